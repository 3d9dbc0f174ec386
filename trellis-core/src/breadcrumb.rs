//! Breadcrumb width planning.
//!
//! Given measured segment widths, choose which leading and trailing segments
//! stay visible, with one ellipsis standing in for the hidden middle.
//!
//! Candidates are every `(prefix, suffix)` pair with `prefix + suffix <= n`.
//! Ranking, first difference wins:
//!   1. fits the available width (otherwise: least overflow)
//!   2. more visible segments
//!   3. includes the first segment
//!   4. more trailing segments
//!   5. smaller required width, then fewer leading segments

use std::cmp::Ordering;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub struct BreadcrumbPlan {
    /// Indices of visible segments in display order.
    pub visible: Vec<usize>,
    /// Hidden middle segments, replaced by the ellipsis.
    pub collapsed: Option<Range<usize>>,
    pub fits_within_width: bool,
    pub required_width: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    prefix: usize,
    suffix: usize,
    required: f64,
    fits: bool,
    overflow: f64,
}

impl Candidate {
    fn count(&self) -> usize {
        self.prefix + self.suffix
    }

    /// `Greater` means `self` is the better plan.
    fn rank(&self, other: &Candidate) -> Ordering {
        self.fits
            .cmp(&other.fits)
            .then_with(|| {
                if self.fits {
                    Ordering::Equal
                } else {
                    other.overflow.total_cmp(&self.overflow)
                }
            })
            .then_with(|| self.count().cmp(&other.count()))
            .then_with(|| (self.prefix > 0).cmp(&(other.prefix > 0)))
            .then_with(|| self.suffix.cmp(&other.suffix))
            .then_with(|| other.required.total_cmp(&self.required))
            .then_with(|| other.prefix.cmp(&self.prefix))
    }
}

pub fn plan_breadcrumb(widths: &[f64], available: f64, ellipsis_width: f64) -> BreadcrumbPlan {
    let n = widths.len();
    let mut prefix_sums = Vec::with_capacity(n + 1);
    prefix_sums.push(0.0);
    for w in widths {
        let last = prefix_sums.last().copied().unwrap_or(0.0);
        prefix_sums.push(last + w.max(0.0));
    }
    let total = prefix_sums[n];

    let mut best: Option<Candidate> = None;
    for prefix in 0..=n {
        for suffix in 0..=(n - prefix) {
            let hidden = prefix + suffix < n;
            let required = prefix_sums[prefix]
                + (total - prefix_sums[n - suffix])
                + if hidden { ellipsis_width } else { 0.0 };
            let candidate = Candidate {
                prefix,
                suffix,
                required,
                fits: required <= available,
                overflow: (required - available).max(0.0),
            };
            best = match best {
                Some(current) if current.rank(&candidate) != Ordering::Less => Some(current),
                _ => Some(candidate),
            };
        }
    }

    let Some(best) = best else {
        return BreadcrumbPlan {
            visible: Vec::new(),
            collapsed: None,
            fits_within_width: true,
            required_width: 0.0,
        };
    };

    let visible: Vec<usize> = (0..best.prefix).chain(n - best.suffix..n).collect();
    let collapsed = (best.count() < n).then(|| best.prefix..n - best.suffix);
    BreadcrumbPlan {
        visible,
        collapsed,
        fits_within_width: best.fits,
        required_width: best.required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_everything_fits() {
        let plan = plan_breadcrumb(&[10.0, 20.0, 30.0], 100.0, 5.0);
        assert_eq!(plan.visible, vec![0, 1, 2]);
        assert_eq!(plan.collapsed, None);
        assert!(plan.fits_within_width);
        assert_eq!(plan.required_width, 60.0);
    }

    #[test]
    fn test_collapses_middle_keeping_first_and_last() {
        // 10 + 5 + 30 = 45 fits, 10 + 20 + 30 = 60 does not
        let plan = plan_breadcrumb(&[10.0, 20.0, 20.0, 30.0], 50.0, 5.0);
        assert_eq!(plan.visible, vec![0, 3]);
        assert_eq!(plan.collapsed, Some(1..3));
        assert!(plan.fits_within_width);
        assert_eq!(plan.required_width, 45.0);
    }

    #[test]
    fn test_prefers_trailing_segments_on_ties() {
        // Only one of the two tails fits next to the first segment
        let plan = plan_breadcrumb(&[10.0, 10.0, 10.0, 10.0], 35.0, 5.0);
        assert_eq!(plan.visible.len(), 3);
        assert_eq!(plan.visible, vec![0, 2, 3]);
        assert_eq!(plan.collapsed, Some(1..2));
    }

    #[test]
    fn test_nothing_fits_minimizes_overflow() {
        let plan = plan_breadcrumb(&[100.0, 100.0], 3.0, 5.0);
        assert!(!plan.fits_within_width);
        assert!(plan.visible.is_empty());
        assert_eq!(plan.collapsed, Some(0..2));
        assert_eq!(plan.required_width, 5.0);
    }

    #[test]
    fn test_empty_path() {
        let plan = plan_breadcrumb(&[], 0.0, 5.0);
        assert!(plan.visible.is_empty());
        assert!(plan.fits_within_width);
        assert_eq!(plan.collapsed, None);
    }

    #[test]
    fn test_fitting_plan_never_exceeds_width() {
        let widths = [12.0, 40.0, 7.5, 22.0, 18.0, 3.0, 60.0];
        for available in [0.0, 10.0, 25.0, 50.0, 80.0, 120.0, 200.0] {
            let plan = plan_breadcrumb(&widths, available, 6.0);
            if plan.fits_within_width {
                assert!(plan.required_width <= available);
            }
            let mut sorted = plan.visible.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, plan.visible);
        }
    }
}
