//! # trellis-core — Convergent outline document engine
//!
//! Nodes of text arranged in a tree of edges, replicated through a yrs
//! document so concurrent edits from any number of peers converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  transact   ┌──────────────┐  commit   ┌──────────────┐
//! │ OutlineDoc   │ ──────────► │ yrs::Doc     │ ────────► │ ChangeSet    │
//! │ operations   │             │ nodes/edges/ │           │ (observers)  │
//! └──────────────┘             │ children/    │           └──────┬───────┘
//!        ▲                     │ roots maps   │                  │
//!        │ remote delta        └──────────────┘      ┌───────────┼───────────┐
//!        │                                           ▼           ▼           ▼
//! ┌──────┴───────┐                             ┌──────────┐ ┌─────────┐ ┌──────────┐
//! │ trellis-sync │ ◄──────── ChangeEvent ───── │ reconcile│ │ undo    │ │ snapshot │
//! └──────────────┘                             └──────────┘ └─────────┘ └────┬─────┘
//!                                                                            ▼
//!                                                              pane rows / breadcrumbs
//! ```
//!
//! ## Modules
//!
//! - [`model`] — nodes, edges, content and metadata
//! - [`transaction`] — origin-tagged transactions, change capture, subscriptions
//! - [`store`] — `OutlineDoc` and its structural operations
//! - [`reconcile`] — repair of the root list and child lists
//! - [`mirror`] — placing one node at several tree locations
//! - [`snapshot`], [`pane`], [`breadcrumb`] — read-side projection

pub mod breadcrumb;
pub mod config;
pub mod error;
pub mod mirror;
pub mod model;
pub mod pane;
pub mod reconcile;
pub mod snapshot;
pub mod store;
mod structure;
pub mod transaction;

// Re-exports for convenience
pub use breadcrumb::{plan_breadcrumb, BreadcrumbPlan};
pub use config::{DocConfig, IdSource};
pub use error::{EntityKind, OutlineError, Result};
pub use mirror::{MirrorMode, MirrorOutcome, MirrorTarget};
pub use model::{
    Edge, EdgeId, LayoutHint, MarkKind, Node, NodeContent, NodeId, NodeMetadata, TextMark,
};
pub use pane::{
    breadcrumb_segments, build_pane_rows, project_pane, resolve_focus_path, BreadcrumbSegment,
    PaneFocus, PaneRow, PaneState, PaneView,
};
pub use reconcile::ReconcileScope;
pub use snapshot::OutlineSnapshot;
pub use store::OutlineDoc;
pub use structure::{RemovalReport, StructuralOutcome};
pub use transaction::{
    ChangeEvent, ChangeSet, Origin, RecordChange, Subscription, Table, Transaction,
};
