use serde::Deserialize;

/// How `OutlineDoc` mints identifiers for nodes and edges it creates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdSource {
    /// UUID v4. The only safe choice for replicas that merge with each other.
    Random,
    /// `"{prefix}n{k}"` / `"{prefix}e{k}"` from a per-document counter.
    /// Two fresh documents fed the same operations produce the same ids.
    Sequential { prefix: String },
}

impl Default for IdSource {
    fn default() -> Self {
        IdSource::Random
    }
}

/// Document-level tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DocConfig {
    /// Touched-edge count above which reconciliation rebuilds every list.
    pub full_rebuild_threshold: usize,
    /// Maximum number of local transactions kept for undo.
    pub undo_depth: usize,
    pub id_source: IdSource,
}

impl Default for DocConfig {
    fn default() -> Self {
        Self { full_rebuild_threshold: 256, undo_depth: 100, id_source: IdSource::Random }
    }
}

impl DocConfig {
    /// Deterministic ids and a small undo history.
    pub fn for_testing() -> Self {
        Self {
            full_rebuild_threshold: 64,
            undo_depth: 16,
            id_source: IdSource::Sequential { prefix: String::new() },
        }
    }
}
