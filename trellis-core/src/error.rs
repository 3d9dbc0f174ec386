use thiserror::Error;

/// Which table a missing identifier was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Node,
    Edge,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Edge => write!(f, "edge"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OutlineError {
    #[error("{kind} not found: {id}")]
    MissingEntity { kind: EntityKind, id: String },

    /// An edge references a node that no longer exists anywhere in the store.
    #[error("edge {edge_id} references missing node {node_id}")]
    ReconciliationCorruption { edge_id: String, node_id: String },

    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OutlineError {
    pub(crate) fn missing_node(id: impl ToString) -> Self {
        OutlineError::MissingEntity { kind: EntityKind::Node, id: id.to_string() }
    }

    pub(crate) fn missing_edge(id: impl ToString) -> Self {
        OutlineError::MissingEntity { kind: EntityKind::Edge, id: id.to_string() }
    }
}

impl From<yrs::encoding::read::Error> for OutlineError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        OutlineError::Crdt(e.to_string())
    }
}

impl From<serde_json::Error> for OutlineError {
    fn from(e: serde_json::Error) -> Self {
        OutlineError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OutlineError>;
