//! Entity model: nodes hold content, edges place nodes in the tree.
//!
//! A node can be placed more than once. The first placement is the primary
//! edge; every further placement is a mirror edge whose `canonical_edge_id`
//! points back at the primary and whose `mirror_of_node_id` names the node.
//! Mirrors share content but keep their own collapsed flag and position.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh UUID v4 identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque node identifier.
    NodeId
);
string_id!(
    /// Opaque edge identifier.
    EdgeId
);

// ─── Content ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarkKind {
    Bold,
    Italic,
    Strike,
    Code,
    Link { href: String },
    Tag { name: String },
    WikiLink { target: String },
}

/// Inline formatting over the char range `start..end` of the node text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMark {
    pub start: u32,
    pub end: u32,
    pub kind: MarkKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<TextMark>,
}

impl NodeContent {
    pub fn plain(text: impl Into<String>) -> Self {
        Self { text: text.into(), marks: Vec::new() }
    }

    /// Whitespace-only text counts as blank; marks alone do not make content.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutHint {
    #[default]
    Bullet,
    Numbered,
    Paragraph,
    Board,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Heading level 1-6, `None` for body text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<u8>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub layout: LayoutHint,
}

impl NodeMetadata {
    /// Out-of-range heading levels are dropped rather than stored.
    pub fn normalized(mut self) -> Self {
        if matches!(self.heading, Some(level) if !(1..=6).contains(&level)) {
            self.heading = None;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub content: NodeContent,
    #[serde(default)]
    pub metadata: NodeMetadata,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    pub fn new(id: NodeId, content: NodeContent, now: u64) -> Self {
        Self { id, content, metadata: NodeMetadata::default(), created_at: now, updated_at: now }
    }
}

// ─── Edges ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    /// `None` places the edge in the root list.
    pub parent_node_id: Option<NodeId>,
    pub child_node_id: NodeId,
    #[serde(default)]
    pub collapsed: bool,
    /// Last known sibling index, used when the edge has to be re-inserted.
    #[serde(default)]
    pub position: Option<u32>,
    pub canonical_edge_id: EdgeId,
    #[serde(default)]
    pub mirror_of_node_id: Option<NodeId>,
}

impl Edge {
    /// An ordinary (primary) edge: its own canonical edge.
    pub fn primary(id: EdgeId, parent: Option<NodeId>, child: NodeId) -> Self {
        Self {
            canonical_edge_id: id.clone(),
            id,
            parent_node_id: parent,
            child_node_id: child,
            collapsed: false,
            position: None,
            mirror_of_node_id: None,
        }
    }

    /// A mirror placement of `child` whose primary edge is `canonical`.
    pub fn mirror(id: EdgeId, parent: Option<NodeId>, child: NodeId, canonical: EdgeId) -> Self {
        Self {
            id,
            parent_node_id: parent,
            mirror_of_node_id: Some(child.clone()),
            child_node_id: child,
            collapsed: false,
            position: None,
            canonical_edge_id: canonical,
        }
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror_of_node_id.is_some()
    }

    /// Turn this placement into the primary edge of its node.
    pub fn promote(&mut self) {
        self.canonical_edge_id = self.id.clone();
        self.mirror_of_node_id = None;
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
