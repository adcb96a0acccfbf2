//! Addressing currency shared by the tree, the composite step set, and the
//! protocol manager.

use crate::ids::Identifier;
use serde::{Deserialize, Serialize};

/// How a caller names a node. `Both` requires the path and id to resolve to
/// the same node — disagreement is `ADDRESS_MISMATCH`, not "prefer one".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRef {
    Path(String),
    Id(Identifier),
    Both(String, Identifier),
}

impl NodeRef {
    pub fn path(p: impl Into<String>) -> Self {
        NodeRef::Path(p.into())
    }

    pub fn id(id: Identifier) -> Self {
        NodeRef::Id(id)
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Path(p) => write!(f, "{p}"),
            NodeRef::Id(id) => write!(f, "#{id}"),
            NodeRef::Both(p, id) => write!(f, "{p} (#{id})"),
        }
    }
}
