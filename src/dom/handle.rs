//! Element handles
//!
//! What a caller holds to say "this element". The backend id is the primary
//! locator; index and xpath let a newer snapshot find the element again after
//! the backend id went stale.

use serde::{Deserialize, Serialize};

use super::node::DomNode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementHandle {
    pub backend_node_id: i64,
    /// Interactive index in the snapshot the handle came from
    pub index: Option<usize>,
    /// Path inside the owning document
    pub xpath: Option<String>,
    /// Target owning the node
    pub target_id: String,
}

impl ElementHandle {
    pub fn from_node(node: &DomNode) -> Self {
        Self {
            backend_node_id: node.backend_node_id,
            index: node.index,
            xpath: if node.xpath.is_empty() {
                None
            } else {
                Some(node.xpath.clone())
            },
            target_id: node.target_id.to_string(),
        }
    }
}
