//! Append-only tree of typed keys.
//!
//! Every distinct `(parent, key, type)` path seen in a stream is assigned a
//! stable integer id in insertion order, starting at 0 for the root. Nodes are
//! never removed except by [`SchemaTree::revert`], which truncates the tree back
//! to the last snapshot.
//!
//! # Thread Safety
//!
//! A `SchemaTree` is shared (via `Arc`) between the deserializer that grows it
//! and every log event built against it. All access goes through an internal
//! `RwLock`, so readers holding already-assigned ids can look them up while the
//! single writer appends new nodes. Ids are never reused while they are live.

use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

/// Id of a node within one schema tree.
pub type NodeId = u32;

/// Id of the root node, which is always present.
pub const ROOT_ID: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Int,
    Float,
    Bool,
    Str,
    UnstructuredArray,
    Obj,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Int => "int",
            NodeType::Float => "float",
            NodeType::Bool => "bool",
            NodeType::Str => "str",
            NodeType::UnstructuredArray => "unstructured-array",
            NodeType::Obj => "obj",
        };
        f.write_str(name)
    }
}

/// The `(parent_id, key_name, node_type)` triple that identifies a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeLocator {
    pub parent_id: NodeId,
    pub key_name: String,
    pub node_type: NodeType,
}

impl NodeLocator {
    pub fn new(parent_id: NodeId, key_name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            parent_id,
            key_name: key_name.into(),
            node_type,
        }
    }
}

impl fmt::Display for NodeLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parent {}, key '{}', type {}",
            self.parent_id, self.key_name, self.node_type
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaTreeNode {
    pub id: NodeId,
    /// `None` only for the root.
    pub parent_id: Option<NodeId>,
    pub key_name: String,
    pub node_type: NodeType,
    pub children_ids: Vec<NodeId>,
}

impl SchemaTreeNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaTreeError {
    #[error("node id {0} is out of bounds")]
    OutOfBounds(NodeId),
    #[error("node already exists: parent {parent_id}, key '{key_name}', type {node_type}")]
    NodeExists {
        parent_id: NodeId,
        key_name: String,
        node_type: NodeType,
    },
    #[error("parent node {parent_id} has type {parent_type} and can't have children")]
    ParentNotObject {
        parent_id: NodeId,
        parent_type: NodeType,
    },
    #[error("revert called without an outstanding snapshot")]
    NoSnapshot,
    #[error("node id space exhausted")]
    IdSpaceExhausted,
}

#[derive(Debug)]
struct Inner {
    nodes: Vec<SchemaTreeNode>,
    snapshot_size: Option<usize>,
}

impl Inner {
    fn new() -> Self {
        Self {
            nodes: vec![SchemaTreeNode {
                id: ROOT_ID,
                parent_id: None,
                key_name: String::new(),
                node_type: NodeType::Obj,
                children_ids: Vec::new(),
            }],
            snapshot_size: None,
        }
    }

    fn node(&self, id: NodeId) -> Result<&SchemaTreeNode, SchemaTreeError> {
        self.nodes
            .get(id as usize)
            .ok_or(SchemaTreeError::OutOfBounds(id))
    }

    fn find(&self, locator: &NodeLocator) -> Option<NodeId> {
        let parent = self.nodes.get(locator.parent_id as usize)?;
        parent.children_ids.iter().copied().find(|child_id| {
            let child = &self.nodes[*child_id as usize];
            child.key_name == locator.key_name && child.node_type == locator.node_type
        })
    }
}

/// Id-indexed schema tree with single-snapshot rollback.
#[derive(Debug)]
pub struct SchemaTree {
    inner: RwLock<Inner>,
}

impl Default for SchemaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaTree {
    /// Create a tree holding only the root.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of nodes, including the root.
    pub fn size(&self) -> usize {
        self.read().nodes.len()
    }

    /// Returns a copy of the node with the given id.
    pub fn get_node(&self, id: NodeId) -> Result<SchemaTreeNode, SchemaTreeError> {
        self.read().node(id).cloned()
    }

    /// Runs `f` against the node without copying it.
    pub fn with_node<T>(
        &self,
        id: NodeId,
        f: impl FnOnce(&SchemaTreeNode) -> T,
    ) -> Result<T, SchemaTreeError> {
        let inner = self.read();
        inner.node(id).map(f)
    }

    pub fn node_type(&self, id: NodeId) -> Result<NodeType, SchemaTreeError> {
        self.with_node(id, |node| node.node_type)
    }

    pub fn has_node(&self, locator: &NodeLocator) -> bool {
        self.read().find(locator).is_some()
    }

    pub fn try_get_node_id(&self, locator: &NodeLocator) -> Option<NodeId> {
        self.read().find(locator)
    }

    /// Inserts a node and registers it as a child of its parent.
    ///
    /// Fails if the locator already exists or the parent isn't an `Obj`.
    pub fn insert_node(&self, locator: &NodeLocator) -> Result<NodeId, SchemaTreeError> {
        let mut inner = self.write();
        let parent_type = inner.node(locator.parent_id)?.node_type;
        if parent_type != NodeType::Obj {
            return Err(SchemaTreeError::ParentNotObject {
                parent_id: locator.parent_id,
                parent_type,
            });
        }
        if inner.find(locator).is_some() {
            return Err(SchemaTreeError::NodeExists {
                parent_id: locator.parent_id,
                key_name: locator.key_name.clone(),
                node_type: locator.node_type,
            });
        }

        let id =
            NodeId::try_from(inner.nodes.len()).map_err(|_| SchemaTreeError::IdSpaceExhausted)?;
        inner.nodes.push(SchemaTreeNode {
            id,
            parent_id: Some(locator.parent_id),
            key_name: locator.key_name.clone(),
            node_type: locator.node_type,
            children_ids: Vec::new(),
        });
        inner.nodes[locator.parent_id as usize].children_ids.push(id);
        Ok(id)
    }

    /// Records the current size. Replaces any earlier snapshot.
    pub fn take_snapshot(&self) {
        let mut inner = self.write();
        inner.snapshot_size = Some(inner.nodes.len());
    }

    /// Drops the snapshot, keeping every node inserted since.
    pub fn discard_snapshot(&self) {
        self.write().snapshot_size = None;
    }

    /// Truncates the tree back to the snapshot and consumes the snapshot.
    pub fn revert(&self) -> Result<(), SchemaTreeError> {
        let mut inner = self.write();
        let snapshot_size = inner
            .snapshot_size
            .take()
            .ok_or(SchemaTreeError::NoSnapshot)?;

        // Pop newest first: each removed node is then always the last child
        // appended to its parent.
        while inner.nodes.len() > snapshot_size {
            let Some(node) = inner.nodes.pop() else {
                break;
            };
            if let Some(parent_id) = node.parent_id {
                let popped = inner.nodes[parent_id as usize].children_ids.pop();
                debug_assert_eq!(popped, Some(node.id));
            }
        }
        Ok(())
    }

    /// Removes every node except the root.
    pub fn reset(&self) {
        let mut inner = self.write();
        *inner = Inner::new();
    }

    /// Key names from the root's child down to `id`.
    pub fn key_path(&self, id: NodeId) -> Result<Vec<String>, SchemaTreeError> {
        let inner = self.read();
        let mut path = Vec::new();
        let mut node = inner.node(id)?;
        while let Some(parent_id) = node.parent_id {
            path.push(node.key_name.clone());
            node = inner.node(parent_id)?;
        }
        path.reverse();
        Ok(path)
    }
}
