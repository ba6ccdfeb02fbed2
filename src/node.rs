//! Tree node contract and the in-memory node implementation.
//!
//! A node is a vertex of the spatial index tree: a bounding shape, an
//! ordered list of entries, a leaf flag and a transient visited flag used
//! by the traversal state machine. Leaf entries carry payload identifiers;
//! branch entries carry the identity of a child node — a vector slot for
//! in-memory nodes, a persistent page id for store-backed nodes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::{SpatialError, SpatialResult};
use crate::shape::{Region, Shape};

/// Persistent identifier of a node's row in a backing store.
pub type PageId = u64;

/// The opaque payload of an entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryData {
    /// Payload identifier of a leaf entry, owned by the caller.
    Key(u64),
    /// Persistent page id of a child node (store-backed branch entries).
    Page(PageId),
    /// Child-vector slot of a child node (in-memory branch entries).
    Slot(usize),
}

/// A (shape, data) pair stored inside a node. Owned by exactly one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub shape: Shape,
    pub data: EntryData,
}

impl Entry {
    pub fn new(shape: Shape, data: EntryData) -> Entry {
        Entry { shape, data }
    }
}

/// Shared handle to a tree node.
pub type NodeRef = Arc<dyn IndexNode>;

/// A vertex of the spatial index tree.
///
/// Implementations use interior mutability: the index layer itself performs
/// no locking, and callers serialize structural mutation externally (see
/// [`crate::lock::LockManager`]).
///
/// `sub_node` must return the same node object across calls for as long as
/// the node is alive: the traversal records its progress in the children's
/// visited flags, and those flags must survive re-entry into a partially
/// scanned node.
pub trait IndexNode: Send + Sync {
    /// Whether this node holds data entries (leaf) or child entries (branch).
    ///
    /// Fallible because a lazily materialized store-backed node must fetch
    /// its row to answer.
    fn is_leaf(&self) -> SpatialResult<bool>;

    /// The bounding region of all entries in this node.
    fn shape(&self) -> SpatialResult<Region>;

    /// Replaces the bounding region.
    fn set_shape(&self, shape: Region) -> SpatialResult<()>;

    fn entry_count(&self) -> SpatialResult<usize>;

    fn entry(&self, index: usize) -> SpatialResult<Entry>;

    /// Appends an entry, expanding the node's shape to cover it.
    fn add_entry(&self, entry: Entry) -> SpatialResult<()>;

    /// Removes and returns the entry at `index`. The node's shape is left
    /// untouched; callers recompute bounds where the tree invariants
    /// require it.
    fn remove_entry(&self, index: usize) -> SpatialResult<Entry>;

    /// Replaces the recorded shape of the entry at `index`.
    fn set_entry_shape(&self, index: usize, shape: Shape) -> SpatialResult<()>;

    /// The child node the entry at `index` refers to. Usage error on a leaf.
    fn sub_node(&self, index: usize) -> SpatialResult<NodeRef>;

    /// The parent node, or `None` for the root.
    fn parent(&self) -> SpatialResult<Option<NodeRef>>;

    /// Records `parent` as this node's parent back-reference.
    fn set_parent(&self, parent: &NodeRef) -> SpatialResult<()>;

    /// Persistent identity, if this node is bound to a backing store and
    /// has been flushed at least once.
    fn page_id(&self) -> Option<PageId>;

    /// Transient traversal state. Never persisted.
    fn is_visited(&self) -> bool;

    fn set_visited(&self, visited: bool);

    /// Flushes pending mutations to the backing store. A no-op for purely
    /// in-memory nodes.
    fn save(&self) -> SpatialResult<()>;
}

/// A purely in-memory tree node.
pub struct MemoryNode {
    leaf: bool,
    state: RwLock<MemoryState>,
    visited: AtomicBool,
}

struct MemoryState {
    shape: Region,
    entries: Vec<Entry>,
    children: Vec<NodeRef>,
    parent: Option<Weak<dyn IndexNode>>,
}

impl MemoryNode {
    /// Creates an empty leaf node with the given bounding region.
    pub fn leaf(shape: Region) -> Arc<MemoryNode> {
        Arc::new(MemoryNode {
            leaf: true,
            state: RwLock::new(MemoryState {
                shape,
                entries: Vec::new(),
                children: Vec::new(),
                parent: None,
            }),
            visited: AtomicBool::new(false),
        })
    }

    /// Creates a branch node over the given children, wiring one entry per
    /// child (the child's bounding shape plus its slot) and the children's
    /// parent back-references.
    pub fn branch(shape: Region, children: Vec<NodeRef>) -> SpatialResult<Arc<MemoryNode>> {
        let mut entries = Vec::with_capacity(children.len());
        for (slot, child) in children.iter().enumerate() {
            entries.push(Entry::new(
                Shape::Region(child.shape()?),
                EntryData::Slot(slot),
            ));
        }

        let node = Arc::new(MemoryNode {
            leaf: false,
            state: RwLock::new(MemoryState {
                shape,
                entries,
                children,
                parent: None,
            }),
            visited: AtomicBool::new(false),
        });

        let node_ref: NodeRef = node.clone();
        {
            let state = node.state.read();
            for child in &state.children {
                child.set_parent(&node_ref)?;
            }
        }
        Ok(node)
    }
}

impl IndexNode for MemoryNode {
    fn is_leaf(&self) -> SpatialResult<bool> {
        Ok(self.leaf)
    }

    fn shape(&self) -> SpatialResult<Region> {
        Ok(self.state.read().shape.clone())
    }

    fn set_shape(&self, shape: Region) -> SpatialResult<()> {
        self.state.write().shape = shape;
        Ok(())
    }

    fn entry_count(&self) -> SpatialResult<usize> {
        Ok(self.state.read().entries.len())
    }

    fn entry(&self, index: usize) -> SpatialResult<Entry> {
        let state = self.state.read();
        state
            .entries
            .get(index)
            .cloned()
            .ok_or_else(|| SpatialError::InvalidArgument(format!("no entry at index {index}")))
    }

    fn add_entry(&self, entry: Entry) -> SpatialResult<()> {
        if !self.leaf {
            return Err(SpatialError::InvalidArgument(
                "entries can only be added to leaf nodes; build branches via MemoryNode::branch"
                    .into(),
            ));
        }
        let mut state = self.state.write();
        let bounds = entry.shape.bounds();
        state.shape.expand(&bounds);
        state.entries.push(entry);
        Ok(())
    }

    fn remove_entry(&self, index: usize) -> SpatialResult<Entry> {
        let mut state = self.state.write();
        if index >= state.entries.len() {
            return Err(SpatialError::InvalidArgument(format!(
                "no entry at index {index}"
            )));
        }
        let removed = state.entries.remove(index);
        if !self.leaf {
            state.children.remove(index);
            // Slots shift down with the removed child.
            for entry in state.entries.iter_mut() {
                if let EntryData::Slot(slot) = &mut entry.data {
                    if *slot > index {
                        *slot -= 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    fn set_entry_shape(&self, index: usize, shape: Shape) -> SpatialResult<()> {
        let mut state = self.state.write();
        match state.entries.get_mut(index) {
            Some(entry) => {
                entry.shape = shape;
                Ok(())
            }
            None => Err(SpatialError::InvalidArgument(format!(
                "no entry at index {index}"
            ))),
        }
    }

    fn sub_node(&self, index: usize) -> SpatialResult<NodeRef> {
        if self.leaf {
            return Err(SpatialError::InvalidArgument(
                "leaf nodes have no sub-nodes".into(),
            ));
        }
        let state = self.state.read();
        state.children.get(index).cloned().ok_or_else(|| {
            SpatialError::Corrupted(format!("branch entry {index} has no child node"))
        })
    }

    fn parent(&self) -> SpatialResult<Option<NodeRef>> {
        Ok(self
            .state
            .read()
            .parent
            .as_ref()
            .and_then(|weak| weak.upgrade()))
    }

    fn set_parent(&self, parent: &NodeRef) -> SpatialResult<()> {
        self.state.write().parent = Some(Arc::downgrade(parent));
        Ok(())
    }

    fn page_id(&self) -> Option<PageId> {
        None
    }

    fn is_visited(&self) -> bool {
        self.visited.load(Ordering::Relaxed)
    }

    fn set_visited(&self, visited: bool) {
        self.visited.store(visited, Ordering::Relaxed);
    }

    fn save(&self) -> SpatialResult<()> {
        Ok(())
    }
}
