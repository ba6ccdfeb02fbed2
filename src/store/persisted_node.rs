//! Store-backed tree nodes with lazy materialization.
//!
//! A [`PersistedNode`] stands for one row of a node table. Constructing one
//! is cheap: the row is only fetched when the node's state is first needed,
//! and mutations stay in memory until [`IndexNode::save`] writes the row
//! back. Child nodes materialized through `sub_node` are cached so that a
//! traversal sees the same node object (and the same visited flag) across
//! calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{SpatialError, SpatialResult};
use crate::node::{Entry, EntryData, IndexNode, NodeRef, PageId};
use crate::shape::{Region, Shape};
use crate::store::dialect::{Dialect, SharedConnection, SqlValue};
use crate::store::payload::{NodePayload, PayloadEnvelope};

/// Everything a persisted node needs to reach its backing table: a shared
/// connection, the dialect that phrases the statements, and the table name.
#[derive(Clone)]
pub struct StoreBinding {
    pub connection: SharedConnection,
    pub dialect: Arc<dyn Dialect>,
    pub table: String,
}

struct NodeIds {
    page_id: Option<PageId>,
    parent_id: Option<PageId>,
}

/// A tree node whose state lives in a store row.
pub struct PersistedNode {
    binding: StoreBinding,
    ids: RwLock<NodeIds>,
    state: RwLock<Option<NodePayload>>,
    children: RwLock<HashMap<usize, NodeRef>>,
    visited: AtomicBool,
}

impl PersistedNode {
    /// A fresh node that has no row yet; the first `save` assigns its page id.
    pub fn create(binding: StoreBinding, shape: Region, leaf: bool) -> Arc<PersistedNode> {
        Arc::new(PersistedNode {
            binding,
            ids: RwLock::new(NodeIds {
                page_id: None,
                parent_id: None,
            }),
            state: RwLock::new(Some(NodePayload {
                leaf,
                shape,
                entries: Vec::new(),
                parent_id: None,
            })),
            children: RwLock::new(HashMap::new()),
            visited: AtomicBool::new(false),
        })
    }

    /// A handle to an existing row; the row is fetched on first access.
    pub fn attach(binding: StoreBinding, page_id: PageId) -> Arc<PersistedNode> {
        Arc::new(PersistedNode {
            binding,
            ids: RwLock::new(NodeIds {
                page_id: Some(page_id),
                parent_id: None,
            }),
            state: RwLock::new(None),
            children: RwLock::new(HashMap::new()),
            visited: AtomicBool::new(false),
        })
    }

    /// Index and entry recording `child` in this branch, if any.
    pub fn entry_for_child(&self, child: &PersistedNode) -> SpatialResult<Option<(usize, Entry)>> {
        let child_id = match child.page_id() {
            Some(id) => id,
            None => return Ok(None),
        };
        self.with_state(|state| {
            Ok(state
                .entries
                .iter()
                .enumerate()
                .find(|(_, entry)| entry.data == EntryData::Page(child_id))
                .map(|(index, entry)| (index, entry.clone())))
        })
    }

    fn ensure_loaded(&self) -> SpatialResult<()> {
        if self.state.read().is_some() {
            return Ok(());
        }
        let page_id = self.ids.read().page_id.ok_or_else(|| {
            SpatialError::Corrupted("node has neither state nor a page id".into())
        })?;

        let statement = self.binding.dialect.select_page(&self.binding.table);
        let record = {
            let mut conn = self.binding.connection.lock();
            conn.query_page(&statement, page_id)?
        }
        .ok_or_else(|| {
            SpatialError::Corrupted(format!(
                "dangling page id {page_id} in table {}",
                self.binding.table
            ))
        })?;

        let payload = PayloadEnvelope::decode(&record.payload)?;
        if payload.leaf != record.leaf {
            return Err(SpatialError::Corrupted(format!(
                "leaf flag of page {page_id} disagrees with its payload"
            )));
        }

        log::trace!("loaded page {page_id} from {}", self.binding.table);
        {
            // A parent recorded before this node was attached (e.g. by the
            // branch that materialized it) wins over the stored linkage.
            let mut ids = self.ids.write();
            if ids.parent_id.is_none() {
                ids.parent_id = payload.parent_id;
            }
        }
        *self.state.write() = Some(payload);
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&NodePayload) -> SpatialResult<R>) -> SpatialResult<R> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        match guard.as_ref() {
            Some(payload) => f(payload),
            None => Err(SpatialError::Corrupted("node state not materialized".into())),
        }
    }

    fn with_state_mut<R>(
        &self,
        f: impl FnOnce(&mut NodePayload) -> SpatialResult<R>,
    ) -> SpatialResult<R> {
        self.ensure_loaded()?;
        let mut guard = self.state.write();
        match guard.as_mut() {
            Some(payload) => f(payload),
            None => Err(SpatialError::Corrupted("node state not materialized".into())),
        }
    }
}

/// Connection-level failures during a write surface as persistence errors.
fn as_persistence(err: SpatialError) -> SpatialError {
    match err {
        SpatialError::Persistence(_) => err,
        other => SpatialError::Persistence(other.to_string()),
    }
}

impl IndexNode for PersistedNode {
    fn is_leaf(&self) -> SpatialResult<bool> {
        self.with_state(|state| Ok(state.leaf))
    }

    fn shape(&self) -> SpatialResult<Region> {
        self.with_state(|state| Ok(state.shape.clone()))
    }

    fn set_shape(&self, shape: Region) -> SpatialResult<()> {
        self.with_state_mut(|state| {
            state.shape = shape;
            Ok(())
        })
    }

    fn entry_count(&self) -> SpatialResult<usize> {
        self.with_state(|state| Ok(state.entries.len()))
    }

    fn entry(&self, index: usize) -> SpatialResult<Entry> {
        self.with_state(|state| {
            state.entries.get(index).cloned().ok_or_else(|| {
                SpatialError::InvalidArgument(format!("entry index {index} out of range"))
            })
        })
    }

    fn add_entry(&self, entry: Entry) -> SpatialResult<()> {
        self.with_state_mut(|state| {
            match (state.leaf, &entry.data) {
                (true, EntryData::Key(_)) | (false, EntryData::Page(_)) => {}
                _ => {
                    return Err(SpatialError::InvalidArgument(
                        "entry data does not match node kind".into(),
                    ))
                }
            }
            state.shape = state.shape.union(&entry.shape.bounds());
            state.entries.push(entry);
            Ok(())
        })
    }

    fn remove_entry(&self, index: usize) -> SpatialResult<Entry> {
        let removed = self.with_state_mut(|state| {
            if index >= state.entries.len() {
                return Err(SpatialError::InvalidArgument(format!(
                    "entry index {index} out of range"
                )));
            }
            Ok(state.entries.remove(index))
        })?;

        // Materialized children past the removed slot shift down by one.
        let mut children = self.children.write();
        children.remove(&index);
        let shifted: Vec<(usize, NodeRef)> = children
            .drain()
            .map(|(i, child)| if i > index { (i - 1, child) } else { (i, child) })
            .collect();
        children.extend(shifted);

        Ok(removed)
    }

    fn set_entry_shape(&self, index: usize, shape: Shape) -> SpatialResult<()> {
        self.with_state_mut(|state| match state.entries.get_mut(index) {
            Some(entry) => {
                entry.shape = shape;
                Ok(())
            }
            None => Err(SpatialError::InvalidArgument(format!(
                "entry index {index} out of range"
            ))),
        })
    }

    fn sub_node(&self, index: usize) -> SpatialResult<NodeRef> {
        if self.is_leaf()? {
            return Err(SpatialError::InvalidArgument(
                "leaf nodes have no sub nodes".into(),
            ));
        }
        if let Some(child) = self.children.read().get(&index) {
            return Ok(child.clone());
        }

        let entry = self.entry(index)?;
        let page_id = match entry.data {
            EntryData::Page(id) => id,
            _ => {
                return Err(SpatialError::Corrupted(
                    "branch entry without a page id".into(),
                ))
            }
        };

        let child = PersistedNode::attach(self.binding.clone(), page_id);
        child.ids.write().parent_id = self.page_id();
        let child: NodeRef = child;
        self.children.write().insert(index, child.clone());
        Ok(child)
    }

    fn parent(&self) -> SpatialResult<Option<NodeRef>> {
        self.ensure_loaded()?;
        let parent_id = self.ids.read().parent_id;
        Ok(parent_id.map(|id| PersistedNode::attach(self.binding.clone(), id) as NodeRef))
    }

    fn set_parent(&self, parent: &NodeRef) -> SpatialResult<()> {
        self.ids.write().parent_id = parent.page_id();
        Ok(())
    }

    fn page_id(&self) -> Option<PageId> {
        self.ids.read().page_id
    }

    fn is_visited(&self) -> bool {
        self.visited.load(Ordering::Acquire)
    }

    fn set_visited(&self, visited: bool) {
        self.visited.store(visited, Ordering::Release);
    }

    fn save(&self) -> SpatialResult<()> {
        let mut payload = {
            let guard = self.state.read();
            match guard.as_ref() {
                Some(payload) => payload.clone(),
                // Never materialized, so nothing has changed.
                None => return Ok(()),
            }
        };
        payload.parent_id = self.ids.read().parent_id;
        let bytes = PayloadEnvelope::new(payload.clone())?.encode()?;

        let page_id = self.ids.read().page_id;
        let mut conn = self.binding.connection.lock();

        let outcome = match page_id {
            None => self
                .binding
                .dialect
                .next_page_id(&mut *conn, &self.binding.table)
                .and_then(|id| {
                    let statement = self.binding.dialect.insert_page(&self.binding.table);
                    conn.execute(
                        &statement,
                        &[
                            SqlValue::Int(id as i64),
                            SqlValue::Bool(payload.leaf),
                            SqlValue::Bytes(bytes),
                        ],
                    )?;
                    conn.commit()?;
                    Ok(Some(id))
                }),
            Some(id) => {
                let statement = self.binding.dialect.update_page(&self.binding.table);
                conn.execute(
                    &statement,
                    &[
                        SqlValue::Bool(payload.leaf),
                        SqlValue::Bytes(bytes),
                        SqlValue::Int(id as i64),
                    ],
                )
                .and_then(|_| conn.commit())
                .map(|_| None)
            }
        };

        match outcome {
            Ok(Some(assigned)) => {
                log::debug!("inserted page {assigned} into {}", self.binding.table);
                self.ids.write().page_id = Some(assigned);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                // The write failure is the error the caller needs to see; a
                // failed rollback on top of it is only logged.
                if let Err(rollback_err) = conn.rollback() {
                    log::warn!("rollback after failed save also failed: {rollback_err}");
                }
                Err(as_persistence(err))
            }
        }
    }
}
