//! Persistence layer: dialects, node payload encoding, store-backed nodes
//! and an in-memory backend.
//!
//! The index layer never talks SQL; it sees nodes through the
//! [`crate::node::IndexNode`] trait. Everything row-shaped lives here: the
//! [`Dialect`] phrases the statements, a [`Connection`] runs them, and
//! [`PersistedNode`] maps node state onto rows of one table. The module's
//! [`create_index`] and [`open_index`] helpers tie the pieces together
//! through the catalog table.

pub mod dialect;
pub mod memory;
pub mod payload;
pub mod persisted_node;

pub use dialect::{
    AnsiDialect, CatalogRecord, Connection, Dialect, PageRecord, SharedConnection, SqlValue,
    CATALOG_TABLE,
};
pub use memory::MemoryConnection;
pub use payload::{NodePayload, PayloadEnvelope};
pub use persisted_node::{PersistedNode, StoreBinding};

use crate::errors::{SpatialError, SpatialResult};
use crate::index::{OutOfBoundsPolicy, SpatialIndex};
use crate::node::{IndexNode, NodeRef};
use crate::shape::Region;

/// Creates a new persisted index: the node table, a root leaf covering
/// `bounds`, and a catalog row so [`open_index`] can find the root again.
pub fn create_index(
    binding: &StoreBinding,
    dimension: usize,
    bounds: Region,
    policy: OutOfBoundsPolicy,
) -> SpatialResult<SpatialIndex> {
    {
        let ddl = binding.dialect.create_table(&binding.table);
        let mut conn = binding.connection.lock();
        conn.execute(&ddl, &[])?;
    }

    let root = PersistedNode::create(binding.clone(), bounds, true);
    root.save()?;
    let root_page = root
        .page_id()
        .ok_or_else(|| SpatialError::Corrupted("saved root has no page id".into()))?;

    {
        let statement = binding.dialect.catalog_insert();
        let mut conn = binding.connection.lock();
        conn.execute(
            &statement,
            &[
                SqlValue::Text(binding.table.clone()),
                SqlValue::Int(root_page as i64),
                SqlValue::Int(dimension as i64),
            ],
        )?;
        conn.commit()?;
    }

    log::debug!(
        "created index over {} (root page {root_page}, {dimension}-d)",
        binding.table
    );
    SpatialIndex::with_policy(root, dimension, policy)
}

/// Reopens a persisted index from its catalog row.
pub fn open_index(binding: &StoreBinding, policy: OutOfBoundsPolicy) -> SpatialResult<SpatialIndex> {
    let record = {
        let statement = binding.dialect.catalog_query();
        let mut conn = binding.connection.lock();
        conn.query_catalog(&statement, &binding.table)?
    }
    .ok_or_else(|| {
        SpatialError::Persistence(format!("no catalog row for table {}", binding.table))
    })?;

    let root: NodeRef = PersistedNode::attach(binding.clone(), record.root_page);
    SpatialIndex::with_policy(root, record.dimension as usize, policy)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::{Entry, EntryData};
    use crate::shape::{Point, Shape};

    fn binding() -> StoreBinding {
        let _ = env_logger::builder().is_test(true).try_init();
        StoreBinding {
            connection: MemoryConnection::new().into_shared(),
            dialect: Arc::new(AnsiDialect),
            table: "IDX_PLACES".to_string(),
        }
    }

    #[test]
    fn create_insert_query_over_a_persisted_tree() {
        let binding = binding();
        let index = create_index(
            &binding,
            2,
            Region::rect(0.0, 0.0, 100.0, 100.0),
            OutOfBoundsPolicy::Reject,
        )
        .unwrap();

        index
            .insert_data(1, &Shape::Point(Point::at(10.0, 10.0)))
            .unwrap();
        index
            .insert_data(2, &Shape::Point(Point::at(80.0, 80.0)))
            .unwrap();
        index
            .insert_data(3, &Shape::Point(Point::at(50.0, 50.0)))
            .unwrap();

        let query = Shape::Region(Region::rect(0.0, 0.0, 60.0, 60.0));
        let mut found = index.collect_intersecting(&query).unwrap();
        found.sort_unstable();
        assert_eq!(found, vec![1, 3]);
    }

    #[test]
    fn reopened_index_sees_committed_data() {
        let binding = binding();
        {
            let index = create_index(
                &binding,
                2,
                Region::rect(0.0, 0.0, 100.0, 100.0),
                OutOfBoundsPolicy::Reject,
            )
            .unwrap();
            index
                .insert_data(42, &Shape::Point(Point::at(25.0, 25.0)))
                .unwrap();
        }

        // A new binding over the same connection simulates a process that
        // only knows the table name.
        let reopened = open_index(&binding, OutOfBoundsPolicy::Reject).unwrap();
        let query = Shape::Region(Region::rect(0.0, 0.0, 100.0, 100.0));
        assert_eq!(reopened.collect_intersecting(&query).unwrap(), vec![42]);
    }

    #[test]
    fn open_without_catalog_row_fails() {
        let binding = binding();
        let err = open_index(&binding, OutOfBoundsPolicy::Reject);
        assert!(matches!(err, Err(SpatialError::Persistence(_))));
    }

    #[test]
    fn delete_over_a_persisted_tree() {
        let binding = binding();
        let index = create_index(
            &binding,
            2,
            Region::rect(0.0, 0.0, 100.0, 100.0),
            OutOfBoundsPolicy::Reject,
        )
        .unwrap();

        let point = Shape::Point(Point::at(10.0, 10.0));
        index.insert_data(1, &point).unwrap();
        assert!(index.delete_data(&point, 1).unwrap());
        assert!(!index.delete_data(&point, 1).unwrap());

        let query = Shape::Region(Region::rect(0.0, 0.0, 100.0, 100.0));
        assert!(index.collect_intersecting(&query).unwrap().is_empty());
    }

    #[test]
    fn traversal_over_a_multi_level_persisted_tree() {
        let binding = binding();
        {
            let ddl = binding.dialect.create_table(&binding.table);
            binding.connection.lock().execute(&ddl, &[]).unwrap();
        }

        // Two saved leaves under a saved branch root.
        let left = PersistedNode::create(binding.clone(), Region::rect(0.0, 0.0, 50.0, 50.0), true);
        left.add_entry(Entry::new(
            Shape::Point(Point::at(10.0, 10.0)),
            EntryData::Key(1),
        ))
        .unwrap();
        left.save().unwrap();

        let right =
            PersistedNode::create(binding.clone(), Region::rect(50.0, 50.0, 100.0, 100.0), true);
        right
            .add_entry(Entry::new(
                Shape::Point(Point::at(90.0, 90.0)),
                EntryData::Key(2),
            ))
            .unwrap();
        right.save().unwrap();

        let root =
            PersistedNode::create(binding.clone(), Region::rect(0.0, 0.0, 100.0, 100.0), false);
        root.add_entry(Entry::new(
            Shape::Region(Region::rect(0.0, 0.0, 50.0, 50.0)),
            EntryData::Page(left.page_id().unwrap()),
        ))
        .unwrap();
        root.add_entry(Entry::new(
            Shape::Region(Region::rect(50.0, 50.0, 100.0, 100.0)),
            EntryData::Page(right.page_id().unwrap()),
        ))
        .unwrap();
        root.save().unwrap();

        let index = SpatialIndex::new(root, 2).unwrap();
        let everything = Shape::Region(Region::rect(0.0, 0.0, 100.0, 100.0));
        let mut found = index.collect_intersecting(&everything).unwrap();
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);

        // Only the left subtree relates to a query confined to it.
        let left_only = Shape::Region(Region::rect(0.0, 0.0, 40.0, 40.0));
        assert_eq!(index.collect_intersecting(&left_only).unwrap(), vec![1]);
    }
}
