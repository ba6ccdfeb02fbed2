//! A spatial index engine with pluggable persistence and explicit
//! lock-based concurrency control.
//!
//! The tree is an R-tree variant over n-dimensional shapes: leaves hold
//! `(shape, key)` entries, branches hold bounding shapes over child nodes.
//! [`SpatialIndex`] answers intersection, containment and point-location
//! queries through a visitor, and supports insertion and deletion.
//!
//! Nodes are an abstraction: [`MemoryNode`] keeps the tree on the heap,
//! [`store::PersistedNode`] maps each node onto a row of a SQL-like backend
//! reached through a [`store::Dialect`] and a [`store::Connection`]. Rows
//! are fetched lazily and written back explicitly, so an arbitrarily large
//! tree can be queried while only the visited path is resident.
//!
//! The index performs no locking itself. Callers serialize writers against
//! readers with a [`LockManager`], a bounded-wait single-writer /
//! multi-reader lock that fails with [`SpatialError::LockTimeout`] rather
//! than waiting forever.
//!
//! ```
//! use spatial_store::{MemoryNode, OutOfBoundsPolicy, Point, Region, Shape, SpatialIndex};
//!
//! # fn main() -> spatial_store::SpatialResult<()> {
//! let root = MemoryNode::leaf(Region::rect(0.0, 0.0, 100.0, 100.0));
//! let index = SpatialIndex::new(root, 2)?;
//!
//! index.insert_data(1, &Shape::Point(Point::at(10.0, 25.0)))?;
//! index.insert_data(2, &Shape::Point(Point::at(80.0, 80.0)))?;
//!
//! let near_origin = Shape::Region(Region::rect(0.0, 0.0, 50.0, 50.0));
//! assert_eq!(index.collect_intersecting(&near_origin)?, vec![1]);
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod index;
pub mod lock;
pub mod node;
pub mod shape;
pub mod store;

pub use errors::{SpatialError, SpatialResult};
pub use index::{OutOfBoundsPolicy, SpatialIndex, SpatialVisitor};
pub use lock::{Lock, LockKind, LockManager};
pub use node::{Entry, EntryData, IndexNode, MemoryNode, NodeRef, PageId};
pub use shape::{Point, Region, Shape};
