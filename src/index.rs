//! Core spatial index: range-query traversal, insert and delete.
//!
//! The index owns the root node and the dimensionality; node-level load,
//! save and child navigation are delegated to the [`IndexNode`] contract, so
//! the same algorithms run over in-memory and store-backed trees.
//!
//! The index is not internally thread-safe. Callers serialize structural
//! mutation with an exclusive lock from [`crate::lock::LockManager`] and may
//! run concurrent read-only traversals under shared leases.

use std::sync::Arc;

use crate::errors::{SpatialError, SpatialResult};
use crate::node::{Entry, EntryData, IndexNode, NodeRef};
use crate::shape::{Region, Shape};

/// Callbacks fired during a range query.
pub trait SpatialVisitor {
    /// Invoked once for every node whose bounding shape relates to the
    /// query shape, the first time the traversal enters it.
    fn visit_node(&mut self, node: &NodeRef);

    /// Invoked once per matching leaf entry.
    fn visit_data(&mut self, entry: &Entry);
}

/// What happens when an insertion shape falls outside the root's bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutOfBoundsPolicy {
    /// Reject the insertion with an `InvalidArgument` error.
    Reject,
    /// Grow the root's bounding shape to cover the insertion.
    GrowRoot,
}

/// The relation a node or entry shape must satisfy against the query shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Relation {
    Intersects,
    Contains,
}

impl Relation {
    fn test(self, shape: &Shape, query: &Shape) -> bool {
        match self {
            Relation::Intersects => shape.intersects(query),
            Relation::Contains => shape.contains(query),
        }
    }
}

/// A spatial index over bounding shapes.
///
/// Supports intersection, containment and point-location range queries
/// plus entry insertion and deletion. Tree rebalancing (node splitting) is
/// not performed: inserts descend the existing structure and leaves accept
/// any number of entries.
///
/// # Examples
///
/// ```
/// use spatial_store::{MemoryNode, Point, Region, SpatialIndex};
///
/// let root = MemoryNode::leaf(Region::rect(0.0, 0.0, 100.0, 100.0));
/// let index = SpatialIndex::new(root, 2).unwrap();
///
/// index.insert_data(1, &Point::at(10.0, 10.0).into()).unwrap();
///
/// let query = Region::rect(0.0, 0.0, 60.0, 60.0).into();
/// let hits = index.collect_intersecting(&query).unwrap();
/// assert_eq!(hits, vec![1]);
/// ```
pub struct SpatialIndex {
    root: NodeRef,
    dimension: usize,
    out_of_bounds: OutOfBoundsPolicy,
}

impl SpatialIndex {
    /// Creates an index over the given root node. The root's bounding shape
    /// must match `dimension`; out-of-bounds insertions are rejected.
    pub fn new(root: NodeRef, dimension: usize) -> SpatialResult<SpatialIndex> {
        Self::with_policy(root, dimension, OutOfBoundsPolicy::Reject)
    }

    /// Creates an index with an explicit out-of-bounds insertion policy.
    pub fn with_policy(
        root: NodeRef,
        dimension: usize,
        out_of_bounds: OutOfBoundsPolicy,
    ) -> SpatialResult<SpatialIndex> {
        let root_dimension = root.shape()?.dimension();
        if root_dimension != dimension {
            return Err(SpatialError::InvalidArgument(format!(
                "root shape has {root_dimension} dimensions, index expects {dimension}"
            )));
        }
        Ok(SpatialIndex {
            root,
            dimension,
            out_of_bounds,
        })
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Visits every entry whose shape intersects the query shape.
    pub fn intersection_query(
        &self,
        query: &Shape,
        visitor: &mut dyn SpatialVisitor,
    ) -> SpatialResult<()> {
        self.check_dimension(query)?;
        self.range_query(query, Relation::Intersects, visitor)
    }

    /// Visits every entry whose shape fully contains the query shape.
    pub fn containment_query(
        &self,
        query: &Shape,
        visitor: &mut dyn SpatialVisitor,
    ) -> SpatialResult<()> {
        self.check_dimension(query)?;
        self.range_query(query, Relation::Contains, visitor)
    }

    /// Point-location query: an intersection query with a point promoted to
    /// a degenerate region for relation testing.
    pub fn point_location_query(
        &self,
        query: &Shape,
        visitor: &mut dyn SpatialVisitor,
    ) -> SpatialResult<()> {
        self.check_dimension(query)?;
        let promoted = Shape::Region(query.bounds());
        self.range_query(&promoted, Relation::Intersects, visitor)
    }

    /// Declared in the contract but intentionally unimplemented by the base
    /// engine; concrete index variants may define it.
    pub fn nearest_neighbour_query(
        &self,
        _query: &Shape,
        _count: usize,
    ) -> SpatialResult<Vec<(u64, f64)>> {
        Err(SpatialError::Unsupported("nearest neighbour query"))
    }

    /// Inserts `(shape, data)` into the tree.
    ///
    /// The insertion descends to the leaf whose entry needs the least
    /// enlargement (ties broken by smaller area), enlarging the recorded
    /// bounds along the way, and flushes the mutated path bottom-up.
    pub fn insert_data(&self, data: u64, shape: &Shape) -> SpatialResult<()> {
        self.check_dimension(shape)?;

        let bounds = shape.bounds();
        if !self.root.shape()?.contains(&bounds) {
            self.insert_data_out_of_bounds(&bounds)?;
        }

        let mut path: Vec<NodeRef> = Vec::new();
        let mut node = self.root.clone();

        while !node.is_leaf()? {
            let count = node.entry_count()?;
            if count == 0 {
                return Err(SpatialError::Corrupted(
                    "branch node without children".into(),
                ));
            }

            let mut best = 0;
            let mut best_enlargement = f64::INFINITY;
            let mut best_area = f64::INFINITY;
            for i in 0..count {
                let child_bounds = node.entry(i)?.shape.bounds();
                let enlargement = child_bounds.enlargement(&bounds);
                let area = child_bounds.area();
                if enlargement < best_enlargement
                    || (enlargement == best_enlargement && area < best_area)
                {
                    best = i;
                    best_enlargement = enlargement;
                    best_area = area;
                }
            }

            let chosen_bounds = node.entry(best)?.shape.bounds().union(&bounds);
            node.set_entry_shape(best, Shape::Region(chosen_bounds.clone()))?;

            let child = node.sub_node(best)?;
            child.set_shape(child.shape()?.union(&bounds))?;

            path.push(node);
            node = child;
        }

        node.add_entry(Entry::new(shape.clone(), EntryData::Key(data)))?;
        log::debug!("inserted entry {data} into leaf at depth {}", path.len());

        node.save()?;
        for ancestor in path.iter().rev() {
            ancestor.save()?;
        }
        Ok(())
    }

    /// Deletes the entry equal to `(shape, data)`.
    ///
    /// Returns `Ok(false)` when the shape lies outside the root's bounds or
    /// no matching entry exists; deletion is never an error for absent
    /// entries.
    pub fn delete_data(&self, shape: &Shape, data: u64) -> SpatialResult<bool> {
        self.check_dimension(shape)?;

        let bounds = shape.bounds();
        if !self.root.shape()?.contains(&bounds) {
            return Ok(false);
        }

        let removed = self.delete_in(&self.root, shape, &bounds, data)?;
        if removed {
            log::debug!("deleted entry {data}");
        }
        Ok(removed)
    }

    /// Policy hook for insertions whose bounds escape the root shape.
    fn insert_data_out_of_bounds(&self, bounds: &Region) -> SpatialResult<()> {
        match self.out_of_bounds {
            OutOfBoundsPolicy::Reject => Err(SpatialError::InvalidArgument(
                "insertion shape lies outside the root's bounding shape".into(),
            )),
            OutOfBoundsPolicy::GrowRoot => {
                let grown = self.root.shape()?.union(bounds);
                log::debug!("growing root bounds to {grown}");
                self.root.set_shape(grown)?;
                self.root.save()
            }
        }
    }

    fn delete_in(
        &self,
        node: &NodeRef,
        shape: &Shape,
        bounds: &Region,
        data: u64,
    ) -> SpatialResult<bool> {
        if node.is_leaf()? {
            let count = node.entry_count()?;
            for i in 0..count {
                let entry = node.entry(i)?;
                if entry.data == EntryData::Key(data) && entry.shape == *shape {
                    node.remove_entry(i)?;
                    // The root keeps its configured bounds; inner nodes
                    // shrink to the union of what remains.
                    if !Arc::ptr_eq(node, &self.root) {
                        if let Some(shrunk) = self.union_of_entries(node)? {
                            node.set_shape(shrunk)?;
                        }
                    }
                    node.save()?;
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        let count = node.entry_count()?;
        for i in 0..count {
            if !node.entry(i)?.shape.bounds().contains(bounds) {
                continue;
            }
            let child = node.sub_node(i)?;
            if self.delete_in(&child, shape, bounds, data)? {
                node.set_entry_shape(i, Shape::Region(child.shape()?))?;
                if !Arc::ptr_eq(node, &self.root) {
                    if let Some(shrunk) = self.union_of_entries(node)? {
                        node.set_shape(shrunk)?;
                    }
                }
                node.save()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn union_of_entries(&self, node: &NodeRef) -> SpatialResult<Option<Region>> {
        let count = node.entry_count()?;
        let mut union: Option<Region> = None;
        for i in 0..count {
            let bounds = node.entry(i)?.shape.bounds();
            union = Some(match union {
                Some(u) => u.union(&bounds),
                None => bounds,
            });
        }
        Ok(union)
    }

    /// Range-query state machine.
    ///
    /// Uses an explicit stack bounded by O(depth): after processing a node,
    /// the first unvisited matching child is pushed together with the node
    /// itself, so the node is re-entered later to resume scanning its
    /// remaining children. The only resumption state is the visited flag on
    /// already-examined children; re-entry re-scans the child list from the
    /// start. Children whose shape fails the predicate are marked visited
    /// immediately and never examined again.
    fn range_query(
        &self,
        query: &Shape,
        relation: Relation,
        visitor: &mut dyn SpatialVisitor,
    ) -> SpatialResult<()> {
        self.root.set_visited(false);

        let mut stack: Vec<NodeRef> = Vec::new();
        if relation.test(&Shape::Region(self.root.shape()?), query) {
            stack.push(self.root.clone());
        }

        while let Some(node) = stack.pop() {
            if !node.is_visited() {
                visitor.visit_node(&node);
                if node.is_leaf()? {
                    for i in 0..node.entry_count()? {
                        let entry = node.entry(i)?;
                        if relation.test(&entry.shape, query) {
                            visitor.visit_data(&entry);
                        }
                    }
                } else {
                    for i in 0..node.entry_count()? {
                        node.sub_node(i)?.set_visited(false);
                    }
                }
                node.set_visited(true);
            }

            if node.is_leaf()? {
                continue;
            }

            for i in 0..node.entry_count()? {
                let child = node.sub_node(i)?;
                if child.is_visited() {
                    continue;
                }
                if relation.test(&node.entry(i)?.shape, query) {
                    stack.push(node.clone());
                    stack.push(child);
                    break;
                }
                // Prune: never revisit to avoid recomputing the relation.
                child.set_visited(true);
            }
        }
        Ok(())
    }

    /// Convenience wrapper collecting the payload ids of all entries whose
    /// shape intersects the query shape.
    pub fn collect_intersecting(&self, query: &Shape) -> SpatialResult<Vec<u64>> {
        let mut collector = KeyCollector::default();
        self.intersection_query(query, &mut collector)?;
        Ok(collector.keys)
    }

    /// Convenience wrapper collecting the payload ids of all entries whose
    /// shape contains the query shape.
    pub fn collect_containing(&self, query: &Shape) -> SpatialResult<Vec<u64>> {
        let mut collector = KeyCollector::default();
        self.containment_query(query, &mut collector)?;
        Ok(collector.keys)
    }

    fn check_dimension(&self, shape: &Shape) -> SpatialResult<()> {
        if shape.dimension() != self.dimension {
            return Err(SpatialError::InvalidArgument(
                "wrong number of dimensions".into(),
            ));
        }
        Ok(())
    }
}

/// Visitor collecting matching leaf payload ids.
#[derive(Default)]
struct KeyCollector {
    keys: Vec<u64>,
}

impl SpatialVisitor for KeyCollector {
    fn visit_node(&mut self, _node: &NodeRef) {}

    fn visit_data(&mut self, entry: &Entry) {
        if let EntryData::Key(key) = entry.data {
            self.keys.push(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemoryNode;
    use crate::shape::Point;

    fn root_region() -> Region {
        Region::rect(0.0, 0.0, 100.0, 100.0)
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn scenario_index() -> SpatialIndex {
        init_logging();
        // 2-D index with root region [0,100]x[0,100] and three points.
        let root = MemoryNode::leaf(root_region());
        let index = SpatialIndex::new(root, 2).unwrap();
        index.insert_data(1, &Point::at(10.0, 10.0).into()).unwrap();
        index.insert_data(2, &Point::at(90.0, 90.0).into()).unwrap();
        index.insert_data(3, &Point::at(50.0, 50.0).into()).unwrap();
        index
    }

    /// Visitor that records visited nodes to assert pruning behavior.
    #[derive(Default)]
    struct CountingVisitor {
        nodes: Vec<NodeRef>,
        keys: Vec<u64>,
    }

    impl SpatialVisitor for CountingVisitor {
        fn visit_node(&mut self, node: &NodeRef) {
            self.nodes.push(node.clone());
        }

        fn visit_data(&mut self, entry: &Entry) {
            if let EntryData::Key(key) = entry.data {
                self.keys.push(key);
            }
        }
    }

    #[test]
    fn test_intersection_query_scenario() {
        let index = scenario_index();
        let query: Shape = Region::rect(0.0, 0.0, 60.0, 60.0).into();
        let mut hits = index.collect_intersecting(&query).unwrap();
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 3]);
    }

    #[test]
    fn test_dimension_mismatch_is_invalid_argument() {
        let index = scenario_index();
        let query: Shape = Point::new(vec![1.0, 2.0, 3.0]).into();

        assert!(matches!(
            index.collect_intersecting(&query),
            Err(SpatialError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.insert_data(9, &query),
            Err(SpatialError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.delete_data(&query, 9),
            Err(SpatialError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_out_of_bounds_delete_returns_false() {
        let index = scenario_index();
        let outside: Shape = Point::at(200.0, 200.0).into();
        assert!(!index.delete_data(&outside, 9).unwrap());
    }

    #[test]
    fn test_out_of_bounds_insert_rejected() {
        let index = scenario_index();
        let outside: Shape = Point::at(200.0, 200.0).into();
        assert!(matches!(
            index.insert_data(9, &outside),
            Err(SpatialError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_grow_root_policy_accepts_out_of_bounds_insert() {
        let root = MemoryNode::leaf(root_region());
        let index =
            SpatialIndex::with_policy(root, 2, OutOfBoundsPolicy::GrowRoot).unwrap();

        let outside: Shape = Point::at(200.0, 200.0).into();
        index.insert_data(9, &outside).unwrap();

        assert!(index
            .root()
            .shape()
            .unwrap()
            .contains(&Point::at(200.0, 200.0).to_region()));
        assert_eq!(index.collect_intersecting(&outside).unwrap(), vec![9]);
    }

    #[test]
    fn test_insert_delete_round_trip() {
        let index = scenario_index();
        let everything: Shape = Shape::Region(root_region());
        let before = {
            let mut keys = index.collect_intersecting(&everything).unwrap();
            keys.sort_unstable();
            keys
        };

        let shape: Shape = Point::at(33.0, 44.0).into();
        index.insert_data(7, &shape).unwrap();
        assert!(index.delete_data(&shape, 7).unwrap());

        let mut after = index.collect_intersecting(&everything).unwrap();
        after.sort_unstable();
        assert_eq!(before, after);

        // A second delete of the same entry finds nothing.
        assert!(!index.delete_data(&shape, 7).unwrap());
    }

    #[test]
    fn test_delete_requires_matching_shape_and_id() {
        let index = scenario_index();
        assert!(!index.delete_data(&Point::at(10.0, 10.0).into(), 99).unwrap());
        assert!(!index.delete_data(&Point::at(11.0, 10.0).into(), 1).unwrap());
        assert!(index.delete_data(&Point::at(10.0, 10.0).into(), 1).unwrap());
    }

    #[test]
    fn test_containment_query() {
        let root = MemoryNode::leaf(root_region());
        let index = SpatialIndex::new(root, 2).unwrap();
        index
            .insert_data(1, &Region::rect(0.0, 0.0, 50.0, 50.0).into())
            .unwrap();
        index
            .insert_data(2, &Region::rect(20.0, 20.0, 30.0, 30.0).into())
            .unwrap();
        index
            .insert_data(3, &Region::rect(60.0, 60.0, 90.0, 90.0).into())
            .unwrap();

        // Entries whose shape contains the query region.
        let query: Shape = Region::rect(22.0, 22.0, 28.0, 28.0).into();
        let mut hits = index.collect_containing(&query).unwrap();
        hits.sort_unstable();
        assert_eq!(hits, vec![1, 2]);
    }

    #[test]
    fn test_point_location_query() {
        let root = MemoryNode::leaf(root_region());
        let index = SpatialIndex::new(root, 2).unwrap();
        index
            .insert_data(1, &Region::rect(0.0, 0.0, 50.0, 50.0).into())
            .unwrap();
        index
            .insert_data(2, &Region::rect(40.0, 40.0, 90.0, 90.0).into())
            .unwrap();

        let mut visitor = CountingVisitor::default();
        index
            .point_location_query(&Point::at(45.0, 45.0).into(), &mut visitor)
            .unwrap();
        visitor.keys.sort_unstable();
        assert_eq!(visitor.keys, vec![1, 2]);

        let mut visitor = CountingVisitor::default();
        index
            .point_location_query(&Point::at(10.0, 10.0).into(), &mut visitor)
            .unwrap();
        assert_eq!(visitor.keys, vec![1]);
    }

    #[test]
    fn test_multi_level_traversal_and_pruning() {
        // Two leaves under one branch; a query touching only the left leaf
        // must never visit the right one.
        let left = MemoryNode::leaf(Region::rect(0.0, 0.0, 50.0, 100.0));
        let right = MemoryNode::leaf(Region::rect(50.0, 0.0, 100.0, 100.0));
        left.add_entry(Entry::new(Point::at(10.0, 10.0).into(), EntryData::Key(1)))
            .unwrap();
        left.add_entry(Entry::new(Point::at(40.0, 40.0).into(), EntryData::Key(2)))
            .unwrap();
        right
            .add_entry(Entry::new(Point::at(90.0, 90.0).into(), EntryData::Key(3)))
            .unwrap();

        let right_ref: NodeRef = right;
        let root = MemoryNode::branch(
            root_region(),
            vec![left as NodeRef, right_ref.clone()],
        )
        .unwrap();
        let index = SpatialIndex::new(root, 2).unwrap();

        let mut visitor = CountingVisitor::default();
        index
            .intersection_query(&Region::rect(0.0, 0.0, 45.0, 45.0).into(), &mut visitor)
            .unwrap();

        visitor.keys.sort_unstable();
        assert_eq!(visitor.keys, vec![1, 2]);
        // Root and left leaf only; the pruned right leaf is never entered.
        assert_eq!(visitor.nodes.len(), 2);
        assert!(visitor
            .nodes
            .iter()
            .all(|n| !Arc::ptr_eq(n, &right_ref)));
        // Each visited node fires its callback exactly once despite the
        // parent being re-entered to resume the child scan.
        for (i, a) in visitor.nodes.iter().enumerate() {
            for b in visitor.nodes.iter().skip(i + 1) {
                assert!(!Arc::ptr_eq(a, b));
            }
        }
    }

    #[test]
    fn test_insert_descends_into_multi_level_tree() {
        let left = MemoryNode::leaf(Region::rect(0.0, 0.0, 50.0, 100.0));
        let right = MemoryNode::leaf(Region::rect(50.0, 0.0, 100.0, 100.0));
        let root = MemoryNode::branch(
            root_region(),
            vec![left.clone() as NodeRef, right as NodeRef],
        )
        .unwrap();
        let index = SpatialIndex::new(root, 2).unwrap();

        index.insert_data(1, &Point::at(10.0, 10.0).into()).unwrap();
        assert_eq!(left.entry_count().unwrap(), 1);

        let hits = index
            .collect_intersecting(&Region::rect(0.0, 0.0, 20.0, 20.0).into())
            .unwrap();
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn test_intersection_soundness_random_points() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let root = MemoryNode::leaf(root_region());
        let index = SpatialIndex::new(root, 2).unwrap();

        let mut points = Vec::new();
        for id in 0..200u64 {
            let p = Point::at(rng.gen_range(0.0..100.0), rng.gen_range(0.0..100.0));
            index.insert_data(id, &p.clone().into()).unwrap();
            points.push((id, p));
        }

        let query_region = Region::rect(25.0, 25.0, 75.0, 75.0);
        let mut expected: Vec<u64> = points
            .iter()
            .filter(|(_, p)| query_region.intersects(&p.to_region()))
            .map(|(id, _)| *id)
            .collect();
        expected.sort_unstable();

        let mut hits = index
            .collect_intersecting(&query_region.into())
            .unwrap();
        hits.sort_unstable();
        assert_eq!(hits, expected);
    }

    #[test]
    fn test_nearest_neighbour_unsupported() {
        let index = scenario_index();
        assert!(matches!(
            index.nearest_neighbour_query(&Point::at(0.0, 0.0).into(), 3),
            Err(SpatialError::Unsupported(_))
        ));
    }
}
