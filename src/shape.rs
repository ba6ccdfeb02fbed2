//! N-dimensional geometric primitives used for bounding-box tests.
//!
//! Two shapes exist: a [`Point`] (one coordinate per dimension) and a
//! [`Region`] (a min/max pair per dimension). A point is promoted to a
//! degenerate region for all relation tests, so intersection and containment
//! are defined uniformly over the [`Shape`] enum.
//!
//! All shapes compared within one index must share the same dimension;
//! the index entry points enforce this and reject mismatches.

use serde::{Deserialize, Serialize};

/// An axis-aligned region described by minimum and maximum coordinates
/// per dimension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Region {
    /// Creates a new region from per-dimension minimum and maximum
    /// coordinates. The two slices must have equal, non-zero length and
    /// `min[d] <= max[d]` must hold for every dimension.
    pub fn new(min: Vec<f64>, max: Vec<f64>) -> Region {
        debug_assert_eq!(min.len(), max.len());
        Region { min, max }
    }

    /// Convenience constructor for the common 2-D case.
    pub fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Region {
        Region {
            min: vec![min_x, min_y],
            max: vec![max_x, max_y],
        }
    }

    /// Number of dimensions of this region.
    pub fn dimension(&self) -> usize {
        self.min.len()
    }

    pub fn min(&self) -> &[f64] {
        &self.min
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    /// Checks that `min[d] <= max[d]` holds in every dimension.
    pub fn is_valid(&self) -> bool {
        self.min.len() == self.max.len()
            && self.min.iter().zip(&self.max).all(|(lo, hi)| lo <= hi)
    }

    /// Checks if this region intersects another. Touching boundaries count
    /// as intersection. Regions of mismatched dimension never intersect.
    pub fn intersects(&self, other: &Region) -> bool {
        if self.dimension() != other.dimension() {
            return false;
        }
        (0..self.dimension())
            .all(|d| self.min[d] <= other.max[d] && self.max[d] >= other.min[d])
    }

    /// Checks if this region fully contains another. Regions of mismatched
    /// dimension are never contained.
    pub fn contains(&self, other: &Region) -> bool {
        if self.dimension() != other.dimension() {
            return false;
        }
        (0..self.dimension())
            .all(|d| self.min[d] <= other.min[d] && self.max[d] >= other.max[d])
    }

    /// Returns the union of this region with another.
    pub fn union(&self, other: &Region) -> Region {
        debug_assert_eq!(self.dimension(), other.dimension());
        Region {
            min: self
                .min
                .iter()
                .zip(&other.min)
                .map(|(a, b)| a.min(*b))
                .collect(),
            max: self
                .max
                .iter()
                .zip(&other.max)
                .map(|(a, b)| a.max(*b))
                .collect(),
        }
    }

    /// Expands this region in place to cover another.
    pub fn expand(&mut self, other: &Region) {
        for d in 0..self.dimension() {
            self.min[d] = self.min[d].min(other.min[d]);
            self.max[d] = self.max[d].max(other.max[d]);
        }
    }

    /// Returns the volume (area in 2-D) of this region.
    pub fn area(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(lo, hi)| hi - lo)
            .product()
    }

    /// Returns how much this region's volume would grow if expanded to
    /// cover `other`.
    pub fn enlargement(&self, other: &Region) -> f64 {
        self.union(other).area() - self.area()
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Region({:?}, {:?})", self.min, self.max)
    }
}

/// A point with one coordinate per dimension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    coords: Vec<f64>,
}

impl Point {
    pub fn new(coords: Vec<f64>) -> Point {
        Point { coords }
    }

    /// Convenience constructor for the common 2-D case.
    pub fn at(x: f64, y: f64) -> Point {
        Point { coords: vec![x, y] }
    }

    pub fn dimension(&self) -> usize {
        self.coords.len()
    }

    pub fn coords(&self) -> &[f64] {
        &self.coords
    }

    /// Promotes this point to a degenerate region (min == max).
    pub fn to_region(&self) -> Region {
        Region {
            min: self.coords.clone(),
            max: self.coords.clone(),
        }
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Point({:?})", self.coords)
    }
}

/// A geometric extent used for bounding-box tests: either a point or an
/// axis-aligned region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Point(Point),
    Region(Region),
}

impl Shape {
    pub fn dimension(&self) -> usize {
        match self {
            Shape::Point(p) => p.dimension(),
            Shape::Region(r) => r.dimension(),
        }
    }

    /// Returns the bounding region of this shape. Points become degenerate
    /// regions.
    pub fn bounds(&self) -> Region {
        match self {
            Shape::Point(p) => p.to_region(),
            Shape::Region(r) => r.clone(),
        }
    }

    /// Checks if this shape intersects another.
    pub fn intersects(&self, other: &Shape) -> bool {
        self.bounds().intersects(&other.bounds())
    }

    /// Checks if this shape fully contains another.
    pub fn contains(&self, other: &Shape) -> bool {
        self.bounds().contains(&other.bounds())
    }
}

impl From<Point> for Shape {
    fn from(p: Point) -> Shape {
        Shape::Point(p)
    }
}

impl From<Region> for Shape {
    fn from(r: Region) -> Shape {
        Shape::Region(r)
    }
}
