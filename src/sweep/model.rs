use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a task in the result grid.
///
/// `row` indexes the imaginary axis and `col` the real axis. Storage depends
/// on this pairing, so it must not be swapped anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coordinate {
    pub row: usize,
    pub col: usize,
}

impl Coordinate {
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Fixed dense shape of a result grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

impl GridShape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub const fn square(n: usize) -> Self {
        Self { rows: n, cols: n }
    }

    pub const fn len(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn contains(&self, coordinate: Coordinate) -> bool {
        coordinate.row < self.rows && coordinate.col < self.cols
    }

    /// Row-major slot index, or `None` when the coordinate is outside the grid.
    pub fn slot(&self, coordinate: Coordinate) -> Option<usize> {
        self.contains(coordinate)
            .then(|| coordinate.row * self.cols + coordinate.col)
    }

    pub fn coordinate(&self, slot: usize) -> Option<Coordinate> {
        (slot < self.len()).then(|| Coordinate::new(slot / self.cols, slot % self.cols))
    }

    /// All coordinates in row-major order
    pub fn coordinates(&self) -> impl Iterator<Item = Coordinate> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.cols).map(move |col| Coordinate::new(row, col)))
    }
}

impl fmt::Display for GridShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A point in the complex plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlanePoint {
    pub re: f64,
    pub im: f64,
}

impl PlanePoint {
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

impl fmt::Display for PlanePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.im.is_sign_negative() {
            write!(f, "{}-{}i", self.re, -self.im)
        } else {
            write!(f, "{}+{}i", self.re, self.im)
        }
    }
}

/// Per-task computation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskParameters {
    pub max_iterations: u32,
    pub threshold: f64,
}

impl Default for TaskParameters {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            threshold: 100.0,
        }
    }
}

/// One unit of work: a domain value bound to its grid coordinate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub value: PlanePoint,
    pub coordinate: Coordinate,
    pub parameters: TaskParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub coordinate: Coordinate,
    pub value: f64,
}

/// The five range arguments of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub re_min: f64,
    pub re_max: f64,
    pub im_min: f64,
    pub im_max: f64,
    pub num_points: usize,
}

impl SweepRange {
    pub fn shape(&self) -> GridShape {
        GridShape::square(self.num_points)
    }
}
