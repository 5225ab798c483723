//! Two-dimensional integer coordinates and sizes in grid-point units.

use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

/// A 2D integer pair used both as a position and as an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Dims {
    pub x: usize,
    pub y: usize,
}

impl Dims {
    pub const fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Same value on both axes.
    pub const fn square(v: usize) -> Self {
        Self { x: v, y: v }
    }

    /// Number of points covered when interpreted as a size.
    pub const fn area(&self) -> usize {
        self.x * self.y
    }

    /// Component-wise saturating difference.
    pub fn saturating_sub(self, other: Dims) -> Dims {
        Dims::new(self.x.saturating_sub(other.x), self.y.saturating_sub(other.y))
    }
}

impl Add for Dims {
    type Output = Dims;
    fn add(self, rhs: Dims) -> Dims {
        Dims::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Dims {
    type Output = Dims;
    fn sub(self, rhs: Dims) -> Dims {
        Dims::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul for Dims {
    type Output = Dims;
    fn mul(self, rhs: Dims) -> Dims {
        Dims::new(self.x * rhs.x, self.y * rhs.y)
    }
}

impl Div for Dims {
    type Output = Dims;
    fn div(self, rhs: Dims) -> Dims {
        Dims::new(self.x / rhs.x, self.y / rhs.y)
    }
}

impl Mul<usize> for Dims {
    type Output = Dims;
    fn mul(self, rhs: usize) -> Dims {
        Dims::new(self.x * rhs, self.y * rhs)
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}
