//! Rectangular tiles of the domain and their geometric relations.
//!
//! A tile is the axis-aligned region owned by one worker, in grid-point
//! units. Halo buffers are serialised around the tile perimeter in the
//! order TOP row, RIGHT column, BOTTOM row, LEFT column, each segment as
//! long as the corresponding tile edge. [`Tile::overlap_offset`] positions a
//! neighbor's shared segment inside that layout and must agree with the
//! packing routines in [`crate::dlb::halo`].

use bytemuck::{Pod, Zeroable};
use std::fmt;

use super::dims::Dims;
use crate::error::{DlbError, Result};

/// Width of the halo margin on every side of a tile, in grid points.
pub const HALO_SIZE: usize = 2;

/// Side of a tile shared with a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    Top,
    Right,
    Bottom,
    Left,
}

impl Edge {
    pub const ALL: [Edge; 4] = [Edge::Top, Edge::Right, Edge::Bottom, Edge::Left];

    /// The edge the neighbor sees when this tile sees `self`.
    pub fn opposite(self) -> Edge {
        match self {
            Edge::Top => Edge::Bottom,
            Edge::Right => Edge::Left,
            Edge::Bottom => Edge::Top,
            Edge::Left => Edge::Right,
        }
    }
}

/// Rectangle owned by one worker plus its owner id and host tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile {
    pub rank: usize,
    pub host: i32,
    pub position: Dims,
    pub size: Dims,
}

impl Tile {
    pub fn new(rank: usize, position: Dims, size: Dims) -> Self {
        Self {
            rank,
            host: 0,
            position,
            size,
        }
    }

    pub fn with_host(mut self, host: i32) -> Self {
        self.host = host;
        self
    }

    /// Last covered point (inclusive) on both axes.
    pub fn end(&self) -> Dims {
        self.position + self.size - Dims::square(1)
    }

    pub fn area(&self) -> usize {
        self.size.area()
    }

    /// Size including the halo margin on every side.
    pub fn ext_size(&self) -> Dims {
        self.size + Dims::square(2 * HALO_SIZE)
    }

    pub fn ext_area(&self) -> usize {
        self.ext_size().area()
    }

    /// Length of the perimeter-serialised halo buffer, in points per layer.
    pub fn halo_len(&self) -> usize {
        2 * (self.size.x + self.size.y)
    }

    pub fn contains(&self, point: Dims) -> bool {
        let end = self.end();
        point.x >= self.position.x && point.x <= end.x && point.y >= self.position.y && point.y <= end.y
    }

    /// Whether `x` lies inside the tile's column range.
    pub fn spans_column(&self, x: usize) -> bool {
        self.position.x <= x && x <= self.end().x
    }

    /// Position and size agree; owner and host are ignored.
    pub fn same_geometry(&self, other: &Tile) -> bool {
        self.position == other.position && self.size == other.size
    }

    /// Which edge of `self` touches `other`, if any.
    ///
    /// Tiles touching only at a corner, overlapping, or disjoint report
    /// `None`.
    pub fn shared_edge(&self, other: &Tile) -> Option<Edge> {
        let end = self.end();
        let tpos = other.position;
        let tend = other.end();

        if intervals_overlap(self.position.x, end.x, tpos.x, tend.x) {
            if end.y + 1 == tpos.y {
                Some(Edge::Bottom)
            } else if tend.y + 1 == self.position.y {
                Some(Edge::Top)
            } else {
                None
            }
        } else if intervals_overlap(self.position.y, end.y, tpos.y, tend.y) {
            if end.x + 1 == tpos.x {
                Some(Edge::Right)
            } else if tend.x + 1 == self.position.x {
                Some(Edge::Left)
            } else {
                None
            }
        } else {
            None
        }
    }

    pub fn is_neighbor(&self, other: &Tile) -> bool {
        self.shared_edge(other).is_some()
    }

    /// Offset and length of the segment shared with `other` inside this
    /// tile's perimeter buffer.
    pub fn overlap_offset(&self, other: &Tile) -> Result<(usize, usize)> {
        let edge = self.shared_edge(other).ok_or_else(|| {
            DlbError::Geometry(format!(
                "tile {} of rank {} does not share an edge with tile {} of rank {}",
                self, self.rank, other, other.rank
            ))
        })?;

        let (start, end, tstart, tend) = match edge {
            Edge::Top | Edge::Bottom => (
                self.position.x,
                self.position.x + self.size.x,
                other.position.x,
                other.position.x + other.size.x,
            ),
            Edge::Right | Edge::Left => (
                self.position.y,
                self.position.y + self.size.y,
                other.position.y,
                other.position.y + other.size.y,
            ),
        };
        let (offset, count) = segment_overlap(start, end, tstart, tend);
        if count == 0 {
            return Err(DlbError::Geometry(format!(
                "degenerate {:?} edge between {} and {}",
                edge, self, other
            )));
        }
        Ok((self.edge_base(edge) + offset, count))
    }

    /// Start of an edge's segment in the perimeter buffer.
    pub fn edge_base(&self, edge: Edge) -> usize {
        match edge {
            Edge::Top => 0,
            Edge::Right => self.size.x,
            Edge::Bottom => self.size.x + self.size.y,
            Edge::Left => 2 * self.size.x + self.size.y,
        }
    }

    pub fn to_msg(&self) -> TileMsg {
        TileMsg {
            pos_x: self.position.x as u32,
            pos_y: self.position.y as u32,
            size_x: self.size.x as u32,
            size_y: self.size.y as u32,
            rank: self.rank as u32,
            host: self.host,
        }
    }

    pub fn from_msg(msg: &TileMsg) -> Self {
        Self {
            rank: msg.rank as usize,
            host: msg.host,
            position: Dims::new(msg.pos_x as usize, msg.pos_y as usize),
            size: Dims::new(msg.size_x as usize, msg.size_y as usize),
        }
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos {} size {}", self.position, self.size)
    }
}

/// Plain-old-data tile record broadcast when a partition changes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TileMsg {
    pub pos_x: u32,
    pub pos_y: u32,
    pub size_x: u32,
    pub size_y: u32,
    pub rank: u32,
    pub host: i32,
}

/// Inclusive 1D intervals `[a0, a1]` and `[b0, b1]` intersect.
fn intervals_overlap(a0: usize, a1: usize, b0: usize, b1: usize) -> bool {
    a0 <= b1 && b0 <= a1
}

/// Offset and length of `[tstart, tend)` clipped to `[start, end)`,
/// relative to `start`.
fn segment_overlap(start: usize, end: usize, tstart: usize, tend: usize) -> (usize, usize) {
    let starts_inside = tstart >= start;
    let ends_inside = tend <= end;
    match (starts_inside, ends_inside) {
        (true, true) => (tstart - start, tend - tstart),
        (true, false) => (tstart - start, end.saturating_sub(tstart)),
        (false, true) => (0, tend.saturating_sub(start)),
        (false, false) => (0, end - start),
    }
}
