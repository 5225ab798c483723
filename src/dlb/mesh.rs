//! The implicit regular mesh of load-balanceable objects.
//!
//! Objects are fixed-size sub-rectangles of the grid enumerated row-major:
//! `gid = row * cols + col`. Nothing is stored per object; every mapping is
//! derived from the edge length and the object size.

use super::dims::Dims;
use super::tile::Tile;
use crate::error::{DlbError, Result};

/// Global object identifier.
pub type Gid = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMesh {
    edge: usize,
    object: Dims,
    cols: usize,
    rows: usize,
}

impl ObjectMesh {
    pub fn new(edge: usize, object: Dims) -> Result<Self> {
        if object.x == 0 || object.y == 0 {
            return Err(DlbError::Config("object size must be non-zero".into()));
        }
        if edge == 0 || edge % object.x != 0 || edge % object.y != 0 {
            return Err(DlbError::Config(format!(
                "domain edge {edge} is not a multiple of object size {object}"
            )));
        }
        Ok(Self {
            edge,
            object,
            cols: edge / object.x,
            rows: edge / object.y,
        })
    }

    pub fn edge(&self) -> usize {
        self.edge
    }

    pub fn object_size(&self) -> Dims {
        self.object
    }

    pub fn object_area(&self) -> usize {
        self.object.area()
    }

    /// Objects per mesh row.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Objects per mesh column.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn total_objects(&self) -> usize {
        self.cols * self.rows
    }

    /// Grid-point position of an object's top-left corner.
    pub fn coords_of(&self, gid: Gid) -> Dims {
        Dims::new((gid % self.cols) * self.object.x, (gid / self.cols) * self.object.y)
    }

    /// Object containing grid point `coords`.
    pub fn gid_of(&self, coords: Dims) -> Gid {
        (coords.y / self.object.y) * self.cols + coords.x / self.object.x
    }

    /// Sorted GIDs covered by `tile`.
    pub fn assigned_gids(&self, tile: &Tile) -> Vec<Gid> {
        let first = tile.position / self.object;
        let span = tile.size / self.object;
        let mut gids = Vec::with_capacity(span.area());
        for row in first.y..first.y + span.y {
            for col in first.x..first.x + span.x {
                gids.push(row * self.cols + col);
            }
        }
        gids
    }

    /// Per-rank sorted GID buckets for a partition indexed by rank.
    pub fn assignment(&self, tiles: &[Tile]) -> Vec<Vec<Gid>> {
        tiles.iter().map(|t| self.assigned_gids(t)).collect()
    }

    /// Rectangle spanned by a set of GIDs.
    ///
    /// The GIDs are sorted; the first and last object define the rectangle,
    /// whose object count must equal the number of GIDs given.
    pub fn resolve_partition(&self, gids: &[Gid]) -> Result<(Dims, Dims)> {
        let mut sorted = gids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let (Some(&first), Some(&last)) = (sorted.first(), sorted.last()) else {
            return Err(DlbError::Invariant("cannot resolve an empty object set".into()));
        };
        if last >= self.total_objects() {
            return Err(DlbError::Invariant(format!(
                "object {last} outside mesh of {} objects",
                self.total_objects()
            )));
        }

        let first_pos = self.coords_of(first);
        let last_pos = self.coords_of(last);
        if last_pos.x < first_pos.x {
            return Err(DlbError::Invariant(format!(
                "objects {first}..={last} do not form a rectangle"
            )));
        }
        let size = last_pos + self.object - first_pos;
        let expected = self.assigned_gids(&Tile::new(0, first_pos, size));
        if expected != sorted || sorted.len() != gids.len() {
            return Err(DlbError::Invariant(format!(
                "resolved rectangle {} at {} holds {} objects, {} given",
                size,
                first_pos,
                expected.len(),
                gids.len()
            )));
        }
        Ok((first_pos, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> ObjectMesh {
        ObjectMesh::new(64, Dims::square(8)).unwrap()
    }

    #[test]
    fn gid_coordinate_mapping() {
        let m = mesh();
        assert_eq!(m.cols(), 8);
        assert_eq!(m.total_objects(), 64);
        assert_eq!(m.coords_of(0), Dims::new(0, 0));
        assert_eq!(m.coords_of(9), Dims::new(8, 8));
        assert_eq!(m.gid_of(Dims::new(63, 63)), 63);
        assert_eq!(m.gid_of(Dims::new(17, 3)), 2);
        for gid in 0..m.total_objects() {
            assert_eq!(m.gid_of(m.coords_of(gid)), gid);
        }
    }

    #[test]
    fn rejects_non_divisible_edge() {
        assert!(matches!(
            ObjectMesh::new(60, Dims::square(8)),
            Err(DlbError::Config(_))
        ));
    }

    #[test]
    fn assigned_gids_of_tile() {
        let m = mesh();
        let tile = Tile::new(0, Dims::new(16, 8), Dims::new(16, 16));
        assert_eq!(m.assigned_gids(&tile), vec![10, 11, 18, 19]);
    }

    #[test]
    fn resolve_partition_round_trip() {
        let m = mesh();
        let tile = Tile::new(0, Dims::new(24, 32), Dims::new(32, 16));
        let gids = m.assigned_gids(&tile);
        assert_eq!(m.resolve_partition(&gids).unwrap(), (tile.position, tile.size));
    }

    #[test]
    fn resolve_partition_rejects_ragged_sets() {
        let m = mesh();
        // an L-shape: count differs from the spanned rectangle
        assert!(matches!(m.resolve_partition(&[0, 1, 8]), Err(DlbError::Invariant(_))));
        // last object left of the first
        assert!(m.resolve_partition(&[3, 8]).is_err());
        assert!(m.resolve_partition(&[]).is_err());
        assert!(m.resolve_partition(&[64]).is_err());
        // right count, wrong members
        assert!(m.resolve_partition(&[0, 2, 8, 9]).is_err());
        // duplicates
        assert!(m.resolve_partition(&[0, 0]).is_err());
    }
}
