//! Neighbor topology of the current partition.
//!
//! For every worker `i` a communication group is split off the world
//! containing `i` and its neighbors. Worker `i` scatters its halo buffer
//! over that group; each neighbor receives its segment through the same
//! group, knowing `i`'s group rank and the broadcast scatter shape.

use super::comm::Communicator;
use super::tile::Tile;
use crate::error::{DlbError, Result};
use crate::protocol_error;

/// What this worker needs to receive from one neighbor.
#[derive(Debug)]
pub struct NeighborRecord<C> {
    /// Neighbor's world rank.
    pub rank: usize,
    /// Neighbor's rank inside its own group.
    pub root: usize,
    /// The neighbor's group.
    pub comm: C,
    /// Where the neighbor's segment lands in this worker's receive buffer.
    pub displ: usize,
    pub count: usize,
    /// The neighbor's scatter shape, indexed by group rank.
    pub scatter_counts: Vec<usize>,
    pub scatter_displs: Vec<usize>,
}

/// Sorted world ranks of the tiles sharing an edge with `tiles[me]`.
pub fn count_neighbors(tiles: &[Tile], me: usize) -> Vec<usize> {
    let mine = &tiles[me];
    let mut neighbors: Vec<usize> = tiles
        .iter()
        .filter(|t| t.rank != me && t.is_neighbor(mine))
        .map(|t| t.rank)
        .collect();
    neighbors.sort_unstable();
    neighbors
}

/// Scatter counts and displacements of `tiles[me]` over its own group,
/// in halo-buffer values (two per perimeter point).
///
/// The group is ordered by world rank, so the entry for `me` sits between
/// the lower- and higher-ranked neighbors and is left empty.
pub fn count_displacements(
    tiles: &[Tile],
    me: usize,
    neighbors: &[usize],
) -> Result<(Vec<usize>, Vec<usize>)> {
    let mine = &tiles[me];
    let mut counts = Vec::with_capacity(neighbors.len() + 1);
    let mut displs = Vec::with_capacity(neighbors.len() + 1);
    let mut self_inserted = false;
    for &n in neighbors {
        if !self_inserted && n > me {
            counts.push(0);
            displs.push(0);
            self_inserted = true;
        }
        let (offset, count) = mine.overlap_offset(&tiles[n])?;
        counts.push(2 * count);
        displs.push(2 * offset);
    }
    if !self_inserted {
        counts.push(0);
        displs.push(0);
    }
    Ok((counts, displs))
}

/// Group rank of world rank `root` in the group made of `root` and its
/// neighbors.
fn group_rank(tiles: &[Tile], root: usize, member: usize) -> Result<usize> {
    let mut members = count_neighbors(tiles, root);
    members.push(root);
    members.sort_unstable();
    members.binary_search(&member).map_err(|_| {
        DlbError::Geometry(format!("rank {member} is not adjacent to rank {root}"))
    })
}

#[derive(Debug)]
pub struct TopologyDescriptor<C> {
    rank: usize,
    edge: usize,
    tiles: Vec<Tile>,
    neighbors: Vec<usize>,
    counts: Vec<usize>,
    displs: Vec<usize>,
    my_comm: C,
    neighbor_data: Vec<NeighborRecord<C>>,
    mid_comm: Option<C>,
}

impl<C: Communicator> TopologyDescriptor<C> {
    /// Collective over `world`: build every neighbor group and the middle
    /// communicator for `tiles` (indexed by rank) on a domain of `edge`.
    pub fn build(world: &C, tiles: Vec<Tile>, edge: usize) -> Result<Self> {
        let rank = world.rank();
        let _span = tracing::debug_span!("update_topology", rank).entered();

        if tiles.len() != world.size() {
            return Err(DlbError::Invariant(format!(
                "{} tiles for {} workers",
                tiles.len(),
                world.size()
            )));
        }
        if let Some((i, t)) = tiles.iter().enumerate().find(|(i, t)| t.rank != *i) {
            return Err(DlbError::Invariant(format!(
                "tile at index {i} belongs to rank {}",
                t.rank
            )));
        }

        let neighbors = count_neighbors(&tiles, rank);
        let (counts, displs) = count_displacements(&tiles, rank, &neighbors)?;
        let (my_comm, neighbor_data) = Self::init_groups(world, &tiles, &neighbors, &counts, &displs)?;
        let mid_comm = Self::mid_update(world, &tiles[rank], edge)?;

        tracing::debug!(
            rank,
            neighbors = ?neighbors,
            middle = mid_comm.is_some(),
            "topology rebuilt"
        );

        Ok(Self {
            rank,
            edge,
            tiles,
            neighbors,
            counts,
            displs,
            my_comm,
            neighbor_data,
            mid_comm,
        })
    }

    /// One split per world rank, each followed by a barrier. The group's
    /// root broadcasts its scatter shape to the members.
    fn init_groups(
        world: &C,
        tiles: &[Tile],
        neighbors: &[usize],
        counts: &[usize],
        displs: &[usize],
    ) -> Result<(C, Vec<NeighborRecord<C>>)> {
        let me = world.rank();
        let mut my_comm = None;
        let mut neighbor_data = Vec::with_capacity(neighbors.len());

        for color in 0..world.size() {
            let member = color == me || neighbors.binary_search(&color).is_ok();
            let group = world.split(member.then_some(color), me)?;
            world.barrier()?;

            let Some(group) = group else {
                if member {
                    return Err(protocol_error!("split", "no group returned for color {}", color));
                }
                continue;
            };

            let root = group_rank(tiles, color, color)?;
            let shape: Vec<u64> = if color == me {
                counts.iter().chain(displs).map(|&v| v as u64).collect()
            } else {
                Vec::new()
            };
            let shape = group.broadcast(root, shape.as_slice())?;
            if shape.len() != 2 * group.size() {
                return Err(protocol_error!(
                    "broadcast",
                    "scatter shape of {} entries for a group of {}",
                    shape.len(),
                    group.size()
                ));
            }
            let (scatter_counts, scatter_displs): (Vec<usize>, Vec<usize>) = (
                shape[..group.size()].iter().map(|&v| v as usize).collect(),
                shape[group.size()..].iter().map(|&v| v as usize).collect(),
            );

            if color == me {
                my_comm = Some(group);
                continue;
            }

            let (offset, count) = tiles[me].overlap_offset(&tiles[color])?;
            if scatter_counts[group.rank()] != 2 * count {
                return Err(DlbError::Geometry(format!(
                    "rank {color} sends {} halo values, rank {me} expects {}",
                    scatter_counts[group.rank()],
                    2 * count
                )));
            }
            neighbor_data.push(NeighborRecord {
                rank: color,
                root,
                comm: group,
                displ: 2 * offset,
                count: 2 * count,
                scatter_counts,
                scatter_displs,
            });
        }

        let my_comm = my_comm
            .ok_or_else(|| protocol_error!("split", "rank {} has no own group", me))?;
        Ok((my_comm, neighbor_data))
    }

    /// Group of the workers whose tiles span the domain's middle column.
    fn mid_update(world: &C, tile: &Tile, edge: usize) -> Result<Option<C>> {
        let middle = tile.spans_column(edge / 2);
        world.split(middle.then_some(0), world.rank())
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self) -> &Tile {
        &self.tiles[self.rank]
    }

    pub fn edge(&self) -> usize {
        self.edge
    }

    /// Sorted world ranks of this worker's neighbors.
    pub fn neighbors(&self) -> &[usize] {
        &self.neighbors
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn displs(&self) -> &[usize] {
        &self.displs
    }

    pub fn my_comm(&self) -> &C {
        &self.my_comm
    }

    pub fn neighbor_data(&self) -> &[NeighborRecord<C>] {
        &self.neighbor_data
    }

    pub fn mid_comm(&self) -> Option<&C> {
        self.mid_comm.as_ref()
    }

    pub fn is_middle(&self) -> bool {
        self.mid_comm.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlb::comm_local::LocalUniverse;
    use crate::dlb::dims::Dims;

    fn grid_2x2() -> Vec<Tile> {
        vec![
            Tile::new(0, Dims::new(0, 0), Dims::square(32)),
            Tile::new(1, Dims::new(32, 0), Dims::square(32)),
            Tile::new(2, Dims::new(0, 32), Dims::square(32)),
            Tile::new(3, Dims::new(32, 32), Dims::square(32)),
        ]
    }

    #[test]
    fn neighbors_of_grid() {
        let tiles = grid_2x2();
        assert_eq!(count_neighbors(&tiles, 0), vec![1, 2]);
        assert_eq!(count_neighbors(&tiles, 3), vec![1, 2]);
    }

    #[test]
    fn displacements_leave_gap_for_self() {
        let tiles = grid_2x2();
        // rank 0: group [0, 1, 2]; RIGHT segment at 32, BOTTOM at 64
        let (counts, displs) = count_displacements(&tiles, 0, &[1, 2]).unwrap();
        assert_eq!(counts, vec![0, 64, 64]);
        assert_eq!(displs, vec![0, 64, 128]);
        // rank 1: group [0, 1, 3]; LEFT segment at 96, BOTTOM at 64
        let (counts, displs) = count_displacements(&tiles, 1, &[0, 3]).unwrap();
        assert_eq!(counts, vec![64, 0, 64]);
        assert_eq!(displs, vec![192, 0, 128]);
        // rank 3: group [1, 2, 3]
        let (counts, _) = count_displacements(&tiles, 3, &[1, 2]).unwrap();
        assert_eq!(counts, vec![64, 64, 0]);
    }

    #[test]
    fn build_over_local_workers() {
        let results = LocalUniverse::run(4, |world| {
            let topo = TopologyDescriptor::build(&world, grid_2x2(), 64)?;
            let recs: Vec<(usize, usize, usize, usize)> = topo
                .neighbor_data()
                .iter()
                .map(|n| (n.rank, n.root, n.displ, n.count))
                .collect();
            Ok((topo.my_comm().size(), recs, topo.is_middle()))
        })
        .unwrap();

        let (size, recs, middle) = &results[0];
        assert_eq!(*size, 3);
        // rank 1 is root of group [0, 1, 3] at position 1
        assert_eq!(recs[0], (1, 1, 64, 64));
        // rank 2 is root of group [0, 2, 3] at position 1
        assert_eq!(recs[1], (2, 1, 128, 64));
        // only the right-hand tiles span column 32
        assert!(!middle);
        assert!(results[1].2);
    }

    #[test]
    fn mismatched_tile_order_is_rejected() {
        let err = LocalUniverse::run(2, |world| {
            let tiles = vec![
                Tile::new(1, Dims::new(0, 0), Dims::new(32, 64)),
                Tile::new(0, Dims::new(32, 0), Dims::new(32, 64)),
            ];
            TopologyDescriptor::build(&world, tiles, 64).map(|_| ())
        })
        .unwrap_err();
        assert!(matches!(err, DlbError::Invariant(_)));
    }
}
