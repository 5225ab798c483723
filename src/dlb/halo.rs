//! Halo serialisation and the overlapped halo exchange.
//!
//! The perimeter buffer holds two values per perimeter point, one per halo
//! layer, ordered by increasing coordinate across the edge. Segments follow
//! the order fixed by [`Tile::edge_base`](super::tile::Tile::edge_base):
//!
//! ```text
//! TOP    [0, sx)             send rows 0, 1          receive rows -2, -1
//! RIGHT  [sx, sx+sy)         send cols sx-2, sx-1    receive cols sx, sx+1
//! BOTTOM [sx+sy, 2sx+sy)     send rows sy-2, sy-1    receive rows sy, sy+1
//! LEFT   [2sx+sy, 2sx+2sy)   send cols 0, 1          receive cols -2, -1
//! ```
//!
//! A neighbor's outgoing segment therefore lands exactly on this worker's
//! incoming segment for the shared edge.

use bytemuck::Pod;

use super::block::{Block, HaloBuffers};
use super::comm::{tags, Communicator, Scatter, Tag};
use super::dims::Dims;
use super::tile::HALO_SIZE;
use super::topology::{NeighborRecord, TopologyDescriptor};
use crate::error::{DlbError, Result};

/// Copy the outermost two core layers of `block` into `buf`.
pub fn pack_halo<T: Copy>(block: &[T], ext: Dims, buf: &mut [T]) {
    let h = HALO_SIZE;
    let size = ext.saturating_sub(Dims::square(2 * h));
    let at = |x: usize, y: usize| (y + h) * ext.x + x + h;

    for x in 0..size.x {
        let p = 2 * x;
        buf[p] = block[at(x, 0)];
        buf[p + 1] = block[at(x, 1)];
    }
    for y in 0..size.y {
        let p = 2 * (size.x + y);
        buf[p] = block[at(size.x - 2, y)];
        buf[p + 1] = block[at(size.x - 1, y)];
    }
    for x in 0..size.x {
        let p = 2 * (size.x + size.y + x);
        buf[p] = block[at(x, size.y - 2)];
        buf[p + 1] = block[at(x, size.y - 1)];
    }
    for y in 0..size.y {
        let p = 2 * (2 * size.x + size.y + y);
        buf[p] = block[at(0, y)];
        buf[p + 1] = block[at(1, y)];
    }
}

/// Write `buf` into the halo margin of `block`.
pub fn unpack_halo<T: Copy>(block: &mut [T], ext: Dims, buf: &[T]) {
    let h = HALO_SIZE;
    let size = ext.saturating_sub(Dims::square(2 * h));
    // halo-padded coordinates
    let at = |x: usize, y: usize| y * ext.x + x;

    for x in 0..size.x {
        let p = 2 * x;
        block[at(x + h, 0)] = buf[p];
        block[at(x + h, 1)] = buf[p + 1];
    }
    for y in 0..size.y {
        let p = 2 * (size.x + y);
        block[at(size.x + h, y + h)] = buf[p];
        block[at(size.x + h + 1, y + h)] = buf[p + 1];
    }
    for x in 0..size.x {
        let p = 2 * (size.x + size.y + x);
        block[at(x + h, size.y + h)] = buf[p];
        block[at(x + h, size.y + h + 1)] = buf[p + 1];
    }
    for y in 0..size.y {
        let p = 2 * (2 * size.x + size.y + y);
        block[at(0, y + h)] = buf[p];
        block[at(1, y + h)] = buf[p + 1];
    }
}

/// Scatter `send` to the neighbors over this worker's group and receive
/// each neighbor's segment into `recv` while `work` runs.
///
/// Every group's scatterv is posted before `work` starts and all of them
/// have completed when this returns.
pub fn exchange<C: Communicator, T: Pod, R>(
    topo: &TopologyDescriptor<C>,
    tag: Tag,
    send: &[T],
    recv: &mut [T],
    work: &mut dyn FnMut() -> Result<R>,
) -> Result<R> {
    let neighbors = topo.neighbor_data();
    let segments: Vec<(usize, usize)> = neighbors.iter().map(|n| (n.displ, n.count)).collect();
    let mut slots = neighbor_slots(recv, &segments)?;
    let my_comm = topo.my_comm();
    let scatter = Scatter {
        buffer: send,
        counts: topo.counts(),
        displs: topo.displs(),
    };
    my_comm.scatterv_overlap(my_comm.rank(), tag, Some(scatter), &mut [], &mut || {
        receive_from(neighbors, &mut slots, tag, &mut *work)
    })
}

/// Nest one receiving scatterv per neighbor group around `work`.
fn receive_from<C: Communicator, T: Pod, R>(
    neighbors: &[NeighborRecord<C>],
    slots: &mut [&mut [T]],
    tag: Tag,
    work: &mut dyn FnMut() -> Result<R>,
) -> Result<R> {
    let (Some((neighbor, neighbors)), Some((slot, slots))) =
        (neighbors.split_first(), slots.split_first_mut())
    else {
        return work();
    };
    neighbor.comm.scatterv_overlap(neighbor.root, tag, None, slot, &mut || {
        receive_from(neighbors, &mut *slots, tag, &mut *work)
    })
}

/// Disjoint `(displ, count)` windows of `recv`, in the order given.
fn neighbor_slots<'a, T>(
    recv: &'a mut [T],
    segments: &[(usize, usize)],
) -> Result<Vec<&'a mut [T]>> {
    let len = recv.len();
    let mut order: Vec<usize> = (0..segments.len()).collect();
    order.sort_unstable_by_key(|&i| segments[i].0);

    let mut slots: Vec<Option<&'a mut [T]>> = (0..segments.len()).map(|_| None).collect();
    let mut rest = recv;
    let mut cursor = 0;
    for i in order {
        let (displ, count) = segments[i];
        if displ < cursor || displ + count > len {
            return Err(DlbError::Geometry(format!(
                "halo segment {}..{} overlaps another or overflows buffer of {}",
                displ,
                displ + count,
                len
            )));
        }
        let (_, tail) = std::mem::take(&mut rest).split_at_mut(displ - cursor);
        let (slot, tail) = tail.split_at_mut(count);
        slots[i] = Some(slot);
        rest = tail;
        cursor = displ + count;
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Blocking exchange of temperature, parameters and material map, used
/// after initialisation and after every repartition. Fills the halos of
/// `old_temp`, `params` and `map`.
pub fn exchange_all<C: Communicator>(
    topo: &TopologyDescriptor<C>,
    block: &mut Block,
    buffers: &mut HaloBuffers,
) -> Result<()> {
    let ext = block.ext_size();
    pack_halo(&block.old_temp, ext, &mut buffers.send_temp);
    pack_halo(&block.params, ext, &mut buffers.send_params);
    pack_halo(&block.map, ext, &mut buffers.send_map);

    let mut idle = || -> Result<()> { Ok(()) };
    exchange(topo, tags::HALO_TEMP, &buffers.send_temp, &mut buffers.recv_temp, &mut idle)?;
    exchange(topo, tags::HALO_PARAMS, &buffers.send_params, &mut buffers.recv_params, &mut idle)?;
    exchange(topo, tags::HALO_MAP, &buffers.send_map, &mut buffers.recv_map, &mut idle)?;

    unpack_halo(&mut block.old_temp, ext, &buffers.recv_temp);
    unpack_halo(&mut block.params, ext, &buffers.recv_params);
    unpack_halo(&mut block.map, ext, &buffers.recv_map);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlb::block::halo_index;
    use crate::dlb::comm_local::LocalUniverse;
    use crate::dlb::tile::Tile;

    /// Block whose core value at domain point (x, y) is `1000 * y + x`.
    fn coded_block(tile: Tile) -> Block {
        let mut block = Block::new(tile);
        let ext_x = tile.ext_size().x;
        for y in 0..tile.size.y {
            for x in 0..tile.size.x {
                let gx = tile.position.x + x;
                let gy = tile.position.y + y;
                block.old_temp[halo_index(x, y, ext_x)] = (1000 * gy + gx) as f32;
                block.params[halo_index(x, y, ext_x)] = 1.0;
                block.map[halo_index(x, y, ext_x)] = (gy + gx) as i32;
            }
        }
        block
    }

    #[test]
    fn pack_orders_layers_by_coordinate() {
        let tile = Tile::new(0, Dims::new(0, 0), Dims::new(4, 3));
        let block = coded_block(tile);
        let mut buf = vec![0.0f32; 2 * tile.halo_len()];
        pack_halo(&block.old_temp, tile.ext_size(), &mut buf);
        // TOP: (x, 0), (x, 1)
        assert_eq!(&buf[0..4], &[0.0, 1000.0, 1.0, 1001.0]);
        // RIGHT starts at perimeter point 4: (2, 0), (3, 0)
        assert_eq!(&buf[8..10], &[2.0, 3.0]);
        // BOTTOM starts at 7: (0, 1), (0, 2)
        assert_eq!(&buf[14..16], &[1000.0, 2000.0]);
        // LEFT starts at 11: (0, 0), (1, 0)
        assert_eq!(&buf[22..24], &[0.0, 1.0]);
    }

    #[test]
    fn unpack_fills_margin_only() {
        let tile = Tile::new(0, Dims::new(0, 0), Dims::new(4, 3));
        let ext = tile.ext_size();
        let mut block = vec![0i32; tile.ext_area()];
        let buf: Vec<i32> = (1..=2 * tile.halo_len() as i32).collect();
        unpack_halo(&mut block, ext, &buf);
        for y in 0..tile.size.y {
            for x in 0..tile.size.x {
                assert_eq!(block[halo_index(x, y, ext.x)], 0);
            }
        }
        // TOP first point: rows 0 and 1 of column 2
        assert_eq!((block[2], block[ext.x + 2]), (1, 2));
        // LEFT first point: cols 0 and 1 of row 2
        assert_eq!((block[2 * ext.x], block[2 * ext.x + 1]), (23, 24));
    }

    #[test]
    fn neighbor_slots_follow_segment_order() {
        let mut recv: Vec<i32> = (0..10).collect();
        let slots = neighbor_slots(&mut recv, &[(6, 3), (0, 2), (2, 0)]).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(&*slots[0], &[6, 7, 8]);
        assert_eq!(&*slots[1], &[0, 1]);
        assert!(slots[2].is_empty());
    }

    #[test]
    fn neighbor_slots_reject_overlap() {
        let mut recv = vec![0u8; 8];
        assert!(matches!(neighbor_slots(&mut recv, &[(0, 4), (3, 2)]), Err(DlbError::Geometry(_))));
        assert!(neighbor_slots(&mut recv, &[(6, 4)]).is_err());
    }

    #[test]
    fn exchange_runs_work_once_and_completes() {
        let tiles = vec![
            Tile::new(0, Dims::new(0, 0), Dims::new(8, 16)),
            Tile::new(1, Dims::new(8, 0), Dims::new(8, 16)),
        ];
        let out = LocalUniverse::run(2, |world| {
            let topo = TopologyDescriptor::build(&world, tiles.clone(), 16)?;
            let len = 2 * topo.tile().halo_len();
            let send = vec![world.rank() as f32 + 1.0; len];
            let mut recv = vec![0.0f32; len];
            let mut calls = 0;
            let answer = exchange(&topo, tags::HALO_TEMP, &send, &mut recv, &mut || {
                calls += 1;
                Ok(42)
            })?;
            Ok((answer, calls, recv))
        })
        .unwrap();
        // tile 0 receives 2 * 16 values on its RIGHT edge, tile 1 on its LEFT
        let (answer, calls, recv) = &out[0];
        assert_eq!((*answer, *calls), (42, 1));
        assert_eq!(recv.iter().filter(|&&v| v == 2.0).count(), 32);
        assert_eq!(out[1].2.iter().filter(|&&v| v == 1.0).count(), 32);
    }

    #[test]
    fn exchange_fills_halos_from_neighbors() {
        let tiles = vec![
            Tile::new(0, Dims::new(0, 0), Dims::new(8, 8)),
            Tile::new(1, Dims::new(8, 0), Dims::new(8, 4)),
            Tile::new(2, Dims::new(8, 4), Dims::new(8, 4)),
            Tile::new(3, Dims::new(0, 8), Dims::new(16, 8)),
        ];
        let checks = LocalUniverse::run(4, |world| {
            let topo = TopologyDescriptor::build(&world, tiles.clone(), 16)?;
            let tile = *topo.tile();
            let mut block = coded_block(tile);
            let mut buffers = HaloBuffers::new(tile.halo_len());
            exchange_all(&topo, &mut block, &mut buffers)?;
            Ok((tile, block))
        })
        .unwrap();

        // every halo point next to an interior edge carries the owner's code
        for (tile, block) in &checks {
            let ext_x = tile.ext_size().x;
            let end = tile.position + tile.size;
            for layer in 1..=2 {
                if tile.position.y > 0 {
                    for x in 0..tile.size.x {
                        let gy = tile.position.y - layer;
                        let gx = tile.position.x + x;
                        let idx = (2 - layer) * ext_x + x + 2;
                        assert_eq!(block.old_temp[idx], (1000 * gy + gx) as f32, "{tile} top");
                        assert_eq!(block.map[idx], (gy + gx) as i32);
                    }
                }
                if end.x < 16 {
                    for y in 0..tile.size.y {
                        let gx = end.x + layer - 1;
                        let gy = tile.position.y + y;
                        let idx = (y + 2) * ext_x + tile.size.x + 1 + layer;
                        assert_eq!(block.old_temp[idx], (1000 * gy + gx) as f32, "{tile} right");
                    }
                }
                if end.y < 16 {
                    for x in 0..tile.size.x {
                        let gy = end.y + layer - 1;
                        let gx = tile.position.x + x;
                        let idx = (tile.size.y + 1 + layer) * ext_x + x + 2;
                        assert_eq!(block.old_temp[idx], (1000 * gy + gx) as f32, "{tile} bottom");
                    }
                }
                if tile.position.x > 0 {
                    for y in 0..tile.size.y {
                        let gx = tile.position.x - layer;
                        let gy = tile.position.y + y;
                        let idx = (y + 2) * ext_x + 2 - layer;
                        assert_eq!(block.old_temp[idx], (1000 * gy + gx) as f32, "{tile} left");
                        assert_eq!(block.params[idx], 1.0);
                    }
                }
            }
        }
    }
}
