//! Per-worker block storage and the views handed to the kernel.
//!
//! A [`Block`] owns the four halo-padded arrays of one tile. Index
//! `(x, y)` of the core maps to `(y + HALO_SIZE) * ext.x + (x + HALO_SIZE)`.

use super::dims::Dims;
use super::tile::{Edge, Tile, HALO_SIZE};
use crate::error::{DlbError, Result};

/// Linear index of core point `(x, y)` in a halo-padded array of width
/// `ext_x`.
#[inline]
pub fn halo_index(x: usize, y: usize, ext_x: usize) -> usize {
    (y + HALO_SIZE) * ext_x + x + HALO_SIZE
}

/// The four arrays of one tile, each `tile.ext_area()` long.
#[derive(Debug, Clone)]
pub struct Block {
    tile: Tile,
    pub old_temp: Vec<f32>,
    pub new_temp: Vec<f32>,
    pub params: Vec<f32>,
    pub map: Vec<i32>,
}

impl Block {
    /// Zero-filled block for `tile`.
    pub fn new(tile: Tile) -> Self {
        let area = tile.ext_area();
        Self {
            tile,
            old_temp: vec![0.0; area],
            new_temp: vec![0.0; area],
            params: vec![0.0; area],
            map: vec![0; area],
        }
    }

    /// Full-domain block filled from row-major `edge x edge` arrays.
    pub fn from_domain(tile: Tile, temp: &[f32], params: &[f32], map: &[i32]) -> Result<Self> {
        let area = tile.area();
        if temp.len() != area || params.len() != area || map.len() != area {
            return Err(DlbError::Invariant(format!(
                "domain arrays of {}/{}/{} points do not fill tile {}",
                temp.len(),
                params.len(),
                map.len(),
                tile
            )));
        }
        let mut block = Self::new(tile);
        let ext_x = tile.ext_size().x;
        for y in 0..tile.size.y {
            for x in 0..tile.size.x {
                let src = y * tile.size.x + x;
                let dst = halo_index(x, y, ext_x);
                block.old_temp[dst] = temp[src];
                block.params[dst] = params[src];
                block.map[dst] = map[src];
            }
        }
        block.sync_new_temp();
        Ok(block)
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn ext_size(&self) -> Dims {
        self.tile.ext_size()
    }

    /// Index of a point given in domain coordinates.
    pub fn index_of(&self, point: Dims) -> usize {
        let rel = point - self.tile.position;
        halo_index(rel.x, rel.y, self.ext_size().x)
    }

    /// Make `new_temp` a copy of `old_temp`.
    pub fn sync_new_temp(&mut self) {
        self.new_temp.copy_from_slice(&self.old_temp);
    }

    /// Exchange the two temperature buffers.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.old_temp, &mut self.new_temp);
    }

    pub fn temp(&self, old: bool) -> &[f32] {
        if old {
            &self.old_temp
        } else {
            &self.new_temp
        }
    }

    /// Split into a kernel view plus the halo geometry for a domain of
    /// `edge` points.
    pub fn data(&mut self, edge: usize) -> BlockData<'_> {
        let layout = BlockLayout::new(&self.tile, edge);
        BlockData {
            old_temp: &self.old_temp,
            new_temp: &mut self.new_temp,
            params: &self.params,
            map: &self.map,
            layout,
        }
    }
}

/// Geometry the kernel needs: extended size, computable bounds and which
/// sides lie on the domain border.
///
/// Bounds are in halo-padded coordinates, half-open. On a border side the
/// two outermost domain points are held fixed and excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub ext_size: Dims,
    pub top: usize,
    pub left: usize,
    pub bottom: usize,
    pub right: usize,
    pub top_border: bool,
    pub right_border: bool,
    pub bottom_border: bool,
    pub left_border: bool,
    /// The tile spans the domain's middle column.
    pub middle: bool,
}

impl BlockLayout {
    pub fn new(tile: &Tile, edge: usize) -> Self {
        let end = tile.position + tile.size;
        let top_border = tile.position.y == 0;
        let left_border = tile.position.x == 0;
        let bottom_border = end.y == edge;
        let right_border = end.x == edge;
        let h = HALO_SIZE;
        Self {
            ext_size: tile.ext_size(),
            top: if top_border { 2 * h } else { h },
            left: if left_border { 2 * h } else { h },
            bottom: if bottom_border { tile.size.y } else { tile.size.y + h },
            right: if right_border { tile.size.x } else { tile.size.x + h },
            top_border,
            right_border,
            bottom_border,
            left_border,
            middle: tile.spans_column(edge / 2),
        }
    }

    pub fn is_border(&self, edge: Edge) -> bool {
        match edge {
            Edge::Top => self.top_border,
            Edge::Right => self.right_border,
            Edge::Bottom => self.bottom_border,
            Edge::Left => self.left_border,
        }
    }

    /// Bounds `(top, left, bottom, right)` of the interior that does not
    /// feed any neighbor's halo.
    pub fn interior(&self) -> (usize, usize, usize, usize) {
        let h = HALO_SIZE;
        (
            if self.top_border { self.top } else { self.top + h },
            if self.left_border { self.left } else { self.left + h },
            if self.bottom_border { self.bottom } else { self.bottom.saturating_sub(h) },
            if self.right_border { self.right } else { self.right.saturating_sub(h) },
        )
    }
}

/// Kernel view over a block: read the old state, write the new one.
#[derive(Debug)]
pub struct BlockData<'a> {
    pub old_temp: &'a [f32],
    pub new_temp: &'a mut [f32],
    pub params: &'a [f32],
    pub map: &'a [i32],
    pub layout: BlockLayout,
}

/// Send and receive staging buffers for one tile's halo exchange.
///
/// Every perimeter point carries two values (the two halo layers), so each
/// buffer is `2 * tile.halo_len()` long.
#[derive(Debug, Clone, Default)]
pub struct HaloBuffers {
    pub send_temp: Vec<f32>,
    pub recv_temp: Vec<f32>,
    pub send_params: Vec<f32>,
    pub recv_params: Vec<f32>,
    pub send_map: Vec<i32>,
    pub recv_map: Vec<i32>,
}

impl HaloBuffers {
    pub fn new(halo_len: usize) -> Self {
        let mut buffers = Self::default();
        buffers.resize(halo_len);
        buffers
    }

    /// Reallocate for a tile whose perimeter is `halo_len` points.
    pub fn resize(&mut self, halo_len: usize) {
        let len = 2 * halo_len;
        for buf in [
            &mut self.send_temp,
            &mut self.recv_temp,
            &mut self.send_params,
            &mut self.recv_params,
        ] {
            buf.clear();
            buf.resize(len, 0.0);
        }
        for buf in [&mut self.send_map, &mut self.recv_map] {
            buf.clear();
            buf.resize(len, 0);
        }
    }

    pub fn len(&self) -> usize {
        self.send_temp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.send_temp.is_empty()
    }
}

/// One object's data in transit: temperature block, then parameter
/// block, then material block. During collection only the temperature is
/// carried.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectRecord {
    pub temperature: Vec<f32>,
    pub params: Vec<f32>,
    pub material: Vec<i32>,
}

impl ObjectRecord {
    /// Packed size of a full record for `area` points.
    pub fn full_size(area: usize) -> usize {
        2 * area * std::mem::size_of::<f32>() + area * std::mem::size_of::<i32>()
    }

    /// Packed size of a temperature-only record for `area` points.
    pub fn temperature_size(area: usize) -> usize {
        area * std::mem::size_of::<f32>()
    }

    pub fn encode(&self, dest: &mut Vec<u8>) {
        dest.extend_from_slice(bytemuck::cast_slice(&self.temperature));
        dest.extend_from_slice(bytemuck::cast_slice(&self.params));
        dest.extend_from_slice(bytemuck::cast_slice(&self.material));
    }

    /// Decode a record of `area` points; `full` selects the three-block
    /// layout over temperature-only.
    pub fn decode(src: &[u8], area: usize, full: bool) -> Result<Self> {
        let expected = if full {
            Self::full_size(area)
        } else {
            Self::temperature_size(area)
        };
        if src.len() != expected {
            return Err(DlbError::Invariant(format!(
                "object record of {} bytes, expected {expected}",
                src.len()
            )));
        }
        let t = Self::temperature_size(area);
        let temperature = super::comm::decode::<f32>(&src[..t])?;
        if !full {
            return Ok(Self {
                temperature,
                ..Self::default()
            });
        }
        Ok(Self {
            temperature,
            params: super::comm::decode::<f32>(&src[t..2 * t])?,
            material: super::comm::decode::<i32>(&src[2 * t..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(x: usize, y: usize, w: usize, h: usize) -> Tile {
        Tile::new(0, Dims::new(x, y), Dims::new(w, h))
    }

    #[test]
    fn halo_index_skips_margin() {
        assert_eq!(halo_index(0, 0, 12), 2 * 12 + 2);
        assert_eq!(halo_index(3, 1, 12), 3 * 12 + 5);
    }

    #[test]
    fn layout_of_corner_tile() {
        let l = BlockLayout::new(&tile(0, 0, 32, 32), 64);
        assert!(l.top_border && l.left_border);
        assert!(!l.bottom_border && !l.right_border);
        assert_eq!((l.top, l.left, l.bottom, l.right), (4, 4, 34, 34));
        assert_eq!(l.interior(), (4, 4, 32, 32));
        // column 32 belongs to the right-hand tiles
        assert!(!l.middle);
    }

    #[test]
    fn layout_of_tile_across_middle() {
        let l = BlockLayout::new(&tile(16, 0, 32, 32), 64);
        assert!(l.middle);
        assert!(l.top_border && !l.left_border && !l.right_border);
        assert_eq!((l.top, l.left, l.bottom, l.right), (4, 2, 34, 34));
        assert!(BlockLayout::new(&tile(0, 32, 33, 32), 64).middle);
        assert!(!BlockLayout::new(&tile(0, 32, 32, 32), 64).middle);
    }

    #[test]
    fn layout_of_inner_tile() {
        let l = BlockLayout::new(&tile(16, 16, 16, 16), 64);
        assert!(!l.is_border(Edge::Top) && !l.is_border(Edge::Left));
        assert_eq!((l.top, l.left, l.bottom, l.right), (2, 2, 18, 18));
        assert_eq!(l.interior(), (4, 4, 16, 16));
        assert!(!l.middle);
        assert!(BlockLayout::new(&tile(32, 0, 8, 8), 64).middle);
    }

    #[test]
    fn layout_of_whole_domain() {
        let l = BlockLayout::new(&tile(0, 0, 16, 16), 16);
        assert_eq!((l.top, l.left, l.bottom, l.right), (4, 4, 16, 16));
        assert_eq!(l.interior(), (4, 4, 16, 16));
    }

    #[test]
    fn from_domain_places_core_and_copies_new_temp() {
        let t = tile(0, 0, 4, 4);
        let temp: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let params = vec![1.0; 16];
        let map = vec![2; 16];
        let block = Block::from_domain(t, &temp, &params, &map).unwrap();
        assert_eq!(block.old_temp.len(), 64);
        assert_eq!(block.old_temp[halo_index(1, 2, 8)], 9.0);
        assert_eq!(block.new_temp, block.old_temp);
        assert_eq!(block.map[0], 0);
        assert!(Block::from_domain(t, &temp[..8], &params, &map).is_err());
    }

    #[test]
    fn swap_exchanges_buffers() {
        let mut block = Block::new(tile(0, 0, 2, 2));
        block.old_temp[0] = 1.0;
        block.new_temp[0] = 2.0;
        block.swap();
        assert_eq!((block.old_temp[0], block.new_temp[0]), (2.0, 1.0));
    }

    #[test]
    fn halo_buffers_hold_two_layers() {
        let mut hb = HaloBuffers::new(10);
        assert_eq!(hb.len(), 20);
        assert_eq!(hb.recv_map.len(), 20);
        hb.resize(3);
        assert_eq!(hb.send_params.len(), 6);
    }

    #[test]
    fn object_record_sizes() {
        let record = ObjectRecord {
            temperature: vec![1.0; 4],
            params: vec![0.5; 4],
            material: vec![1; 4],
        };
        let mut bytes = Vec::new();
        record.encode(&mut bytes);
        assert_eq!(bytes.len(), ObjectRecord::full_size(4));
        assert_eq!(ObjectRecord::decode(&bytes, 4, true).unwrap(), record);

        let temp_only = ObjectRecord::decode(&bytes[..16], 4, false).unwrap();
        assert_eq!(temp_only.temperature, vec![1.0; 4]);
        assert!(temp_only.material.is_empty());
        assert!(ObjectRecord::decode(&bytes[..20], 4, true).is_err());
    }
}
