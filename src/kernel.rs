//! Heat-diffusion stencil.
//!
//! A point's new temperature is the coefficient-weighted average of itself
//! and its eight cross neighbours at distance one and two. Cells of
//! material 0 (air) additionally exchange a fraction of their heat with
//! the cooler air stream.

use rayon::prelude::*;

use crate::dlb::block::BlockData;
use crate::dlb::tile::HALO_SIZE;

/// Scalars shared by every point update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StencilParams {
    pub air_flow_rate: f32,
    pub cooler_temp: f32,
}

/// New temperature at linear index `center` of arrays `width` points wide.
///
/// The caller guarantees two valid points on every side of `center`.
#[inline]
pub fn compute_point(
    old: &[f32],
    params: &[f32],
    map: &[i32],
    center: usize,
    width: usize,
    stencil: StencilParams,
) -> f32 {
    let neighbours = [
        center - width,
        center - 2 * width,
        center + width,
        center + 2 * width,
        center - 1,
        center - 2,
        center + 1,
        center + 2,
    ];

    let weight_sum: f32 = neighbours.iter().map(|&n| params[n]).sum::<f32>() + params[center];
    let frac = 1.0 / weight_sum;

    let mut temp = 0.0f32;
    for &n in &neighbours {
        temp += old[n] * params[n] * frac;
    }
    temp += old[center] * params[center] * frac;

    if map[center] == 0 {
        stencil.air_flow_rate * stencil.cooler_temp + (1.0 - stencil.air_flow_rate) * temp
    } else {
        temp
    }
}

/// One step over a full `edge x edge` domain without halo. The two
/// outermost rows and columns are held fixed.
pub fn step_domain(
    old: &[f32],
    new: &mut [f32],
    params: &[f32],
    map: &[i32],
    edge: usize,
    stencil: StencilParams,
) {
    let fixed = HALO_SIZE;
    if edge <= 2 * fixed {
        return;
    }
    new.par_chunks_mut(edge)
        .enumerate()
        .skip(fixed)
        .take(edge - 2 * fixed)
        .for_each(|(row, out)| {
            for col in fixed..edge - fixed {
                out[col] = compute_point(old, params, map, row * edge + col, edge, stencil);
            }
        });
}

/// Average of column `edge / 2` of a full domain array.
pub fn middle_column_average(temp: &[f32], edge: usize) -> f32 {
    let mid = edge / 2;
    let sum: f32 = (0..edge).map(|row| temp[row * edge + mid]).sum();
    sum / edge as f32
}

/// Compute rows `[top, bottom)` and columns `[left, right)` of a block, in
/// halo-padded coordinates.
fn compute_rect(
    data: &mut BlockData<'_>,
    (top, left, bottom, right): (usize, usize, usize, usize),
    stencil: StencilParams,
) {
    let width = data.layout.ext_size.x;
    for row in top..bottom {
        for col in left..right {
            let idx = row * width + col;
            data.new_temp[idx] = compute_point(data.old_temp, data.params, data.map, idx, width, stencil);
        }
    }
}

/// Compute the two-point strips along every side that faces a neighbor.
/// These are the values the next halo exchange sends.
pub fn compute_halo(data: &mut BlockData<'_>, stencil: StencilParams) {
    let l = data.layout;
    let (inner_top, _, inner_bottom, _) = l.interior();
    if !l.top_border {
        compute_rect(data, (l.top, l.left, l.top + HALO_SIZE, l.right), stencil);
    }
    if !l.bottom_border {
        compute_rect(data, (l.bottom - HALO_SIZE, l.left, l.bottom, l.right), stencil);
    }
    if !l.left_border {
        compute_rect(data, (inner_top, l.left, inner_bottom, l.left + HALO_SIZE), stencil);
    }
    if !l.right_border {
        compute_rect(data, (inner_top, l.right - HALO_SIZE, inner_bottom, l.right), stencil);
    }
}

/// Compute everything [`compute_halo`] leaves out.
pub fn compute_interior(data: &mut BlockData<'_>, stencil: StencilParams) {
    let interior = data.layout.interior();
    compute_rect(data, interior, stencil);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlb::block::{halo_index, Block};
    use crate::dlb::dims::Dims;
    use crate::dlb::tile::Tile;
    use approx::assert_abs_diff_eq;

    const STILL: StencilParams = StencilParams {
        air_flow_rate: 0.0,
        cooler_temp: 20.0,
    };

    #[test]
    fn uniform_field_is_stationary() {
        let edge = 8;
        let old = vec![20.0f32; edge * edge];
        let params = vec![0.1f32; edge * edge];
        let map = vec![1; edge * edge];
        let mut new = old.clone();
        step_domain(&old, &mut new, &params, &map, edge, STILL);
        for v in new {
            assert_abs_diff_eq!(v, 20.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn point_is_weighted_average() {
        let width = 5;
        let mut old = vec![0.0f32; 25];
        let params = vec![1.0f32; 25];
        let map = vec![1; 25];
        old[12 - 1] = 9.0;
        old[12 + 10] = 18.0;
        let t = compute_point(&old, &params, &map, 12, width, STILL);
        assert_abs_diff_eq!(t, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn air_cells_mix_with_cooler() {
        let old = vec![100.0f32; 25];
        let params = vec![1.0f32; 25];
        let mut map = vec![1; 25];
        map[12] = 0;
        let stencil = StencilParams {
            air_flow_rate: 0.25,
            cooler_temp: 20.0,
        };
        let t = compute_point(&old, &params, &map, 12, 5, stencil);
        assert_abs_diff_eq!(t, 0.25 * 20.0 + 0.75 * 100.0, epsilon = 1e-4);
    }

    #[test]
    fn borders_stay_fixed() {
        let edge = 8;
        let old: Vec<f32> = (0..edge * edge).map(|v| v as f32).collect();
        let params = vec![1.0f32; edge * edge];
        let map = vec![1; edge * edge];
        let mut new = vec![-1.0f32; edge * edge];
        step_domain(&old, &mut new, &params, &map, edge, STILL);
        assert_eq!(new[0], -1.0);
        assert_eq!(new[edge + 3], -1.0);
        assert_ne!(new[2 * edge + 2], -1.0);
        assert_eq!(new[2 * edge + edge - 2], -1.0);
    }

    #[test]
    fn halo_and_interior_cover_the_block_once() {
        // an inner tile: every side faces a neighbor
        let tile = Tile::new(0, Dims::new(8, 8), Dims::new(8, 8));
        let mut block = Block::new(tile);
        block.params.fill(1.0);
        block.map.fill(1);
        block.old_temp.fill(1.0);
        block.new_temp.fill(0.0);

        let mut data = block.data(32);
        compute_halo(&mut data, STILL);
        let ext_x = tile.ext_size().x;
        // a corner of the core is a halo strip point; the centre is not
        assert_abs_diff_eq!(data.new_temp[halo_index(0, 0, ext_x)], 1.0, epsilon = 1e-6);
        assert_eq!(data.new_temp[halo_index(4, 4, ext_x)], 0.0);
        compute_interior(&mut data, STILL);
        for y in 0..8 {
            for x in 0..8 {
                assert_abs_diff_eq!(data.new_temp[halo_index(x, y, ext_x)], 1.0, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn middle_column() {
        let edge = 4;
        let mut temp = vec![0.0f32; 16];
        for row in 0..edge {
            temp[row * edge + 2] = row as f32;
        }
        assert_abs_diff_eq!(middle_column_average(&temp, edge), 1.5, epsilon = 1e-6);
    }
}
