//! Partition oracle and the object-transfer capability interface.
//!
//! The balancer treats partitioning as a black box: given weighted object
//! positions and a part count, an oracle returns a part per object.
//! [`RecursiveBisection`] is the built-in oracle; it cuts along whole
//! object rows or columns only, so every part of a full rectangular object
//! set is itself a rectangle.
//!
//! [`ObjectTransfer`] is what the orchestrator exposes so that objects can
//! be moved between workers without the transport knowing their layout.

use super::dims::Dims;
use super::mesh::Gid;
use crate::error::{DlbError, Result};

/// One object as seen by a partition oracle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedObject {
    pub gid: Gid,
    /// Position in object-mesh units.
    pub position: Dims,
    pub weight: f64,
}

/// Partition oracle trait. Returns a part id in `0..num_parts` per object.
pub trait PartitionOracle: Send + Sync {
    fn partition(&self, objects: &[WeightedObject], num_parts: usize) -> Result<Vec<usize>>;
}

/// Recursive coordinate bisection over whole object lines.
///
/// Each step splits the current set along the axis with more distinct
/// lines, placing the cut where the cumulative weight is closest to the
/// share of parts on the lower side.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecursiveBisection;

impl PartitionOracle for RecursiveBisection {
    fn partition(&self, objects: &[WeightedObject], num_parts: usize) -> Result<Vec<usize>> {
        if num_parts == 0 {
            return Err(DlbError::Config("cannot partition into zero parts".into()));
        }
        if objects.len() < num_parts {
            return Err(DlbError::Invariant(format!(
                "{} objects cannot fill {} parts",
                objects.len(),
                num_parts
            )));
        }
        if let Some(bad) = objects.iter().find(|o| !(o.weight.is_finite() && o.weight >= 0.0)) {
            return Err(DlbError::Invariant(format!(
                "object {} has invalid weight {}",
                bad.gid, bad.weight
            )));
        }

        let mut parts = vec![0usize; objects.len()];
        let indices: Vec<usize> = (0..objects.len()).collect();
        bisect(objects, indices, 0, num_parts, &mut parts)?;
        Ok(parts)
    }
}

#[derive(Clone, Copy)]
enum Axis {
    X,
    Y,
}

fn coordinate(o: &WeightedObject, axis: Axis) -> usize {
    match axis {
        Axis::X => o.position.x,
        Axis::Y => o.position.y,
    }
}

fn distinct_lines(objects: &[WeightedObject], indices: &[usize], axis: Axis) -> usize {
    let mut coords: Vec<usize> = indices.iter().map(|&i| coordinate(&objects[i], axis)).collect();
    coords.sort_unstable();
    coords.dedup();
    coords.len()
}

fn bisect(
    objects: &[WeightedObject],
    mut indices: Vec<usize>,
    first_part: usize,
    num_parts: usize,
    parts: &mut [usize],
) -> Result<()> {
    if num_parts == 1 {
        for i in indices {
            parts[i] = first_part;
        }
        return Ok(());
    }

    let lines_x = distinct_lines(objects, &indices, Axis::X);
    let lines_y = distinct_lines(objects, &indices, Axis::Y);
    let axis = if lines_x >= lines_y { Axis::X } else { Axis::Y };
    if lines_x.max(lines_y) < 2 {
        return Err(DlbError::Invariant(format!(
            "cannot bisect a single object line into {num_parts} parts"
        )));
    }

    indices.sort_by_key(|&i| (coordinate(&objects[i], axis), objects[i].gid));

    let lower_parts = num_parts / 2;
    let upper_parts = num_parts - lower_parts;
    let total: f64 = indices.iter().map(|&i| objects[i].weight).sum();
    let target = total * lower_parts as f64 / num_parts as f64;

    // Candidate cuts sit between distinct coordinates.
    let mut best: Option<(usize, f64)> = None;
    let mut acc = 0.0;
    for pos in 1..indices.len() {
        acc += objects[indices[pos - 1]].weight;
        let prev = coordinate(&objects[indices[pos - 1]], axis);
        let here = coordinate(&objects[indices[pos]], axis);
        if prev == here || pos < lower_parts || indices.len() - pos < upper_parts {
            continue;
        }
        let miss = (acc - target).abs();
        if best.map_or(true, |(_, m)| miss < m) {
            best = Some((pos, miss));
        }
    }
    let (cut, _) = best.ok_or_else(|| {
        DlbError::Invariant(format!("no admissible cut for {num_parts} parts"))
    })?;

    let upper = indices.split_off(cut);
    bisect(objects, indices, first_part, lower_parts, parts)?;
    bisect(objects, upper, first_part + lower_parts, upper_parts, parts)
}

/// Capability interface the orchestrator implements so objects can be
/// packed, shipped and unpacked by the migration protocol.
pub trait ObjectTransfer {
    /// Number of objects owned locally.
    fn object_count(&self) -> usize;

    /// Sorted GIDs owned locally.
    fn owned_objects(&self) -> Vec<Gid>;

    /// Grid-point position of an object.
    fn object_position(&self, gid: Gid) -> Dims;

    /// Bytes one packed object occupies in the current transfer context.
    fn object_byte_size(&self, gid: Gid) -> usize;

    /// Append the packed object to `dest`.
    fn pack_object(&self, gid: Gid, dest: &mut Vec<u8>) -> Result<()>;

    /// Store a packed object received from another worker.
    fn unpack_object(&mut self, gid: Gid, src: &[u8]) -> Result<()>;
}
