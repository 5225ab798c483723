//! Load balancer: regular and performance-weighted partitions, imbalance
//! detection, and the object migration protocol.
//!
//! The balancer never touches block data. It decides *where* objects go;
//! moving them is delegated to an [`ObjectTransfer`] implementation handed
//! to [`LoadBalancer::migrate`].

use std::collections::BTreeMap;

use super::block::ObjectRecord;
use super::comm::{tags, Communicator};
use super::dims::Dims;
use super::mesh::{Gid, ObjectMesh};
use super::oracle::{ObjectTransfer, PartitionOracle, RecursiveBisection, WeightedObject};
use super::tile::Tile;
use crate::config::PartitionStrategy;
use crate::error::{DlbError, Result};
use crate::protocol_error;

/// Every worker holds a single local part.
pub const LOCAL_PART: usize = 0;

/// Shape of the regular partition: equal blocks laid out row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegularLayout {
    pub block: Dims,
    /// Tiles per row band.
    pub cols: usize,
    /// Number of row bands.
    pub rows: usize,
}

impl RegularLayout {
    /// Square blocks of side `edge / sqrt(n)` when `log2(n)` is even,
    /// otherwise `edge / sqrt(2n)` wide and twice as tall.
    pub fn new(world_size: usize, mesh: &ObjectMesh) -> Result<Self> {
        if world_size == 0 || !world_size.is_power_of_two() {
            return Err(DlbError::Config(format!(
                "worker count {world_size} is not a power of two"
            )));
        }
        let edge = mesh.edge();
        let log2 = world_size.trailing_zeros();
        let (divisor, block) = if log2 % 2 == 0 {
            let d = 1usize << (log2 / 2);
            (d, Dims::square(edge / d))
        } else {
            let d = 1usize << ((log2 + 1) / 2);
            (d, Dims::new(edge / d, 2 * (edge / d)))
        };
        if edge % divisor != 0 || block.x == 0 {
            return Err(DlbError::Config(format!(
                "domain edge {edge} cannot be split among {world_size} workers"
            )));
        }
        let object = mesh.object_size();
        if block.x % object.x != 0 || block.y % object.y != 0 {
            return Err(DlbError::Config(format!(
                "regular block {block} for {world_size} workers is not a multiple of object size {object}"
            )));
        }
        let layout = Self {
            block,
            cols: edge / block.x,
            rows: edge / block.y,
        };
        if layout.cols * layout.rows != world_size {
            return Err(DlbError::Config(format!(
                "regular layout {}x{} does not match {world_size} workers",
                layout.cols, layout.rows
            )));
        }
        Ok(layout)
    }

    /// Row-major tiles; tile `i` belongs to worker `i`.
    pub fn tiles(&self) -> Vec<Tile> {
        let mut tiles = Vec::with_capacity(self.cols * self.rows);
        for row in 0..self.rows {
            for col in 0..self.cols {
                let rank = row * self.cols + col;
                tiles.push(Tile::new(
                    rank,
                    Dims::new(col * self.block.x, row * self.block.y),
                    self.block,
                ));
            }
        }
        tiles
    }
}

/// Allowance per buffered message for the transport's bookkeeping. Above
/// `MPI_BSEND_OVERHEAD` of the common MPI implementations.
pub const SEND_OVERHEAD: usize = 512;

/// Bytes one worker may have in flight during a single
/// [`LoadBalancer::migrate`] over an `edge`² domain: every object with its
/// frame header, split into at most one message per other worker.
/// Worker 0 reaches this bound when it hands out the initial domain.
pub fn migration_bytes(edge: usize, object_size: usize, workers: usize) -> usize {
    let objects = (edge / object_size.max(1)).pow(2);
    let headers = objects * 2 * std::mem::size_of::<u32>();
    ObjectRecord::full_size(edge * edge) + headers + workers.saturating_sub(1) * SEND_OVERHEAD
}

/// Split `total_columns` object columns among workers inversely to their
/// iteration times. Every worker keeps at least one column and the result
/// always sums to `total_columns`.
pub fn split_by_performance(times: &[f64], total_columns: usize) -> Result<Vec<usize>> {
    let n = times.len();
    if n == 0 || n > total_columns {
        return Err(DlbError::Config(format!(
            "cannot split {total_columns} columns among {n} workers"
        )));
    }
    if let Some(t) = times.iter().find(|t| !(t.is_finite() && **t >= 0.0)) {
        return Err(DlbError::Invariant(format!("invalid iteration time {t}")));
    }

    let rates: Vec<f64> = times.iter().map(|t| 1.0 / t.max(1e-12)).collect();
    let rate_sum: f64 = rates.iter().sum();
    let mut columns: Vec<usize> = rates
        .iter()
        .map(|r| ((r / rate_sum * total_columns as f64).round() as usize).max(1))
        .collect();

    let mut assigned: usize = columns.iter().sum();
    let mut i = 0;
    while assigned > total_columns {
        if columns[i] > 1 {
            columns[i] -= 1;
            assigned -= 1;
        }
        i = (i + 1) % n;
    }
    i = 0;
    while assigned < total_columns {
        columns[i] += 1;
        assigned += 1;
        i = (i + 1) % n;
    }
    Ok(columns)
}

/// Partition decisions and migration bookkeeping for one worker.
pub struct LoadBalancer {
    mesh: ObjectMesh,
    world_size: usize,
    threshold: f64,
    layout: RegularLayout,
    strategy: PartitionStrategy,
    oracle: Box<dyn PartitionOracle>,
    /// A performance-weighted partition is in force.
    imbalance: bool,
    import_gids: Vec<Gid>,
    import_procs: Vec<usize>,
    import_to_part: Vec<usize>,
    export_gids: Vec<Gid>,
    export_procs: Vec<usize>,
    export_to_part: Vec<usize>,
}

impl LoadBalancer {
    pub fn new(
        mesh: ObjectMesh,
        world_size: usize,
        threshold: f64,
        strategy: PartitionStrategy,
    ) -> Result<Self> {
        let layout = RegularLayout::new(world_size, &mesh)?;
        Ok(Self {
            mesh,
            world_size,
            threshold,
            layout,
            strategy,
            oracle: Box::new(RecursiveBisection),
            imbalance: false,
            import_gids: Vec::new(),
            import_procs: Vec::new(),
            import_to_part: Vec::new(),
            export_gids: Vec::new(),
            export_procs: Vec::new(),
            export_to_part: Vec::new(),
        })
    }

    /// Replace the oracle used by [`PartitionStrategy::Bisection`].
    pub fn with_oracle(mut self, oracle: Box<dyn PartitionOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn layout(&self) -> RegularLayout {
        self.layout
    }

    pub fn mesh(&self) -> &ObjectMesh {
        &self.mesh
    }

    pub fn is_running_balanced(&self) -> bool {
        self.imbalance
    }

    pub fn regular_partition(&self) -> Vec<Tile> {
        self.layout.tiles()
    }

    /// `max(times) > min(times) * threshold`.
    pub fn is_imbalanced(&self, times: &[f64]) -> bool {
        let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = times.iter().copied().fold(f64::INFINITY, f64::min);
        !times.is_empty() && max > min * self.threshold
    }

    /// Object columns per worker of one row band.
    pub fn split_by_performance(&self, times: &[f64]) -> Result<Vec<usize>> {
        split_by_performance(times, self.mesh.cols())
    }

    /// New partition weighted by `times` (indexed by rank).
    pub fn get_partition(&self, times: &[f64], old_tiles: &[Tile]) -> Result<Vec<Tile>> {
        if times.len() != self.world_size || old_tiles.len() != self.world_size {
            return Err(DlbError::Invariant(format!(
                "partition request with {} times and {} tiles for {} workers",
                times.len(),
                old_tiles.len(),
                self.world_size
            )));
        }
        let tiles = match self.strategy {
            PartitionStrategy::RowSplit => self.row_split_partition(times)?,
            PartitionStrategy::Bisection => self.oracle_partition(times, old_tiles)?,
        };
        Ok(carry_hosts(tiles, old_tiles))
    }

    /// Only the x-extents inside each row band change; bands keep the
    /// regular layout's height.
    fn row_split_partition(&self, times: &[f64]) -> Result<Vec<Tile>> {
        let object = self.mesh.object_size();
        let mut tiles = self.regular_partition();
        for band in 0..self.layout.rows {
            let ranks = band * self.layout.cols..(band + 1) * self.layout.cols;
            let columns = self.split_by_performance(&times[ranks.clone()])?;
            let mut x = 0;
            for (rank, cols) in ranks.zip(columns) {
                let tile = &mut tiles[rank];
                tile.position.x = x;
                tile.size.x = cols * object.x;
                x += tile.size.x;
            }
        }
        Ok(tiles)
    }

    /// Each object weighs its owner's time divided by the owner's object
    /// count. Parts are handed to workers in order of their smallest GID.
    fn oracle_partition(&self, times: &[f64], old_tiles: &[Tile]) -> Result<Vec<Tile>> {
        let object = self.mesh.object_size();
        let mut points = Vec::with_capacity(self.mesh.total_objects());
        for tile in old_tiles {
            let gids = self.mesh.assigned_gids(tile);
            let weight = times[tile.rank] / gids.len().max(1) as f64;
            points.extend(gids.into_iter().map(|gid| WeightedObject {
                gid,
                position: self.mesh.coords_of(gid) / object,
                weight,
            }));
        }

        let parts = self.oracle.partition(&points, self.world_size)?;
        let mut buckets: Vec<Vec<Gid>> = vec![Vec::new(); self.world_size];
        for (point, part) in points.iter().zip(parts) {
            let bucket = buckets.get_mut(part).ok_or_else(|| {
                DlbError::Invariant(format!("oracle returned part {part} of {}", self.world_size))
            })?;
            bucket.push(point.gid);
        }
        for bucket in &mut buckets {
            bucket.sort_unstable();
        }
        buckets.sort_by_key(|b| b.first().copied().unwrap_or(usize::MAX));

        buckets
            .iter()
            .enumerate()
            .map(|(rank, gids)| {
                let (position, size) = self.mesh.resolve_partition(gids)?;
                Ok(Tile::new(rank, position, size))
            })
            .collect()
    }

    /// Apply the hysteresis rule to gathered `times`.
    ///
    /// Balanced timings under a weighted partition restore the regular
    /// one; imbalanced timings produce a fresh weighted partition. Returns
    /// the partition to switch to, or `None` when nothing changes.
    pub fn rebalance(&mut self, times: &[f64], current: &[Tile]) -> Result<Option<Vec<Tile>>> {
        let next = if self.is_imbalanced(times) {
            let tiles = self.get_partition(times, current)?;
            self.imbalance = true;
            tiles
        } else if self.imbalance {
            self.imbalance = false;
            carry_hosts(self.regular_partition(), current)
        } else {
            return Ok(None);
        };

        let unchanged = next.len() == current.len()
            && next.iter().zip(current).all(|(a, b)| a.same_geometry(b));
        Ok((!unchanged).then_some(next))
    }

    /// Record the objects this worker imports (with their current owners)
    /// and exports (with their new owners).
    pub fn set_migration(&mut self, imports: &[(Gid, usize)], exports: &[(Gid, usize)]) {
        self.clear_arrays();
        for &(gid, source) in imports {
            self.import_gids.push(gid);
            self.import_procs.push(source);
            self.import_to_part.push(LOCAL_PART);
        }
        for &(gid, dest) in exports {
            self.export_gids.push(gid);
            self.export_procs.push(dest);
            self.export_to_part.push(LOCAL_PART);
        }
    }

    pub fn clear_arrays(&mut self) {
        self.import_gids.clear();
        self.import_procs.clear();
        self.import_to_part.clear();
        self.export_gids.clear();
        self.export_procs.clear();
        self.export_to_part.clear();
    }

    pub fn import_gids(&self) -> &[Gid] {
        &self.import_gids
    }

    pub fn import_procs(&self) -> &[usize] {
        &self.import_procs
    }

    pub fn export_gids(&self) -> &[Gid] {
        &self.export_gids
    }

    pub fn export_procs(&self) -> &[usize] {
        &self.export_procs
    }

    pub fn export_to_part(&self) -> &[usize] {
        &self.export_to_part
    }

    pub fn import_to_part(&self) -> &[usize] {
        &self.import_to_part
    }

    /// Move the recorded imports and exports through `transfer`.
    ///
    /// One message per destination carries `(gid: u32, len: u32, bytes)`
    /// frames. The transfer is bracketed by barriers on `comm`.
    pub fn migrate<C: Communicator>(&self, comm: &C, transfer: &mut dyn ObjectTransfer) -> Result<()> {
        let _span = tracing::debug_span!(
            "migrate",
            rank = comm.rank(),
            imports = self.import_gids.len(),
            exports = self.export_gids.len(),
            owned = transfer.object_count()
        )
        .entered();

        comm.barrier()?;

        let owned = transfer.owned_objects();
        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&gid, &dest) in self.export_gids.iter().zip(&self.export_procs) {
            if owned.binary_search(&gid).is_err() {
                return Err(DlbError::Invariant(format!(
                    "rank {} exports object {gid} it does not own",
                    comm.rank()
                )));
            }
            if dest == comm.rank() || dest >= comm.size() {
                return Err(DlbError::Invariant(format!(
                    "object {gid} exported to invalid rank {dest}"
                )));
            }
            let size = transfer.object_byte_size(gid);
            let frame = outgoing.entry(dest).or_default();
            frame.extend_from_slice(bytemuck::bytes_of(&(gid as u32)));
            frame.extend_from_slice(bytemuck::bytes_of(&(size as u32)));
            let before = frame.len();
            transfer.pack_object(gid, frame)?;
            if frame.len() - before != size {
                return Err(DlbError::Invariant(format!(
                    "object {gid} packed to {} bytes, expected {size}",
                    frame.len() - before
                )));
            }
        }
        for (dest, frame) in &outgoing {
            comm.send(*dest, tags::MIGRATE, frame)?;
        }

        let mut expected: BTreeMap<usize, Vec<Gid>> = BTreeMap::new();
        for (&gid, &source) in self.import_gids.iter().zip(&self.import_procs) {
            expected.entry(source).or_default().push(gid);
        }
        for (source, mut gids) in expected {
            let message = comm.recv(source, tags::MIGRATE)?;
            let mut received = Vec::with_capacity(gids.len());
            let mut cursor = 0;
            while cursor < message.len() {
                let header = message.get(cursor..cursor + 8).ok_or_else(|| {
                    protocol_error!("migrate", "truncated frame header from rank {}", source)
                })?;
                let gid = bytemuck::pod_read_unaligned::<u32>(&header[..4]) as Gid;
                let len = bytemuck::pod_read_unaligned::<u32>(&header[4..]) as usize;
                let body = message.get(cursor + 8..cursor + 8 + len).ok_or_else(|| {
                    protocol_error!("migrate", "truncated object {} from rank {}", gid, source)
                })?;
                if len != transfer.object_byte_size(gid) {
                    return Err(DlbError::Invariant(format!(
                        "object {gid} from rank {source} is {len} bytes, expected {}",
                        transfer.object_byte_size(gid)
                    )));
                }
                transfer.unpack_object(gid, body)?;
                received.push(gid);
                cursor += 8 + len;
            }
            received.sort_unstable();
            gids.sort_unstable();
            if received != gids {
                return Err(DlbError::Invariant(format!(
                    "rank {source} delivered {} objects, {} expected",
                    received.len(),
                    gids.len()
                )));
            }
        }

        comm.barrier()
    }
}

/// Keep each rank's host tag across partitions.
fn carry_hosts(mut tiles: Vec<Tile>, current: &[Tile]) -> Vec<Tile> {
    for tile in &mut tiles {
        if let Some(old) = current.iter().find(|t| t.rank == tile.rank) {
            tile.host = old.host;
        }
    }
    tiles
}
