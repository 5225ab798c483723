//! Dynamic block descriptor: owns this worker's block and topology and
//! drives initial distribution, rebalancing, halo exchange and result
//! collection.
//!
//! Lifecycle: [`DynamicBlockDescriptor::new`] → [`load_init`] → (compute,
//! [`load_balance`] every period) → [`collect_data`].
//!
//! [`load_init`]: DynamicBlockDescriptor::load_init
//! [`load_balance`]: DynamicBlockDescriptor::load_balance
//! [`collect_data`]: DynamicBlockDescriptor::collect_data

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::balancer::LoadBalancer;
use super::block::{Block, BlockData, HaloBuffers, ObjectRecord};
use super::comm::{tags, Communicator};
use super::dims::Dims;
use super::halo;
use super::mesh::{Gid, ObjectMesh};
use super::oracle::ObjectTransfer;
use super::perf::PerfMeasure;
use super::tile::{Tile, TileMsg};
use super::topology::TopologyDescriptor;
use crate::config::BalanceConfig;
use crate::error::{DlbError, Result};
use crate::material::MaterialProperties;

/// How objects change owner between two partitions, seen by one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSets {
    /// `(gid, current owner)` of objects this worker receives.
    pub imports: Vec<(Gid, usize)>,
    /// `(gid, new owner)` of objects this worker hands over.
    pub exports: Vec<(Gid, usize)>,
    /// Objects this worker owns in both partitions.
    pub persist: Vec<Gid>,
}

impl MigrationSets {
    pub fn import_gids(&self) -> Vec<Gid> {
        self.imports.iter().map(|&(g, _)| g).collect()
    }

    pub fn export_gids(&self) -> Vec<Gid> {
        self.exports.iter().map(|&(g, _)| g).collect()
    }
}

/// Classify `rank`'s objects between partitions `old` and `new` and find
/// the peer owning each moved object.
pub fn resolve_migration(
    mesh: &ObjectMesh,
    old: &[Tile],
    new: &[Tile],
    rank: usize,
) -> Result<MigrationSets> {
    let old_assigned = mesh.assignment(old);
    let new_assigned = mesh.assignment(new);
    let (Some(mine_old), Some(mine_new)) = (old_assigned.get(rank), new_assigned.get(rank)) else {
        return Err(DlbError::Invariant(format!("rank {rank} missing from partition")));
    };

    let mut sets = MigrationSets::default();
    let (mut i, mut j) = (0, 0);
    let mut import = Vec::new();
    let mut export = Vec::new();
    while i < mine_old.len() || j < mine_new.len() {
        match (mine_old.get(i), mine_new.get(j)) {
            (Some(&a), Some(&b)) if a == b => {
                sets.persist.push(a);
                i += 1;
                j += 1;
            }
            (Some(&a), Some(&b)) if a < b => {
                export.push(a);
                i += 1;
            }
            (Some(_), Some(&b)) => {
                import.push(b);
                j += 1;
            }
            (Some(&a), None) => {
                export.push(a);
                i += 1;
            }
            (None, Some(&b)) => {
                import.push(b);
                j += 1;
            }
            (None, None) => break,
        }
    }

    let owner = |buckets: &[Vec<Gid>], gid: Gid| {
        buckets
            .iter()
            .position(|b| b.binary_search(&gid).is_ok())
            .ok_or_else(|| DlbError::Invariant(format!("object {gid} has no owner")))
    };
    for gid in import {
        sets.imports.push((gid, owner(&old_assigned, gid)?));
    }
    for gid in export {
        sets.exports.push((gid, owner(&new_assigned, gid)?));
    }
    Ok(sets)
}

/// Copy objects that keep their owner from `old` into `new`.
pub fn move_persist_objects(mesh: &ObjectMesh, persist: &[Gid], old: &Block, new: &mut Block) {
    let object = mesh.object_size();
    for &gid in persist {
        let origin = mesh.coords_of(gid);
        for y in 0..object.y {
            let row = origin + Dims::new(0, y);
            let src = old.index_of(row);
            let dst = new.index_of(row);
            new.old_temp[dst..dst + object.x].copy_from_slice(&old.old_temp[src..src + object.x]);
            new.params[dst..dst + object.x].copy_from_slice(&old.params[src..src + object.x]);
            new.map[dst..dst + object.x].copy_from_slice(&old.map[src..src + object.x]);
        }
    }
}

/// Where unpacked objects go.
enum Target<'a> {
    /// Into the block of the next partition, all three arrays.
    Block(&'a mut Block),
    /// Temperature only, into a halo-free `edge x edge` array.
    Domain { result: &'a mut [f32], edge: usize },
    /// This worker only sends.
    None,
}

/// Object packing and unpacking over this worker's block.
struct BlockTransfer<'a> {
    mesh: &'a ObjectMesh,
    source: Option<&'a Block>,
    target: Target<'a>,
    /// Ship temperature only.
    collect: bool,
    /// Read `old_temp` rather than `new_temp` when collecting.
    old: bool,
}

impl BlockTransfer<'_> {
    fn source(&self, gid: Gid) -> Result<&Block> {
        self.source.ok_or_else(|| {
            DlbError::Invariant(format!("object {gid} requested from a worker without a block"))
        })
    }
}

impl ObjectTransfer for BlockTransfer<'_> {
    fn object_count(&self) -> usize {
        self.owned_objects().len()
    }

    fn owned_objects(&self) -> Vec<Gid> {
        self.source
            .map(|b| self.mesh.assigned_gids(b.tile()))
            .unwrap_or_default()
    }

    fn object_position(&self, gid: Gid) -> Dims {
        self.mesh.coords_of(gid)
    }

    fn object_byte_size(&self, _gid: Gid) -> usize {
        let area = self.mesh.object_area();
        if self.collect {
            ObjectRecord::temperature_size(area)
        } else {
            ObjectRecord::full_size(area)
        }
    }

    fn pack_object(&self, gid: Gid, dest: &mut Vec<u8>) -> Result<()> {
        let block = self.source(gid)?;
        let object = self.mesh.object_size();
        let origin = self.mesh.coords_of(gid);
        let temp = if self.collect { block.temp(self.old) } else { &block.old_temp };

        let mut record = ObjectRecord::default();
        for y in 0..object.y {
            let start = block.index_of(origin + Dims::new(0, y));
            let row = start..start + object.x;
            record.temperature.extend_from_slice(&temp[row.clone()]);
            if !self.collect {
                record.params.extend_from_slice(&block.params[row.clone()]);
                record.material.extend_from_slice(&block.map[row]);
            }
        }
        record.encode(dest);
        Ok(())
    }

    fn unpack_object(&mut self, gid: Gid, src: &[u8]) -> Result<()> {
        let object = self.mesh.object_size();
        let origin = self.mesh.coords_of(gid);
        let record = ObjectRecord::decode(src, object.area(), !self.collect)?;
        match &mut self.target {
            Target::Block(block) => {
                for y in 0..object.y {
                    let start = block.index_of(origin + Dims::new(0, y));
                    let part = y * object.x..(y + 1) * object.x;
                    block.old_temp[start..start + object.x].copy_from_slice(&record.temperature[part.clone()]);
                    block.params[start..start + object.x].copy_from_slice(&record.params[part.clone()]);
                    block.map[start..start + object.x].copy_from_slice(&record.material[part]);
                }
                Ok(())
            }
            Target::Domain { result, edge } => {
                for y in 0..object.y {
                    let start = (origin.y + y) * *edge + origin.x;
                    let part = y * object.x..(y + 1) * object.x;
                    result[start..start + object.x].copy_from_slice(&record.temperature[part]);
                }
                Ok(())
            }
            Target::None => Err(DlbError::Invariant(format!(
                "object {gid} delivered to a worker that expects none"
            ))),
        }
    }
}

/// Host tag: hash of the host name, folded to 31 bits.
fn host_tag(name: &str) -> i32 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() & 0x7fff_ffff) as i32
}

/// Orchestrator for one worker.
pub struct DynamicBlockDescriptor<C: Communicator> {
    world: C,
    mesh: ObjectMesh,
    balancer: LoadBalancer,
    topology: Option<TopologyDescriptor<C>>,
    block: Option<Block>,
    balance_seq: usize,
}

impl<C: Communicator> DynamicBlockDescriptor<C> {
    pub fn new(world: C, edge: usize, balance: &BalanceConfig) -> Result<Self> {
        let mesh = ObjectMesh::new(edge, balance.object_dims())?;
        let balancer = LoadBalancer::new(mesh, world.size(), balance.threshold, balance.strategy)?;
        Ok(Self {
            world,
            mesh,
            balancer,
            topology: None,
            block: None,
            balance_seq: 0,
        })
    }

    pub fn rank(&self) -> usize {
        self.world.rank()
    }

    pub fn world(&self) -> &C {
        &self.world
    }

    pub fn mesh(&self) -> &ObjectMesh {
        &self.mesh
    }

    pub fn edge(&self) -> usize {
        self.mesh.edge()
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn balancer_mut(&mut self) -> &mut LoadBalancer {
        &mut self.balancer
    }

    /// Number of completed balance checks.
    pub fn balance_seq(&self) -> usize {
        self.balance_seq
    }

    pub fn topology(&self) -> Result<&TopologyDescriptor<C>> {
        self.topology
            .as_ref()
            .ok_or_else(|| DlbError::Invariant("topology used before load_init".into()))
    }

    pub fn block(&self) -> Result<&Block> {
        self.block
            .as_ref()
            .ok_or_else(|| DlbError::Invariant("block used before load_init".into()))
    }

    pub fn block_mut(&mut self) -> Result<&mut Block> {
        self.block
            .as_mut()
            .ok_or_else(|| DlbError::Invariant("block used before load_init".into()))
    }

    pub fn tiles(&self) -> Result<&[Tile]> {
        Ok(self.topology()?.tiles())
    }

    pub fn tile(&self) -> Result<Tile> {
        Ok(*self.block()?.tile())
    }

    pub fn ext_size(&self) -> Result<Dims> {
        Ok(self.tile()?.ext_size())
    }

    pub fn position(&self) -> Result<Dims> {
        Ok(self.tile()?.position)
    }

    pub fn halo_len(&self) -> Result<usize> {
        Ok(self.tile()?.halo_len())
    }

    pub fn is_middle(&self) -> bool {
        self.topology.as_ref().is_some_and(|t| t.is_middle())
    }

    pub fn coords_of(&self, gid: Gid) -> Dims {
        self.mesh.coords_of(gid)
    }

    pub fn gid_of(&self, coords: Dims) -> Gid {
        self.mesh.gid_of(coords)
    }

    pub fn resolve_partition(&self, gids: &[Gid]) -> Result<(Dims, Dims)> {
        self.mesh.resolve_partition(gids)
    }

    /// Kernel view of the current block.
    pub fn block_data(&mut self) -> Result<BlockData<'_>> {
        let edge = self.mesh.edge();
        Ok(self.block_mut()?.data(edge))
    }

    /// Exchange `old_temp` and `new_temp`.
    pub fn swap(&mut self) -> Result<()> {
        self.block_mut()?.swap();
        Ok(())
    }

    /// Distribute the regular partition's objects from worker 0, which
    /// alone holds `initial`, and build the topology.
    pub fn load_init(&mut self, initial: Option<&MaterialProperties>) -> Result<()> {
        let rank = self.rank();
        let _span = tracing::info_span!("load_init", rank).entered();

        let regular = self.balancer.regular_partition();
        let assigned = self.mesh.assignment(&regular);
        let hosts = self.world.gather(0, host_tag(&self.world.processor_name()))?;
        let mut next = Block::new(regular[rank]);

        if rank == 0 {
            let data = initial.ok_or_else(|| {
                DlbError::Config("worker 0 needs the initial domain data".into())
            })?;
            if data.edge != self.mesh.edge() {
                return Err(DlbError::Config(format!(
                    "material edge {} does not match domain edge {}",
                    data.edge,
                    self.mesh.edge()
                )));
            }
            let edge = data.edge;
            let full = Tile::new(0, Dims::new(0, 0), Dims::square(edge));
            let domain = Block::from_domain(full, &data.initial_temp, &data.params, &data.map)?;

            let exports: Vec<(Gid, usize)> = assigned
                .iter()
                .enumerate()
                .skip(1)
                .flat_map(|(r, gids)| gids.iter().map(move |&g| (g, r)))
                .collect();
            self.balancer.set_migration(&[], &exports);
            let mut transfer = BlockTransfer {
                mesh: &self.mesh,
                source: Some(&domain),
                target: Target::None,
                collect: false,
                old: true,
            };
            self.balancer.migrate(&self.world, &mut transfer)?;
            move_persist_objects(&self.mesh, &assigned[0], &domain, &mut next);
        } else {
            let imports: Vec<(Gid, usize)> = assigned[rank].iter().map(|&g| (g, 0)).collect();
            self.balancer.set_migration(&imports, &[]);
            let mut transfer = BlockTransfer {
                mesh: &self.mesh,
                source: None,
                target: Target::Block(&mut next),
                collect: false,
                old: true,
            };
            self.balancer.migrate(&self.world, &mut transfer)?;
        }
        self.balancer.clear_arrays();
        next.sync_new_temp();

        let mut tiles = regular;
        if let Some(hosts) = hosts {
            for (tile, host) in tiles.iter_mut().zip(hosts) {
                tile.host = host;
            }
        }
        let tiles = self.broadcast_tiles(&tiles)?;

        self.topology = Some(TopologyDescriptor::build(&self.world, tiles, self.mesh.edge())?);
        self.block = Some(next);
        tracing::info!(rank, tile = %self.tile()?, "initial block loaded");
        Ok(())
    }

    /// Root's `tiles` to every worker.
    fn broadcast_tiles(&self, tiles: &[Tile]) -> Result<Vec<Tile>> {
        let msgs: Vec<TileMsg> = if self.rank() == 0 {
            tiles.iter().map(Tile::to_msg).collect()
        } else {
            Vec::new()
        };
        let msgs = self.world.broadcast(0, msgs.as_slice())?;
        if msgs.len() != self.world.size() {
            return Err(crate::protocol_error!(
                "broadcast",
                "{} tiles received for {} workers",
                msgs.len(),
                self.world.size()
            ));
        }
        Ok(msgs.iter().map(Tile::from_msg).collect())
    }

    /// Gather timings, let worker 0 decide, and repartition if it asks
    /// to. Returns whether the partition changed.
    pub fn load_balance(&mut self, perf: &PerfMeasure) -> Result<bool> {
        let rank = self.rank();
        let _span = tracing::info_span!("load_balance", rank, seq = self.balance_seq).entered();

        let time = perf.aggregate()?;
        let times = self.world.gather(0, time)?;
        let current = self.tiles()?.to_vec();

        let mut decision = 0u32;
        let mut next = Vec::new();
        if let Some(times) = times {
            tracing::info!(seq = self.balance_seq, times = ?times, "iteration times");
            if let Some(tiles) = self.balancer.rebalance(&times, &current)? {
                decision = 1;
                next = tiles;
            }
        }
        self.balance_seq += 1;

        let decision = self.world.broadcast(0, &[decision])?;
        if decision.first().copied().unwrap_or(0) == 0 {
            return Ok(false);
        }

        let next = self.broadcast_tiles(&next)?;
        let sets = resolve_migration(&self.mesh, &current, &next, rank)?;
        tracing::debug!(
            rank,
            imports = sets.imports.len(),
            exports = sets.exports.len(),
            persist = sets.persist.len(),
            "migration resolved"
        );
        self.migrate(&next, &sets)?;
        self.topology = Some(TopologyDescriptor::build(&self.world, next, self.mesh.edge())?);

        if rank == 0 {
            let columns: Vec<usize> = self
                .tiles()?
                .iter()
                .map(|t| t.size.x / self.mesh.object_size().x)
                .collect();
            tracing::info!(seq = self.balance_seq, columns = ?columns, "partition changed");
        }
        Ok(true)
    }

    /// Build the next block for `new_tiles[rank]`, fill it from the
    /// current block and the network, and make it current.
    pub fn migrate(&mut self, new_tiles: &[Tile], sets: &MigrationSets) -> Result<()> {
        let rank = self.rank();
        let current = self
            .block
            .as_ref()
            .ok_or_else(|| DlbError::Invariant("migrate called before load_init".into()))?;
        let mut next = Block::new(*new_tiles.get(rank).ok_or_else(|| {
            DlbError::Invariant(format!("rank {rank} missing from new partition"))
        })?);

        self.balancer.set_migration(&sets.imports, &sets.exports);
        let mut transfer = BlockTransfer {
            mesh: &self.mesh,
            source: Some(current),
            target: Target::Block(&mut next),
            collect: false,
            old: true,
        };
        let moved = self.balancer.migrate(&self.world, &mut transfer);
        self.balancer.clear_arrays();
        moved?;

        move_persist_objects(&self.mesh, &sets.persist, current, &mut next);
        next.sync_new_temp();
        self.block = Some(next);
        Ok(())
    }

    /// Merge every worker's temperature at worker 0 into a halo-free
    /// `edge x edge` array. `old` selects `old_temp` over `new_temp`.
    pub fn collect_data(&mut self, old: bool) -> Result<Option<Vec<f32>>> {
        let rank = self.rank();
        let _span = tracing::info_span!("collect_data", rank, old).entered();

        let edge = self.mesh.edge();
        let assigned = self.mesh.assignment(self.tiles()?);
        let block = self
            .block
            .as_ref()
            .ok_or_else(|| DlbError::Invariant("collect_data called before load_init".into()))?;

        let mut result = Vec::new();
        if rank == 0 {
            result = vec![0.0f32; edge * edge];
            let imports: Vec<(Gid, usize)> = assigned
                .iter()
                .enumerate()
                .skip(1)
                .flat_map(|(r, gids)| gids.iter().map(move |&g| (g, r)))
                .collect();
            self.balancer.set_migration(&imports, &[]);
        } else {
            let exports: Vec<(Gid, usize)> = assigned[rank].iter().map(|&g| (g, 0)).collect();
            self.balancer.set_migration(&[], &exports);
        }

        let target = if rank == 0 {
            Target::Domain {
                result: &mut result,
                edge,
            }
        } else {
            Target::None
        };
        let mut transfer = BlockTransfer {
            mesh: &self.mesh,
            source: Some(block),
            target,
            collect: true,
            old,
        };
        let collected = self.balancer.migrate(&self.world, &mut transfer);
        self.balancer.clear_arrays();
        collected?;

        if rank != 0 {
            return Ok(None);
        }
        let temp = block.temp(old);
        let object = self.mesh.object_size();
        for &gid in &assigned[0] {
            let origin = self.mesh.coords_of(gid);
            for y in 0..object.y {
                let row = origin + Dims::new(0, y);
                let src = block.index_of(row);
                let dst = row.y * edge + row.x;
                result[dst..dst + object.x].copy_from_slice(&temp[src..src + object.x]);
            }
        }
        Ok(Some(result))
    }

    /// Blocking exchange of all halos after initialisation or a
    /// repartition.
    pub fn exchange_all(&mut self, buffers: &mut HaloBuffers) -> Result<()> {
        let (Some(topology), Some(block)) = (self.topology.as_ref(), self.block.as_mut()) else {
            return Err(DlbError::Invariant("halo exchange before load_init".into()));
        };
        halo::exchange_all(topology, block, buffers)
    }

    /// Exchange the `new_temp` halo with the neighbors while `work`
    /// updates the block, then write the received strips into the halo of
    /// `new_temp`. `work` must leave the outer two core layers untouched.
    pub fn overlap_halo<R>(
        &mut self,
        buffers: &mut HaloBuffers,
        mut work: impl FnMut(&mut BlockData<'_>) -> Result<R>,
    ) -> Result<R> {
        let edge = self.mesh.edge();
        let (Some(topology), Some(block)) = (self.topology.as_ref(), self.block.as_mut()) else {
            return Err(DlbError::Invariant("halo exchange before load_init".into()));
        };
        let ext = block.ext_size();
        halo::pack_halo(&block.new_temp, ext, &mut buffers.send_temp);
        let out = halo::exchange(
            topology,
            tags::HALO_TEMP,
            &buffers.send_temp,
            &mut buffers.recv_temp,
            &mut || work(&mut block.data(edge)),
        )?;
        halo::unpack_halo(&mut block.new_temp, ext, &buffers.recv_temp);
        Ok(out)
    }

    /// Sum of this tile's share of the middle column in `new_temp`; zero
    /// for tiles off the middle.
    pub fn middle_col_sum(&self) -> Result<f32> {
        let block = self.block()?;
        let tile = block.tile();
        let mid = self.mesh.edge() / 2;
        if !tile.spans_column(mid) {
            return Ok(0.0);
        }
        Ok((0..tile.size.y)
            .map(|y| block.new_temp[block.index_of(Dims::new(mid, tile.position.y + y))])
            .sum())
    }

    /// Average of the middle column, reduced over the middle group.
    /// Returned at the group's first worker only.
    pub fn middle_col_avg(&self) -> Result<Option<f32>> {
        let Some(mid) = self.topology()?.mid_comm() else {
            return Ok(None);
        };
        let sum = mid.reduce_sum_f32(0, self.middle_col_sum()?)?;
        Ok(sum.map(|s| s / self.mesh.edge() as f32))
    }
}
