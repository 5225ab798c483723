//! Driver loops: the sequential baseline and the parallel loop with
//! overlapped halo exchange and periodic rebalancing.

use std::time::Instant;

use bytemuck::{Pod, Zeroable};

use crate::config::SimulationConfig;
use crate::dlb::block::HaloBuffers;
use crate::dlb::comm::Communicator;
use crate::dlb::descriptor::DynamicBlockDescriptor;
use crate::dlb::perf::PerfMeasure;
use crate::dlb::tile::Tile;
use crate::error::{DlbError, Result};
use crate::kernel::{self, StencilParams};
use crate::material::MaterialProperties;
use crate::output::RunStats;

/// Largest tolerated point difference between the two solvers.
pub const VERIFY_EPSILON: f32 = 1e-3;

/// Receives `(snapshot index, iteration, edge x edge temperatures)`.
pub type SnapshotSink<'a> = Option<&'a mut dyn FnMut(usize, usize, &[f32]) -> Result<()>>;

/// Domain scalars worker 0 shares with everybody before distribution.
/// An edge of zero tells the other workers that worker 0 has no data.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DomainHeader {
    edge: u64,
    cooler_temp: f32,
    heater_temp: f32,
}

#[derive(Debug, Clone)]
pub struct SequentialResult {
    pub temperature: Vec<f32>,
    pub stats: RunStats,
}

/// What one worker brings back from a parallel run.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub rank: usize,
    /// Final temperature field, worker 0 only.
    pub temperature: Option<Vec<f32>>,
    /// Run summary, at the first worker of the middle group only.
    pub stats: Option<RunStats>,
    /// Partition in force when the loop ended.
    pub tiles: Vec<Tile>,
}

/// Iterations between progress reports.
fn progress_interval(iterations: usize) -> usize {
    (iterations / 10).max(1)
}

/// Whole-domain solver without decomposition.
pub fn run_sequential(
    material: &MaterialProperties,
    config: &SimulationConfig,
    mut sink: SnapshotSink<'_>,
) -> Result<SequentialResult> {
    let edge = material.edge;
    config.validate(edge, 1)?;
    let _span = tracing::info_span!("sequential", edge, iterations = config.iterations).entered();

    let stencil = StencilParams {
        air_flow_rate: config.air_flow_rate,
        cooler_temp: material.cooler_temp,
    };
    let mut old = material.initial_temp.clone();
    let mut new = material.initial_temp.clone();
    let every = progress_interval(config.iterations);
    let mut stats = RunStats::new("seq", config.iterations);
    stats.object_size = config.balance.object_size;

    let start = Instant::now();
    for iter in 0..config.iterations {
        let begin = Instant::now();
        kernel::step_domain(&old, &mut new, &material.params, &material.map, edge, stencil);
        stats.middle_col = kernel::middle_column_average(&new, edge);

        if config.io_enabled && iter % config.disk_write_interval == 0 {
            if let Some(sink) = sink.as_mut() {
                let io = Instant::now();
                sink(iter / config.disk_write_interval, iter, &new)?;
                stats.io_total += io.elapsed();
            }
        }
        std::mem::swap(&mut old, &mut new);
        stats.iter_total += begin.elapsed();

        if iter % every == every - 1 && !config.batch_mode {
            tracing::info!(
                progress = (iter + 1) * 100 / config.iterations,
                average = stats.middle_col,
                "sequential progress"
            );
        }
    }
    stats.total = start.elapsed();

    Ok(SequentialResult {
        temperature: old,
        stats,
    })
}

/// Share the domain scalars from worker 0.
fn share_header<C: Communicator>(world: &C, material: Option<&MaterialProperties>) -> Result<DomainHeader> {
    let header = match material {
        Some(m) if world.rank() == 0 => DomainHeader {
            edge: m.edge as u64,
            cooler_temp: m.cooler_temp,
            heater_temp: m.heater_temp,
        },
        _ => DomainHeader::zeroed(),
    };
    let shared = world.broadcast(0, &[header])?;
    let header = shared
        .first()
        .copied()
        .ok_or_else(|| crate::protocol_error!("broadcast", "empty domain header"))?;
    if header.edge == 0 {
        return Err(DlbError::Config("worker 0 has no material data".into()));
    }
    Ok(header)
}

/// Parallel solver. Every worker of `world` calls this; only worker 0
/// passes the material and a snapshot sink.
pub fn run_parallel<C: Communicator>(
    world: C,
    material: Option<&MaterialProperties>,
    config: &SimulationConfig,
    mut sink: SnapshotSink<'_>,
) -> Result<WorkerResult> {
    let rank = world.rank();
    let header = share_header(&world, material)?;
    let edge = header.edge as usize;
    config.validate(edge, world.size())?;
    let _span = tracing::info_span!("parallel", rank, edge).entered();
    tracing::debug!(heater = header.heater_temp, cooler = header.cooler_temp, "domain header received");

    let mut dbd = DynamicBlockDescriptor::new(world, edge, &config.balance)?;
    dbd.load_init(material)?;
    let mut buffers = HaloBuffers::new(dbd.halo_len()?);
    dbd.exchange_all(&mut buffers)?;

    let stencil = StencilParams {
        air_flow_rate: config.air_flow_rate,
        cooler_temp: header.cooler_temp,
    };
    let n = config.iterations;
    let every = progress_interval(n);
    let mut perf = PerfMeasure::new(config.balance.period);
    let mut middle_col = 0.0f32;
    let mut rebalances = 0;

    let start = Instant::now();
    for iter in 0..n {
        if perf.period_elapsed() {
            if config.balance.enabled {
                perf.start_balance();
                if dbd.load_balance(&perf)? {
                    rebalances += 1;
                    buffers.resize(dbd.halo_len()?);
                    dbd.exchange_all(&mut buffers)?;
                }
                perf.stop_balance();
            }
            perf.reset();
        }

        perf.start_iteration();
        perf.inject_delay(dbd.is_middle(), iter, n, config.delay_multiplier);

        kernel::compute_halo(&mut dbd.block_data()?, stencil);
        dbd.overlap_halo(&mut buffers, |data| {
            kernel::compute_interior(data, stencil);
            Ok(())
        })?;

        if iter % every == every - 1 && dbd.is_middle() {
            if let Some(avg) = dbd.middle_col_avg()? {
                middle_col = avg;
                if !config.batch_mode {
                    tracing::info!(progress = (iter + 1) * 100 / n, average = avg, "parallel progress");
                }
            }
        }

        if config.io_enabled && iter % config.disk_write_interval == 0 {
            perf.start_io();
            let snapshot = dbd.collect_data(false)?;
            perf.stop_io();
            if let (Some(temp), Some(sink)) = (snapshot, sink.as_mut()) {
                sink(iter / config.disk_write_interval, iter, &temp)?;
            }
        }

        perf.stop_iteration()?;
        dbd.swap()?;
    }
    let total = start.elapsed();

    let temperature = dbd.collect_data(true)?;
    let reports = dbd.topology()?.mid_comm().is_some_and(|c| c.rank() == 0);
    let stats = reports.then(|| RunStats {
        mode: if config.balance.enabled { "parBal" } else { "par" },
        object_size: config.balance.object_size,
        middle_col,
        total,
        iter_total: perf.iter_total,
        sleep_for: perf.imbalance_delay(true, n, n, config.delay_multiplier),
        sleep_total: perf.sleep_total,
        io_total: perf.io_total,
        balance_total: perf.balance_total,
        rebalances,
        ..RunStats::new("par", n)
    });
    tracing::debug!(rank, rebalances, total = total.as_secs_f64(), "parallel loop finished");

    Ok(WorkerResult {
        rank,
        temperature,
        stats,
        tiles: dbd.tiles()?.to_vec(),
    })
}

/// Largest point-wise difference between two fields.
pub fn max_abs_difference(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(DlbError::Invariant(format!(
            "comparing fields of {} and {} points",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max))
}

/// Whether two fields agree within `epsilon` everywhere.
pub fn verify(sequential: &[f32], parallel: &[f32], epsilon: f32) -> Result<bool> {
    let diff = max_abs_difference(sequential, parallel)?;
    tracing::info!(max_difference = diff, epsilon, "verification");
    Ok(diff <= epsilon)
}
