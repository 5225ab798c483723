//! End-to-end tests of the parallel engine over in-process workers.
//!
//! The sequential solver is the reference: every parallel run, with or
//! without repartitioning, must reproduce its field within 1e-3.

use std::time::Duration;

use approx::assert_abs_diff_eq;
use heat_dlb::config::{BalanceConfig, PartitionStrategy, SimulationConfig};
use heat_dlb::dlb::balancer::LoadBalancer;
use heat_dlb::dlb::comm::Communicator;
use heat_dlb::dlb::comm_local::LocalUniverse;
use heat_dlb::dlb::descriptor::DynamicBlockDescriptor;
use heat_dlb::dlb::dims::Dims;
use heat_dlb::dlb::mesh::ObjectMesh;
use heat_dlb::dlb::perf::PerfMeasure;
use heat_dlb::material::MaterialProperties;
use heat_dlb::simulation::{self, WorkerResult, VERIFY_EPSILON};

fn run_parallel(workers: usize, material: &MaterialProperties, config: &SimulationConfig) -> Vec<WorkerResult> {
    LocalUniverse::run(workers, |world| {
        let root = world.rank() == 0;
        simulation::run_parallel(world, root.then_some(material), config, None)
    })
    .unwrap()
}

fn merged(results: &[WorkerResult]) -> &[f32] {
    results[0].temperature.as_deref().unwrap()
}

// ── Regression against the sequential solver ──────────────────────────

#[test]
fn uniform_air_matches_sequential() {
    let material = MaterialProperties::uniform(64, 0, 0.05, 20.0);
    let mut config = SimulationConfig::new(40);
    config.balance.enabled = false;

    let seq = simulation::run_sequential(&material, &config, None).unwrap();
    let results = run_parallel(4, &material, &config);

    for tile in &results[0].tiles {
        assert_eq!(tile.size, Dims::square(32));
    }
    let par = merged(&results);
    assert!(simulation::verify(&seq.temperature, par, VERIFY_EPSILON).unwrap());
    for v in par {
        assert_abs_diff_eq!(*v, 20.0, epsilon = 1e-3);
    }
}

#[test]
fn cooler_layout_matches_sequential() {
    let material = MaterialProperties::generate(64, 100.0, 20.0).unwrap();
    let mut config = SimulationConfig::new(60);
    config.air_flow_rate = 0.01;
    config.balance.enabled = false;

    let seq = simulation::run_sequential(&material, &config, None).unwrap();
    for workers in [2, 4, 8] {
        let results = run_parallel(workers, &material, &config);
        let diff = simulation::max_abs_difference(&seq.temperature, merged(&results)).unwrap();
        assert!(diff <= VERIFY_EPSILON, "{workers} workers differ by {diff}");
    }
}

#[test]
fn rebalancing_does_not_change_the_result() {
    for (workers, edge) in [(8, 64), (2, 32)] {
        let material = MaterialProperties::generate(edge, 100.0, 20.0).unwrap();
        let seq = simulation::run_sequential(&material, &SimulationConfig::new(80), None).unwrap();

        for strategy in [PartitionStrategy::RowSplit, PartitionStrategy::Bisection] {
            let mut config = SimulationConfig::new(80);
            config.delay_multiplier = 3.0;
            config.balance.period = 4;
            config.balance.threshold = 1.2;
            config.balance.strategy = strategy;
            let results = run_parallel(workers, &material, &config);

            let stats = results.iter().find_map(|r| r.stats.as_ref()).unwrap();
            assert!(stats.rebalances > 0, "{strategy:?} on {workers} workers never rebalanced");
            let diff = simulation::max_abs_difference(&seq.temperature, merged(&results)).unwrap();
            assert_eq!(diff, 0.0, "{strategy:?} on {workers} workers differs by {diff}");

            let covered: usize = results[0].tiles.iter().map(|t| t.area()).sum();
            assert_eq!(covered, edge * edge);
        }
    }
}

#[test]
fn snapshots_reach_the_root_sink() {
    let material = MaterialProperties::generate(32, 100.0, 20.0).unwrap();
    let mut config = SimulationConfig::new(12);
    config.io_enabled = true;
    config.disk_write_interval = 5;

    let seq = simulation::run_sequential(&material, &config, None).unwrap();
    let snapshots = LocalUniverse::run(2, |world| {
        let root = world.rank() == 0;
        let mut seen = Vec::new();
        let mut sink = |snap: usize, iter: usize, temp: &[f32]| -> heat_dlb::error::Result<()> {
            seen.push((snap, iter, temp.len()));
            Ok(())
        };
        let sink_ref: simulation::SnapshotSink<'_> = if root { Some(&mut sink) } else { None };
        let result = simulation::run_parallel(world, root.then_some(&material), &config, sink_ref)?;
        if let Some(par) = &result.temperature {
            assert!(simulation::verify(&seq.temperature, par, VERIFY_EPSILON)?);
        }
        Ok(seen)
    })
    .unwrap();

    assert_eq!(snapshots[0], vec![(0, 0, 1024), (1, 5, 1024), (2, 10, 1024)]);
    assert!(snapshots[1].is_empty());
}

// ── Imbalance scenarios ────────────────────────────────────────────────

#[test]
fn straggler_is_detected_and_loses_columns() {
    let mesh = ObjectMesh::new(64, Dims::square(8)).unwrap();
    let balancer = LoadBalancer::new(mesh, 4, 1.5, PartitionStrategy::RowSplit).unwrap();

    // worker 2 runs at threshold x 1.2 of the others
    let period = 10;
    let mut perfs: Vec<PerfMeasure> = (0..4).map(|_| PerfMeasure::new(period)).collect();
    for (rank, perf) in perfs.iter_mut().enumerate() {
        let ms = if rank == 2 { 18 } else { 10 };
        for _ in 0..period {
            perf.record_iteration(Duration::from_millis(ms));
        }
        assert!(perf.period_elapsed());
    }
    let times: Vec<f64> = perfs.iter().map(|p| p.aggregate().unwrap()).collect();

    assert!(balancer.is_imbalanced(&times));
    let regular = balancer.regular_partition();
    let tiles = balancer.get_partition(&times, &regular).unwrap();
    assert!(tiles[2].size.x / 8 < mesh.cols() / 2);
    assert_eq!(tiles[2].size.x + tiles[3].size.x, 64);
}

#[test]
fn equal_timings_restore_the_regular_partition() {
    let mesh = ObjectMesh::new(64, Dims::square(8)).unwrap();
    let mut balancer = LoadBalancer::new(mesh, 4, 1.5, PartitionStrategy::RowSplit).unwrap();
    let regular = balancer.regular_partition();

    let skewed = balancer.rebalance(&[0.01, 0.01, 0.018, 0.01], &regular).unwrap().unwrap();
    assert!(balancer.is_running_balanced());
    let restored = balancer.rebalance(&[0.01; 4], &skewed).unwrap().unwrap();
    assert!(!balancer.is_running_balanced());
    assert!(restored.iter().zip(&regular).all(|(a, b)| a.same_geometry(b)));
    assert!(balancer.rebalance(&[0.01; 4], &restored).unwrap().is_none());
}

// ── Migration ──────────────────────────────────────────────────────────

#[test]
fn migration_round_trip_preserves_field() {
    let material = MaterialProperties::generate(64, 100.0, 20.0).unwrap();
    let balance = BalanceConfig::default();
    let results = LocalUniverse::run(4, |world| {
        let rank = world.rank();
        let mut dbd = DynamicBlockDescriptor::new(world, 64, &balance)?;
        dbd.load_init((rank == 0).then_some(&material))?;

        let mut perf = PerfMeasure::new(1);
        let ms = if rank == 1 { 30 } else { 10 };
        perf.record_iteration(Duration::from_millis(ms));
        let moved = dbd.load_balance(&perf)?;
        let after_move = dbd.collect_data(true)?;

        perf.reset();
        perf.record_iteration(Duration::from_millis(10));
        let restored = dbd.load_balance(&perf)?;
        let after_restore = dbd.collect_data(true)?;
        Ok((moved, restored, dbd.tile()?, after_move, after_restore))
    })
    .unwrap();

    let (moved, restored, _, after_move, after_restore) = &results[0];
    assert!(*moved && *restored);
    assert_eq!(after_move.as_ref().unwrap(), &material.initial_temp);
    assert_eq!(after_restore.as_ref().unwrap(), &material.initial_temp);
    assert_eq!(results[1].2.size, Dims::square(32));
}
