use clap::{Parser, ValueEnum};
use heat_dlb::config::{PartitionStrategy, SimulationConfig};
use heat_dlb::dlb::comm::Communicator;
use heat_dlb::dlb::comm_local::LocalUniverse;
use heat_dlb::error::{DlbError, Result};
use heat_dlb::material::MaterialProperties;
use heat_dlb::output::{self, RunStats};
use heat_dlb::simulation::{self, WorkerResult, VERIFY_EPSILON};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Sequential,
    Parallel,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Strategy {
    RowSplit,
    Bisection,
}

impl From<Strategy> for PartitionStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::RowSplit => PartitionStrategy::RowSplit,
            Strategy::Bisection => PartitionStrategy::Bisection,
        }
    }
}

/// Heat diffusion in a heterogeneous 2D medium with dynamic load balancing
#[derive(Parser)]
#[command(name = "heat-dlb", version)]
struct Cli {
    /// Material file to simulate
    #[arg(long, conflicts_with = "generate")]
    input: Option<PathBuf>,

    /// Generate the built-in cooler layout with this edge size instead
    #[arg(long, value_name = "EDGE")]
    generate: Option<usize>,

    /// Heater temperature of a generated layout
    #[arg(long, default_value_t = 100.0)]
    heater_temp: f32,

    /// Cooler (air) temperature of a generated layout
    #[arg(long, default_value_t = 20.0)]
    cooler_temp: f32,

    /// Store the generated layout as a material file
    #[arg(long)]
    save_material: Option<PathBuf>,

    #[arg(long, default_value_t = 100_000)]
    iterations: usize,

    /// Iterations between snapshots
    #[arg(long, default_value_t = 1000)]
    disk_write_interval: usize,

    #[arg(long, default_value_t = 0.001)]
    air_flow: f32,

    /// CSV snapshot file; enables I/O
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Parallel)]
    mode: Mode,

    /// Run both solvers and compare the results
    #[arg(long)]
    verify: bool,

    /// Print a CSV summary instead of progress
    #[arg(long)]
    batch: bool,

    /// Number of in-process workers (a power of two)
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Edge of one load-balancing object
    #[arg(long, default_value_t = 8)]
    object_size: usize,

    /// Enable dynamic load balancing
    #[arg(long)]
    balance: bool,

    /// Iterations between balance checks (default: a tenth of the run)
    #[arg(long)]
    balance_period: Option<usize>,

    #[arg(long, default_value_t = 1.5)]
    threshold: f64,

    /// Delay injected into middle-column workers, in baseline iterations
    #[arg(long, default_value_t = 0.0)]
    delay_multiplier: f64,

    #[arg(long, value_enum, default_value_t = Strategy::RowSplit)]
    strategy: Strategy,

    /// Use the MPI world instead of in-process workers
    #[cfg(feature = "distributed")]
    #[arg(long)]
    mpi: bool,

    /// Print run stats to stderr
    #[arg(long)]
    stats: bool,
}

impl Cli {
    fn config(&self) -> SimulationConfig {
        let mut config = SimulationConfig::new(self.iterations);
        config.disk_write_interval = self.disk_write_interval;
        config.air_flow_rate = self.air_flow;
        config.io_enabled = self.output.is_some();
        config.batch_mode = self.batch;
        config.delay_multiplier = self.delay_multiplier;
        config.balance.enabled = self.balance;
        config.balance.threshold = self.threshold;
        config.balance.object_size = self.object_size;
        config.balance.strategy = self.strategy.into();
        if let Some(period) = self.balance_period {
            config.balance.period = period;
        }
        config
    }

    fn material(&self) -> Result<MaterialProperties> {
        match (&self.input, self.generate) {
            (Some(path), None) => MaterialProperties::load(path),
            (None, Some(edge)) => MaterialProperties::generate(edge, self.heater_temp, self.cooler_temp),
            _ => Err(DlbError::Config("one of --input or --generate is required".into())),
        }
    }
}

/// `out.csv` -> `out_seq.csv`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}_{suffix}.{ext}"),
        None => format!("{stem}_{suffix}"),
    };
    path.with_file_name(name)
}

fn snapshot_writer(path: Option<&Path>, edge: usize) -> Result<Option<BufWriter<File>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let mut writer = BufWriter::new(File::create(path)?);
    output::write_snapshot_header(edge, &mut writer)?;
    Ok(Some(writer))
}

fn run_sequential(cli: &Cli, material: &MaterialProperties, config: &SimulationConfig) -> Result<(Vec<f32>, RunStats)> {
    let path = cli.output.as_deref().map(|p| with_suffix(p, "seq"));
    let mut writer = snapshot_writer(path.as_deref(), material.edge)?;
    let edge = material.edge;
    let mut sink = |snap: usize, iter: usize, temp: &[f32]| -> Result<()> {
        match writer.as_mut() {
            Some(w) => output::write_snapshot_csv(snap, iter, temp, edge, w),
            None => Ok(()),
        }
    };
    let result = simulation::run_sequential(material, config, Some(&mut sink))?;
    if let Some(mut w) = writer {
        w.flush()?;
    }
    let mut stats = result.stats;
    stats.output = path.map(|p| p.display().to_string()).unwrap_or_default();
    Ok((result.temperature, stats))
}

/// One worker's share of the parallel run. Only worker 0 hands over the
/// material and writes snapshots.
fn run_worker<C: Communicator>(
    world: C,
    material: &MaterialProperties,
    config: &SimulationConfig,
    path: Option<&Path>,
) -> Result<WorkerResult> {
    let edge = material.edge;
    let root = world.rank() == 0;
    let mut writer = if root { snapshot_writer(path, edge)? } else { None };
    let mut sink = |snap: usize, iter: usize, temp: &[f32]| -> Result<()> {
        match writer.as_mut() {
            Some(w) => output::write_snapshot_csv(snap, iter, temp, edge, w),
            None => Ok(()),
        }
    };
    let result = simulation::run_parallel(world, root.then_some(material), config, Some(&mut sink))?;
    if let Some(mut w) = writer {
        w.flush()?;
    }
    Ok(result)
}

fn run_parallel(
    cli: &Cli,
    material: &MaterialProperties,
    config: &SimulationConfig,
) -> Result<(Vec<f32>, Option<RunStats>)> {
    let path = cli.output.as_deref().map(|p| with_suffix(p, "par"));

    #[cfg(feature = "distributed")]
    if cli.mpi {
        let mut universe = mpi::initialize()
            .ok_or_else(|| DlbError::Config("MPI is already initialised".into()))?;
        let world = heat_dlb::dlb::comm_mpi::MpiComm::world(
            &mut universe,
            material.edge,
            config.balance.object_size,
        );
        let result = run_worker(world, material, config, path.as_deref())?;
        return Ok(collect_results(vec![result], path));
    }

    let results = LocalUniverse::run(cli.workers, |world| {
        run_worker(world, material, config, path.as_deref())
    })?;
    Ok(collect_results(results, path))
}

/// Final field from worker 0 and stats from whoever reported them.
fn collect_results(results: Vec<WorkerResult>, path: Option<PathBuf>) -> (Vec<f32>, Option<RunStats>) {
    let mut temperature = Vec::new();
    let mut stats = None;
    for result in results {
        if let Some(t) = result.temperature {
            temperature = t;
        }
        if result.stats.is_some() {
            stats = result.stats;
        }
    }
    if let Some(stats) = stats.as_mut() {
        stats.output = path.map(|p| p.display().to_string()).unwrap_or_default();
    }
    (temperature, stats)
}

fn report(cli: &Cli, stats: &RunStats) {
    if cli.batch {
        output::write_batch_summary(stats, &mut io::stdout()).unwrap_or_else(|e| {
            eprintln!("Output error: {}", e);
            std::process::exit(1);
        });
    } else {
        println!("Execution time of {} version {:.5}", stats.mode, stats.total.as_secs_f64());
    }
    if cli.stats {
        stats.display();
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let material = cli.material().unwrap_or_else(|e| {
        eprintln!("Material error: {}", e);
        std::process::exit(1);
    });
    if let Some(path) = &cli.save_material {
        material.save(path).unwrap_or_else(|e| {
            eprintln!("Error writing {}: {}", path.display(), e);
            std::process::exit(1);
        });
    }
    let config = cli.config();

    let sequential = (cli.mode == Mode::Sequential || cli.verify).then(|| {
        run_sequential(&cli, &material, &config).unwrap_or_else(|e| {
            eprintln!("Sequential simulation error: {}", e);
            std::process::exit(1);
        })
    });
    if let Some((_, stats)) = &sequential {
        report(&cli, stats);
    }

    let parallel = (cli.mode == Mode::Parallel || cli.verify).then(|| {
        run_parallel(&cli, &material, &config).unwrap_or_else(|e| {
            eprintln!("Parallel simulation error: {}", e);
            std::process::exit(1);
        })
    });
    if let Some((_, Some(stats))) = &parallel {
        report(&cli, stats);
    }

    if let (Some((seq, _)), Some((par, _))) = (&sequential, &parallel) {
        if par.is_empty() {
            // results live on MPI rank 0 only
            return;
        }
        match simulation::verify(seq, par, VERIFY_EPSILON) {
            Ok(true) => println!("Verification OK"),
            Ok(false) => {
                println!("Verification FAILED");
                std::process::exit(1);
            }
            Err(e) => {
                eprintln!("Verification error: {}", e);
                std::process::exit(1);
            }
        }
    }
}
