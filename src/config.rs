//! Immutable run configuration.
//!
//! Built once at startup (by the CLI or a test) and passed by reference to
//! the orchestrator, the kernel and the driver loop.

use crate::dlb::balancer::RegularLayout;
use crate::dlb::dims::Dims;
use crate::dlb::mesh::ObjectMesh;
use crate::dlb::tile::HALO_SIZE;
use crate::error::{DlbError, Result};

/// How a new partition is computed once imbalance is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionStrategy {
    /// Re-split the object columns of every row band by measured speed.
    #[default]
    RowSplit,
    /// Ask the recursive-bisection oracle for a weighted partition.
    Bisection,
}

/// Load-balancing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceConfig {
    pub enabled: bool,
    /// Iterations between balance checks.
    pub period: usize,
    /// Imbalance is declared when `max > min * threshold`.
    pub threshold: f64,
    /// Edge of one square object, in grid points.
    pub object_size: usize,
    pub strategy: PartitionStrategy,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: 10_000,
            threshold: 1.5,
            object_size: 8,
            strategy: PartitionStrategy::RowSplit,
        }
    }
}

impl BalanceConfig {
    pub fn object_dims(&self) -> Dims {
        Dims::square(self.object_size)
    }
}

/// Simulation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub iterations: usize,
    /// Iterations between snapshots when I/O is enabled.
    pub disk_write_interval: usize,
    pub air_flow_rate: f32,
    pub io_enabled: bool,
    pub batch_mode: bool,
    /// Synthetic delay for middle-column workers, as a multiple of their
    /// baseline iteration time. Zero disables injection.
    pub delay_multiplier: f64,
    pub balance: BalanceConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl SimulationConfig {
    /// Defaults for a run of `iterations` steps; the balance period is a
    /// tenth of the run.
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            disk_write_interval: 1000,
            air_flow_rate: 0.001,
            io_enabled: false,
            batch_mode: false,
            delay_multiplier: 0.0,
            balance: BalanceConfig {
                period: (iterations / 10).max(1),
                ..BalanceConfig::default()
            },
        }
    }

    /// Reject configurations the engine cannot run on a domain of `edge`
    /// points with `workers` workers.
    pub fn validate(&self, edge: usize, workers: usize) -> Result<()> {
        if self.iterations == 0 {
            return Err(DlbError::Config("iteration count must be positive".into()));
        }
        if self.io_enabled && self.disk_write_interval == 0 {
            return Err(DlbError::Config("disk write interval must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.air_flow_rate) {
            return Err(DlbError::Config(format!(
                "air flow rate {} outside [0, 1]",
                self.air_flow_rate
            )));
        }
        if !(self.delay_multiplier >= 0.0 && self.delay_multiplier.is_finite()) {
            return Err(DlbError::Config(format!(
                "delay multiplier {} must be a non-negative number",
                self.delay_multiplier
            )));
        }
        if self.balance.period == 0 {
            return Err(DlbError::Config("balance period must be positive".into()));
        }
        if !(self.balance.threshold > 1.0 && self.balance.threshold.is_finite()) {
            return Err(DlbError::Config(format!(
                "imbalance threshold {} must be greater than 1",
                self.balance.threshold
            )));
        }

        if self.balance.object_size < 2 * HALO_SIZE {
            return Err(DlbError::Config(format!(
                "object size {} is narrower than two halo widths",
                self.balance.object_size
            )));
        }

        let mesh = ObjectMesh::new(edge, self.balance.object_dims())?;
        RegularLayout::new(workers, &mesh)?;
        Ok(())
    }
}
