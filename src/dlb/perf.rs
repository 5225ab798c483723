//! Per-worker performance measurement used as the load signal.

use std::time::{Duration, Instant};

use crate::error::{DlbError, Result};

/// Iterations measured before the imbalance-injection baseline is fixed.
const BASELINE_ITERATIONS: usize = 5;

/// Rolling per-iteration wall-time history plus I/O and balancing timers.
///
/// Every `period` completed iterations the "period elapsed" flag is raised;
/// the driver then aggregates the history, runs the balancer and calls
/// [`PerfMeasure::reset`]. Measurement never blocks.
#[derive(Debug, Clone)]
pub struct PerfMeasure {
    period: usize,
    iter_counter: usize,
    period_elapsed: bool,
    history: Vec<Duration>,
    iter_start: Option<Instant>,
    io_start: Option<Instant>,
    balance_start: Option<Instant>,
    baseline: Option<Duration>,
    pub iter_total: Duration,
    pub io_total: Duration,
    pub balance_total: Duration,
    pub sleep_total: Duration,
    pub last_period_mean: Option<Duration>,
}

impl PerfMeasure {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            iter_counter: 0,
            period_elapsed: false,
            history: Vec::new(),
            iter_start: None,
            io_start: None,
            balance_start: None,
            baseline: None,
            iter_total: Duration::ZERO,
            io_total: Duration::ZERO,
            balance_total: Duration::ZERO,
            sleep_total: Duration::ZERO,
            last_period_mean: None,
        }
    }

    pub fn start_iteration(&mut self) {
        self.iter_start = Some(Instant::now());
    }

    /// Close the running iteration and record its duration.
    pub fn stop_iteration(&mut self) -> Result<()> {
        let start = self.iter_start.take().ok_or_else(|| {
            DlbError::Invariant("stop_iteration called before start_iteration".into())
        })?;
        self.record_iteration(start.elapsed());
        Ok(())
    }

    /// Record an iteration of known duration.
    pub fn record_iteration(&mut self, duration: Duration) {
        self.iter_total += duration;
        self.history.push(duration);
        self.iter_counter += 1;

        if self.iter_counter == BASELINE_ITERATIONS {
            self.baseline = self.mean();
        }
        if self.iter_counter % self.period == 0 {
            self.last_period_mean = self.mean();
            self.period_elapsed = true;
        }
    }

    pub fn period_elapsed(&self) -> bool {
        self.period_elapsed
    }

    /// Mean iteration time over the whole history, in seconds.
    pub fn aggregate(&self) -> Result<f64> {
        self.mean()
            .map(|d| d.as_secs_f64())
            .ok_or_else(|| DlbError::Invariant("aggregate called on an empty history".into()))
    }

    /// Drop the history and lower the period flag. Iteration count and
    /// accumulated totals are kept.
    pub fn reset(&mut self) {
        self.period_elapsed = false;
        self.history.clear();
    }

    pub fn iterations(&self) -> usize {
        self.iter_counter
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Mean of the first few iterations, once measured.
    pub fn baseline(&self) -> Option<Duration> {
        self.baseline
    }

    pub fn start_io(&mut self) {
        self.io_start = Some(Instant::now());
    }

    pub fn stop_io(&mut self) {
        if let Some(start) = self.io_start.take() {
            self.io_total += start.elapsed();
        }
    }

    pub fn start_balance(&mut self) {
        self.balance_start = Some(Instant::now());
    }

    pub fn stop_balance(&mut self) {
        if let Some(start) = self.balance_start.take() {
            self.balance_total += start.elapsed();
        }
    }

    /// Length of the synthetic delay for iteration `iter`: the baseline
    /// scaled by `multiplier` for active workers past the first quarter of
    /// the run, zero otherwise.
    pub fn imbalance_delay(
        &self,
        active: bool,
        iter: usize,
        n_iterations: usize,
        multiplier: f64,
    ) -> Duration {
        match self.baseline {
            Some(baseline) if active && multiplier > 0.0 && iter > n_iterations / 4 => {
                baseline.mul_f64(multiplier)
            }
            _ => Duration::ZERO,
        }
    }

    /// Sleep for [`PerfMeasure::imbalance_delay`] and account for it.
    pub fn inject_delay(&mut self, active: bool, iter: usize, n_iterations: usize, multiplier: f64) {
        let delay = self.imbalance_delay(active, iter, n_iterations, multiplier);
        if !delay.is_zero() {
            std::thread::sleep(delay);
            self.sleep_total += delay;
        }
    }

    fn mean(&self) -> Option<Duration> {
        if self.history.is_empty() {
            return None;
        }
        let total: Duration = self.history.iter().sum();
        Some(total / self.history.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn aggregate_fails_on_empty_history() {
        let pm = PerfMeasure::new(4);
        assert!(matches!(pm.aggregate(), Err(DlbError::Invariant(_))));
    }

    #[test]
    fn period_flag_and_mean() {
        let mut pm = PerfMeasure::new(3);
        pm.record_iteration(ms(10));
        pm.record_iteration(ms(20));
        assert!(!pm.period_elapsed());
        pm.record_iteration(ms(30));
        assert!(pm.period_elapsed());
        assert_abs_diff_eq!(pm.aggregate().unwrap(), 0.020, epsilon = 1e-9);
    }

    #[test]
    fn reset_clears_history_but_keeps_count() {
        let mut pm = PerfMeasure::new(2);
        pm.record_iteration(ms(5));
        pm.record_iteration(ms(5));
        pm.reset();
        assert!(!pm.period_elapsed());
        assert_eq!(pm.history_len(), 0);
        assert_eq!(pm.iterations(), 2);
        assert_eq!(pm.iter_total, ms(10));
        pm.record_iteration(ms(7));
        pm.record_iteration(ms(9));
        assert!(pm.period_elapsed());
        assert_abs_diff_eq!(pm.aggregate().unwrap(), 0.008, epsilon = 1e-9);
    }

    #[test]
    fn stop_without_start_is_an_error() {
        let mut pm = PerfMeasure::new(2);
        assert!(pm.stop_iteration().is_err());
        pm.start_iteration();
        assert!(pm.stop_iteration().is_ok());
        assert_eq!(pm.history_len(), 1);
    }

    #[test]
    fn imbalance_delay_after_first_quarter() {
        let mut pm = PerfMeasure::new(100);
        for _ in 0..5 {
            pm.record_iteration(ms(2));
        }
        assert_eq!(pm.baseline(), Some(ms(2)));
        assert_eq!(pm.imbalance_delay(true, 10, 100, 3.0), Duration::ZERO);
        assert_abs_diff_eq!(pm.imbalance_delay(true, 26, 100, 3.0).as_secs_f64(), 0.006, epsilon = 1e-9);
        assert_eq!(pm.imbalance_delay(false, 26, 100, 3.0), Duration::ZERO);
        assert_eq!(pm.imbalance_delay(true, 26, 100, 0.0), Duration::ZERO);
    }
}
