//! Results output: CSV snapshots, the batch summary line and the run
//! statistics table.

use std::io::Write;
use std::time::Duration;

use crate::error::{DlbError, Result};

/// Write the header of a snapshot file for a domain of `edge` points.
///
/// Format:
/// ```csv
/// snapshot,iteration,row,c0,c1,...,c{edge-1}
/// ```
pub fn write_snapshot_header<W: Write>(edge: usize, writer: &mut W) -> Result<()> {
    write!(writer, "snapshot,iteration,row")?;
    for col in 0..edge {
        write!(writer, ",c{}", col)?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Append one temperature snapshot, one line per domain row.
///
/// Format:
/// ```csv
/// 3,3000,0,20.0,20.0,100.0,...
/// 3,3000,1,20.0,20.0,97.4,...
/// ```
pub fn write_snapshot_csv<W: Write>(
    snapshot: usize,
    iteration: usize,
    temp: &[f32],
    edge: usize,
    writer: &mut W,
) -> Result<()> {
    if temp.len() != edge * edge {
        return Err(DlbError::Invariant(format!(
            "snapshot of {} values for a domain of edge {}",
            temp.len(),
            edge
        )));
    }
    for (row, values) in temp.chunks(edge).enumerate() {
        write!(writer, "{},{},{}", snapshot, iteration, row)?;
        for v in values {
            write!(writer, ",{}", v)?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Timings and results of one run, reported by the worker that owns the
/// middle-column average.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    /// `seq`, `par` or `parBal`.
    pub mode: &'static str,
    pub output: String,
    pub object_size: usize,
    pub iterations: usize,
    pub middle_col: f32,
    pub total: Duration,
    pub iter_total: Duration,
    /// Delay injected per iteration once active.
    pub sleep_for: Duration,
    pub sleep_total: Duration,
    pub io_total: Duration,
    pub balance_total: Duration,
    pub rebalances: usize,
}

impl RunStats {
    pub fn new(mode: &'static str, iterations: usize) -> Self {
        Self {
            mode,
            output: String::new(),
            object_size: 0,
            iterations,
            middle_col: 0.0,
            total: Duration::ZERO,
            iter_total: Duration::ZERO,
            sleep_for: Duration::ZERO,
            sleep_total: Duration::ZERO,
            io_total: Duration::ZERO,
            balance_total: Duration::ZERO,
            rebalances: 0,
        }
    }

    /// Wall time per iteration.
    pub fn iter_time(&self) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            self.total.as_secs_f64() / self.iterations as f64
        }
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        eprintln!();
        eprintln!("=== heat-dlb Run Stats ({}) ===", self.mode);
        eprintln!("  {:<24} {:>8.3}s", "Total", self.total.as_secs_f64());
        eprintln!("  {:<24} {:>8.6}s", "Per iteration", self.iter_time());
        eprintln!("  {:<24} {:>8.3}s", "Iteration total", self.iter_total.as_secs_f64());
        eprintln!("  {:<24} {:>8.3}s", "I/O", self.io_total.as_secs_f64());
        eprintln!("  {:<24} {:>8.3}s", "Balancing", self.balance_total.as_secs_f64());
        if !self.sleep_total.is_zero() {
            eprintln!("  {:<24} {:>8.3}s", "Injected delay", self.sleep_total.as_secs_f64());
        }
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Iterations:              {}", self.iterations);
        eprintln!("  Repartitions:            {}", self.rebalances);
        eprintln!("  Middle column average:   {:.5}", self.middle_col);
    }
}

/// Write the batch-mode summary: a header and one record.
///
/// Format:
/// ```csv
/// output;mode;middle_col;total_time;iter_time;iter_total;sleep_for;sleep_total_ms;io_total;balance_total
/// out.csv;parBal;24.51;12.3;0.000123;11.9;0.0004;40.2;0;0.08
/// ```
pub fn write_batch_summary<W: Write>(stats: &RunStats, writer: &mut W) -> Result<()> {
    writeln!(
        writer,
        "output;mode;middle_col;total_time;iter_time;iter_total;sleep_for;sleep_total_ms;io_total;balance_total"
    )?;
    writeln!(
        writer,
        "{};{};{};{};{};{};{};{};{};{}",
        stats.output,
        stats.mode,
        stats.middle_col,
        stats.total.as_secs_f64(),
        stats.iter_time(),
        stats.iter_total.as_secs_f64(),
        stats.sleep_for.as_secs_f64(),
        stats.sleep_total.as_micros() as f64 / 1000.0,
        stats.io_total.as_secs_f64(),
        stats.balance_total.as_secs_f64()
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_rows() {
        let temp = [1.0f32, 2.0, 3.0, 4.5];
        let mut out = Vec::new();
        write_snapshot_header(2, &mut out).unwrap();
        write_snapshot_csv(1, 10, &temp, 2, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["snapshot,iteration,row,c0,c1", "1,10,0,1,2", "1,10,1,3,4.5"]);
    }

    #[test]
    fn snapshot_size_mismatch() {
        let mut out = Vec::new();
        assert!(write_snapshot_csv(0, 0, &[1.0; 3], 2, &mut out).is_err());
    }

    #[test]
    fn batch_summary_fields() {
        let mut stats = RunStats::new("par", 4);
        stats.output = "out.csv".into();
        stats.middle_col = 20.5;
        stats.total = Duration::from_secs(2);
        stats.sleep_total = Duration::from_millis(3);
        let mut out = Vec::new();
        write_batch_summary(&stats, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let record = text.lines().nth(1).unwrap();
        let fields: Vec<&str> = record.split(';').collect();
        assert_eq!(fields.len(), 10);
        assert_eq!(fields[0], "out.csv");
        assert_eq!(fields[1], "par");
        assert_eq!(fields[2], "20.5");
        assert_eq!(fields[4], "0.5");
        assert_eq!(fields[7], "3");
    }
}
