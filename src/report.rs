//! Result Reporter
//!
//! Times the whole invocation, table materialization included, and renders
//! the outcome to stdout.

use crate::error::Result;
use crate::suspend::{ExecutionOutcome, SuspendReport};
use std::io::Write;
use std::time::{Duration, Instant};

pub struct ResultReporter {
    started: Instant,
}

impl ResultReporter {
    /// Start the clock.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn render<W: Write>(&self, outcome: &ExecutionOutcome, out: &mut W) -> Result<()> {
        match outcome {
            ExecutionOutcome::Completed(frame) => {
                writeln!(out, "{}", frame)?;
            }
            ExecutionOutcome::Paused(report) => render_paused(report, out)?,
        }
        writeln!(out, "Total Runtime: {}", self.elapsed().as_secs_f64())?;
        Ok(())
    }
}

fn render_paused<W: Write>(report: &SuspendReport, out: &mut W) -> Result<()> {
    writeln!(out, "Query suspended, no result rows.")?;
    writeln!(
        out,
        "Checkpoint {} written to {} ({})",
        report.checkpoint_id,
        report.location.display(),
        if report.partitioned {
            "one descriptor per partition"
        } else {
            "single file"
        }
    )?;
    writeln!(
        out,
        "Partitions: {} ({} unfinished, {} buffered rows)",
        report.partitions, report.arrested_partitions, report.buffered_rows
    )?;
    if report.forced {
        writeln!(out, "Forced at suspend end time before every partition reached the barrier")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    #[test]
    fn test_render_completed() {
        let reporter = ResultReporter::start();
        let frame = df!("revenue" => &[42.5f64]).unwrap();
        let mut out = Vec::new();
        reporter
            .render(&ExecutionOutcome::Completed(frame), &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("revenue"));
        assert!(text.contains("42.5"));
        assert!(text.trim_end().lines().last().unwrap().starts_with("Total Runtime: "));
    }

    #[test]
    fn test_render_paused() {
        let reporter = ResultReporter::start();
        let report = SuspendReport {
            checkpoint_id: Uuid::new_v4(),
            location: PathBuf::from("/tmp/ckpt"),
            partitioned: true,
            partitions: 4,
            arrested_partitions: 3,
            buffered_rows: 17,
            forced: true,
        };
        let mut out = Vec::new();
        reporter
            .render(&ExecutionOutcome::Paused(report), &mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("/tmp/ckpt"));
        assert!(text.contains("Partitions: 4 (3 unfinished, 17 buffered rows)"));
        assert!(text.contains("Forced"));
        assert!(text.contains("Total Runtime: "));
    }
}
