use std::{
    io::Write,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::Context;

use crate::coverage::CoverageTracker;

pub(crate) struct Monitor {
    /// The total number of inputs that have been executed.
    pub total_executions: u64,

    /// The number of completed rounds.
    pub rounds: u64,

    /// An instant that keeps track of when fuzzing started.
    pub start_time: Instant,

    /// The last time that we displayed output.
    pub last_report: Instant,

    /// The total executions the last time we displayed output.
    pub last_exec_count: u64,

    /// The amount of time to wait between progress messages.
    pub report_rate: Duration,

    /// Where to append statistics to, if enabled.
    pub stats_path: Option<PathBuf>,
}

impl Monitor {
    pub fn new(stats_path: Option<PathBuf>) -> Self {
        Self {
            total_executions: 0,
            rounds: 0,
            start_time: Instant::now(),
            last_report: Instant::now(),
            last_exec_count: 0,
            report_rate: Duration::from_secs(1),
            stats_path,
        }
    }

    /// Account for a completed round of `executions` runs.
    pub fn round(&mut self, executions: u64, coverage: &CoverageTracker) -> anyhow::Result<()> {
        self.total_executions += executions;
        self.rounds += 1;

        if self.last_report.elapsed() >= self.report_rate {
            self.log(coverage)?;
        }
        Ok(())
    }

    pub fn log(&mut self, coverage: &CoverageTracker) -> anyhow::Result<()> {
        let elapsed_time = self.last_report.elapsed().as_secs_f64().max(f64::EPSILON);
        let rate = (self.total_executions - self.last_exec_count) as f64 / elapsed_time;
        let branches = coverage.branch_coverage();
        let instructions = coverage.instruction_coverage();

        tracing::info!(
            "Processed {} inputs @ {rate:.1} inputs/s with branch coverage {branches}, instruction coverage {instructions}",
            self.total_executions,
        );

        if let Some(path) = self.stats_path.as_ref() {
            let mut file = std::fs::File::options()
                .append(true)
                .create(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            writeln!(
                file,
                "{},{},{},{},{}",
                self.start_time.elapsed().as_secs(),
                self.total_executions,
                self.rounds,
                branches.percent().map_or(String::new(), |x| format!("{x:.2}")),
                instructions.percent().map_or(String::new(), |x| format!("{x:.2}")),
            )
            .context("Failed to write to stats file")?;
        }

        self.last_report = Instant::now();
        self.last_exec_count = self.total_executions;
        Ok(())
    }
}
