use std::{
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use anyhow::Context;
use tinyboy_avr::config::{get_u64_env, FirmwareConfig};

use crate::utils::{parse_bool_env, parse_duration_str, parse_f64_env};

/// Which coverage metric decides when fuzzing has reached its target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum CoverageMetric {
    Branch,
    Instruction,
}

impl std::str::FromStr for CoverageMetric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch" | "branches" => Ok(Self::Branch),
            "instruction" | "instructions" => Ok(Self::Instruction),
            other => anyhow::bail!("unknown coverage metric: {other}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FuzzConfig {
    /// The number of emulator sessions executing inputs in parallel.
    pub workers: usize,
    /// The number of inputs each worker executes per round.
    pub batch_size: usize,
    /// The coverage percentage at which fuzzing stops.
    pub target: f64,
    pub metric: CoverageMetric,
    pub seed: u64,
    /// The maximum number of inputs to generate.
    pub max_inputs: Option<u64>,
    /// The maximum number of pulses in a generated input.
    pub max_pulses: usize,
    /// Stop fuzzing after this amount of time. Only checked between rounds.
    pub run_for: Option<Duration>,
    /// Whether to append statistics to `stats.csv` in the working directory.
    pub save_stats: bool,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            batch_size: 8,
            target: 100.0,
            metric: CoverageMetric::Branch,
            seed: 0x5eed,
            max_inputs: None,
            max_pulses: 256,
            run_for: None,
            save_stats: false,
        }
    }
}

impl FuzzConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(workers) = get_u64_env("WORKERS")? {
            config.workers = workers as usize;
        }
        else if let Ok(threads) = std::thread::available_parallelism() {
            config.workers = threads.get();
        }
        if let Some(batch_size) = get_u64_env("BATCH_SIZE")? {
            config.batch_size = batch_size as usize;
        }
        if let Some(target) = parse_f64_env("TARGET_COVERAGE")? {
            config.target = target;
        }
        if let Ok(metric) = std::env::var("COVERAGE_METRIC") {
            config.metric = metric.parse()?;
        }
        if let Some(seed) = get_u64_env("SEED")? {
            config.seed = seed;
        }
        config.max_inputs = get_u64_env("MAX_INPUTS")?;
        if let Some(max_pulses) = get_u64_env("MAX_PULSES")? {
            config.max_pulses = max_pulses as usize;
        }
        if let Ok(duration) = std::env::var("RUN_FOR") {
            config.run_for = Some(
                parse_duration_str(&duration)
                    .ok_or_else(|| anyhow::format_err!("invalid duration for RUN_FOR: {duration}"))?,
            );
        }
        config.save_stats = parse_bool_env("ENABLE_STATS")?.unwrap_or(false);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.workers > 0, "at least one worker is required");
        anyhow::ensure!(self.batch_size > 0, "batch size must be non-zero");
        anyhow::ensure!(self.max_pulses > 0, "inputs must allow at least one pulse");
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.target),
            "target coverage must be a percentage, got {}",
            self.target
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct Config {
    pub fuzzer: FuzzConfig,
    pub workdir: PathBuf,
    pub firmware: FirmwareConfig,
    pub interrupt_flag: Arc<AtomicBool>,
}

pub struct WorkdirLock {
    file: Option<std::fs::File>,
    path: PathBuf,
}

impl WorkdirLock {
    fn new(path: PathBuf) -> anyhow::Result<Self> {
        let file = std::fs::File::options().write(true).create_new(true).open(&path).with_context(
            || format!("Failed to obtain lock for working directory ({})", path.display()),
        )?;
        Ok(Self { file: Some(file), path })
    }
}

impl Drop for WorkdirLock {
    fn drop(&mut self) {
        drop(self.file.take());
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(serde::Serialize)]
struct Settings<'a> {
    firmware: PathBuf,
    workers: usize,
    batch_size: usize,
    target: f64,
    metric: CoverageMetric,
    wiring: &'a tinyboy_avr::pins::WiringTable,
}

/// Create the working directory, taking an exclusive lock on it for as long as the returned guard
/// is alive.
pub fn lock_workdir(workdir: &Path) -> anyhow::Result<WorkdirLock> {
    std::fs::create_dir_all(workdir).context("Error creating working directory")?;
    WorkdirLock::new(workdir.join(".lock"))
}

/// Lock the working directory of a fuzzing run, then record its settings and reset the stats file.
pub fn init_workdir(config: &Config) -> anyhow::Result<WorkdirLock> {
    let workdir = &config.workdir;
    let lock = lock_workdir(workdir)?;

    let firmware = config.firmware.firmware_path();
    std::fs::write(
        workdir.join("settings.json"),
        serde_json::to_vec_pretty(&Settings {
            firmware: firmware.canonicalize().unwrap_or(firmware),
            workers: config.fuzzer.workers,
            batch_size: config.fuzzer.batch_size,
            target: config.fuzzer.target,
            metric: config.fuzzer.metric,
            wiring: &config.firmware.wiring,
        })?,
    )
    .context("Failed to write settings")?;

    let stats_path = workdir.join("stats.csv");
    let _ = std::fs::remove_file(&stats_path);
    if config.fuzzer.save_stats {
        std::fs::write(&stats_path, b"time,execs,rounds,branch_coverage,instruction_coverage\n")
            .context("Failed to write to stats file")?;
    }

    Ok(lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names() {
        assert_eq!("branch".parse::<CoverageMetric>().unwrap(), CoverageMetric::Branch);
        assert_eq!("instructions".parse::<CoverageMetric>().unwrap(), CoverageMetric::Instruction);
        assert!("edges".parse::<CoverageMetric>().is_err());
    }

    #[test]
    fn validation() {
        assert!(FuzzConfig::default().validate().is_ok());
        assert!(FuzzConfig { target: 101.0, ..FuzzConfig::default() }.validate().is_err());
        assert!(FuzzConfig { workers: 0, ..FuzzConfig::default() }.validate().is_err());
    }

    #[test]
    fn workdir_lock_is_exclusive() {
        let workdir = std::env::temp_dir().join(format!("tinyboy-workdir-{}", std::process::id()));
        let config = Config {
            fuzzer: FuzzConfig { save_stats: true, ..FuzzConfig::default() },
            workdir: workdir.clone(),
            firmware: FirmwareConfig::for_firmware("game.hex".into()),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
        };

        let lock = init_workdir(&config).unwrap();
        assert!(workdir.join("settings.json").exists());
        assert!(workdir.join("stats.csv").exists());
        assert!(init_workdir(&config).is_err());
        drop(lock);
        assert!(init_workdir(&config).is_ok());

        let _ = std::fs::remove_dir_all(&workdir);
    }

    #[test]
    fn analysis_workdir_only_takes_the_lock() {
        let workdir = std::env::temp_dir().join(format!("tinyboy-analysis-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&workdir);

        let lock = lock_workdir(&workdir).unwrap();
        assert!(workdir.join(".lock").exists());
        assert!(!workdir.join("settings.json").exists());
        assert!(!workdir.join("stats.csv").exists());
        assert!(lock_workdir(&workdir).is_err());
        drop(lock);
        assert!(!workdir.join(".lock").exists());

        let _ = std::fs::remove_dir_all(&workdir);
    }
}
