use std::io::Write;

use anyhow::Context;
use tinyboy_avr::config::FirmwareConfig;
use tinyboy_fuzz::{config::lock_workdir, CoverageTracker};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("TINYBOY_LOG"))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error running analysis: {e:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    // The firmware config can be passed either as an environment variable or as an argument.
    let config_arg = std::env::args().nth(1);
    let firmware_config = match config_arg.as_deref() {
        Some("") | None => FirmwareConfig::from_env()?,
        Some(arg) => FirmwareConfig::from_path(arg.as_ref())?,
    };

    let workdir =
        std::path::PathBuf::from(std::env::var_os("WORKDIR").unwrap_or_else(|| "./workdir".into()));
    let _workdir_lock = lock_workdir(&workdir).with_context(|| {
        format!("Failed to initialize working directory at: {}", workdir.display())
    })?;

    let firmware = firmware_config.load_firmware()?;
    let coverage = CoverageTracker::new(&firmware).with_context(|| {
        format!("failed to analyze {}", firmware_config.firmware_path().display())
    })?;
    let graph = coverage.graph();
    tracing::info!(
        "{} bytes of flash: {} reachable instructions, {} conditional branches",
        firmware.len(),
        graph.instruction_count(),
        graph.branch_count(),
    );

    let listing_path = workdir.join("reachable.txt");
    let mut listing = std::io::BufWriter::new(
        std::fs::File::create(&listing_path)
            .with_context(|| format!("failed to create {}", listing_path.display()))?,
    );
    for (addr, instruction) in graph.instructions() {
        let marker = if graph.branch(addr).is_some() { "*" } else { " " };
        writeln!(listing, "{addr:#06x}:{marker} {instruction}")?;
    }
    listing.flush().with_context(|| format!("failed to write {}", listing_path.display()))?;

    coverage.save_report(&workdir.join("coverage.json"))?;
    tracing::info!("analysis saved to {}", workdir.display());

    Ok(())
}
