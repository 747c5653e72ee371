use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use smartcache::config::Config as SmartcacheConfig;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable tracing output, written to a no-op sink.
    #[arg(long)]
    tracing: bool,

    /// Send metrics to a local UDP sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run() {
        smartcache::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = SmartcacheConfig::get(cli.config.as_deref())?;

    if !cli.tracing {
        // SAFETY: The runtime is not started yet, so we are still single-threaded.
        unsafe { smartcache::logging::init_logging(&config.logging) };
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    let mut logging_guard = runtime.block_on(async {
        logging::init(logging::Config {
            tracing: cli.tracing,
            metrics: cli.metrics,
        })
    })?;
    if let Some(udp_sink) = logging_guard.udp_sink.take() {
        runtime.spawn(udp_sink);
    } else if let Some(statsd) = &config.metrics.statsd {
        smartcache::metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    runtime.block_on(perform_stresstest(&config.caches, workloads, cli.duration))?;

    Ok(())
}
