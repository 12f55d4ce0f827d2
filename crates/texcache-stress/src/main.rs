use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use texcache::config::Config;
use texcache::logging::ensure_log_error;

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
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable sentry, reporting into a local sink.
    #[arg(long)]
    sentry: bool,

    /// Enable JSON logging into the void.
    #[arg(long)]
    tracing: bool,

    /// Enable statsd metrics, reporting into a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run() {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = WorkloadsConfig::from_path(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref())?;

    let logging_config = logging::Config {
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: no other threads are running yet.
    let guard = unsafe { logging::init(logging_config, &config)? };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async move {
        let mut guard = guard;
        for sink in guard.sinks.drain(..) {
            tokio::spawn(sink);
        }

        perform_stresstest(config.cache, workloads, cli.duration).await
    })
}
