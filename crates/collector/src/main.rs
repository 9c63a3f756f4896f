use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use membw::{BandwidthMonitor, MonitorConfig};
use pcp::{MetricsClientCell, DEFAULT_LIBRARY};
use tokio_util::sync::CancellationToken;

mod pcp_driver;
mod poll_task;

use pcp_driver::{MaxBandwidth, PcpComputeDriver};
use poll_task::{poll_monitor, supervise};

const DEFAULT_COUNTER_METRIC: &str = "perfevent.hwcounters.numa_membw.value";
const DEFAULT_MAX_METRIC: &str = "hinv.membw.max";

/// NUMA memory bandwidth monitor backed by Performance Co-Pilot
#[derive(Debug, Parser)]
struct Command {
    /// Verbose debug output
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between polls
    #[arg(short, long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Run duration in seconds (0 = unlimited)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// PCP metric holding the cumulative byte counter of each NUMA node
    #[arg(long, default_value = DEFAULT_COUNTER_METRIC)]
    counter_metric: String,

    /// Bandwidth ceiling in bytes per second (0 = read it from --max-metric)
    #[arg(long, default_value = "0")]
    max_bw: u64,

    /// PCP metric holding the bandwidth ceiling, summed over its instances
    #[arg(long, default_value = DEFAULT_MAX_METRIC)]
    max_metric: String,

    /// Path or soname of the PCP client library
    #[arg(long, default_value = DEFAULT_LIBRARY)]
    pcp_library: PathBuf,

    /// Compute driver label reported with every sample
    #[arg(long, default_value = "pcp")]
    source: String,
}

impl Command {
    fn max_bandwidth(&self) -> MaxBandwidth {
        if self.max_bw > 0 {
            MaxBandwidth::Fixed(self.max_bw)
        } else {
            MaxBandwidth::Metric(self.max_metric.clone())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Command::parse();

    let default_level = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // One daemon connection shared by everything in this process
    let metrics = Arc::new(MetricsClientCell::local(opts.pcp_library.clone()));
    let driver = PcpComputeDriver::new(metrics, opts.counter_metric.clone(), opts.max_bandwidth());
    let monitor = BandwidthMonitor::new(driver, MonitorConfig::new(opts.source.clone()))
        .context("Failed to create memory bandwidth monitor")?;

    info!(
        "Monitoring {} every {}s, ceiling {} B/s",
        opts.counter_metric,
        opts.interval,
        monitor.max_mem_bw()
    );

    let shutdown = CancellationToken::new();
    let poller = tokio::spawn(poll_monitor(
        monitor,
        Duration::from_secs(opts.interval),
        shutdown.clone(),
    ));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    if opts.duration > 0 {
        let timer_token = shutdown.clone();
        let duration = Duration::from_secs(opts.duration);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => timer_token.cancel(),
                _ = timer_token.cancelled() => {}
            }
        });
    }

    match supervise(poller, shutdown, "memory bandwidth poller").await {
        Some(summary) => {
            info!(
                "Completed {} polls, {} skipped after driver errors",
                summary.polls, summary.failed_polls
            );
            Ok(())
        }
        None => Err(anyhow::anyhow!("memory bandwidth poller did not finish cleanly")),
    }
}
