use chrono::{DateTime, Duration, Utc};
use log::{debug, error};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::driver::{ComputeDriver, DriverError, NodeCounters};
use crate::metric::{MetricName, MetricSample, MetricValue, NodeBandwidth};

/// Name the bandwidth monitor reports itself under in errors
pub const MONITOR_NAME: &str = "BandwidthMonitor";

/// Errors surfaced to the monitoring framework
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    /// The compute driver could not deliver what the monitor needs.
    /// The current poll is lost; the framework should retry next cycle.
    #[error("resource monitor {monitor} failed: {source}")]
    ResourceMonitor {
        monitor: &'static str,
        #[source]
        source: DriverError,
    },

    /// The requested metric is not served by this monitor
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
}

/// Interface the monitoring framework polls.
pub trait ResourceMonitor {
    /// Label of the compute driver behind this monitor
    fn source(&self) -> &str;

    /// Metrics this monitor can serve
    fn get_metric_names(&self) -> &'static [MetricName];

    /// Current value of `name` and the time it was sampled
    fn get_metric(&mut self, name: &str) -> Result<(MetricValue, DateTime<Utc>), MonitorError>;

    /// Sample every metric this monitor serves
    fn get_metrics(&mut self) -> Result<Vec<MetricSample>, MonitorError> {
        let mut samples = Vec::with_capacity(self.get_metric_names().len());
        for &name in self.get_metric_names() {
            let (value, timestamp) = self.get_metric(name.as_str())?;
            samples.push(MetricSample {
                name,
                value,
                timestamp,
                source: self.source().to_string(),
            });
        }
        Ok(samples)
    }
}

/// Settings read once when a monitor is built
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Compute driver label reported with every sample
    pub source: String,
    /// Polls closer together than this reuse the previous reading
    pub min_interval: Duration,
}

impl MonitorConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            min_interval: Duration::seconds(1),
        }
    }
}

/// Derives per-node memory bandwidth from a driver's cumulative byte counters.
///
/// The monitor starts cold, with no previous counters. The first successful
/// poll records the counters and reports 0.0 for every node. Each later poll
/// outside the throttle window reports `(current - previous) / elapsed` for
/// nodes whose counter advanced. A node whose counter stayed put or went
/// backwards keeps its last reported rate.
///
/// Polls at most `min_interval` apart return the previous reading without
/// touching the driver.
///
/// # Examples
///
/// ```
/// use chrono::{DateTime, Duration, Utc};
/// use membw::{
///     BandwidthMonitor, ComputeDriver, DriverError, ManualClock, MetricValue,
///     MonitorConfig, NodeCounters, ResourceMonitor,
/// };
/// use std::cell::Cell;
/// use std::sync::Arc;
///
/// struct Ramp(Cell<u64>);
///
/// impl ComputeDriver for Ramp {
///     fn get_max_memory_bw(&self) -> Result<u64, DriverError> {
///         Ok(1 << 30)
///     }
///
///     fn get_current_memory_bw(&self) -> Result<NodeCounters, DriverError> {
///         let bytes = self.0.get();
///         self.0.set(bytes + 4000);
///         Ok(NodeCounters::from([(0, bytes)]))
///     }
/// }
///
/// let clock = Arc::new(ManualClock::new(DateTime::<Utc>::UNIX_EPOCH));
/// let mut monitor =
///     BandwidthMonitor::with_clock(Ramp(Cell::new(0)), clock.clone(), MonitorConfig::new("fake"))
///         .unwrap();
///
/// monitor.get_metric("numa.membw.current").unwrap();
/// clock.advance(Duration::seconds(2));
///
/// let (value, _) = monitor.get_metric("numa.membw.current").unwrap();
/// assert_eq!(value, MetricValue::PerNode([(0, 2000.0)].into()));
/// ```
pub struct BandwidthMonitor<D, C = SystemClock> {
    driver: D,
    clock: C,
    source: String,
    min_interval: Duration,
    max_mem_bw: u64,
    prev_count: NodeCounters,
    rates: NodeBandwidth,
    timestamp: Option<DateTime<Utc>>,
}

impl<D: ComputeDriver> BandwidthMonitor<D> {
    /// Creates a monitor sampling with the system clock.
    ///
    /// Reads the driver's bandwidth ceiling once; it is never refreshed.
    pub fn new(driver: D, config: MonitorConfig) -> Result<Self, MonitorError> {
        Self::with_clock(driver, SystemClock, config)
    }
}

impl<D: ComputeDriver, C: Clock> BandwidthMonitor<D, C> {
    pub fn with_clock(driver: D, clock: C, config: MonitorConfig) -> Result<Self, MonitorError> {
        let max_mem_bw = driver
            .get_max_memory_bw()
            .map_err(Self::integration_error)?;

        Ok(Self {
            driver,
            clock,
            source: config.source,
            min_interval: config.min_interval,
            max_mem_bw,
            prev_count: NodeCounters::new(),
            rates: NodeBandwidth::new(),
            timestamp: None,
        })
    }

    /// Bandwidth ceiling captured at construction
    pub fn max_mem_bw(&self) -> u64 {
        self.max_mem_bw
    }

    /// Refreshes the cached rates unless the last poll is too recent.
    /// Returns the timestamp of the reading now held.
    fn update_data(&mut self) -> Result<DateTime<Utc>, MonitorError> {
        let now = self.clock.now();

        let elapsed_secs = match self.timestamp {
            Some(last) => {
                let elapsed = now - last;
                if elapsed <= self.min_interval {
                    debug!(
                        "Skipping driver poll, last sample was {}ms ago",
                        elapsed.num_milliseconds()
                    );
                    return Ok(last);
                }
                Some(elapsed.num_milliseconds() as f64 / 1000.0)
            }
            None => None,
        };

        let counters = self
            .driver
            .get_current_memory_bw()
            .map_err(Self::integration_error)?;

        let mut rates = NodeBandwidth::new();
        for (&node, &current) in &counters {
            let rate = match (elapsed_secs, self.prev_count.get(&node)) {
                (Some(secs), Some(&previous)) if current > previous => {
                    (current - previous) as f64 / secs
                }
                // First sighting of this node, or a counter that did not advance
                _ => self.rates.get(&node).copied().unwrap_or(0.0),
            };
            rates.insert(node, rate);
        }

        self.rates = rates;
        self.prev_count = counters;
        self.timestamp = Some(now);
        Ok(now)
    }

    fn integration_error(source: DriverError) -> MonitorError {
        error!(
            "Not all properties needed are implemented in the compute driver: {}",
            source
        );
        MonitorError::ResourceMonitor {
            monitor: MONITOR_NAME,
            source,
        }
    }
}

impl<D: ComputeDriver, C: Clock> ResourceMonitor for BandwidthMonitor<D, C> {
    fn source(&self) -> &str {
        &self.source
    }

    fn get_metric_names(&self) -> &'static [MetricName] {
        &MetricName::ALL
    }

    fn get_metric(&mut self, name: &str) -> Result<(MetricValue, DateTime<Utc>), MonitorError> {
        let name: MetricName = name.parse()?;
        let timestamp = self.update_data()?;

        let value = match name {
            MetricName::Current => MetricValue::PerNode(self.rates.clone()),
            MetricName::Max => MetricValue::Ceiling(self.max_mem_bw),
        };
        Ok((value, timestamp))
    }
}
