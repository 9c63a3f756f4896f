use std::sync::Arc;

use membw::{ComputeDriver, DriverError, NodeCounters};
use pcp::{Atom, InstanceValues, LibPcp, MetricsClientCell, PmApi};

/// Where the driver takes its bandwidth ceiling from
#[derive(Debug, Clone, PartialEq)]
pub enum MaxBandwidth {
    /// Configured ceiling in bytes per second
    Fixed(u64),
    /// Metric whose instances are summed into the ceiling
    Metric(String),
}

/// Compute driver that reads memory bandwidth counters from PCP.
///
/// Every instance of the counter metric is treated as a NUMA node; its value
/// must be a non-negative integer byte count.
pub struct PcpComputeDriver<A: PmApi = LibPcp> {
    metrics: Arc<MetricsClientCell<A>>,
    counter_metric: String,
    max_bw: MaxBandwidth,
}

impl<A: PmApi> PcpComputeDriver<A> {
    pub fn new(
        metrics: Arc<MetricsClientCell<A>>,
        counter_metric: impl Into<String>,
        max_bw: MaxBandwidth,
    ) -> Self {
        Self {
            metrics,
            counter_metric: counter_metric.into(),
            max_bw,
        }
    }

    fn read(&self, metric: &str) -> Result<InstanceValues, DriverError> {
        let client = self
            .metrics
            .get_instance()
            .map_err(|e| DriverError::Unavailable(e.to_string()))?;
        client
            .get_metric_value(metric)
            .ok_or_else(|| DriverError::Unavailable(format!("no data for metric {}", metric)))
    }
}

fn counter(metric: &str, inst: i32, atom: &Atom) -> Result<u64, DriverError> {
    atom.as_u64().ok_or_else(|| DriverError::InvalidType {
        key: format!("{}[{}]", metric, inst),
        expected: "non-negative integer",
        found: format!("{:?}", atom),
    })
}

impl<A: PmApi> ComputeDriver for PcpComputeDriver<A> {
    fn get_max_memory_bw(&self) -> Result<u64, DriverError> {
        match &self.max_bw {
            MaxBandwidth::Fixed(max) => Ok(*max),
            MaxBandwidth::Metric(metric) => {
                let values = self.read(metric)?;
                if values.is_empty() {
                    return Err(DriverError::MissingKey(metric.clone()));
                }
                values
                    .iter()
                    .try_fold(0u64, |total, (&inst, atom)| -> Result<u64, DriverError> {
                        Ok(total.saturating_add(counter(metric, inst, atom)?))
                    })
            }
        }
    }

    fn get_current_memory_bw(&self) -> Result<NodeCounters, DriverError> {
        let metric = &self.counter_metric;
        self.read(metric)?
            .iter()
            .map(|(&inst, atom)| -> Result<(u32, u64), DriverError> {
                let node = u32::try_from(inst).map_err(|_| DriverError::InvalidType {
                    key: metric.clone(),
                    expected: "NUMA node instance",
                    found: format!("instance {}", inst),
                })?;
                Ok((node, counter(metric, inst, atom)?))
            })
            .collect()
    }
}
