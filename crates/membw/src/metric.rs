use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::monitor::MonitorError;

/// Bandwidth in bytes per second keyed by NUMA node id
pub type NodeBandwidth = BTreeMap<u32, f64>;

/// Metrics exported by the memory bandwidth monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    /// Per-node bandwidth derived from counter deltas
    Current,
    /// Static bandwidth ceiling reported by the driver
    Max,
}

impl MetricName {
    pub const ALL: [MetricName; 2] = [MetricName::Current, MetricName::Max];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Current => "numa.membw.current",
            MetricName::Max => "numa.membw.max",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricName {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| MonitorError::UnknownMetric(s.to_string()))
    }
}

/// Value of a single monitor metric
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    PerNode(NodeBandwidth),
    Ceiling(u64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Ceiling(max) => write!(f, "{}", max),
            MetricValue::PerNode(nodes) => {
                f.write_str("{")?;
                for (i, (node, bw)) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "node{}: {:.1}", node, bw)?;
                }
                f.write_str("}")
            }
        }
    }
}

/// One metric reading as handed to the monitoring framework
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: MetricName,
    pub value: MetricValue,
    pub timestamp: DateTime<Utc>,
    /// Label of the compute driver the reading came from
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_parse() {
        assert_eq!(
            "numa.membw.current".parse::<MetricName>().unwrap(),
            MetricName::Current
        );
        assert_eq!(
            "numa.membw.max".parse::<MetricName>().unwrap(),
            MetricName::Max
        );
        assert_eq!(
            "numa.membw.bogus".parse::<MetricName>(),
            Err(MonitorError::UnknownMetric("numa.membw.bogus".to_string()))
        );
    }

    #[test]
    fn test_value_display() {
        let nodes = NodeBandwidth::from([(0, 50.0), (1, 0.0)]);
        assert_eq!(
            MetricValue::PerNode(nodes).to_string(),
            "{node0: 50.0, node1: 0.0}"
        );
        assert_eq!(MetricValue::Ceiling(42).to_string(), "42");
    }
}
