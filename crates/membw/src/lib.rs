//! # membw
//!
//! Per-NUMA-node memory bandwidth derived from cumulative hardware counters.
//!
//! A [`ComputeDriver`] exposes a static bandwidth ceiling and a set of
//! monotonically increasing byte counters, one per NUMA node. The
//! [`BandwidthMonitor`] polls those counters, at most once per second, and
//! turns successive readings into a rate in bytes per second. Monitoring
//! frameworks consume it through the [`ResourceMonitor`] trait.

pub mod clock;
pub mod driver;
pub mod metric;
pub mod monitor;

pub use clock::*;
pub use driver::*;
pub use metric::*;
pub use monitor::*;
