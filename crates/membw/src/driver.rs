use std::collections::BTreeMap;

use thiserror::Error;

/// Cumulative byte counters keyed by NUMA node id
pub type NodeCounters = BTreeMap<u32, u64>;

/// Errors a compute driver can report while serving memory bandwidth data
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// The driver does not support the requested capability
    #[error("{0} is not implemented by this compute driver")]
    NotImplemented(&'static str),

    /// A value the driver relies on was missing from its data source
    #[error("missing key: {0}")]
    MissingKey(String),

    /// A value had a type that cannot be used as a counter
    #[error("invalid value for {key}: expected {expected}, found {found}")]
    InvalidType {
        key: String,
        expected: &'static str,
        found: String,
    },

    /// The driver's data source had nothing to report
    #[error("data source unavailable: {0}")]
    Unavailable(String),
}

/// Memory bandwidth capabilities of a compute driver.
///
/// Both methods default to [`DriverError::NotImplemented`], so drivers that
/// know nothing about memory bandwidth only need an empty `impl`.
pub trait ComputeDriver {
    /// Theoretical memory bandwidth ceiling in bytes per second
    fn get_max_memory_bw(&self) -> Result<u64, DriverError> {
        Err(DriverError::NotImplemented("get_max_memory_bw"))
    }

    /// Current cumulative byte counter for every NUMA node
    fn get_current_memory_bw(&self) -> Result<NodeCounters, DriverError> {
        Err(DriverError::NotImplemented("get_current_memory_bw"))
    }
}

impl<D: ComputeDriver + ?Sized> ComputeDriver for Box<D> {
    fn get_max_memory_bw(&self) -> Result<u64, DriverError> {
        (**self).get_max_memory_bw()
    }

    fn get_current_memory_bw(&self) -> Result<NodeCounters, DriverError> {
        (**self).get_current_memory_bw()
    }
}

impl<D: ComputeDriver + ?Sized> ComputeDriver for std::sync::Arc<D> {
    fn get_max_memory_bw(&self) -> Result<u64, DriverError> {
        (**self).get_max_memory_bw()
    }

    fn get_current_memory_bw(&self) -> Result<NodeCounters, DriverError> {
        (**self).get_current_memory_bw()
    }
}
