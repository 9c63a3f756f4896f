use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error};

use crate::api::{Desc, Fetched, PmApi};
use crate::atom::Atom;
use crate::error::{InitError, PmError};
use crate::libpcp::{LibPcp, DEFAULT_LIBRARY};

/// Decoded values keyed by instance id
pub type InstanceValues = BTreeMap<i32, Atom>;

/// Reads metric values through one daemon connection.
///
/// Protocol errors never reach the caller: they are logged and the metric
/// is reported as absent for this call.
pub struct MetricsClient<A: PmApi = LibPcp> {
    api: Mutex<A>,
}

impl<A: PmApi> MetricsClient<A> {
    pub fn new(api: A) -> Self {
        Self {
            api: Mutex::new(api),
        }
    }

    /// Current values of `metric_name` in every instance domain.
    ///
    /// Returns `None` when the daemon does not know the metric, when any
    /// protocol call fails, or when any single value cannot be decoded.
    /// A partially decoded mapping is never returned.
    pub fn get_metric_value(&self, metric_name: &str) -> Option<InstanceValues> {
        let api = self.api.lock().unwrap_or_else(PoisonError::into_inner);

        let (descs, fetched) = match Self::lookup(&*api, metric_name) {
            Ok(found) => found,
            Err(e) if e.is_name_error() => {
                error!("The metric {} is not available: {}", metric_name, e);
                return None;
            }
            Err(e) => {
                error!("Failed to fetch metric {}: {}", metric_name, e);
                return None;
            }
        };

        let mut values = InstanceValues::new();
        let Some(desc) = descs.first() else {
            debug!("No descriptor returned for metric {}", metric_name);
            return Some(values);
        };

        for index in 0..fetched.num_values() {
            match api.extract_value(&fetched, index, desc.type_code) {
                Ok((inst, atom)) => {
                    values.insert(inst, atom);
                }
                Err(e) => {
                    error!(
                        "There was an error in retrieving the metric {} due to {}",
                        metric_name, e
                    );
                    return None;
                }
            }
        }
        Some(values)
    }

    fn lookup(api: &A, metric_name: &str) -> Result<(Vec<Desc>, A::Fetched), PmError> {
        let pmid = api.lookup_name(metric_name)?;
        let descs = api.lookup_descs(&[pmid])?;
        let fetched = api.fetch(&[pmid])?;
        Ok((descs, fetched))
    }
}

type Connector<A> = Box<dyn Fn() -> Result<A, InitError> + Send + Sync>;

/// One-time initialization guard for a shared [`MetricsClient`].
///
/// The first successful [`get_instance`](Self::get_instance) connects and
/// caches the client; every later call hands out the same `Arc`. A failed
/// connection caches nothing, so the next call tries again. Construction
/// runs under a mutex, so concurrent first calls connect once.
pub struct MetricsClientCell<A: PmApi = LibPcp> {
    connector: Connector<A>,
    instance: Mutex<Option<Arc<MetricsClient<A>>>>,
}

impl<A: PmApi> MetricsClientCell<A> {
    pub fn new<F>(connector: F) -> Self
    where
        F: Fn() -> Result<A, InitError> + Send + Sync + 'static,
    {
        Self {
            connector: Box::new(connector),
            instance: Mutex::new(None),
        }
    }

    /// Shared client, connecting on first use
    pub fn get_instance(&self) -> Result<Arc<MetricsClient<A>>, InitError> {
        let mut instance = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = instance.as_ref() {
            return Ok(Arc::clone(client));
        }

        let api = (self.connector)().map_err(|e| {
            error!("Failed to initialize metrics client: {}", e);
            e
        })?;
        let client = Arc::new(MetricsClient::new(api));
        *instance = Some(Arc::clone(&client));
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl MetricsClientCell<LibPcp> {
    /// Cell connecting to the local pmcd through `library`
    pub fn local(library: impl Into<PathBuf>) -> Self {
        let library = library.into();
        Self::new(move || LibPcp::connect(&library, "local:"))
    }
}

impl Default for MetricsClientCell<LibPcp> {
    fn default() -> Self {
        Self::local(DEFAULT_LIBRARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{RawValue, ValueType};
    use crate::error::{PM_ERR_IPC, PM_ERR_NAME};
    use crate::memory_context::MemoryContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const COUNTER: &str = "perfevent.hwcounters.numa_membw.value";

    fn numa_context() -> MemoryContext {
        let context = MemoryContext::new();
        context.set_atoms(
            COUNTER,
            ValueType::U64,
            &[(0, Atom::U64(1000)), (1, Atom::U64(u64::MAX))],
        );
        context
    }

    #[test]
    fn test_values_per_instance() {
        let client = MetricsClient::new(numa_context());
        let values = client.get_metric_value(COUNTER).unwrap();
        assert_eq!(
            values,
            InstanceValues::from([(0, Atom::U64(1000)), (1, Atom::U64(u64::MAX))])
        );
    }

    #[test]
    fn test_unknown_metric_is_absent() {
        testing_logger::setup();

        let client = MetricsClient::new(numa_context());
        assert_eq!(client.get_metric_value("no.such.metric"), None);

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Error);
            assert_eq!(
                captured_logs[0].body,
                format!(
                    "The metric no.such.metric is not available: {}",
                    PmError::new(PM_ERR_NAME)
                )
            );
        });
    }

    #[test]
    fn test_other_protocol_errors_are_absent() {
        testing_logger::setup();

        let context = numa_context();
        context.fail_fetch(COUNTER, Some(PM_ERR_IPC));
        let client = MetricsClient::new(context);
        assert_eq!(client.get_metric_value(COUNTER), None);

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert_eq!(captured_logs[0].level, log::Level::Error);
            assert!(captured_logs[0]
                .body
                .starts_with(&format!("Failed to fetch metric {}", COUNTER)));
        });
    }

    #[test]
    fn test_lookup_failure_is_absent() {
        let context = numa_context();
        context.fail_lookups(Some(PM_ERR_IPC));
        let client = MetricsClient::new(context);
        assert_eq!(client.get_metric_value(COUNTER), None);
    }

    #[test]
    fn test_extract_failure_drops_partial_result() {
        testing_logger::setup();

        let context = MemoryContext::new();
        context.set_raw(
            COUNTER,
            ValueType::U64.code(),
            vec![
                (0, Atom::U64(5).to_raw()),
                // Truncated block
                (1, RawValue::Block(vec![0; 3])),
            ],
        );
        let client = MetricsClient::new(context);
        assert_eq!(client.get_metric_value(COUNTER), None);

        testing_logger::validate(|captured_logs| {
            assert_eq!(captured_logs.len(), 1);
            assert!(captured_logs[0]
                .body
                .contains("There was an error in retrieving the metric"));
        });
    }

    #[test]
    fn test_non_numeric_type_is_absent() {
        let context = MemoryContext::new();
        // String typed metric
        context.set_raw(
            "kernel.uname.release",
            6,
            vec![(-1, RawValue::Block(b"6.8\0".to_vec()))],
        );
        let client = MetricsClient::new(context);
        assert_eq!(client.get_metric_value("kernel.uname.release"), None);
    }

    #[test]
    fn test_missing_descriptor_yields_empty_mapping() {
        let context = numa_context();
        context.hide_descriptor(COUNTER);
        let client = MetricsClient::new(context);
        assert_eq!(client.get_metric_value(COUNTER), Some(InstanceValues::new()));
    }

    #[test]
    fn test_no_local_caching() {
        let context = numa_context();
        let client = MetricsClient::new(context.clone());

        client.get_metric_value(COUNTER).unwrap();
        context.set_atoms(COUNTER, ValueType::U64, &[(0, Atom::U64(2000))]);
        let values = client.get_metric_value(COUNTER).unwrap();

        assert_eq!(values, InstanceValues::from([(0, Atom::U64(2000))]));
        assert_eq!(context.fetch_count(), 2);
    }

    #[test]
    fn test_cell_returns_same_instance() {
        let cell = MetricsClientCell::new(|| Ok(numa_context()));
        assert!(!cell.is_connected());

        let first = cell.get_instance().unwrap();
        let second = cell.get_instance().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cell.is_connected());
    }

    #[test]
    fn test_cell_retries_after_failed_connect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cell = MetricsClientCell::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(InitError::Context {
                    target: "local:".to_string(),
                    source: PmError::new(-libc::ECONNREFUSED),
                })
            } else {
                Ok(numa_context())
            }
        });

        assert!(matches!(
            cell.get_instance(),
            Err(InitError::Context { .. })
        ));
        assert!(!cell.is_connected());

        let client = cell.get_instance().unwrap();
        assert!(client.get_metric_value(COUNTER).is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_first_use_connects_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let cell = Arc::new(MetricsClientCell::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(std::time::Duration::from_millis(20));
            Ok(numa_context())
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || cell.get_instance().unwrap())
            })
            .collect();
        let clients: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_local_cell_without_library() {
        let cell = MetricsClientCell::local("libpcp-does-not-exist.so.0");
        assert!(matches!(
            cell.get_instance(),
            Err(InitError::LibraryLoad { .. })
        ));
        assert!(!cell.is_connected());
    }
}
