use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::{Desc, Fetched, PmApi, PmId};
use crate::atom::{Atom, RawValue, ValueType};
use crate::error::{PmError, PM_ERR_NAME, PM_ERR_PMID, PM_ERR_VALUE};

/// In-memory stand-in for a daemon connection.
///
/// Metrics are registered by name with a type tag and a list of raw
/// per-instance values. Clones share state, so a test can keep one handle to
/// change values or inject failures while a client owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    names: BTreeMap<String, PmId>,
    metrics: BTreeMap<PmId, MemoryMetric>,
    lookup_error: Option<i32>,
    fetches: usize,
}

#[derive(Debug, Clone)]
struct MemoryMetric {
    desc: Option<Desc>,
    values: Vec<(i32, RawValue)>,
    fetch_error: Option<i32>,
}

/// Snapshot of one metric's values taken by [`MemoryContext::fetch`]
#[derive(Debug, Clone)]
pub struct MemoryFetch {
    values: Vec<(i32, RawValue)>,
}

impl Fetched for MemoryFetch {
    fn num_values(&self) -> usize {
        self.values.len()
    }
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers or replaces a metric with raw values under a raw type tag
    pub fn set_raw(&self, name: &str, type_code: i32, values: Vec<(i32, RawValue)>) {
        let mut state = self.state();
        let next = state.names.len() as PmId + 1;
        let pmid = *state.names.entry(name.to_string()).or_insert(next);
        state.metrics.insert(
            pmid,
            MemoryMetric {
                desc: Some(Desc {
                    pmid,
                    type_code,
                    indom: 0,
                    sem: 0,
                }),
                values,
                fetch_error: None,
            },
        );
    }

    /// Registers or replaces a metric whose values all have type `value_type`
    pub fn set_atoms(&self, name: &str, value_type: ValueType, values: &[(i32, Atom)]) {
        let raw = values.iter().map(|(inst, atom)| (*inst, atom.to_raw())).collect();
        self.set_raw(name, value_type.code(), raw);
    }

    /// Makes the descriptor lookup for `name` come back empty
    pub fn hide_descriptor(&self, name: &str) {
        self.update_metric(name, |metric| metric.desc = None);
    }

    /// Makes every name lookup fail with `code`
    pub fn fail_lookups(&self, code: Option<i32>) {
        self.state().lookup_error = code;
    }

    /// Makes fetches of `name` fail with `code`
    pub fn fail_fetch(&self, name: &str, code: Option<i32>) {
        self.update_metric(name, |metric| metric.fetch_error = code);
    }

    /// Number of successful fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    fn update_metric(&self, name: &str, f: impl FnOnce(&mut MemoryMetric)) {
        let mut state = self.state();
        if let Some(pmid) = state.names.get(name).copied() {
            if let Some(metric) = state.metrics.get_mut(&pmid) {
                f(metric);
            }
        }
    }
}

impl PmApi for MemoryContext {
    type Fetched = MemoryFetch;

    fn lookup_name(&self, name: &str) -> Result<PmId, PmError> {
        let state = self.state();
        if let Some(code) = state.lookup_error {
            return Err(PmError::new(code));
        }
        state
            .names
            .get(name)
            .copied()
            .ok_or_else(|| PmError::new(PM_ERR_NAME))
    }

    fn lookup_descs(&self, pmids: &[PmId]) -> Result<Vec<Desc>, PmError> {
        let state = self.state();
        let mut descs = Vec::with_capacity(pmids.len());
        for pmid in pmids {
            let metric = state
                .metrics
                .get(pmid)
                .ok_or_else(|| PmError::new(PM_ERR_PMID))?;
            descs.extend(metric.desc);
        }
        Ok(descs)
    }

    fn fetch(&self, pmids: &[PmId]) -> Result<Self::Fetched, PmError> {
        let mut state = self.state();
        let pmid = pmids.first().ok_or_else(|| PmError::new(PM_ERR_PMID))?;
        let metric = state
            .metrics
            .get(pmid)
            .ok_or_else(|| PmError::new(PM_ERR_PMID))?;
        if let Some(code) = metric.fetch_error {
            return Err(PmError::new(code));
        }
        let values = metric.values.clone();
        state.fetches += 1;
        Ok(MemoryFetch { values })
    }

    fn extract_value(
        &self,
        fetched: &Self::Fetched,
        index: usize,
        type_code: i32,
    ) -> Result<(i32, Atom), PmError> {
        let (inst, raw) = fetched
            .values
            .get(index)
            .ok_or_else(|| PmError::new(PM_ERR_VALUE))?;
        let atom = ValueType::try_from(type_code)?.decode(raw)?;
        Ok((*inst, atom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_fetch() {
        let context = MemoryContext::new();
        context.set_atoms("mem.util.used", ValueType::U64, &[(0, Atom::U64(7))]);

        let pmid = context.lookup_name("mem.util.used").unwrap();
        let descs = context.lookup_descs(&[pmid]).unwrap();
        assert_eq!(descs[0].type_code, ValueType::U64.code());

        let fetched = context.fetch(&[pmid]).unwrap();
        assert_eq!(fetched.num_values(), 1);
        assert_eq!(
            context.extract_value(&fetched, 0, descs[0].type_code),
            Ok((0, Atom::U64(7)))
        );
        assert_eq!(context.fetch_count(), 1);
    }

    #[test]
    fn test_unknown_name() {
        let context = MemoryContext::new();
        assert!(context.lookup_name("nope").unwrap_err().is_name_error());
    }

    #[test]
    fn test_clones_share_state() {
        let context = MemoryContext::new();
        let handle = context.clone();
        handle.set_atoms("a", ValueType::I32, &[(1, Atom::I32(1))]);
        assert!(context.lookup_name("a").is_ok());

        handle.fail_fetch("a", Some(PM_ERR_VALUE));
        let pmid = context.lookup_name("a").unwrap();
        assert_eq!(context.fetch(&[pmid]).unwrap_err().code(), PM_ERR_VALUE);
    }
}
