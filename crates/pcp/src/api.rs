use crate::atom::Atom;
use crate::error::PmError;

/// Daemon-internal metric identifier
pub type PmId = u32;

/// Instance id used by metrics without an instance domain
pub const PM_IN_NULL: i32 = -1;

/// Metric descriptor as returned by a descriptor lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desc {
    pub pmid: PmId,
    /// Raw type tag; see [`ValueType`](crate::ValueType) for the numeric ones
    pub type_code: i32,
    pub indom: u32,
    pub sem: i32,
}

/// Values returned by one fetch
pub trait Fetched {
    /// Number of instances reported for the first metric of the fetch
    fn num_values(&self) -> usize;
}

/// The four calls of the metrics daemon protocol.
///
/// Each call may fail on its own. Implementations are not required to be
/// thread-safe; [`MetricsClient`](crate::MetricsClient) serializes access.
pub trait PmApi {
    type Fetched: Fetched;

    /// Resolves a metric name to its identifier
    fn lookup_name(&self, name: &str) -> Result<PmId, PmError>;

    /// Looks up the descriptor of every identifier in `pmids`
    fn lookup_descs(&self, pmids: &[PmId]) -> Result<Vec<Desc>, PmError>;

    /// Fetches current values for `pmids`
    fn fetch(&self, pmids: &[PmId]) -> Result<Self::Fetched, PmError>;

    /// Decodes the value at `index` of the first metric in `fetched` as
    /// `type_code`, returning it with its instance id
    fn extract_value(
        &self,
        fetched: &Self::Fetched,
        index: usize,
        type_code: i32,
    ) -> Result<(i32, Atom), PmError>;
}
