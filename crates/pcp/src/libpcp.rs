//! Binding to the system's PCP client library, resolved at runtime.
//!
//! Loading through `libloading` keeps hosts without PCP installed able to run;
//! they only fail when a connection is actually requested.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::path::Path;
use std::ptr::{self, NonNull};

use libloading::Library;

use crate::api::{Desc, Fetched, PmApi, PmId};
use crate::atom::{Atom, ValueType};
use crate::error::{
    InitError, PmError, PM_ERR_GENERIC, PM_ERR_NAME, PM_ERR_PMID, PM_ERR_VALUE,
};

/// Default soname of the PCP client library
pub const DEFAULT_LIBRARY: &str = "libpcp.so.3";

/// Connect to a pmcd on a host
pub const PM_CONTEXT_HOST: c_int = 1;

const PM_MAXERRMSGLEN: usize = 128;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct RawDesc {
    pmid: c_uint,
    type_: c_int,
    indom: c_uint,
    sem: c_int,
    units: c_uint,
}

#[repr(C)]
#[allow(dead_code)]
union RawValueUnion {
    pval: *mut c_void,
    lval: c_int,
}

#[repr(C)]
#[allow(dead_code)]
struct RawPmValue {
    inst: c_int,
    value: RawValueUnion,
}

#[repr(C)]
#[allow(dead_code)]
struct RawValueSet {
    pmid: c_uint,
    numval: c_int,
    valfmt: c_int,
    vlist: [RawPmValue; 1],
}

#[repr(C)]
#[allow(dead_code)]
struct RawResult {
    timestamp: libc::timeval,
    numpmid: c_int,
    vset: [*mut RawValueSet; 1],
}

#[repr(C)]
#[allow(dead_code)]
union RawAtom {
    l: i32,
    ul: u32,
    ll: i64,
    ull: u64,
    f: f32,
    d: f64,
    cp: *mut c_char,
    vbp: *mut c_void,
}

type NewContextFn = unsafe extern "C" fn(c_int, *const c_char) -> c_int;
type UseContextFn = unsafe extern "C" fn(c_int) -> c_int;
type LookupNameFn = unsafe extern "C" fn(c_int, *const *const c_char, *mut c_uint) -> c_int;
type LookupDescFn = unsafe extern "C" fn(c_uint, *mut RawDesc) -> c_int;
type FetchFn = unsafe extern "C" fn(c_int, *mut c_uint, *mut *mut RawResult) -> c_int;
type ExtractValueFn =
    unsafe extern "C" fn(c_int, *const RawPmValue, c_int, *mut RawAtom, c_int) -> c_int;
type FreeResultFn = unsafe extern "C" fn(*mut RawResult);
type ErrStrFn = unsafe extern "C" fn(c_int, *mut c_char, c_int) -> *mut c_char;

#[derive(Clone, Copy)]
struct Symbols {
    new_context: NewContextFn,
    use_context: UseContextFn,
    lookup_name: LookupNameFn,
    lookup_desc: LookupDescFn,
    fetch: FetchFn,
    extract_value: ExtractValueFn,
    free_result: FreeResultFn,
    err_str: ErrStrFn,
}

/// Copies a function pointer out of the library.
///
/// # Safety
///
/// `T` must match the C signature of `symbol`.
unsafe fn symbol<T: Copy>(library: &Library, symbol: &'static str) -> Result<T, InitError> {
    let name = format!("{}\0", symbol);
    library
        .get::<T>(name.as_bytes())
        .map(|sym| *sym)
        .map_err(|source| InitError::MissingSymbol { symbol, source })
}

impl Symbols {
    fn load(library: &Library) -> Result<Self, InitError> {
        // SAFETY: the signatures below follow pmapi.h
        unsafe {
            Ok(Self {
                new_context: symbol(library, "pmNewContext")?,
                use_context: symbol(library, "pmUseContext")?,
                lookup_name: symbol(library, "pmLookupName")?,
                lookup_desc: symbol(library, "pmLookupDesc")?,
                fetch: symbol(library, "pmFetch")?,
                extract_value: symbol(library, "pmExtractValue")?,
                free_result: symbol(library, "pmFreeResult")?,
                err_str: symbol(library, "pmErrStr_r")?,
            })
        }
    }
}

/// A live PCP context backed by `libpcp`.
///
/// The context is never destroyed; it lives as long as the process.
pub struct LibPcp {
    // Function pointers in `symbols` are only valid while this is loaded
    _library: Library,
    symbols: Symbols,
    context: c_int,
}

impl LibPcp {
    /// Loads `library` and opens a host context on `target`, e.g. `"local:"`
    pub fn connect(library: &Path, target: &str) -> Result<Self, InitError> {
        // SAFETY: loading libpcp runs no initializers with preconditions
        let lib = unsafe { Library::new(library) }.map_err(|source| InitError::LibraryLoad {
            path: library.to_path_buf(),
            source,
        })?;
        let symbols = Symbols::load(&lib)?;

        let context_error = |source: PmError| InitError::Context {
            target: target.to_string(),
            source,
        };
        let c_target = CString::new(target).map_err(|_| {
            context_error(PmError::with_message(PM_ERR_GENERIC, "target contains a NUL byte"))
        })?;

        // SAFETY: c_target is a valid NUL-terminated string for the call
        let context = unsafe { (symbols.new_context)(PM_CONTEXT_HOST, c_target.as_ptr()) };
        if context < 0 {
            return Err(context_error(error_from(&symbols, context)));
        }

        Ok(Self {
            _library: lib,
            symbols,
            context,
        })
    }

    fn error(&self, code: c_int) -> PmError {
        error_from(&self.symbols, code)
    }

    fn use_context(&self) -> Result<(), PmError> {
        // SAFETY: plain integer argument
        let rc = unsafe { (self.symbols.use_context)(self.context) };
        if rc < 0 {
            return Err(self.error(rc));
        }
        Ok(())
    }
}

fn error_from(symbols: &Symbols, code: c_int) -> PmError {
    let mut buf = [0 as c_char; PM_MAXERRMSGLEN];
    // SAFETY: buf is writable for its full length and pmErrStr_r NUL-terminates
    let text = unsafe {
        let ptr = (symbols.err_str)(code, buf.as_mut_ptr(), buf.len() as c_int);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    };
    match text {
        Some(message) => PmError::with_message(code, message),
        None => PmError::new(code),
    }
}

/// Result of a `pmFetch`, freed on drop
pub struct LibPcpFetch {
    result: NonNull<RawResult>,
    free: FreeResultFn,
}

impl LibPcpFetch {
    /// First value set of the result
    fn value_set(&self) -> Option<*const RawValueSet> {
        // SAFETY: result came from a successful pmFetch and is alive until drop
        unsafe {
            let result = self.result.as_ptr();
            if (*result).numpmid < 1 {
                return None;
            }
            let vset = *ptr::addr_of!((*result).vset).cast::<*mut RawValueSet>();
            (!vset.is_null()).then_some(vset as *const RawValueSet)
        }
    }

    fn numval(&self) -> Option<c_int> {
        // SAFETY: value_set only yields non-null pointers into the live result
        self.value_set().map(|vset| unsafe { (*vset).numval })
    }

    fn valfmt(&self) -> Option<c_int> {
        // SAFETY: as above
        self.value_set().map(|vset| unsafe { (*vset).valfmt })
    }

    fn value(&self, index: usize) -> Option<*const RawPmValue> {
        let vset = self.value_set()?;
        if index >= self.num_values() {
            return None;
        }
        // SAFETY: vlist holds numval entries allocated past the struct
        unsafe { Some(ptr::addr_of!((*vset).vlist).cast::<RawPmValue>().add(index)) }
    }
}

impl Fetched for LibPcpFetch {
    fn num_values(&self) -> usize {
        self.numval()
            .and_then(|numval| usize::try_from(numval).ok())
            .unwrap_or(0)
    }
}

impl Drop for LibPcpFetch {
    fn drop(&mut self) {
        // SAFETY: the pointer came from pmFetch and is freed exactly once
        unsafe { (self.free)(self.result.as_ptr()) }
    }
}

impl PmApi for LibPcp {
    type Fetched = LibPcpFetch;

    fn lookup_name(&self, name: &str) -> Result<PmId, PmError> {
        self.use_context()?;
        let c_name = CString::new(name).map_err(|_| PmError::new(PM_ERR_NAME))?;
        let names = [c_name.as_ptr()];
        let mut pmid: c_uint = 0;
        // SAFETY: one name in, one identifier out
        let rc = unsafe { (self.symbols.lookup_name)(1, names.as_ptr(), &mut pmid) };
        if rc < 0 {
            return Err(self.error(rc));
        }
        Ok(pmid)
    }

    fn lookup_descs(&self, pmids: &[PmId]) -> Result<Vec<Desc>, PmError> {
        self.use_context()?;
        let mut descs = Vec::with_capacity(pmids.len());
        for &pmid in pmids {
            let mut raw = RawDesc::default();
            // SAFETY: raw is a valid out-pointer for one descriptor
            let rc = unsafe { (self.symbols.lookup_desc)(pmid, &mut raw) };
            if rc < 0 {
                return Err(self.error(rc));
            }
            descs.push(Desc {
                pmid: raw.pmid,
                type_code: raw.type_,
                indom: raw.indom,
                sem: raw.sem,
            });
        }
        Ok(descs)
    }

    fn fetch(&self, pmids: &[PmId]) -> Result<Self::Fetched, PmError> {
        self.use_context()?;
        if pmids.is_empty() {
            return Err(PmError::new(PM_ERR_PMID));
        }
        let mut ids: Vec<c_uint> = pmids.to_vec();
        let mut result: *mut RawResult = ptr::null_mut();
        // SAFETY: ids is valid for its length; result receives an owned pointer
        let rc = unsafe { (self.symbols.fetch)(ids.len() as c_int, ids.as_mut_ptr(), &mut result) };
        if rc < 0 {
            return Err(self.error(rc));
        }
        let result = NonNull::new(result).ok_or_else(|| PmError::new(PM_ERR_VALUE))?;
        let fetched = LibPcpFetch {
            result,
            free: self.symbols.free_result,
        };

        // A negative count carries the per-metric error
        if let Some(numval) = fetched.numval() {
            if numval < 0 {
                return Err(self.error(numval));
            }
        }
        Ok(fetched)
    }

    fn extract_value(
        &self,
        fetched: &Self::Fetched,
        index: usize,
        type_code: i32,
    ) -> Result<(i32, Atom), PmError> {
        let value_type = ValueType::try_from(type_code)?;
        let valfmt = fetched.valfmt().ok_or_else(|| PmError::new(PM_ERR_VALUE))?;
        let value = fetched
            .value(index)
            .ok_or_else(|| PmError::new(PM_ERR_VALUE))?;

        let mut atom = RawAtom { ull: 0 };
        // SAFETY: value points into the live fetch result; atom is writable
        let rc = unsafe {
            (self.symbols.extract_value)(valfmt, value, type_code, &mut atom, type_code)
        };
        if rc < 0 {
            return Err(self.error(rc));
        }

        // SAFETY: pmExtractValue wrote the member selected by type_code
        let decoded = unsafe {
            match value_type {
                ValueType::I32 => Atom::I32(atom.l),
                ValueType::U32 => Atom::U32(atom.ul),
                ValueType::I64 => Atom::I64(atom.ll),
                ValueType::U64 => Atom::U64(atom.ull),
                ValueType::Float => Atom::Float(atom.f),
                ValueType::Double => Atom::Double(atom.d),
            }
        };
        // SAFETY: value points into the live fetch result
        let inst = unsafe { (*value).inst };
        Ok((inst, decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library_is_load_error() {
        let result = LibPcp::connect(Path::new("libpcp-does-not-exist.so.0"), "local:");
        assert!(matches!(result, Err(InitError::LibraryLoad { .. })));
    }

    #[test]
    fn test_value_layout_matches_pmapi() {
        assert_eq!(std::mem::size_of::<RawAtom>(), 8);
        assert_eq!(std::mem::size_of::<RawDesc>(), 20);
        assert_eq!(
            std::mem::size_of::<RawPmValue>(),
            2 * std::mem::size_of::<*mut c_void>()
        );
    }
}
