use std::path::PathBuf;

use thiserror::Error;

pub const PM_ERR_GENERIC: i32 = -12345;
pub const PM_ERR_VALUE: i32 = -12351;
pub const PM_ERR_NAME: i32 = -12357;
pub const PM_ERR_PMID: i32 = -12358;
pub const PM_ERR_CONV: i32 = -12362;
pub const PM_ERR_IPC: i32 = -12366;
pub const PM_ERR_NOCONTEXT: i32 = -12376;
pub const PM_ERR_TYPE: i32 = -12397;

/// Error code returned by the metrics daemon client library
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct PmError {
    code: i32,
    message: String,
}

impl PmError {
    /// Error with the library's canonical text for `code`
    pub fn new(code: i32) -> Self {
        Self::with_message(code, describe(code))
    }

    pub fn with_message(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The daemon does not know the requested metric name
    pub fn is_name_error(&self) -> bool {
        self.code == PM_ERR_NAME
    }
}

fn describe(code: i32) -> String {
    match code {
        PM_ERR_GENERIC => "Generic error, already reported above".to_string(),
        PM_ERR_VALUE => "Missing metric value(s)".to_string(),
        PM_ERR_NAME => "Unknown metric name".to_string(),
        PM_ERR_PMID => "Unknown or illegal metric identifier".to_string(),
        PM_ERR_CONV => "Impossible value or scale conversion".to_string(),
        PM_ERR_IPC => "IPC protocol failure".to_string(),
        PM_ERR_NOCONTEXT => "Attempt to use an illegal context".to_string(),
        PM_ERR_TYPE => "Unknown or illegal metric type".to_string(),
        c if c < 0 && c > -4096 => std::io::Error::from_raw_os_error(-c).to_string(),
        c => format!("Unknown error code {}", c),
    }
}

/// Failures while building the shared daemon connection
#[derive(Error, Debug)]
pub enum InitError {
    #[error("cannot load client library {path}: {source}")]
    LibraryLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("client library is missing symbol {symbol}: {source}")]
    MissingSymbol {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("error initializing connection to {target}, ensure pmcd is running: {source}")]
    Context {
        target: String,
        #[source]
        source: PmError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_error() {
        let err = PmError::new(PM_ERR_NAME);
        assert!(err.is_name_error());
        assert_eq!(err.to_string(), "Unknown metric name (code -12357)");
        assert!(!PmError::new(PM_ERR_IPC).is_name_error());
    }

    #[test]
    fn test_errno_codes_use_os_text() {
        let err = PmError::new(-libc::ECONNREFUSED);
        assert_eq!(
            err.message(),
            std::io::Error::from_raw_os_error(libc::ECONNREFUSED).to_string()
        );
    }
}
