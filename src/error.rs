//! Error types for the probe library

use thiserror::Error;

/// Result type alias for this library
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Raw result of a call across the system boundary: the error is the
/// platform's own status code, uninterpreted.
pub type SysResult<T> = std::result::Result<T, u32>;

/// `ERROR_INVALID_PARAMETER`, what process APIs report for a pid that is gone.
pub const ERROR_INVALID_PARAMETER: u32 = 87;
/// `ERROR_CALL_NOT_IMPLEMENTED`
pub const ERROR_CALL_NOT_IMPLEMENTED: u32 = 120;
/// `ERROR_PROC_NOT_FOUND`, reported for a symbol missing from a module.
pub const ERROR_PROC_NOT_FOUND: u32 = 127;
/// `ERROR_MORE_DATA`
pub const ERROR_MORE_DATA: u32 = 234;

/// Error types that can occur when probing the system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// A system call failed with a status code we do not interpret
    #[error("OS error code {0}")]
    Os(u32),

    /// The entry point backing this feature does not exist on this system
    #[error("Not implemented on this system: {0}")]
    NotImplemented(&'static str),

    /// The module was marked unavailable by an earlier failed load
    #[error("Module not found: {0}")]
    ModuleNotFound(&'static str),

    /// Process not found
    #[error("No such process: pid {0}")]
    NoSuchProcess(u32),

    /// A requested key (interface, drive, counter object) is not in the enumerated set
    #[error("Not found: {0}")]
    NotFound(String),

    /// Every object type in a counter block reported no instances
    #[error("No counter instances for key {0}")]
    NoInstances(String),

    /// A counter block record or offset is outside the data the system returned
    #[error("Malformed counter data: {0}")]
    Malformed(String),
}

impl ProbeError {
    /// Map a raw status code from the system boundary.
    ///
    /// Only codes with a semantic meaning of their own are translated,
    /// everything else stays an opaque [`ProbeError::Os`].
    pub fn from_os(code: u32) -> Self {
        match code {
            ERROR_CALL_NOT_IMPLEMENTED => ProbeError::NotImplemented("system call"),
            code => ProbeError::Os(code),
        }
    }

    /// Like [`ProbeError::from_os`], for calls made on behalf of one pid.
    pub fn from_process_os(pid: u32, code: u32) -> Self {
        match code {
            ERROR_INVALID_PARAMETER => ProbeError::NoSuchProcess(pid),
            code => ProbeError::from_os(code),
        }
    }

    /// True for the "no such key" family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProbeError::NotFound(_) | ProbeError::NoSuchProcess(_) | ProbeError::NoInstances(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_codes_map_to_no_such_process() {
        assert_eq!(
            ProbeError::from_process_os(42, ERROR_INVALID_PARAMETER),
            ProbeError::NoSuchProcess(42)
        );
        assert_eq!(ProbeError::from_process_os(42, 5), ProbeError::Os(5));
    }

    #[test]
    fn test_unknown_codes_stay_opaque() {
        assert_eq!(ProbeError::from_os(1234), ProbeError::Os(1234));
        assert!(matches!(
            ProbeError::from_os(ERROR_CALL_NOT_IMPLEMENTED),
            ProbeError::NotImplemented(_)
        ));
    }

    #[test]
    fn test_not_found_family() {
        assert!(ProbeError::NoInstances("238".into()).is_not_found());
        assert!(ProbeError::NoSuchProcess(1).is_not_found());
        assert!(!ProbeError::Os(5).is_not_found());
    }
}
