//! Error handling module for the storage planner
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Every mutating engine call returns `Result<T>`; callers that need the
//! integer contract convert with [`StorageError::code`] or [`to_code`].
//!
//! # Code Families
//!
//! | Family        | Range  |
//! |---------------|--------|
//! | Engine        | -1xxx  |
//! | Container     | -2xxx  |
//! | Volume        | -3xxx  |
//! | Extent pool   | -4xxx  |
//! | Commit        | -5xxx  |

use thiserror::Error;

use crate::types::FsType;

/// Integer result codes, `0` is success.
pub mod codes {
    pub const OK: i32 = 0;

    pub const LOCKED: i32 = -1001;
    pub const IO: i32 = -1002;
    pub const JSON: i32 = -1003;

    pub const READ_ONLY: i32 = -2001;
    pub const INVALID_ENTITY_KIND: i32 = -2002;

    pub const NOT_FOUND: i32 = -3001;
    pub const ALREADY_IN_USE: i32 = -3002;
    pub const UNSUPPORTED_BY_FILESYSTEM: i32 = -3003;
    pub const INVALID_ARGUMENT: i32 = -3004;

    pub const INSUFFICIENT_SPACE: i32 = -4001;
    pub const PE_MAP_INCONSISTENT: i32 = -4002;
    pub const MEMBER_NOT_FOUND: i32 = -4003;

    pub const EXTERNAL_TOOL_FAILED: i32 = -5001;
    pub const COMMIT_ABORTED: i32 = -5002;
    pub const DEVICE_TIMEOUT: i32 = -5003;
}

/// Main error type for the storage planner
#[derive(Error, Debug)]
pub enum StorageError {
    /// The engine or the target container does not accept changes
    #[error("Storage is read-only: {0}")]
    ReadOnly(String),

    /// Entity (container or volume) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Extent-pool member does not exist in the pool
    #[error("Pool member not found: {0}")]
    MemberNotFound(String),

    /// The device is consumed by another entity
    #[error("Device {device} is in use by {used_by}")]
    AlreadyInUse { device: String, used_by: String },

    /// A driver was handed an entity of the wrong kind
    #[error("Invalid entity kind for {operation}: {found}")]
    InvalidEntityKind { operation: &'static str, found: String },

    /// Not enough free space (extents or KiB, depending on the container)
    #[error("Insufficient space: requested {requested}, available {available}")]
    InsufficientSpace { requested: u64, available: u64 },

    /// Extent bookkeeping does not match the pool members
    #[error("Extent map inconsistent: {0}")]
    PeMapInconsistent(String),

    /// An external tool exited unsuccessfully
    #[error("{command} failed (exit code {exit_code}): {diagnostic}")]
    ExternalToolFailed {
        command: String,
        exit_code: i32,
        diagnostic: String,
    },

    /// The filesystem cannot do what was asked
    #[error("Filesystem {fs} does not support {operation}")]
    UnsupportedByFilesystem { fs: FsType, operation: &'static str },

    /// Argument validation errors (sizes, names, mount points)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The confirmation callback declined an action
    #[error("Commit aborted before: {0}")]
    CommitAborted(String),

    /// A commit batch stopped at the given action
    #[error("Commit failed at action {index} ({description}): {source}")]
    CommitFailed {
        index: usize,
        description: String,
        #[source]
        source: Box<StorageError>,
    },

    /// The advisory engine lock is held elsewhere
    #[error("Storage lock unavailable: {0}")]
    Locked(String),

    /// A device node did not show up in time
    #[error("Timed out waiting for device node {0}")]
    DeviceTimeout(String),

    /// IO errors (lock file, fstab, /proc)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Create a read-only error
    pub fn read_only(what: impl Into<String>) -> Self {
        Self::ReadOnly(what.into())
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an invalid-argument error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an extent bookkeeping error
    pub fn pe_map(msg: impl Into<String>) -> Self {
        Self::PeMapInconsistent(msg.into())
    }

    /// Create an in-use error
    pub fn in_use(device: impl Into<String>, used_by: impl Into<String>) -> Self {
        Self::AlreadyInUse {
            device: device.into(),
            used_by: used_by.into(),
        }
    }

    /// Integer code of this error, partitioned by family.
    pub fn code(&self) -> i32 {
        match self {
            Self::Locked(_) => codes::LOCKED,
            Self::Io(_) => codes::IO,
            Self::Json(_) => codes::JSON,
            Self::ReadOnly(_) => codes::READ_ONLY,
            Self::InvalidEntityKind { .. } => codes::INVALID_ENTITY_KIND,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::AlreadyInUse { .. } => codes::ALREADY_IN_USE,
            Self::UnsupportedByFilesystem { .. } => codes::UNSUPPORTED_BY_FILESYSTEM,
            Self::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            Self::InsufficientSpace { .. } => codes::INSUFFICIENT_SPACE,
            Self::PeMapInconsistent(_) => codes::PE_MAP_INCONSISTENT,
            Self::MemberNotFound(_) => codes::MEMBER_NOT_FOUND,
            Self::ExternalToolFailed { .. } => codes::EXTERNAL_TOOL_FAILED,
            Self::CommitAborted(_) => codes::COMMIT_ABORTED,
            Self::DeviceTimeout(_) => codes::DEVICE_TIMEOUT,
            Self::CommitFailed { source, .. } => source.code(),
        }
    }

    /// The innermost error of a failed commit, or `self`.
    pub fn root_cause(&self) -> &StorageError {
        match self {
            Self::CommitFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Convert any engine result into the integer contract.
pub fn to_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => codes::OK,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::InsufficientSpace {
            requested: 20,
            available: 15,
        };
        assert_eq!(err.to_string(), "Insufficient space: requested 20, available 15");

        let err = StorageError::in_use("/dev/sda1", "lvm:/dev/system");
        assert_eq!(err.to_string(), "Device /dev/sda1 is in use by lvm:/dev/system");
    }

    #[test]
    fn test_codes_are_partitioned_by_family() {
        assert_eq!(StorageError::read_only("x").code() / 1000, -2);
        assert_eq!(StorageError::not_found("x").code() / 1000, -3);
        assert_eq!(StorageError::pe_map("x").code() / 1000, -4);
        assert_eq!(StorageError::CommitAborted("x".into()).code() / 1000, -5);
        assert_eq!(StorageError::Locked("x".into()).code() / 1000, -1);
    }

    #[test]
    fn test_commit_failed_reports_source_code() {
        let err = StorageError::CommitFailed {
            index: 3,
            description: "Create /dev/sda1".to_string(),
            source: Box::new(StorageError::ExternalToolFailed {
                command: "parted".to_string(),
                exit_code: 1,
                diagnostic: "Error: unrecognised disk label".to_string(),
            }),
        };
        assert_eq!(err.code(), codes::EXTERNAL_TOOL_FAILED);
        assert!(err.to_string().contains("unrecognised disk label"));
        assert!(matches!(err.root_cause(), StorageError::ExternalToolFailed { .. }));
    }

    #[test]
    fn test_to_code() {
        let ok: Result<()> = Ok(());
        assert_eq!(to_code(&ok), codes::OK);

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Result<()> = Err(io_err.into());
        assert_eq!(to_code(&err), codes::IO);
    }
}
