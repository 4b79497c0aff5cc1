//! Error types for SSTIO
//!
//! One error enum shared by the provider, the catalog and the remote storage
//! clients, so that "not found" can be recognized uniformly whatever backend
//! produced it.

use crate::types::{CreatorId, DiskFileNum, FileType};
use thiserror::Error;

/// Common result type for SSTIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for SSTIO
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object {file_num} ({file_type}) unknown to the object storage provider")]
    UnknownObject {
        file_type: FileType,
        file_num: DiskFileNum,
    },

    #[error("remote object not found: {name}")]
    RemoteObjectNotFound { name: String },

    #[error("object {file_num} already known to the object storage provider")]
    ObjectExists { file_num: DiskFileNum },

    // Consistency errors
    #[error("object {file_num} type mismatch (known type {known}, expected type {expected})")]
    TypeMismatch {
        file_num: DiskFileNum,
        known: FileType,
        expected: FileType,
    },

    #[error("invalid protection count for object {file_num}")]
    InvalidProtectionCount { file_num: DiskFileNum },

    // Initialization errors
    #[error("remote object support not configured")]
    RemoteNotConfigured,

    #[error("remote object support not available: remote creator ID not yet set")]
    CreatorIdNotSet,

    #[error("attempt to change creator ID from {current} to {requested}")]
    CreatorIdMismatch {
        current: CreatorId,
        requested: CreatorId,
    },

    // Reference integrity errors
    #[error("marker object {name} does not exist")]
    MarkerMissing { name: String },

    #[error(
        "origin marker object {name} does not exist; object probably removed from the provider which created the backing"
    )]
    OriginMarkerMissing { name: String },

    // Backing codec errors
    #[error("invalid remote object backing: {0}")]
    InvalidBacking(String),

    #[error("unknown tag {0} in remote object backing")]
    UnknownBackingTag(u64),

    // Catalog errors
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("catalog corruption: {0}")]
    CatalogCorruption(String),

    // Request errors
    #[error("read cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a catalog error
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create an invalid backing error
    pub fn invalid_backing(msg: impl Into<String>) -> Self {
        Self::InvalidBacking(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Wrap this error with a description of the operation that failed
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this is a not found error
    ///
    /// Covers objects unknown to the provider, missing remote objects and
    /// missing local files.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::UnknownObject { .. } | Self::RemoteObjectNotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error indicates internal inconsistency rather than an
    /// environmental failure
    #[must_use]
    pub fn is_assertion_failure(&self) -> bool {
        matches!(
            self.root(),
            Self::TypeMismatch { .. } | Self::ObjectExists { .. } | Self::InvalidProtectionCount { .. }
        )
    }

    /// Check if retrying the same call may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Attach context to errors returned by fallible calls
pub trait ResultExt<T> {
    /// Wrap the error with a fixed context string
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Wrap the error with a lazily built context string
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(
            Error::UnknownObject {
                file_type: FileType::Table,
                file_num: DiskFileNum::new(1),
            }
            .is_not_found()
        );
        assert!(Error::RemoteObjectNotFound { name: "a".into() }.is_not_found());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_not_found());
        assert!(!Error::CreatorIdNotSet.is_not_found());
    }

    #[test]
    fn test_context_preserves_kind() {
        let err = Error::RemoteObjectNotFound { name: "x".into() }
            .context("removing object 000001")
            .context("outer");
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "outer: removing object 000001: remote object not found: x"
        );

        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        let err = res.context("opening 000002.sst").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_assertion_failures() {
        let err = Error::TypeMismatch {
            file_num: DiskFileNum::new(3),
            known: FileType::Table,
            expected: FileType::Blob,
        };
        assert!(err.is_assertion_failure());
        assert!(!err.is_not_found());
        assert!(!Error::Cancelled.is_assertion_failure());
    }
}
