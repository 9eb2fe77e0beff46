//! Error types for the data management subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::ItemError;

/// Result type alias for replica manager operations.
pub type DmsResult<T> = Result<T, DmsError>;

/// Which side of a transfer an administrative ban applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanRole {
    /// The endpoint may not be read from for replication.
    Source,
    /// The endpoint may not be written to by replication.
    Target,
}

impl std::fmt::Display for BanRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BanRole::Source => write!(f, "source"),
            BanRole::Target => write!(f, "target"),
        }
    }
}

/// Taxonomy tag carried by every error so callers can branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed item shape or empty batch.
    InvalidInput,
    /// Credential lacks write access.
    PermissionDenied,
    /// Total failure of the catalog.
    CatalogUnavailable,
    /// Total failure of a storage endpoint.
    StorageUnavailable,
    /// Catalog size disagrees with the physical size.
    SizeMismatch,
    /// Every candidate source failed filtering or transfer.
    NoValidSource,
    /// Endpoint administratively excluded.
    BannedEndpoint,
    /// Transfer succeeded but the catalog update did not.
    RegistrationFailed,
    /// Operation name not implemented by the capability.
    UnsupportedOperation,
    /// Third-party transfer failed for one source.
    ReplicationFailed,
    /// Existing catalog entry disagrees with the requested one.
    Conflict,
    /// Item does not exist.
    NotFound,
    /// Side channel deadline expired.
    Timeout,
    /// Local I/O failure.
    Io,
    /// Configuration could not be loaded.
    Config,
}

/// Errors that can occur in the data management subsystem.
#[derive(Debug, Error)]
pub enum DmsError {
    /// The supplied items had the wrong shape or were empty.
    #[error("invalid input: {reason}")]
    InvalidInput {
        /// What was wrong with the input.
        reason: String,
    },

    /// Write access to the path is not permitted for this credential.
    #[error("write access not permitted for {path}")]
    PermissionDenied {
        /// Path that was checked.
        path: String,
    },

    /// The catalog could not be reached or refused the whole call.
    #[error("catalog unavailable: {reason}")]
    CatalogUnavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The storage endpoint could not be instantiated or refused the whole call.
    #[error("storage endpoint {se} unavailable: {reason}")]
    StorageUnavailable {
        /// Storage endpoint name.
        se: String,
        /// Description of the failure.
        reason: String,
    },

    /// Physical size at a source disagrees with the catalog.
    #[error("size mismatch for {pfn} at {se}: catalog {catalog_size}, physical {physical_size}")]
    SizeMismatch {
        /// Storage endpoint holding the copy.
        se: String,
        /// Physical name of the copy.
        pfn: String,
        /// Size recorded in the catalog.
        catalog_size: u64,
        /// Size reported by the endpoint.
        physical_size: u64,
    },

    /// No usable source replica remained.
    #[error("no valid source replica for {lfn}")]
    NoValidSource {
        /// Logical name being replicated.
        lfn: String,
    },

    /// The endpoint is on a banned list.
    #[error("storage endpoint {se} is banned as a {role}")]
    BannedEndpoint {
        /// Storage endpoint name.
        se: String,
        /// Which ban list matched.
        role: BanRole,
    },

    /// Catalog registration failed after a successful transfer.
    #[error("registration of {lfn} failed: {reason}")]
    RegistrationFailed {
        /// Logical name being registered.
        lfn: String,
        /// Description of the failure.
        reason: String,
    },

    /// The named operation is not implemented by the target capability.
    #[error("operation '{op}' not supported by {target}")]
    UnsupportedOperation {
        /// Operation name requested.
        op: String,
        /// Capability that rejected it.
        target: String,
    },

    /// All transfer attempts failed.
    #[error("replication of {lfn} to {dest_se} failed: {reason}")]
    ReplicationFailed {
        /// Logical name being replicated.
        lfn: String,
        /// Destination endpoint.
        dest_se: String,
        /// Description of the failure.
        reason: String,
    },

    /// An existing entry conflicts with the requested one.
    #[error("conflict for {item}: {reason}")]
    Conflict {
        /// Item in conflict.
        item: String,
        /// Description of the conflict.
        reason: String,
    },

    /// The item does not exist.
    #[error("{item} not found")]
    NotFound {
        /// Item looked up.
        item: String,
    },

    /// The side channel did not answer within the configured deadline.
    #[error("{operation} timed out after {secs}s")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Deadline in seconds.
        secs: u64,
    },

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("config error: {reason}")]
    Config {
        /// Description of the error.
        reason: String,
    },

    /// A single-item call failed for that item.
    #[error("{item}: {error}")]
    ItemFailed {
        /// The item that failed.
        item: String,
        /// The structured per-item failure.
        error: ItemError,
    },
}

impl DmsError {
    /// Returns the taxonomy tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DmsError::InvalidInput { .. } => ErrorKind::InvalidInput,
            DmsError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            DmsError::CatalogUnavailable { .. } => ErrorKind::CatalogUnavailable,
            DmsError::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            DmsError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            DmsError::NoValidSource { .. } => ErrorKind::NoValidSource,
            DmsError::BannedEndpoint { .. } => ErrorKind::BannedEndpoint,
            DmsError::RegistrationFailed { .. } => ErrorKind::RegistrationFailed,
            DmsError::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            DmsError::ReplicationFailed { .. } => ErrorKind::ReplicationFailed,
            DmsError::Conflict { .. } => ErrorKind::Conflict,
            DmsError::NotFound { .. } => ErrorKind::NotFound,
            DmsError::Timeout { .. } => ErrorKind::Timeout,
            DmsError::Io(_) => ErrorKind::Io,
            DmsError::Config { .. } => ErrorKind::Config,
            DmsError::ItemFailed { error, .. } => error.kind,
        }
    }

    /// True for failures that abort a whole bulk call rather than one item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CatalogUnavailable | ErrorKind::Config
        )
    }

    /// Shorthand for an [`DmsError::InvalidInput`].
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        DmsError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DmsError::CatalogUnavailable`].
    pub fn catalog(reason: impl Into<String>) -> Self {
        DmsError::CatalogUnavailable {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`DmsError::StorageUnavailable`].
    pub fn storage(se: impl Into<String>, reason: impl Into<String>) -> Self {
        DmsError::StorageUnavailable {
            se: se.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = DmsError::NoValidSource {
            lfn: "/grid/a".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NoValidSource);

        let err = DmsError::BannedEndpoint {
            se: "CERN-DST".to_string(),
            role: BanRole::Target,
        };
        assert_eq!(err.kind(), ErrorKind::BannedEndpoint);

        let err = DmsError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_banned_display() {
        let err = DmsError::BannedEndpoint {
            se: "RAL-USER".to_string(),
            role: BanRole::Source,
        };
        assert_eq!(
            format!("{}", err),
            "storage endpoint RAL-USER is banned as a source"
        );
    }

    #[test]
    fn test_size_mismatch_display() {
        let err = DmsError::SizeMismatch {
            se: "PIC-DST".to_string(),
            pfn: "srm://pic/grid/a".to_string(),
            catalog_size: 100,
            physical_size: 42,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("catalog 100"));
        assert!(msg.contains("physical 42"));
    }

    #[test]
    fn test_shorthands() {
        assert_eq!(
            DmsError::invalid_input("empty").kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(DmsError::catalog("down").kind(), ErrorKind::CatalogUnavailable);
        assert!(DmsError::catalog("down").is_fatal());
        assert!(!DmsError::storage("SE", "down").is_fatal());
        let err = DmsError::storage("CNAF-DST", "timeout");
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert_eq!(
            format!("{}", err),
            "storage endpoint CNAF-DST unavailable: timeout"
        );
    }
}
