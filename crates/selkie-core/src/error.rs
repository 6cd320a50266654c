//! Error types for selkie
//!
//! TigerStyle: Explicit error types with context, using thiserror.
//!
//! Propagation policy: anything tied to a session is returned to that
//! session as an error-typed message by the runtime; anything untied is
//! logged; fatal errors (lock file, missing config, boot service failure)
//! abort the process from the binary.

use thiserror::Error;

/// Result type alias for selkie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Selkie error types
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Routing Errors
    // =========================================================================
    #[error("Service not found: {id:#010x}")]
    ServiceNotFound { id: u32 },

    #[error("Receiver must be non-zero")]
    InvalidReceiver,

    #[error("Invalid message type: {ptype}")]
    InvalidMessageType { ptype: u8 },

    #[error("Worker out of range: {worker_id} (server has {count} workers)")]
    WorkerOutOfRange { worker_id: u32, count: usize },

    // =========================================================================
    // Service Lifecycle Errors
    // =========================================================================
    #[error("Unknown service kind: {kind}")]
    UnknownServiceKind { kind: String },

    #[error("Service init failed: kind {kind}, reason: {reason}")]
    ServiceInitFailed { kind: String, reason: String },

    #[error("Unique name taken: {name}")]
    UniqueNameTaken { name: String },

    #[error("Worker sequence space exhausted on worker {worker_id}")]
    SequenceExhausted { worker_id: u32 },

    // =========================================================================
    // Buffer and Envelope Errors
    // =========================================================================
    #[error("Buffer range out of bounds: offset {offset}, len {len}, size {size}")]
    BufferOutOfRange {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Cluster payload too large: {size} bytes exceeds limit of {limit} bytes")]
    ClusterPayloadTooLarge { size: usize, limit: usize },

    #[error("Cluster envelope truncated: {size} bytes")]
    ClusterTruncated { size: usize },

    #[error("Unknown decode field code: {code:?}")]
    InvalidDecodeFormat { code: char },

    // =========================================================================
    // Prefab Errors
    // =========================================================================
    #[error("Prefab not found: {id}")]
    PrefabNotFound { id: u64 },

    // =========================================================================
    // Startup Errors
    // =========================================================================
    #[error("Invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Configuration not found: {path}")]
    ConfigMissing { path: String },

    #[error("Another instance holds the lock file: {path}")]
    LockFileHeld { path: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Server is stopping")]
    ServerStopping,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Create a service not found error
    pub fn service_not_found(id: u32) -> Self {
        Self::ServiceNotFound { id }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error aborts startup rather than being reported per-session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LockFileHeld { .. }
                | Self::ConfigMissing { .. }
                | Self::InvalidConfiguration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::service_not_found(0x0100_0001);
        assert!(err.to_string().contains("0x01000001"));
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::ConfigMissing {
            path: "config.json".into()
        }
        .is_fatal());
        assert!(!Error::service_not_found(1).is_fatal());
    }
}
