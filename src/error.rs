//! Error types for the CSI attacher
//!
//! Provides structured error types for all sidecar components including
//! plugin probing, leader election and VolumeAttachment reconciliation.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the attacher
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Plugin Errors
    // =========================================================================
    #[error("Failed to connect to CSI driver at {address}: {reason}")]
    PluginConnection { address: String, reason: String },

    #[error("CSI driver identity unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("CSI capability query {query} failed: {reason}")]
    CapabilityQueryFailed { query: String, reason: String },

    #[error("CSI call {operation} failed: {code:?}: {message}")]
    PluginRpc {
        operation: String,
        code: tonic::Code,
        message: String,
    },

    #[error("CSI call {operation} timed out after {timeout:?}")]
    PluginTimeout { operation: String, timeout: Duration },

    #[error("CSI driver does not implement {operation}")]
    PluginUnsupported { operation: String },

    // =========================================================================
    // Leader Election Errors
    // =========================================================================
    #[error("Leader election record {lock} was modified concurrently")]
    LeaseConflict { lock: String },

    #[error("Leader election record {lock} is malformed: {reason}")]
    LeaseRecordMalformed { lock: String, reason: String },

    // =========================================================================
    // Attachment Errors
    // =========================================================================
    #[error("Invalid VolumeAttachment {name}: {reason}")]
    InvalidAttachment { name: String, reason: String },

    #[error("Node {node} has no ID registered for driver {driver}")]
    NodeIdUnavailable { node: String, driver: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::PluginTimeout { .. }
            | Error::LeaseConflict { .. }
            | Error::ResourceNotFound { .. } => ErrorAction::RequeueWithBackoff,

            Error::PluginRpc { code, .. } if is_transient_code(*code) => {
                ErrorAction::RequeueWithBackoff
            }

            // Node registration normally follows shortly after the node starts
            Error::NodeIdUnavailable { .. } => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // The driver answered definitively - wait for the object to change
            Error::PluginRpc { .. }
            | Error::PluginUnsupported { .. }
            | Error::InvalidAttachment { .. }
            | Error::Configuration(_)
            | Error::DurationParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(_) | Error::PluginTimeout { .. } | Error::LeaseConflict { .. } => true,
            Error::PluginRpc { code, .. } => is_transient_code(*code),
            _ => false,
        }
    }

    /// Build a plugin RPC error from a gRPC status
    pub fn from_status(operation: &str, status: tonic::Status) -> Self {
        Error::PluginRpc {
            operation: operation.to_string(),
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

/// gRPC codes after which the driver may still complete (or later succeed
/// at) the operation.
fn is_transient_code(code: tonic::Code) -> bool {
    matches!(
        code,
        tonic::Code::Cancelled
            | tonic::Code::Unknown
            | tonic::Code::DeadlineExceeded
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted
            | tonic::Code::Internal
            | tonic::Code::Unavailable
    )
}

/// Result type alias for the attacher
pub type Result<T> = std::result::Result<T, Error>;
