//! Error types for the hypervisor abstraction layer.

use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The control plane could not be reached.
    #[error("Failed to connect to hypervisor at {target}: {reason}")]
    ConnectionFailed {
        /// URI or alias that was being opened
        target: String,
        /// Underlying failure
        reason: String,
    },

    /// VM is absent from both the active and the defined lists.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// A profile or request could not be resolved to a complete device spec.
    ///
    /// Always raised before any external call is issued.
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// Requested feature is not available for the hypervisor family.
    #[error("{feature} is not supported with the {family} hypervisor")]
    UnsupportedCombination {
        /// Feature that was requested
        feature: String,
        /// Family it was requested for
        family: String,
    },

    /// A multi-step operation aborted after external side effects happened.
    #[error("{operation} for VM {vm} failed at step {step} ({step_name}), completed: [{}]: {source}", .completed.join(", "))]
    PartialFailure {
        /// Operation name (e.g. "init", "purge")
        operation: String,
        /// VM the operation acted on
        vm: String,
        /// Zero-based index of the failing step
        step: usize,
        /// Name of the failing step
        step_name: String,
        /// Steps that completed before the failure
        completed: Vec<String>,
        /// Underlying failure
        #[source]
        source: Box<HypervisorError>,
    },

    /// General control-plane operation failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// VM is in an invalid state for the requested operation.
    #[error("Invalid VM state for operation: {0}")]
    InvalidState(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<quick_xml::Error> for HypervisorError {
    fn from(e: quick_xml::Error) -> Self {
        HypervisorError::XmlError(e.to_string())
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
