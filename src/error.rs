//! Error taxonomy for the orchestration core.
//!
//! Every "expected" domain condition (unknown device, illegal transition,
//! tripped breaker) is a typed variant rather than a panic or an opaque
//! string, so callers can branch on what actually went wrong.

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All the ways an orchestrator, queue, or transport operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input which was rejected before touching any hardware.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced device or job id is not known to the registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// A device with this id is already registered.
    #[error("device already registered: {0}")]
    DuplicateDevice(String),

    /// The operation requires a live link, and the device has none.
    #[error("device {0} is not connected")]
    NotConnected(String),

    /// The connection handshake could not be completed.
    #[error("connection to {device} failed: {message}")]
    Connection {
        /// Device the connection attempt was for.
        device: String,
        /// What went wrong during the handshake.
        message: String,
    },

    /// A command was sent but no acknowledgement arrived in time.
    #[error("command `{command}` to {device} timed out")]
    CommandTimeout {
        /// Device the command was sent to.
        device: String,
        /// The command that went unanswered.
        command: String,
    },

    /// The device's circuit breaker is open; the hardware was not touched.
    #[error("circuit open for {device}, retry in {retry_after:?}")]
    CircuitOpen {
        /// Device whose breaker is open.
        device: String,
        /// How long until the breaker will allow a probe through.
        retry_after: Duration,
    },

    /// A job or queue operation that is illegal in the job's current state.
    #[error("job {job}: illegal transition {from} -> {to}")]
    InvalidState {
        /// Job the transition was attempted on.
        job: uuid::Uuid,
        /// State the job is in.
        from: String,
        /// State the caller asked for.
        to: String,
    },

    /// The device reported a critical fault (e.g. thermal runaway). Never
    /// retried.
    #[error("unrecoverable device error on {device}: {message}")]
    UnrecoverableDevice {
        /// Device that reported the fault.
        device: String,
        /// The device's own description of the fault.
        message: String,
    },

    /// The transport does not implement this capability; check
    /// `supports_file_based_print` before calling.
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// HTTP-level failure from the network transport.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Serial port failure.
    #[cfg(feature = "serial")]
    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),
}

impl Error {
    /// True for failures that recovery may convert into retry/backoff
    /// actions; validation and lookup failures are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::CommandTimeout { .. } | Error::Io(_) | Error::Http(_)
        )
    }
}
