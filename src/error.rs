//! Error types for the tunnel endpoints
//!
//! [`TunnelError`] covers everything outside the wire codec: socket I/O,
//! upstream dialing, DNS message handling, SOCKS negotiation, timeouts,
//! and configuration. Wire-grammar violations live in
//! [`crate::codec::CodecError`] because they map directly onto DNS
//! response codes.
//!
//! # Example
//!
//! ```
//! use dnspipe::error::TunnelError;
//!
//! let err = TunnelError::timeout("poll query", std::time::Duration::from_secs(2));
//! assert!(err.is_timeout());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result alias for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error type shared by the client and server endpoints.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Invalid configuration
    #[error("invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error
        reason: String,
        /// The configuration field at fault, if known
        field: Option<String>,
    },

    /// Socket I/O failure
    #[error("network error: {reason}")]
    Network {
        /// Description of the network failure
        reason: String,
        /// The underlying I/O error, if available
        #[source]
        source: Option<io::Error>,
    },

    /// An operation exceeded its deadline
    #[error("{context} timed out after {timeout:?}")]
    Timeout {
        /// What timed out
        context: String,
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// The TCP dial to the upstream target failed
    ///
    /// On the server this maps to a ServFail reply and no session is
    /// created.
    #[error("failed to dial upstream target {target}: {source}")]
    Dial {
        /// The target host:port
        target: String,
        /// The dial failure
        #[source]
        source: io::Error,
    },

    /// DNS message construction, serialization, or parsing failed
    #[error("DNS message error: {reason}")]
    Dns {
        /// Description of the failure
        reason: String,
    },

    /// SOCKS5 negotiation failed on the local endpoint
    #[error("SOCKS5 negotiation failed: {reason}")]
    Socks {
        /// Description of the failure
        reason: String,
    },
}

impl TunnelError {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error with field context.
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a network error.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error from an I/O error.
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            context: context.into(),
            timeout,
        }
    }

    /// Create a dial error.
    pub fn dial(target: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            target: target.into(),
            source,
        }
    }

    /// Create a DNS message error.
    pub fn dns(reason: impl Into<String>) -> Self {
        Self::Dns {
            reason: reason.into(),
        }
    }

    /// Create a SOCKS error.
    pub fn socks(reason: impl Into<String>) -> Self {
        Self::Socks {
            reason: reason.into(),
        }
    }

    /// Whether this error is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error is an upstream dial failure.
    #[must_use]
    pub const fn is_dial(&self) -> bool {
        matches!(self, Self::Dial { .. })
    }

    /// Whether the server's receive loop should give up on this error.
    ///
    /// Transient receive failures are logged and skipped; only conditions
    /// the process cannot recover from (lost bind permissions, exhausted
    /// descriptors, out of memory) stop the loop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Network {
                source: Some(io_err),
                ..
            } => matches!(
                io_err.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::AddrInUse
                    | io::ErrorKind::OutOfMemory
            ),
            _ => false,
        }
    }
}
