//! Error types and categorization.
//!
//! Forward failures are categorized so they can be counted per category and
//! logged with a stable label. They never abort a job: the request handlers
//! turn them into sentinel responses. [`JobError`] is the error type of a whole
//! job run and is what reaches `main`.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::generator::GeneratorError;
use crate::locator::LocatorError;
use crate::storage::StorageError;
use crate::tls::TlsSetupError;

/// Categories of failures that can occur while forwarding a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The target address could not be parsed
    TargetError,

    /// Connection could not be established (DNS, refused, reset)
    NetworkError,

    /// TLS handshake failures
    TlsError,

    /// No complete response within the forward timeout
    TimeoutError,

    /// Malformed or incomplete HTTP exchange
    ProtocolError,
}

impl ErrorCategory {
    /// Get the Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::TargetError => "target_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::ProtocolError => "protocol_error",
        }
    }

    /// Get a human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::TargetError => "Invalid Target Address",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TlsError => "TLS Handshake Errors",
            ErrorCategory::TimeoutError => "Forward Timeout Errors",
            ErrorCategory::ProtocolError => "Malformed HTTP Exchanges",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A failed forward attempt.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("invalid target '{target}': {message}")]
    InvalidTarget { target: String, message: String },

    #[error("error establishing tcp connection to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("error exchanging request with {addr}: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: hyper::Error,
    },

    #[error("error building request for {addr}: {source}")]
    Request {
        addr: String,
        #[source]
        source: hyper::http::Error,
    },

    #[error("no response from {addr} within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },
}

impl ForwardError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForwardError::InvalidTarget { .. } => ErrorCategory::TargetError,
            ForwardError::Connect { .. } => ErrorCategory::NetworkError,
            ForwardError::Tls { .. } => ErrorCategory::TlsError,
            ForwardError::Timeout { .. } => ErrorCategory::TimeoutError,
            ForwardError::Protocol { .. } | ForwardError::Request { .. } => {
                ErrorCategory::ProtocolError
            }
        }
    }
}

/// Errors that end a job run.
///
/// Every variant is fatal: `main` logs it once and exits non-zero.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error("object storage setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("file discovery failed: {0}")]
    Discovery(#[from] LocatorError),

    #[error("traffic generator failed: {0}")]
    Generator(#[from] GeneratorError),

    #[error("listener failed: {0}")]
    Listener(#[source] hyper::Error),

    #[error("diff log write failed: {0}")]
    DiffLog(#[source] io::Error),

    #[error("persisting results to {location} failed: {source}")]
    Persist {
        location: String,
        #[source]
        source: StorageError,
    },

    #[error("metrics setup failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
