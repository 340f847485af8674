//! Typed error hierarchy for multifetch
//!
//! Structural errors (engine or reactor desynchronisation, allocation
//! failures) are returned as [`MultiplexError`] and stop the run loop.
//! Per-transfer failures never escalate: they are delivered to the
//! completion sink as a [`TransferError`].

use crate::types::{NativeSocket, SessionId};
use thiserror::Error;

/// Main error type for the multiplex coordinator
#[derive(Debug, Error)]
pub enum MultiplexError {
    /// The transfer engine handle could not be created
    #[error("Transfer engine init failed: {0}")]
    EngineInit(String),

    /// The engine rejected a new transfer; no session was created
    #[error("Transfer setup failed for {url}: {message}")]
    TransferSetup { url: String, message: String },

    /// The native handle seen by the reactor disagrees with the engine's socket
    #[error("Socket consistency violation for session {session}: expected {expected:?}, got {actual}")]
    SocketConsistency {
        session: SessionId,
        expected: Option<NativeSocket>,
        actual: NativeSocket,
    },

    /// A socket-action call returned an internal engine error code
    #[error("Engine drive error: {0}")]
    EngineDrive(String),

    /// The readiness layer failed
    #[error("Reactor error: {0}")]
    Reactor(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("Invalid config for '{field}': {message}")]
    InvalidConfig {
        field: &'static str,
        message: String,
    },

    /// Resource limits exceeded
    #[error("Resource limit exceeded: {resource} (limit: {limit})")]
    ResourceLimit {
        resource: &'static str,
        limit: usize,
    },
}

impl MultiplexError {
    /// Check if this error must terminate the run loop
    ///
    /// Drive errors only signal that a transfer will likely finish with an
    /// error outcome, and setup errors concern a single transfer; everything
    /// else means the two engines disagree or a resource could not be obtained.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EngineDrive(_) | Self::TransferSetup { .. })
    }

    /// Create a transfer setup error
    pub fn transfer_setup(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransferSetup {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, MultiplexError>;

impl From<toml::de::Error> for MultiplexError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_config("toml", err.to_string())
    }
}

impl From<url::ParseError> for MultiplexError {
    fn from(err: url::ParseError) -> Self {
        Self::TransferSetup {
            url: String::new(),
            message: err.to_string(),
        }
    }
}

/// Why a transfer finished without a body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// DNS resolution failed
    DnsResolution,
    /// Connection refused or host unreachable
    ConnectionRefused,
    /// Connect or transfer timeout
    Timeout,
    /// TLS handshake or certificate failure
    Tls,
    /// Too many redirects
    TooManyRedirects,
    /// Transfer rate stayed below the configured low-speed limit
    LowSpeed,
    /// Transfer was aborted before completion
    Aborted,
    /// Other transfer error
    Other,
}

impl std::fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DnsResolution => "dns resolution",
            Self::ConnectionRefused => "connection refused",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::TooManyRedirects => "too many redirects",
            Self::LowSpeed => "low speed",
            Self::Aborted => "aborted",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Failed outcome of one transfer, handed to the completion sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Check if the failure happened before any connection was made
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self.kind,
            TransferErrorKind::DnsResolution | TransferErrorKind::ConnectionRefused
        )
    }
}

#[cfg(feature = "curl")]
impl From<curl::Error> for TransferError {
    fn from(err: curl::Error) -> Self {
        let kind = if err.is_couldnt_resolve_host() || err.is_couldnt_resolve_proxy() {
            TransferErrorKind::DnsResolution
        } else if err.is_couldnt_connect() {
            TransferErrorKind::ConnectionRefused
        } else if err.is_operation_timedout() {
            // curl reports the low-speed abort as a timeout; the message says which
            if err
                .extra_description()
                .is_some_and(|extra| extra.contains("too slow"))
            {
                TransferErrorKind::LowSpeed
            } else {
                TransferErrorKind::Timeout
            }
        } else if err.is_ssl_connect_error() || err.is_peer_failed_verification() {
            TransferErrorKind::Tls
        } else if err.is_too_many_redirects() {
            TransferErrorKind::TooManyRedirects
        } else if err.is_aborted_by_callback() || err.is_write_error() {
            TransferErrorKind::Aborted
        } else {
            TransferErrorKind::Other
        };

        let message = match err.extra_description() {
            Some(extra) => format!("{} ({})", err.description(), extra),
            None => err.description().to_string(),
        };

        Self { kind, message }
    }
}
