//! Error types for Chirp operations
//!
//! Server failures arrive as negative status codes and are mapped onto
//! [`ChirpStatus`]. Everything the client detects on its own side (transport
//! trouble, malformed responses, bad caller input) has its own variant so a
//! caller can tell a refused request from a dropped connection.

use crate::protocol::ChirpStatus;
use thiserror::Error;

/// Result type alias for Chirp operations
pub type Result<T> = std::result::Result<T, Error>;

/// Chirp client error types
#[derive(Error, Debug)]
pub enum Error {
    /// The server answered with a negative status code
    #[error("{0}")]
    Status(ChirpStatus),

    /// I/O error on the socket or a local file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not resolve or connect to the server
    #[error("Connection error: {0}")]
    Connection(String),

    /// The socket timeout fired while waiting on the server
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The peer closed the connection or a write made no progress
    #[error("Connection to the Chirp server is broken: {0}")]
    ConnectionBroken(String),

    /// A single-line response exceeded the protocol line limit
    #[error("The server responded with too much data ({0} bytes without a newline)")]
    OversizedResponse(usize),

    /// The server sent something the client cannot interpret
    #[error("Chirp protocol error: {0}")]
    Protocol(String),

    /// A request the client refused to send: a malformed command line, half
    /// a stride pair, or a write longer than its data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Open flags outside of `rwatcx`, or missing a required flag
    #[error("Invalid open flags: {0}")]
    InvalidFlags(String),

    /// Access mode character outside of `frwx`
    #[error("Invalid access mode '{0}', expected one or more of 'frwx'")]
    InvalidAccessMode(char),

    /// Missing or unreadable client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Every configured authentication method was rejected
    #[error("Could not authenticate with methods [{methods}]")]
    AuthenticationFailed {
        /// Comma separated list of the methods that were attempted
        methods: String,
    },

    /// A known authentication method this client does not implement
    #[error("Auth method '{0}' not implemented in this client")]
    AuthNotImplemented(String),

    /// An authentication method name nobody knows about
    #[error("Unknown authentication method '{0}'")]
    UnknownAuthMethod(String),

    /// A command was issued on a session without an open socket
    #[error("Session is not connected")]
    NotConnected,

    /// Fewer bytes were stored remotely than the caller handed over
    #[error("Only {written} bytes of {expected} bytes were written")]
    ShortWrite {
        /// Bytes reported written by the server
        written: u64,
        /// Bytes the caller asked to write
        expected: u64,
    },
}

impl Error {
    /// Map a negative status code onto its typed failure.
    ///
    /// Codes outside of the named set (including -127) become
    /// [`ChirpStatus::Unknown`] carrying the original value.
    pub fn from_status(code: i64) -> Self {
        Error::Status(ChirpStatus::from_code(code))
    }

    /// A request rejected locally, before anything was sent
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Error::InvalidRequest(reason.into())
    }

    /// Protocol status this error corresponds to, if any.
    ///
    /// Authentication failures detected during construction report
    /// [`ChirpStatus::NotAuthenticated`] just like the server-side status.
    pub fn status(&self) -> Option<ChirpStatus> {
        match self {
            Error::Status(status) => Some(*status),
            Error::InvalidRequest(_) => Some(ChirpStatus::InvalidRequest),
            Error::AuthenticationFailed { .. } => Some(ChirpStatus::NotAuthenticated),
            _ => None,
        }
    }

    /// `true` when the request never reached the server because the caller's
    /// input was rejected locally.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::InvalidFlags(_)
                | Error::InvalidAccessMode(_)
                | Error::Config(_)
                | Error::UnknownAuthMethod(_)
        )
    }

    /// `true` when retrying the whole operation on a fresh session may help
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Connection(_) | Error::ConnectionBroken(_) => true,
            Error::Status(status) => matches!(
                status,
                ChirpStatus::TryAgain | ChirpStatus::Busy | ChirpStatus::Offline
            ),
            _ => false,
        }
    }

    /// Convert a socket error, telling timeouts and dropped peers apart from
    /// other I/O failures.
    pub(crate) fn from_socket(err: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout(context.to_string()),
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof => {
                Error::ConnectionBroken(format!("{context}: {err}"))
            }
            _ => Error::Io(err),
        }
    }
}

impl From<ChirpStatus> for Error {
    fn from(status: ChirpStatus) -> Self {
        Error::Status(status)
    }
}

/// Interpret a numeric status line.
///
/// Non-negative values are ordinary results (byte counts, descriptors,
/// payload lengths). Negative values never escape as integers.
pub fn check_status(code: i64) -> Result<u64> {
    u64::try_from(code).map_err(|_| Error::from_status(code))
}
