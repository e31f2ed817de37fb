//! Error types for the streaming node.
//!
//! Errors are scoped to what they can take down:
//!
//! - [`DeviceError`]: capture device failures. Open/start failures abort
//!   startup; frame-read failures are transient and skipped by the
//!   streaming loop until they persist.
//! - [`ProtocolError`]: a single RTSP request failed. Always answered with
//!   an RTSP error status; the session state is left untouched.
//! - [`Error::TransportWrite`]: the client can no longer be reached. Ends
//!   that one session, never the server.

use std::fmt;
use std::time::Duration;

use crate::session::SessionState;

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error (listener bind, accept, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Writing media or a response to the client failed.
    #[error("transport write failed: {0}")]
    TransportWrite(#[source] std::io::Error),

    /// Failed to parse an RTSP message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

/// Capture device failures.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open capture device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start capture: {0}")]
    Start(#[source] std::io::Error),

    #[error("frame read failed: {0}")]
    Read(#[source] std::io::Error),

    /// A tuning control was rejected by the driver.
    #[error("control {id:#010x} rejected: {source}")]
    Control {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    /// No new frame arrived within the wait window.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    /// The device (or the capture thread owning it) has shut down.
    #[error("capture device closed")]
    Closed,

    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),
}

impl DeviceError {
    /// Whether the streaming loop should skip a tick and carry on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Read(_) | Self::Timeout(_))
    }
}

/// Request-scoped RTSP failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The request URI does not name the configured stream.
    #[error("stream not found: {0}")]
    NotFound(String),

    /// The client asked for a transport the server does not speak.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// The transport is valid but no delivery path could be allocated.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("{method} not valid in state {state:?}")]
    MethodNotValidInState { method: String, state: SessionState },
}

impl ProtocolError {
    /// RTSP status code and reason phrase (RFC 2326 §7.1.1).
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::NotFound(_) => (404, "Not Found"),
            Self::UnsupportedTransport(_) => (461, "Unsupported Transport"),
            Self::TransportUnavailable(_) => (503, "Service Unavailable"),
            Self::BadRequest(_) => (400, "Bad Request"),
            Self::SessionNotFound(_) => (454, "Session Not Found"),
            Self::MethodNotValidInState { .. } => (455, "Method Not Valid in This State"),
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// The message head is not valid UTF-8.
    InvalidEncoding,
    /// The message head grew past the framing limit without terminating.
    HeaderTooLarge,
    /// `Content-Length` is not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidEncoding => write!(f, "message head is not UTF-8"),
            Self::HeaderTooLarge => write!(f, "message head too large"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_status_codes() {
        assert_eq!(ProtocolError::NotFound("/x".into()).status().0, 404);
        assert_eq!(
            ProtocolError::UnsupportedTransport("RAW/RAW/UDP".into()).status().0,
            461
        );
        assert_eq!(
            ProtocolError::TransportUnavailable("no ports".into()).status().0,
            503
        );
        assert_eq!(
            ProtocolError::MethodNotValidInState {
                method: "PLAY".into(),
                state: SessionState::Init,
            }
            .status(),
            (455, "Method Not Valid in This State")
        );
    }

    #[test]
    fn transient_device_errors() {
        assert!(DeviceError::Timeout(Duration::from_millis(33)).is_transient());
        assert!(DeviceError::Read(std::io::Error::other("EAGAIN")).is_transient());
        assert!(!DeviceError::Closed.is_transient());
        assert!(!DeviceError::Start(std::io::Error::other("busy")).is_transient());
    }
}
