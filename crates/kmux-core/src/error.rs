//! Error types for kmux-core.

use std::fmt;

use thiserror::Error;

use crate::stream::StreamId;
use crate::timeout::TimeoutReason;

/// Application error code carried on stream resets and connection close.
///
/// Values follow the HTTP/3 error code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Graceful close, no error.
    NoError,
    /// Generic protocol violation.
    ProtocolError,
    /// Internal failure in the local endpoint.
    InternalError,
    /// Peer created a stream that was not acceptable.
    StreamCreationError,
    /// A critical unidirectional stream was closed.
    ClosedCriticalStream,
    /// Peer violated flow-control limits.
    FlowControlError,
    /// Invalid or duplicate SETTINGS.
    SettingsError,
    /// Request refused before any processing; safe to retry.
    RequestRejected,
    /// Request cancelled after processing started.
    RequestCancelled,
}

impl ErrorCode {
    /// Numeric wire value of this code.
    pub fn to_wire(self) -> u64 {
        match self {
            ErrorCode::NoError => 0x100,
            ErrorCode::ProtocolError => 0x101,
            ErrorCode::InternalError => 0x102,
            ErrorCode::StreamCreationError => 0x103,
            ErrorCode::ClosedCriticalStream => 0x104,
            ErrorCode::FlowControlError => 0x105,
            ErrorCode::SettingsError => 0x109,
            ErrorCode::RequestRejected => 0x10b,
            ErrorCode::RequestCancelled => 0x10c,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::StreamCreationError => "STREAM_CREATION_ERROR",
            ErrorCode::ClosedCriticalStream => "CLOSED_CRITICAL_STREAM",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsError => "SETTINGS_ERROR",
            ErrorCode::RequestRejected => "REQUEST_REJECTED",
            ErrorCode::RequestCancelled => "REQUEST_CANCELLED",
        };
        f.write_str(name)
    }
}

/// Main error type for kmux operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying transport stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation by the peer.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Peer opened a stream that cannot be accepted.
    #[error("stream creation error: {message}")]
    StreamCreation { message: String },

    /// A critical inbound stream (control, encoder, decoder) was closed.
    #[error("critical stream closed: {kind}")]
    ClosedCriticalStream { kind: &'static str },

    /// Peer SETTINGS carried an unusable value.
    #[error("settings error: {message}")]
    Settings { message: String },

    /// Flow-control window violation.
    #[error("flow control error: {message}")]
    FlowControl { message: String },

    /// Connection-level timeout expired.
    #[error("{0} timeout expired")]
    Timeout(TimeoutReason),

    /// The connection was aborted while the caller was waiting on it.
    #[error("connection aborted: {message}")]
    ConnectionAborted { message: String },

    /// The connection closed gracefully but the caller was still running.
    #[error("connection closed")]
    ConnectionClosed,

    /// No live stream with the given id.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Transport layer failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Application stream handler failure.
    #[error("handler error: {message}")]
    Handler { message: String },

    /// Invalid configuration value.
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    /// Returns the code used when this error resets a stream or closes a connection.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::Protocol { .. } => ErrorCode::ProtocolError,
            Error::StreamCreation { .. } => ErrorCode::StreamCreationError,
            Error::ClosedCriticalStream { .. } => ErrorCode::ClosedCriticalStream,
            Error::Settings { .. } => ErrorCode::SettingsError,
            Error::FlowControl { .. } => ErrorCode::FlowControlError,
            Error::ConnectionClosed => ErrorCode::NoError,
            Error::StreamNotFound(_) => ErrorCode::RequestCancelled,
            Error::Io(_)
            | Error::Timeout(_)
            | Error::ConnectionAborted { .. }
            | Error::Transport { .. }
            | Error::Handler { .. }
            | Error::InvalidConfig { .. } => ErrorCode::InternalError,
        }
    }

    /// Returns true if this error terminates the whole connection.
    ///
    /// Stream-scoped failures (handler errors, a stream that disappeared)
    /// only tear down the affected stream.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::StreamCreation { .. }
                | Error::ClosedCriticalStream { .. }
                | Error::Settings { .. }
                | Error::FlowControl { .. }
                | Error::Timeout(_)
                | Error::ConnectionAborted { .. }
                | Error::Transport { .. }
                | Error::Io(_)
        )
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }
}

/// Convenience result type for kmux operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_protocol() {
        let err = Error::protocol("duplicate SETTINGS");
        assert_eq!(err.to_string(), "protocol error: duplicate SETTINGS");
    }

    #[test]
    fn error_display_timeout() {
        let err = Error::Timeout(TimeoutReason::RequestHeaders);
        assert_eq!(err.to_string(), "request headers timeout expired");
    }

    #[test]
    fn error_display_stream_not_found() {
        let err = Error::StreamNotFound(StreamId::new(8));
        assert_eq!(err.to_string(), "stream not found: 8");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.error_code(), ErrorCode::InternalError);
    }

    #[test]
    fn error_codes() {
        assert_eq!(Error::protocol("x").error_code(), ErrorCode::ProtocolError);
        assert_eq!(
            Error::ClosedCriticalStream { kind: "control" }.error_code(),
            ErrorCode::ClosedCriticalStream
        );
        assert_eq!(Error::ConnectionClosed.error_code(), ErrorCode::NoError);
        assert_eq!(
            Error::Settings {
                message: "x".into()
            }
            .error_code(),
            ErrorCode::SettingsError
        );
        assert_eq!(
            Error::Timeout(TimeoutReason::ReadDataRate).error_code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn connection_fatal_errors() {
        assert!(Error::Timeout(TimeoutReason::KeepAlive).is_connection_fatal());
        assert!(Error::protocol("bad").is_connection_fatal());
        assert!(Error::transport("reset").is_connection_fatal());

        // Stream-scoped
        assert!(
            !Error::Handler {
                message: "boom".into()
            }
            .is_connection_fatal()
        );
        assert!(!Error::StreamNotFound(StreamId::new(0)).is_connection_fatal());
        assert!(!Error::ConnectionClosed.is_connection_fatal());
    }

    #[test]
    fn wire_values_are_distinct() {
        let codes = [
            ErrorCode::NoError,
            ErrorCode::ProtocolError,
            ErrorCode::InternalError,
            ErrorCode::StreamCreationError,
            ErrorCode::ClosedCriticalStream,
            ErrorCode::FlowControlError,
            ErrorCode::SettingsError,
            ErrorCode::RequestRejected,
            ErrorCode::RequestCancelled,
        ];
        let mut wire: Vec<u64> = codes.iter().map(|c| c.to_wire()).collect();
        wire.sort_unstable();
        wire.dedup();
        assert_eq!(wire.len(), codes.len());
        assert_eq!(ErrorCode::RequestRejected.to_string(), "REQUEST_REJECTED");
    }
}
