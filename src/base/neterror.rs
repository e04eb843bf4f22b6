use bytes::Bytes;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    // Request construction
    #[error("{what} must be a valid HTTP token [\"{value}\"]")]
    InvalidToken { what: &'static str, value: String },
    #[error("{what} contains unescaped characters")]
    UnescapedCharacters { what: &'static str },
    #[error("Invalid value for header \"{name}\"")]
    InvalidHeader { name: String },
    #[error("Cannot {action} headers after they are sent to the client")]
    HeadersAlreadySent { action: &'static str },
    #[error("Protocol \"{protocol}\" not supported. Expected \"{expected}\"")]
    ProtocolMismatch { protocol: String, expected: String },
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("write after end")]
    WriteAfterEnd,

    // Connection Errors
    #[error("Connection reset: {message}")]
    ConnectionReset { message: &'static str },
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Name {domain} not resolved: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: io::Error,
    },
    #[error("Socket pool is shut down")]
    PoolClosed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // Response parsing
    #[error("Parse Error: {reason}")]
    ParseError {
        reason: String,
        bytes_parsed: usize,
        raw_packet: Bytes,
    },

    // Response body helpers
    #[error("Response body is not valid UTF-8")]
    InvalidUtf8,
    #[error("JSON parse error: {0}")]
    Json(#[source] serde_json::Error),
}

impl NetError {
    /// The error raised when the peer goes away before a response completes.
    pub fn socket_hang_up() -> Self {
        NetError::ConnectionReset { message: "socket hang up" }
    }

    pub(crate) fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        NetError::ConnectionFailedTo { host: host.to_string(), port, source }
    }

    pub(crate) fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor { domain: domain.to_string(), source }
    }

    /// True for errors reported synchronously, before any I/O happens.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            NetError::InvalidToken { .. }
                | NetError::UnescapedCharacters { .. }
                | NetError::InvalidHeader { .. }
                | NetError::HeadersAlreadySent { .. }
                | NetError::ProtocolMismatch { .. }
                | NetError::InvalidUrl
        )
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionReset { .. } => -101,
            NetError::ConnectionAborted => -103,
            NetError::TimedOut => -7,
            NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolvedFor { .. } => -105,
            NetError::PoolClosed => -133,
            NetError::Io(_) => -15,

            NetError::InvalidUrl => -300,
            NetError::ParseError { .. } => -320,
            NetError::InvalidHeader { .. } => -321,
            NetError::ProtocolMismatch { .. } => -302,
            NetError::InvalidToken { .. } => -322,
            // Edge case errors (custom codes starting at -900)
            NetError::UnescapedCharacters { .. } => -900,
            NetError::HeadersAlreadySent { .. } => -901,
            NetError::WriteAfterEnd => -902,
            NetError::InvalidUtf8 => -903,
            NetError::Json(_) => -904,
        }
    }
}
