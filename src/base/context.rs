//! Ergonomic error context helpers.
//!
//! Extension traits that turn `io::Error`s coming off a socket into
//! context-rich `NetError` variants.

use crate::base::neterror::NetError;
use std::io;

/// Map an I/O error observed on a bound connection to a `NetError`.
///
/// Peer resets are reported the same way as a premature close so callers
/// only have one variant to match on.
pub fn from_io(err: io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::ConnectionReset => NetError::ConnectionReset { message: "read ECONNRESET" },
        io::ErrorKind::BrokenPipe => NetError::ConnectionReset { message: "write EPIPE" },
        _ => NetError::Io(err),
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use h1client::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 80)?;
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;

    /// Convert a socket read/write failure.
    fn socket_context(self) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| NetError::connection_failed_to(host, port, e))
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }

    fn socket_context(self) -> Result<T, NetError> {
        self.map_err(from_io)
    }
}
