//! Socket abstraction for polymorphic transport handling.
//!
//! The request engine only needs a byte stream plus a cheap liveness probe,
//! so any `AsyncRead + AsyncWrite` transport can be bound to a request once
//! it implements [`StreamSocket`].

use futures::task::noop_waker_ref;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A connected transport.
///
/// Chromium equivalent: `net::StreamSocket`
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug + 'static {
    /// Returns true if the socket is still connected.
    /// This is a non-blocking check, not a full liveness probe.
    fn is_connected(&self) -> bool;

    /// Returns true if the socket is connected and has no unread data.
    /// Matches Chromium's IsConnectedAndIdle().
    fn is_connected_and_idle(&self) -> bool;
}

/// Peek without consuming: `Some(true)` if bytes are waiting, `Some(false)`
/// if the peer is quiet, `None` on EOF or error.
fn probe_tcp(stream: &TcpStream) -> Option<bool> {
    if stream.peer_addr().is_err() {
        return None;
    }
    let mut cx = Context::from_waker(noop_waker_ref());
    let mut byte = [0u8; 1];
    let mut buf = ReadBuf::new(&mut byte);
    match stream.poll_peek(&mut cx, &mut buf) {
        Poll::Pending => Some(false),
        Poll::Ready(Ok(0)) => None,
        Poll::Ready(Ok(_)) => Some(true),
        Poll::Ready(Err(_)) => None,
    }
}

impl StreamSocket for TcpStream {
    fn is_connected(&self) -> bool {
        probe_tcp(self).is_some()
    }

    fn is_connected_and_idle(&self) -> bool {
        probe_tcp(self) == Some(false)
    }
}

// In-memory transport, used by tests and embedders with their own I/O.
impl StreamSocket for DuplexStream {
    fn is_connected(&self) -> bool {
        true
    }

    fn is_connected_and_idle(&self) -> bool {
        true
    }
}

/// A wrapper type for boxed dynamic StreamSocket that is object-safe.
/// This avoids conflicting trait implementations with tokio's blanket impls.
pub struct BoxedSocket {
    inner: Pin<Box<dyn StreamSocket>>,
}

impl BoxedSocket {
    /// Create a new BoxedSocket from any StreamSocket.
    pub fn new<S: StreamSocket>(socket: S) -> Self {
        Self { inner: Box::pin(socket) }
    }

    /// Get a pinned mutable reference to the inner socket.
    pub fn as_mut(&mut self) -> Pin<&mut dyn StreamSocket> {
        self.inner.as_mut()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_connected_and_idle(&self) -> bool {
        self.inner.is_connected_and_idle()
    }
}

impl fmt::Debug for BoxedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoxedSocket").field(&self.inner).finish()
    }
}

impl AsyncRead for BoxedSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxedSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}
