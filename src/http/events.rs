//! Notifications raised by a request to its caller.

use crate::base::neterror::NetError;
use crate::http::response::ResponseHead;
use bytes::Bytes;

/// Placeholder for the connection in events produced by the sans-io core.
///
/// The core never owns the transport; the driver that does swaps the marker
/// for the real connection with [`RequestEvent::map_connection`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Detached;

/// A connection handed over to the caller after Upgrade or CONNECT.
#[derive(Debug)]
pub struct Handoff<C> {
    pub response: ResponseHead,
    pub connection: C,
    /// Bytes read past the response head, to be replayed by the new protocol.
    pub body_head: Bytes,
}

#[derive(Debug)]
pub enum RequestEvent<C = Detached> {
    /// A connection was bound to the request.
    Socket { reused: bool },
    /// The final response head arrived.
    Response(ResponseHead),
    /// A 1xx informational response (never 101).
    Information(ResponseHead),
    /// `100 Continue` specifically; always followed by `Information`.
    Continue,
    /// A slice of the response body.
    Data(Bytes),
    ResponseEnd,
    /// The connection closed before the response body completed.
    ResponseAborted,
    ResponseClose,
    Upgrade(Handoff<C>),
    Connect(Handoff<C>),
    Timeout,
    Abort,
    Error(NetError),
    /// Last event for the request.
    Close,
}

impl RequestEvent<Detached> {
    /// Attach the real connection to a hand-off event.
    ///
    /// `take` is only called for `Upgrade` and `Connect`. Returns `None` if a
    /// hand-off event finds no connection to hand over.
    pub fn map_connection<C>(self, take: impl FnOnce() -> Option<C>) -> Option<RequestEvent<C>> {
        Some(match self {
            RequestEvent::Upgrade(h) => RequestEvent::Upgrade(h.with_connection(take()?)),
            RequestEvent::Connect(h) => RequestEvent::Connect(h.with_connection(take()?)),
            RequestEvent::Socket { reused } => RequestEvent::Socket { reused },
            RequestEvent::Response(head) => RequestEvent::Response(head),
            RequestEvent::Information(head) => RequestEvent::Information(head),
            RequestEvent::Continue => RequestEvent::Continue,
            RequestEvent::Data(data) => RequestEvent::Data(data),
            RequestEvent::ResponseEnd => RequestEvent::ResponseEnd,
            RequestEvent::ResponseAborted => RequestEvent::ResponseAborted,
            RequestEvent::ResponseClose => RequestEvent::ResponseClose,
            RequestEvent::Timeout => RequestEvent::Timeout,
            RequestEvent::Abort => RequestEvent::Abort,
            RequestEvent::Error(e) => RequestEvent::Error(e),
            RequestEvent::Close => RequestEvent::Close,
        })
    }
}

impl<C> RequestEvent<C> {
    pub fn is_close(&self) -> bool {
        matches!(self, RequestEvent::Close)
    }

    /// Short name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            RequestEvent::Socket { .. } => "socket",
            RequestEvent::Response(_) => "response",
            RequestEvent::Information(_) => "information",
            RequestEvent::Continue => "continue",
            RequestEvent::Data(_) => "data",
            RequestEvent::ResponseEnd => "end",
            RequestEvent::ResponseAborted => "aborted",
            RequestEvent::ResponseClose => "response-close",
            RequestEvent::Upgrade(_) => "upgrade",
            RequestEvent::Connect(_) => "connect",
            RequestEvent::Timeout => "timeout",
            RequestEvent::Abort => "abort",
            RequestEvent::Error(_) => "error",
            RequestEvent::Close => "close",
        }
    }
}

impl Handoff<Detached> {
    fn with_connection<C>(self, connection: C) -> Handoff<C> {
        Handoff { response: self.response, connection, body_head: self.body_head }
    }
}
