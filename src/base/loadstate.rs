/// Coarse progress of a request, for reporting.
/// This roughly matches net/base/load_states.h, trimmed to what an
/// HTTP/1.1 request on a pooled connection can be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The request is idle (not started, or finished).
    #[default]
    Idle,

    /// Waiting for the allocator to hand out a socket.
    WaitingForAvailableSocket,

    /// Sending the request line, headers and body.
    SendingRequest,

    /// Waiting for the server response (TTFB).
    WaitingForResponse,

    /// Reading the response body.
    ReadingResponse,
}
