//! Connection release bookkeeping.
//!
//! A connection is handed back to its allocator only once both sides of the
//! exchange are done: the request body has been fully written and the
//! response has been fully read. Either may happen first.

/// What to do with the connection once the exchange is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// Return the connection to the allocator for another request.
    Reuse,
    /// Close it; `graceful` sends a FIN first when the socket is writable.
    Close { graceful: bool },
}

/// Fires exactly once, after both completion flags are set.
#[derive(Debug, Default, Clone)]
pub struct ReleaseGate {
    request_ended: bool,
    response_complete: bool,
    fired: bool,
}

impl ReleaseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the request side finished. Returns true if the gate fires.
    pub fn request_ended(&mut self) -> bool {
        self.request_ended = true;
        self.try_fire()
    }

    /// Record that the response side finished. Returns true if the gate fires.
    pub fn response_complete(&mut self) -> bool {
        self.response_complete = true;
        self.try_fire()
    }

    pub fn is_request_ended(&self) -> bool {
        self.request_ended
    }

    fn try_fire(&mut self) -> bool {
        if self.fired || !self.request_ended || !self.response_complete {
            return false;
        }
        self.fired = true;
        true
    }
}

/// Decide the fate of a connection whose exchange just completed.
pub fn decide(keep_alive: bool, writable: bool) -> ReleaseDecision {
    if keep_alive {
        ReleaseDecision::Reuse
    } else {
        ReleaseDecision::Close { graceful: writable }
    }
}
