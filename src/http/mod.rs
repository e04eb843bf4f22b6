//! HTTP/1.1 client protocol engine.
//!
//! - [`request`]: the per-request state machine ([`ClientRequest`])
//! - [`parser`]: incremental response parser
//! - [`outgoing`]: header block rendering and body framing
//! - [`keepalive`]: connection release bookkeeping
//! - [`events`]: notifications raised to the caller

pub mod events;
pub mod keepalive;
pub mod orderedheaders;
pub mod outgoing;
pub mod parser;
pub mod request;
pub mod response;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use events::{Detached, Handoff, RequestEvent};
pub use orderedheaders::OrderedHeaderMap;
pub use request::{AgentMode, ClientRequest, ConnAction, RequestOptions, RequestState};
pub use response::{HttpResponse, ResponseHead};
