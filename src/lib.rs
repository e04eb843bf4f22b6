//! # h1client
//!
//! An HTTP/1.1 client request engine for Rust.
//!
//! `h1client` drives one request at a time over a pooled or dedicated
//! connection: it renders the request head, frames the body, parses the
//! response, and decides whether the connection can be handed back for
//! reuse once both sides of the exchange are done.
//!
//! ## Features
//!
//! - **Connection Pooling**: per-host limits with FIFO waiters and idle reuse
//! - **Keep-Alive**: connections are released only after request and response both finish
//! - **Upgrade & CONNECT**: the raw connection is handed to the caller with any read-ahead bytes
//! - **Informational responses**: `100 Continue` and other 1xx heads surface as events
//! - **Idle timeouts**: advisory timeout events, abort left to the caller
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use h1client::Client;
//!
//! #[tokio::main]
//! async fn main() {
//!     let response = Client::new()
//!         .get("http://example.com/")
//!         .send()
//!         .await
//!         .unwrap();
//!     println!("Status: {}", response.status());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error definitions and load states
//! - [`http`] - The request state machine, response parser and header handling
//! - [`socket`] - Connection pooling and the task that binds requests to sockets
//! - [`client`] - High-level request API

pub mod base;
pub mod client;
pub mod http;
pub mod socket;

pub use crate::base::neterror::NetError;
pub use crate::client::{Client, ClientBuilder, RequestBuilder, RequestHandle};
pub use crate::http::{ClientRequest, HttpResponse, RequestEvent, RequestOptions, ResponseHead};
pub use crate::socket::pool::{Allocator, ClientSocketPool, PoolConfig, Target};
