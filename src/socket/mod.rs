//! Socket and connection management.
//!
//! - [`pool`]: connection allocation (6 per host, 256 total by default)
//! - [`connectjob`]: DNS → TCP connection flow
//! - [`stream`]: the boxed connection type and liveness checks
//! - [`binder`]: runs a request against a real connection

pub mod binder;
pub mod connectjob;
pub mod pool;
pub mod stream;
