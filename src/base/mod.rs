//! Base types and error handling.
//!
//! - [`NetError`](neterror::NetError): error taxonomy with Chromium-style codes
//! - [`LoadState`](loadstate::LoadState): request progress reporting

pub mod context;
pub mod loadstate;
pub mod neterror;
