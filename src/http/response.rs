//! HTTP response types.
//!
//! [`ResponseHead`] is what the parser hands to the request state machine;
//! [`HttpResponse`] is the user-facing, fully collected response returned by
//! [`RequestBuilder::send`](crate::client::RequestBuilder::send).

use crate::base::neterror::NetError;
use crate::http::orderedheaders::OrderedHeaderMap;
use bytes::Bytes;
use http::{StatusCode, Version};

/// 100 Continue, 102 Processing, 103 Early Hints and the unassigned
/// 104-199 range. 101 Switching Protocols is a full upgrade, not a
/// provisional status.
pub fn status_is_informational(status: StatusCode) -> bool {
    let code = status.as_u16();
    (100..200).contains(&code) && code != 101
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    status: StatusCode,
    reason: String,
    version: Version,
    headers: OrderedHeaderMap,
    upgrade: bool,
    should_keep_alive: bool,
}

impl ResponseHead {
    pub(crate) fn new(
        status: StatusCode,
        reason: String,
        version: Version,
        headers: OrderedHeaderMap,
        upgrade: bool,
        should_keep_alive: bool,
    ) -> Self {
        Self { status, reason, version, headers, upgrade, should_keep_alive }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase exactly as the server sent it.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &OrderedHeaderMap {
        &self.headers
    }

    /// True for a 101 upgrade, or for any response to CONNECT.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    /// Whether the server agreed to keep the connection open.
    pub fn should_keep_alive(&self) -> bool {
        self.should_keep_alive
    }

    pub fn is_informational(&self) -> bool {
        status_is_informational(self.status)
    }

    pub(crate) fn force_upgrade(&mut self) {
        self.upgrade = true;
    }
}

/// The response currently associated with a request.
#[derive(Debug)]
pub(crate) struct IncomingResponse {
    pub(crate) head: ResponseHead,
    pub(crate) complete: bool,
    pub(crate) aborted: bool,
    /// Body is drained without being delivered.
    pub(crate) dumped: bool,
}

impl IncomingResponse {
    pub(crate) fn new(head: ResponseHead) -> Self {
        Self { head, complete: false, aborted: false, dumped: false }
    }

    pub(crate) fn dump(&mut self) {
        self.dumped = true;
    }
}

/// HTTP Response with its body fully read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    head: ResponseHead,
    body: Bytes,
}

impl HttpResponse {
    pub(crate) fn new(head: ResponseHead, body: Bytes) -> Self {
        Self { head, body }
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    /// Get the HTTP version.
    pub fn version(&self) -> Version {
        self.head.version()
    }

    /// Get a reference to the headers.
    pub fn headers(&self) -> &OrderedHeaderMap {
        self.head.headers()
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// Consume the response, returning the raw body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Consume body as UTF-8 text.
    pub fn text(self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|_| NetError::InvalidUtf8)
    }

    /// Consume body as JSON.
    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(NetError::Json)
    }
}
