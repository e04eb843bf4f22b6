//! Outgoing request serialization: header block rendering and body framing.

use crate::base::neterror::NetError;
use crate::http::orderedheaders::OrderedHeaderMap;
use bytes::{BufMut, Bytes, BytesMut};
use http::Method;

/// Terminator written by `end()` on a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// How body bytes are put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// Written as-is; length is declared by a header or implied by the method.
    Raw,
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// Methods that stream a body with chunked encoding unless told otherwise.
pub fn uses_chunked_by_default(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::TRACE | Method::CONNECT
    )
}

/// Append one chunk in `{len:x}\r\n{data}\r\n` form.
pub fn encode_chunk(data: &[u8], dst: &mut BytesMut) {
    let size = format!("{:x}\r\n", data.len());
    dst.reserve(size.len() + data.len() + 2);
    dst.put_slice(size.as_bytes());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// Request line, headers and buffered body of one outgoing message.
#[derive(Debug)]
pub struct OutgoingMessage {
    headers: OrderedHeaderMap,
    header: Option<Bytes>,
    header_flushed: bool,
    framing: BodyFraming,
    finished: bool,
    pending: BytesMut,
}

impl OutgoingMessage {
    pub fn new(headers: OrderedHeaderMap) -> Self {
        Self {
            headers,
            header: None,
            header_flushed: false,
            framing: BodyFraming::Raw,
            finished: false,
            pending: BytesMut::new(),
        }
    }

    pub fn headers(&self) -> &OrderedHeaderMap {
        &self.headers
    }

    /// True once the header block is rendered and frozen.
    pub fn headers_sent(&self) -> bool {
        self.header.is_some()
    }

    pub fn header_block(&self) -> Option<&Bytes> {
        self.header.as_ref()
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), NetError> {
        if self.headers_sent() {
            return Err(NetError::HeadersAlreadySent { action: "set" });
        }
        self.headers.insert(name, value)
    }

    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), NetError> {
        if self.headers_sent() {
            return Err(NetError::HeadersAlreadySent { action: "append" });
        }
        self.headers.append(name, value)
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), NetError> {
        if self.headers_sent() {
            return Err(NetError::HeadersAlreadySent { action: "remove" });
        }
        self.headers.remove(name);
        Ok(())
    }

    /// Freeze the header block.
    ///
    /// Adds `Connection` and body-length headers the caller did not set.
    /// Returns the keep-alive intent after the caller's own `Connection`
    /// header has been taken into account.
    pub fn render(
        &mut self,
        request_line: &[u8],
        method: &Method,
        keep_alive: bool,
        known_length: Option<u64>,
    ) -> bool {
        if self.header.is_some() {
            return keep_alive;
        }

        let mut keep_alive = keep_alive;
        let mut block = BytesMut::with_capacity(request_line.len() + 256);
        block.put_slice(request_line);
        self.headers.write_to(&mut block);

        if self.headers.contains("Connection") {
            if self.headers.has_token("Connection", "close") {
                keep_alive = false;
            }
        } else if keep_alive {
            block.put_slice(b"Connection: keep-alive\r\n");
        } else {
            block.put_slice(b"Connection: close\r\n");
        }

        let has_length = self.headers.contains("Content-Length");
        let has_te = self.headers.contains("Transfer-Encoding");
        if has_te {
            if self.headers.has_token("Transfer-Encoding", "chunked") {
                self.framing = BodyFraming::Chunked;
            }
        } else if !has_length {
            match known_length {
                Some(0) if !uses_chunked_by_default(method) => {}
                Some(n) => block.put_slice(format!("Content-Length: {}\r\n", n).as_bytes()),
                None if uses_chunked_by_default(method) => {
                    block.put_slice(b"Transfer-Encoding: chunked\r\n");
                    self.framing = BodyFraming::Chunked;
                }
                None => {}
            }
        }

        block.put_slice(b"\r\n");
        self.header = Some(block.freeze());
        keep_alive
    }

    /// Queue body bytes, framed for the wire.
    pub fn write(&mut self, data: &[u8]) -> Result<(), NetError> {
        if self.finished {
            return Err(NetError::WriteAfterEnd);
        }
        if data.is_empty() {
            return Ok(());
        }
        match self.framing {
            BodyFraming::Chunked => encode_chunk(data, &mut self.pending),
            BodyFraming::Raw => self.pending.extend_from_slice(data),
        }
        Ok(())
    }

    /// Mark the body complete, queueing the chunked terminator if needed.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.framing == BodyFraming::Chunked {
            self.pending.extend_from_slice(LAST_CHUNK);
        }
    }

    /// Everything not yet handed to the connection: the header block on the
    /// first call, followed by buffered body bytes.
    pub fn take_pending(&mut self) -> Option<Bytes> {
        let header = match (&self.header, self.header_flushed) {
            (Some(h), false) => Some(h.clone()),
            _ => None,
        };
        if header.is_none() && self.pending.is_empty() {
            return None;
        }

        let Some(header) = header else {
            return Some(self.pending.split().freeze());
        };
        self.header_flushed = true;
        if self.pending.is_empty() {
            return Some(header);
        }
        let mut out = BytesMut::with_capacity(header.len() + self.pending.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.pending);
        self.pending.clear();
        Some(out.freeze())
    }

    /// Drop unsent output; the connection it was meant for is gone.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }
}
