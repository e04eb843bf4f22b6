//! Incremental HTTP/1.x response parser.
//!
//! Bytes are pushed with [`ResponseParser::feed`] and structured events are
//! pulled with [`ResponseParser::next_event`]. After a [`ParserEvent::Head`]
//! the owner decides how the message continues through
//! [`ResponseParser::set_disposition`]: normal body framing, no body at all
//! (HEAD, 1xx) or a protocol switch where parsing stops at the end of the
//! headers.
//!
//! Like a wire parser, it keeps going after a message completes: bytes that
//! follow are parsed as the next response on the connection.

use crate::base::neterror::NetError;
use crate::http::orderedheaders::OrderedHeaderMap;
use crate::http::response::{status_is_informational, ResponseHead};
use bytes::{Buf, Bytes, BytesMut};
use http::{Method, StatusCode, Version};

/// Largest status line + header block accepted.
pub const MAX_HEAD_SIZE: usize = 80 * 1024;
/// Default number of header pairs kept per response.
pub const DEFAULT_MAX_HEADERS: usize = 2000;
const INITIAL_HEADER_SLOTS: usize = 64;
/// A header line is at least `N:\r\n`.
const MAX_HEADER_SLOTS: usize = MAX_HEAD_SIZE / 4;
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// What the parser needs to know about the request it is parsing for.
#[derive(Debug, Clone)]
pub struct ParserContext {
    pub method: Method,
    /// Header pairs kept on the head; the rest are dropped. Zero keeps all.
    pub max_headers: usize,
}

impl ParserContext {
    pub fn new(method: Method) -> Self {
        Self { method, max_headers: DEFAULT_MAX_HEADERS }
    }
}

#[derive(Debug)]
pub enum ParserEvent {
    /// A status line and header block.
    Head(ResponseHead),
    /// A slice of the message body, framing removed.
    Body(Bytes),
    /// The current message is done.
    MessageComplete { informational: bool },
    /// Parsing stopped at the header boundary; everything after it.
    Upgrade { body_head: Bytes },
}

/// How the message following a head is to be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadDisposition {
    Normal,
    SkipBody,
    Upgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunked {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug)]
enum State {
    Head,
    AwaitDisposition { framing: Framing, informational: bool },
    Length(u64),
    Chunked(Chunked),
    Eof,
    Complete { informational: bool },
    UpgradePending,
    Upgraded,
    Finished,
}

#[derive(Debug)]
pub struct ResponseParser {
    ctx: ParserContext,
    buf: BytesMut,
    state: State,
    bytes_parsed: usize,
}

impl ResponseParser {
    pub fn new(ctx: ParserContext) -> Self {
        Self { ctx, buf: BytesMut::new(), state: State::Head, bytes_parsed: 0 }
    }

    /// Queue bytes read from the connection.
    pub fn feed(&mut self, data: &[u8]) {
        if matches!(self.state, State::Upgraded | State::Finished) {
            return;
        }
        self.buf.extend_from_slice(data);
    }

    /// Total bytes consumed so far.
    pub fn bytes_parsed(&self) -> usize {
        self.bytes_parsed
    }

    /// Unconsumed bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Choose how the message whose head was just returned continues.
    pub fn set_disposition(&mut self, disposition: HeadDisposition) {
        let State::AwaitDisposition { framing, informational } = self.state else {
            return;
        };
        self.state = match disposition {
            HeadDisposition::Upgrade => State::UpgradePending,
            HeadDisposition::SkipBody => State::Complete { informational },
            HeadDisposition::Normal => match framing {
                Framing::Empty | Framing::Length(0) => State::Complete { informational },
                Framing::Length(n) => State::Length(n),
                Framing::Chunked => State::Chunked(Chunked::Size),
                Framing::Eof => State::Eof,
            },
        };
    }

    /// Pull the next event, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<ParserEvent>, NetError> {
        loop {
            match self.state {
                State::Head => return self.parse_head(),
                State::AwaitDisposition { .. } => self.set_disposition(HeadDisposition::Normal),
                State::Complete { informational } => {
                    self.state = State::Head;
                    return Ok(Some(ParserEvent::MessageComplete { informational }));
                }
                State::UpgradePending => {
                    self.state = State::Upgraded;
                    let body_head = self.buf.split().freeze();
                    return Ok(Some(ParserEvent::Upgrade { body_head }));
                }
                State::Upgraded | State::Finished => return Ok(None),
                State::Eof => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(ParserEvent::Body(self.take_body(self.buf.len()))));
                }
                State::Length(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let n = remaining.min(self.buf.len() as u64);
                    let chunk = self.take_body(n as usize);
                    self.state = if n == remaining {
                        State::Complete { informational: false }
                    } else {
                        State::Length(remaining - n)
                    };
                    return Ok(Some(ParserEvent::Body(chunk)));
                }
                State::Chunked(step) => {
                    if let Some(event) = self.step_chunked(step)? {
                        return Ok(Some(event));
                    }
                    if matches!(self.state, State::Chunked(s) if s == step) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Signal end of stream. Completes a close-delimited body.
    pub fn finish(&mut self) -> Result<Option<ParserEvent>, NetError> {
        let state = std::mem::replace(&mut self.state, State::Finished);
        match state {
            State::Eof => Ok(Some(ParserEvent::MessageComplete { informational: false })),
            State::Head if self.buf.is_empty() => Ok(None),
            State::Upgraded | State::UpgradePending | State::Finished => Ok(None),
            State::Complete { informational } => {
                Ok(Some(ParserEvent::MessageComplete { informational }))
            }
            _ => Err(self.error("Invalid EOF state")),
        }
    }

    fn take_body(&mut self, n: usize) -> Bytes {
        self.bytes_parsed += n;
        self.buf.split_to(n).freeze()
    }

    fn advance(&mut self, n: usize) {
        self.bytes_parsed += n;
        self.buf.advance(n);
    }

    fn error(&self, reason: &str) -> NetError {
        NetError::ParseError {
            reason: reason.to_string(),
            bytes_parsed: self.bytes_parsed,
            raw_packet: Bytes::copy_from_slice(&self.buf),
        }
    }

    fn parse_head(&mut self) -> Result<Option<ParserEvent>, NetError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        // Header storage grows until the whole head fits.
        let mut slots = INITIAL_HEADER_SLOTS;
        let (len, code, reason, version, mut headers) = loop {
            let mut storage = vec![httparse::EMPTY_HEADER; slots];
            let mut res = httparse::Response::new(&mut storage);
            match res.parse(&self.buf) {
                Ok(httparse::Status::Complete(len)) => {
                    let mut headers = OrderedHeaderMap::new();
                    for h in res.headers.iter() {
                        headers.append_raw(
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        );
                    }
                    break (
                        len,
                        res.code.unwrap_or_default(),
                        res.reason.unwrap_or_default().to_string(),
                        res.version,
                        headers,
                    );
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > MAX_HEAD_SIZE {
                        return Err(self.error("Header overflow"));
                    }
                    return Ok(None);
                }
                Err(httparse::Error::TooManyHeaders) if slots < MAX_HEADER_SLOTS => {
                    slots = (slots * 2).min(MAX_HEADER_SLOTS);
                }
                Err(httparse::Error::TooManyHeaders) => return Err(self.error("Header overflow")),
                Err(e) => return Err(self.error(&e.to_string())),
            }
        };

        let status = StatusCode::from_u16(code).map_err(|_| self.error("Invalid status code"))?;
        let version = if version == Some(0) { Version::HTTP_10 } else { Version::HTTP_11 };

        let framing = self.framing(status, &headers)?;
        let informational = status_is_informational(status);
        let switching = status == StatusCode::SWITCHING_PROTOCOLS;
        let upgrade = switching
            && headers.contains("Upgrade")
            && headers.has_token("Connection", "upgrade");

        let needs_eof = framing == Framing::Eof && self.ctx.method != Method::HEAD;
        let persistent = if version == Version::HTTP_11 {
            !headers.has_token("Connection", "close")
        } else {
            headers.has_token("Connection", "keep-alive")
        };
        // A 101 without a usable Upgrade leaves the stream in an unknown protocol.
        let should_keep_alive = persistent && !needs_eof && !switching;

        if self.ctx.max_headers > 0 && headers.len() > self.ctx.max_headers {
            tracing::trace!(
                received = headers.len(),
                kept = self.ctx.max_headers,
                "dropping excess response headers"
            );
            headers.truncate(self.ctx.max_headers);
        }

        self.advance(len);
        tracing::trace!(status = code, bytes = len, "parsed response head");
        self.state = State::AwaitDisposition { framing, informational };

        Ok(Some(ParserEvent::Head(ResponseHead::new(
            status,
            reason,
            version,
            headers,
            upgrade,
            should_keep_alive,
        ))))
    }

    fn framing(&self, status: StatusCode, headers: &OrderedHeaderMap) -> Result<Framing, NetError> {
        let code = status.as_u16();
        if (100..200).contains(&code) || code == 204 || code == 304 {
            return Ok(Framing::Empty);
        }

        if headers.contains("Transfer-Encoding") {
            let last = headers
                .get_all("Transfer-Encoding")
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .last();
            return Ok(match last {
                Some(coding) if coding.eq_ignore_ascii_case("chunked") => Framing::Chunked,
                _ => Framing::Eof,
            });
        }

        let mut length = None;
        for value in headers.get_all("Content-Length").flat_map(|v| v.split(',')) {
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(self.error("Invalid character in Content-Length"));
            }
            let n: u64 = value.parse().map_err(|_| self.error("Content-Length overflow"))?;
            match length {
                Some(prev) if prev != n => return Err(self.error("Duplicate Content-Length")),
                _ => length = Some(n),
            }
        }

        Ok(length.map_or(Framing::Eof, Framing::Length))
    }

    /// Advance the chunked decoder by one step.
    fn step_chunked(&mut self, step: Chunked) -> Result<Option<ParserEvent>, NetError> {
        match step {
            Chunked::Size => {
                let Some(line_end) = find_crlf(&self.buf) else {
                    if self.buf.len() > MAX_CHUNK_SIZE_LINE {
                        return Err(self.error("Chunk size line too long"));
                    }
                    return Ok(None);
                };
                let line = &self.buf[..line_end];
                let size_part = line.split(|&b| b == b';').next().unwrap_or_default();
                let size_str = std::str::from_utf8(size_part)
                    .map(str::trim)
                    .map_err(|_| self.error("Invalid character in chunk size"))?;
                let size = u64::from_str_radix(size_str, 16)
                    .map_err(|_| self.error("Invalid character in chunk size"))?;
                self.advance(line_end + 2);
                self.state =
                    State::Chunked(if size == 0 { Chunked::Trailers } else { Chunked::Data(size) });
                Ok(None)
            }
            Chunked::Data(remaining) => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let n = remaining.min(self.buf.len() as u64);
                let chunk = self.take_body(n as usize);
                self.state = State::Chunked(if n == remaining {
                    Chunked::DataEnd
                } else {
                    Chunked::Data(remaining - n)
                });
                Ok(Some(ParserEvent::Body(chunk)))
            }
            Chunked::DataEnd => {
                if self.buf.len() < 2 {
                    return Ok(None);
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(self.error("Expected CRLF after chunk"));
                }
                self.advance(2);
                self.state = State::Chunked(Chunked::Size);
                Ok(None)
            }
            Chunked::Trailers => {
                let Some(line_end) = find_crlf(&self.buf) else {
                    if self.buf.len() > MAX_HEAD_SIZE {
                        return Err(self.error("Header overflow"));
                    }
                    return Ok(None);
                };
                self.advance(line_end + 2);
                if line_end == 0 {
                    self.state = State::Complete { informational: false };
                }
                Ok(None)
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
