//! The per-request HTTP/1.1 client state machine.
//!
//! [`ClientRequest`] performs no I/O. The driver that owns the connection
//! feeds it connection events (`on_socket`, `on_data`, `on_end`, `on_close`,
//! `on_error`, `on_timeout`) and caller operations (`write`, `end`, `abort`,
//! `set_timeout`), then drains two queues:
//!
//! - [`poll_action`](ClientRequest::poll_action): what to do with the
//!   connection (write bytes, close it, return it to the allocator, ...).
//! - [`poll_event`](ClientRequest::poll_event): notifications for the caller,
//!   in the order they were raised.
//!
//! Every input is handled to completion before the next one, so the core
//! needs no locking and firing order is exactly the order of the queue.

use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::http::events::{Detached, Handoff, RequestEvent};
use crate::http::keepalive::{decide, ReleaseDecision, ReleaseGate};
use crate::http::orderedheaders::OrderedHeaderMap;
use crate::http::outgoing::OutgoingMessage;
use crate::http::parser::{
    HeadDisposition, ParserContext, ParserEvent, ResponseParser, DEFAULT_MAX_HEADERS,
};
use crate::http::response::{IncomingResponse, ResponseHead};
use crate::socket::pool::{Allocator, Target};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{Method, StatusCode};
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

/// Whether the request borrows pooled connections or gets one of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentMode {
    #[default]
    Pooled,
    /// A fresh connection used once and destroyed afterwards.
    Exclusive,
}

/// Caller-supplied request parameters.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Option<String>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Send `headers` exactly as given: no Host or Authorization injection,
    /// header block rendered at construction.
    pub verbatim_headers: bool,
    /// `user:password` for Basic authentication.
    pub auth: Option<String>,
    pub timeout: Option<Duration>,
    pub keep_alive: Option<bool>,
    pub set_host: bool,
    pub max_headers_count: Option<usize>,
    pub agent: AgentMode,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: None,
            protocol: None,
            host: None,
            hostname: None,
            port: None,
            path: "/".to_string(),
            headers: Vec::new(),
            verbatim_headers: false,
            auth: None,
            timeout: None,
            keep_alive: None,
            set_host: true,
            max_headers_count: None,
            agent: AgentMode::Pooled,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for `url`: protocol, hostname, port, path with query, and
    /// credentials as `auth`.
    pub fn from_url(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let hostname = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let auth = match (url.username(), url.password()) {
            ("", None) => None,
            (user, pass) => Some(format!("{}:{}", user, pass.unwrap_or_default())),
        };

        Ok(Self {
            protocol: Some(format!("{}:", url.scheme())),
            hostname: Some(hostname),
            port: url.port(),
            path,
            auth,
            ..Self::default()
        })
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn verbatim_headers(mut self, verbatim: bool) -> Self {
        self.verbatim_headers = verbatim;
        self
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn set_host(mut self, set_host: bool) -> Self {
        self.set_host = set_host;
        self
    }

    pub fn max_headers_count(mut self, count: usize) -> Self {
        self.max_headers_count = Some(count);
        self
    }

    pub fn agent(mut self, agent: AgentMode) -> Self {
        self.agent = agent;
        self
    }
}

/// Request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Unbound,
    Bound,
    HeadersSent,
    AwaitingResponse,
    ResponseActive,
    Completed,
    Aborted,
    Errored,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Aborted | RequestState::Errored)
    }

    fn to_load_state(self) -> LoadState {
        match self {
            RequestState::Unbound => LoadState::WaitingForAvailableSocket,
            RequestState::Bound | RequestState::HeadersSent => LoadState::SendingRequest,
            RequestState::AwaitingResponse => LoadState::WaitingForResponse,
            RequestState::ResponseActive => LoadState::ReadingResponse,
            _ => LoadState::Idle,
        }
    }
}

/// Instructions for whoever owns the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnAction {
    Write(Bytes),
    /// Flush, send FIN, then close.
    Shutdown,
    /// Close immediately.
    Destroy,
    /// Give the connection back to the allocator. Deliver queued events first.
    Release,
    /// Stop driving the connection; it goes to the caller with the next
    /// `Upgrade` or `Connect` event.
    Detach,
    ArmTimer(Duration),
    DisarmTimer,
}

/// Which connection events the request is still listening to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Subscriptions {
    pub data: bool,
    pub end: bool,
    pub close: bool,
    pub error: bool,
    /// Set once the connection is idle and owned by no request.
    pub idle_error: bool,
}

impl Subscriptions {
    fn bound() -> Self {
        Self { data: true, end: true, close: true, error: true, idle_error: false }
    }
}

/// Where the connection stands from the request's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Unbound,
    Attached,
    /// Destroy or Shutdown requested, waiting for `on_close`.
    Closing,
    Closed,
    Released,
    Detached,
}

pub struct ClientRequest {
    method: Method,
    path: String,
    target: Target,
    out: OutgoingMessage,
    keep_alive: bool,
    agent: AgentMode,
    timeout: Option<Duration>,
    max_headers: usize,

    state: RequestState,
    link: Link,
    subs: Subscriptions,
    writable: bool,
    reused: bool,
    timer_armed: bool,

    upgrade_listener: bool,
    connect_listener: bool,
    upgrade_or_connect: bool,

    parser: Option<ResponseParser>,
    response: Option<IncomingResponse>,
    response_ended: bool,
    gate: ReleaseGate,

    had_error: bool,
    aborted: bool,
    close_emitted: bool,

    events: VecDeque<RequestEvent>,
    actions: VecDeque<ConnAction>,
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Bracket IPv6 literals and append the port when it is not the default.
fn host_header(host: &str, port: u16, default_port: u16) -> String {
    let mut value = if host.matches(':').count() >= 2 && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    if port != default_port {
        value.push(':');
        value.push_str(&port.to_string());
    }
    value
}

fn valid_path(path: &str) -> bool {
    path.chars().all(|c| ('\u{21}'..='\u{ff}').contains(&c))
}

impl ClientRequest {
    /// Validate `options` and build the request.
    ///
    /// Fails before any connection is requested on a bad method, path,
    /// header or protocol.
    pub fn new(options: RequestOptions, allocator: &dyn Allocator) -> Result<Self, NetError> {
        let protocol = options.protocol.as_deref().unwrap_or(allocator.protocol());
        if protocol != allocator.protocol() {
            return Err(NetError::ProtocolMismatch {
                protocol: protocol.to_string(),
                expected: allocator.protocol().to_string(),
            });
        }

        let method = match options.method.as_deref() {
            None | Some("") => Method::GET,
            Some(m) => {
                let parsed = Method::from_bytes(m.as_bytes()).map_err(|_| NetError::InvalidToken {
                    what: "Method",
                    value: m.to_string(),
                })?;
                let upper = parsed.as_str().to_ascii_uppercase();
                Method::from_bytes(upper.as_bytes()).unwrap_or(parsed)
            }
        };

        if !valid_path(&options.path) {
            return Err(NetError::UnescapedCharacters { what: "Request path" });
        }

        let host = options
            .hostname
            .clone()
            .or_else(|| options.host.clone())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let default_port = allocator.default_port();
        let port = options.port.unwrap_or(default_port);

        let mut headers = OrderedHeaderMap::new();
        for (name, value) in &options.headers {
            headers.append(name, value)?;
        }

        if !options.verbatim_headers {
            if options.set_host && !headers.contains("Host") {
                headers.insert("Host", &host_header(&host, port, default_port))?;
            }
            if let Some(auth) = &options.auth {
                if !headers.contains("Authorization") {
                    let value = format!("Basic {}", STANDARD.encode(auth.as_bytes()));
                    headers.insert("Authorization", &value)?;
                }
            }
        }

        let keep_alive = match options.agent {
            AgentMode::Exclusive => false,
            AgentMode::Pooled => options
                .keep_alive
                .unwrap_or_else(|| allocator.keep_alive() || allocator.max_sockets().is_some()),
        };

        let mut req = Self {
            method,
            path: options.path,
            target: Target::new(host, port),
            out: OutgoingMessage::new(headers),
            keep_alive,
            agent: options.agent,
            timeout: options.timeout.or_else(|| allocator.timeout()),
            max_headers: options.max_headers_count.unwrap_or(DEFAULT_MAX_HEADERS),
            state: RequestState::Unbound,
            link: Link::Unbound,
            subs: Subscriptions::default(),
            writable: false,
            reused: false,
            timer_armed: false,
            upgrade_listener: false,
            connect_listener: false,
            upgrade_or_connect: false,
            parser: None,
            response: None,
            response_ended: false,
            gate: ReleaseGate::new(),
            had_error: false,
            aborted: false,
            close_emitted: false,
            events: VecDeque::new(),
            actions: VecDeque::new(),
        };

        // The caller waits for `100 Continue` before streaming a body, so
        // the head cannot wait for the first write.
        if options.verbatim_headers || req.out.headers().contains("Expect") {
            req.render_head(None);
        }

        tracing::debug!(method = %req.method, path = %req.path, target = %req.target, "request created");
        Ok(req)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Get the current load state (for progress reporting).
    pub fn load_state(&self) -> LoadState {
        self.state.to_load_state()
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn agent(&self) -> AgentMode {
        self.agent
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn headers(&self) -> &OrderedHeaderMap {
        self.out.headers()
    }

    pub fn headers_sent(&self) -> bool {
        self.out.headers_sent()
    }

    /// The rendered request line and header block, once frozen.
    pub fn header_block(&self) -> Option<&Bytes> {
        self.out.header_block()
    }

    pub fn subscriptions(&self) -> Subscriptions {
        self.subs
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// True once `end` was called.
    pub fn is_finished(&self) -> bool {
        self.out.is_finished()
    }

    pub fn reused_socket(&self) -> bool {
        self.reused
    }

    pub fn response(&self) -> Option<&ResponseHead> {
        self.response.as_ref().map(|r| &r.head)
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), NetError> {
        self.out.set_header(name, value)
    }

    pub fn append_header(&mut self, name: &str, value: &str) -> Result<(), NetError> {
        self.out.append_header(name, value)
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), NetError> {
        self.out.remove_header(name)
    }

    /// Declare that the caller takes over the connection on `101`.
    pub fn set_upgrade_listener(&mut self, listening: bool) {
        self.upgrade_listener = listening;
    }

    /// Declare that the caller takes over the connection after CONNECT.
    pub fn set_connect_listener(&mut self, listening: bool) {
        self.connect_listener = listening;
    }

    pub fn poll_event(&mut self) -> Option<RequestEvent> {
        self.events.pop_front()
    }

    pub fn poll_action(&mut self) -> Option<ConnAction> {
        self.actions.pop_front()
    }

    /// True once nothing more can happen on this request.
    pub fn is_done(&self) -> bool {
        self.close_emitted && self.actions.is_empty() && self.events.is_empty()
    }

    fn emit(&mut self, event: RequestEvent) {
        tracing::trace!(event = event.name(), "request event");
        self.events.push_back(event);
    }

    fn emit_close(&mut self) {
        if !self.close_emitted {
            self.close_emitted = true;
            self.emit(RequestEvent::Close);
        }
    }

    /// Report an I/O-derived error, at most once and never after abort.
    fn emit_error(&mut self, err: NetError) {
        if self.had_error {
            tracing::trace!(error = %err, "suppressing repeated error");
            return;
        }
        self.had_error = true;
        if self.aborted {
            return;
        }
        tracing::debug!(error = %err, target = %self.target, "request error");
        self.emit(RequestEvent::Error(err));
        if !self.state.is_terminal() {
            self.state = RequestState::Errored;
        }
    }

    fn destroy(&mut self) {
        if self.link == Link::Attached {
            self.link = Link::Closing;
            self.writable = false;
            self.actions.push_back(ConnAction::Destroy);
        }
    }

    fn shutdown(&mut self) {
        if self.link == Link::Attached {
            self.link = Link::Closing;
            self.writable = false;
            self.actions.push_back(ConnAction::Shutdown);
        }
    }

    fn disarm_timer(&mut self) {
        if self.timer_armed {
            self.timer_armed = false;
            self.actions.push_back(ConnAction::DisarmTimer);
        }
    }

    fn render_head(&mut self, known_length: Option<u64>) {
        // Path chars are validated to fit in one byte; send them as latin1.
        let mut line = Vec::with_capacity(self.method.as_str().len() + self.path.len() + 12);
        line.extend_from_slice(self.method.as_str().as_bytes());
        line.push(b' ');
        line.extend(self.path.chars().map(|c| c as u8));
        line.extend_from_slice(b" HTTP/1.1\r\n");
        self.keep_alive = self.out.render(&line, &self.method, self.keep_alive, known_length);
    }

    /// Queue body bytes. The header block is frozen on the first call.
    pub fn write(&mut self, data: &[u8]) -> Result<(), NetError> {
        if self.out.is_finished() {
            return Err(NetError::WriteAfterEnd);
        }
        if !self.out.headers_sent() {
            self.render_head(None);
        }
        self.out.write(data)?;
        self.flush();
        Ok(())
    }

    /// Finish the request, optionally with a last piece of body.
    ///
    /// When nothing was written yet, the whole body is known and sent with a
    /// `Content-Length`.
    pub fn end(&mut self, data: Option<&[u8]>) -> Result<(), NetError> {
        if self.out.is_finished() {
            return Ok(());
        }
        let data = data.unwrap_or_default();
        if !self.out.headers_sent() {
            self.render_head(Some(data.len() as u64));
        }
        self.out.write(data)?;
        self.out.finish();
        self.flush();
        Ok(())
    }

    /// Push buffered output to a writable connection and note when the whole
    /// request has gone out.
    fn flush(&mut self) {
        if self.link != Link::Attached || !self.writable {
            return;
        }
        if let Some(bytes) = self.out.take_pending() {
            if self.state == RequestState::Bound {
                self.state = RequestState::HeadersSent;
            }
            self.actions.push_back(ConnAction::Write(bytes));
        }
        if self.out.is_finished() && self.out.headers_sent() && !self.gate.is_request_ended() {
            if matches!(self.state, RequestState::Bound | RequestState::HeadersSent) {
                self.state = RequestState::AwaitingResponse;
            }
            if self.gate.request_ended() {
                self.response_keep_alive();
            }
        }
    }

    /// A connection is available for this request.
    pub fn on_socket(&mut self, reused: bool) {
        if self.link != Link::Unbound {
            return;
        }
        if self.aborted {
            // Aborted while waiting for a socket: hand it straight back.
            self.link = Link::Released;
            self.actions.push_back(match self.agent {
                AgentMode::Pooled => ConnAction::Release,
                AgentMode::Exclusive => ConnAction::Destroy,
            });
            self.emit_close();
            return;
        }

        self.link = Link::Attached;
        self.writable = true;
        self.reused = reused;
        self.subs = Subscriptions::bound();
        self.parser = Some(ResponseParser::new(ParserContext {
            method: self.method.clone(),
            max_headers: self.max_headers,
        }));
        self.state = RequestState::Bound;
        self.emit(RequestEvent::Socket { reused });

        if let Some(timeout) = self.timeout {
            self.timer_armed = true;
            self.actions.push_back(ConnAction::ArmTimer(timeout));
        }
        self.flush();
    }

    /// The allocator could not produce a connection.
    pub fn on_acquire_failed(&mut self, err: NetError) {
        if self.link != Link::Unbound {
            return;
        }
        self.link = Link::Closed;
        self.emit_error(err);
        self.emit_close();
    }

    pub fn on_data(&mut self, chunk: &[u8]) {
        if !self.subs.data {
            return;
        }
        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        parser.feed(chunk);

        let mut completed = false;
        loop {
            let next = match self.parser.as_mut() {
                Some(parser) => parser.next_event(),
                None => break,
            };
            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "response parse error");
                    self.parser = None;
                    self.destroy();
                    // The response itself arrived intact; only what follows is bad.
                    if completed {
                        self.on_message_complete();
                    }
                    self.emit_error(err);
                    return;
                }
            };

            match event {
                ParserEvent::Head(head) => match self.on_incoming(head) {
                    Some(disposition) => {
                        if let Some(parser) = self.parser.as_mut() {
                            parser.set_disposition(disposition);
                        }
                    }
                    None => break,
                },
                ParserEvent::Body(data) => {
                    if self.response.as_ref().is_some_and(|res| !res.dumped) {
                        self.emit(RequestEvent::Data(data));
                    }
                }
                ParserEvent::MessageComplete { informational: true } => {}
                ParserEvent::MessageComplete { informational: false } => completed = true,
                ParserEvent::Upgrade { body_head } => {
                    self.on_upgrade(body_head);
                    return;
                }
            }
        }

        if completed {
            self.on_message_complete();
        }
    }

    /// Handle a parsed response head. `None` means the connection was
    /// destroyed and the rest of the chunk must be ignored.
    fn on_incoming(&mut self, mut head: ResponseHead) -> Option<HeadDisposition> {
        if self.response.is_some() {
            tracing::debug!(target = %self.target, "server sent a second response");
            self.subs.data = false;
            self.destroy();
            return None;
        }

        if head.is_upgrade() {
            self.response = Some(IncomingResponse::new(head));
            return Some(HeadDisposition::Upgrade);
        }
        if self.method == Method::CONNECT {
            head.force_upgrade();
            self.response = Some(IncomingResponse::new(head));
            return Some(HeadDisposition::Upgrade);
        }

        if head.is_informational() {
            if head.status() == StatusCode::CONTINUE {
                self.emit(RequestEvent::Continue);
            }
            self.emit(RequestEvent::Information(head));
            return Some(HeadDisposition::SkipBody);
        }

        if self.keep_alive && !head.should_keep_alive() && !self.upgrade_or_connect {
            tracing::trace!("server did not agree to keep-alive");
            self.keep_alive = false;
        }

        if !self.state.is_terminal() {
            self.state = RequestState::ResponseActive;
        }
        let mut res = IncomingResponse::new(head.clone());
        if self.aborted {
            res.dump();
        }
        self.response = Some(res);
        self.emit(RequestEvent::Response(head));

        if self.method == Method::HEAD {
            Some(HeadDisposition::SkipBody)
        } else {
            Some(HeadDisposition::Normal)
        }
    }

    fn on_message_complete(&mut self) {
        let Some(res) = self.response.as_mut() else {
            return;
        };
        res.complete = true;

        // Bytes past the response mean the connection is out of sync.
        if self.parser.as_ref().is_some_and(|p| p.buffered() > 0) {
            tracing::debug!(target = %self.target, "unexpected data after response");
            self.keep_alive = false;
        }

        // Anything after this is not ours to interpret.
        self.subs.data = false;
        self.subs.end = false;
        self.parser = None;

        self.response_ended = true;
        self.emit(RequestEvent::ResponseEnd);
        self.disarm_timer();

        if self.gate.response_complete() {
            self.response_keep_alive();
        }
    }

    fn on_upgrade(&mut self, body_head: Bytes) {
        self.subs.data = false;
        self.subs.end = false;
        self.parser = None;

        let connect = self.method == Method::CONNECT;
        let listening = if connect { self.connect_listener } else { self.upgrade_listener };
        let Some(res) = self.response.as_mut() else {
            self.destroy();
            return;
        };
        res.complete = true;
        let response = res.head.clone();

        if !listening {
            // Nobody will drive the new protocol; don't leave it half-open.
            tracing::debug!(target = %self.target, connect, "unhandled upgrade, destroying");
            self.destroy();
            return;
        }

        let handoff = Handoff { response, connection: Detached, body_head };
        self.upgrade_or_connect = true;
        self.subs.close = false;
        self.subs.error = false;
        self.disarm_timer();
        self.link = Link::Detached;
        self.writable = false;
        self.actions.push_back(ConnAction::Detach);
        self.emit(if connect { RequestEvent::Connect(handoff) } else { RequestEvent::Upgrade(handoff) });
        self.emit_close();
        if !self.state.is_terminal() {
            self.state = RequestState::Completed;
        }
    }

    /// Both halves of the exchange are done: reuse or close the connection.
    fn response_keep_alive(&mut self) {
        if self.upgrade_or_connect || self.link != Link::Attached {
            if !self.state.is_terminal() {
                self.state = RequestState::Completed;
            }
            return;
        }

        match decide(self.keep_alive, self.writable) {
            ReleaseDecision::Reuse => {
                tracing::debug!(target = %self.target, "connection kept alive");
                self.disarm_timer();
                self.subs.close = false;
                self.subs.error = false;
                self.subs.idle_error = true;
                self.link = Link::Released;
                self.writable = false;
                if !self.state.is_terminal() {
                    self.state = RequestState::Completed;
                }
                self.emit_close();
                if self.response.is_some() {
                    self.emit(RequestEvent::ResponseClose);
                }
                self.actions.push_back(ConnAction::Release);
            }
            ReleaseDecision::Close { graceful } => {
                if !self.state.is_terminal() {
                    self.state = RequestState::Completed;
                }
                if graceful {
                    self.shutdown();
                } else {
                    self.destroy();
                }
            }
        }
    }

    /// The peer finished sending.
    pub fn on_end(&mut self) {
        self.writable = false;
        if self.subs.end {
            if self.response.is_none() {
                self.emit_error(NetError::socket_hang_up());
            }
            let finished = self.parser.as_mut().map(|p| p.finish());
            self.parser = None;
            match finished {
                Some(Ok(Some(ParserEvent::MessageComplete { informational: false }))) => {
                    self.on_message_complete();
                }
                Some(Err(err)) if self.response.is_some() => {
                    tracing::trace!(error = %err, "response truncated by end of stream");
                }
                _ => {}
            }
            if let Some(res) = self.response.as_mut() {
                if !res.complete {
                    res.aborted = true;
                }
            }
        }
        // No half-open reuse.
        if self.link == Link::Attached {
            self.destroy();
        }
    }

    /// The connection is gone.
    pub fn on_close(&mut self) {
        if !matches!(self.link, Link::Attached | Link::Closing) {
            return;
        }
        self.link = Link::Closed;
        self.writable = false;
        self.disarm_timer();
        if !self.subs.close {
            return;
        }
        self.subs = Subscriptions::default();

        if let Some(res) = self.response.as_mut() {
            let incomplete = !res.complete;
            if incomplete {
                res.aborted = true;
            }
            if incomplete {
                self.emit(RequestEvent::ResponseAborted);
            }
            self.emit_close();
            self.emit(RequestEvent::ResponseClose);
            if incomplete && !self.state.is_terminal() {
                self.state = RequestState::Errored;
            }
        } else {
            self.emit_error(NetError::socket_hang_up());
            self.emit_close();
        }

        self.out.clear_pending();
        self.parser = None;
        if !self.state.is_terminal() {
            self.state = RequestState::Completed;
        }
    }

    pub fn on_error(&mut self, err: NetError) {
        if !self.subs.error {
            if self.subs.idle_error {
                tracing::debug!(error = %err, "error on idle connection");
            }
            self.destroy();
            return;
        }
        self.emit_error(err);
        self.parser = None;
        self.subs.data = false;
        self.subs.end = false;
        self.destroy();
    }

    /// The idle timer expired. Advisory only.
    pub fn on_timeout(&mut self) {
        if !self.timer_armed {
            return;
        }
        self.timer_armed = false;
        self.emit(RequestEvent::Timeout);
    }

    /// Set the idle timeout; zero disarms it. Ignored once the response ended.
    pub fn set_timeout(&mut self, timeout: Duration) {
        if self.response_ended {
            return;
        }
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        if self.link != Link::Attached {
            return;
        }
        if timeout.is_zero() {
            self.disarm_timer();
        } else {
            self.timer_armed = true;
            self.actions.push_back(ConnAction::ArmTimer(timeout));
        }
    }

    /// Cancel the request. Only the first call has any effect.
    pub fn abort(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        tracing::debug!(target = %self.target, "request aborted");
        self.emit(RequestEvent::Abort);
        if let Some(res) = self.response.as_mut() {
            res.dump();
        }
        if !self.state.is_terminal() {
            self.state = RequestState::Aborted;
        }
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::pool::{ClientSocketPool, PoolConfig};

    fn pool() -> ClientSocketPool {
        ClientSocketPool::new(PoolConfig::default())
    }

    #[test]
    fn test_host_header() {
        assert_eq!(host_header("example.com", 80, 80), "example.com");
        assert_eq!(host_header("example.com", 8080, 80), "example.com:8080");
        assert_eq!(host_header("::1", 80, 80), "[::1]");
        assert_eq!(host_header("::1", 3000, 80), "[::1]:3000");
        assert_eq!(host_header("[::1]", 80, 80), "[::1]");
        assert_eq!(host_header("host:1", 80, 80), "host:1");
    }

    #[test]
    fn test_path_validation() {
        assert!(valid_path("/a/b?c=d&e=%20"));
        assert!(valid_path("/caf\u{e9}"));
        assert!(!valid_path("/with space"));
        assert!(!valid_path("/tab\t"));
        assert!(!valid_path("/\u{100}"));
    }

    #[test]
    fn test_method_uppercased() {
        let req = ClientRequest::new(RequestOptions::new().method("patch"), &pool()).unwrap();
        assert_eq!(req.method(), &Method::PATCH);

        let req = ClientRequest::new(RequestOptions::new().method("purge"), &pool()).unwrap();
        assert_eq!(req.method().as_str(), "PURGE");

        let req = ClientRequest::new(RequestOptions::new(), &pool()).unwrap();
        assert_eq!(req.method(), &Method::GET);
    }

    #[test]
    fn test_invalid_method() {
        for bad in ["GE T", "GET\r", "GET\n", "G(ET"] {
            let err = ClientRequest::new(RequestOptions::new().method(bad), &pool()).unwrap_err();
            assert!(matches!(err, NetError::InvalidToken { what: "Method", .. }), "{:?}", bad);
        }
    }

    #[test]
    fn test_protocol_mismatch() {
        let err =
            ClientRequest::new(RequestOptions::new().protocol("https:"), &pool()).unwrap_err();
        assert!(matches!(err, NetError::ProtocolMismatch { .. }));
    }

    #[test]
    fn test_auth_header() {
        let req = ClientRequest::new(RequestOptions::new().auth("user:pass"), &pool()).unwrap();
        assert_eq!(req.headers().get("authorization"), Some("Basic dXNlcjpwYXNz"));

        let req = ClientRequest::new(
            RequestOptions::new().auth("user:pass").header("Authorization", "Bearer t"),
            &pool(),
        )
        .unwrap();
        assert_eq!(req.headers().get("authorization"), Some("Bearer t"));
    }

    #[test]
    fn test_from_url() {
        let opts = RequestOptions::from_url("http://u:p@[::1]:8080/a/b?x=1").unwrap();
        assert_eq!(opts.hostname.as_deref(), Some("::1"));
        assert_eq!(opts.port, Some(8080));
        assert_eq!(opts.path, "/a/b?x=1");
        assert_eq!(opts.auth.as_deref(), Some("u:p"));
        assert_eq!(opts.protocol.as_deref(), Some("http:"));

        let req = ClientRequest::new(opts, &pool()).unwrap();
        assert_eq!(req.headers().get("host"), Some("[::1]:8080"));
    }

    #[test]
    fn test_keep_alive_intent() {
        let req = ClientRequest::new(RequestOptions::new(), &pool()).unwrap();
        assert!(req.keep_alive(), "finite socket limit implies reuse");

        let unlimited = ClientSocketPool::new(PoolConfig::new().max_sockets_per_group(None));
        let req = ClientRequest::new(RequestOptions::new(), &unlimited).unwrap();
        assert!(!req.keep_alive());

        let req =
            ClientRequest::new(RequestOptions::new().agent(AgentMode::Exclusive), &pool()).unwrap();
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_load_state() {
        let mut req = ClientRequest::new(RequestOptions::new(), &pool()).unwrap();
        assert_eq!(req.load_state(), LoadState::WaitingForAvailableSocket);
        req.on_socket(false);
        assert_eq!(req.load_state(), LoadState::SendingRequest);
        req.end(None).unwrap();
        assert_eq!(req.load_state(), LoadState::WaitingForResponse);
        req.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nab");
        assert_eq!(req.load_state(), LoadState::ReadingResponse);
        req.on_data(b"c");
        assert_eq!(req.load_state(), LoadState::Idle);
    }
}
