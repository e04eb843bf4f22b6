//! HTTP Client with builder pattern.
//!
//! Provides a high-level API over the request engine: a [`Client`] owns the
//! connection allocator, [`RequestBuilder`] assembles one request and
//! [`RequestHandle`] streams its body and events.
//!
//! # Example
//!
//! ```rust,ignore
//! use h1client::Client;
//!
//! let client = Client::builder().keep_alive(true).build();
//!
//! let resp = client.get("http://example.com/")
//!     .send()
//!     .await?;
//! ```

use crate::base::neterror::NetError;
use crate::http::events::RequestEvent;
use crate::http::request::{AgentMode, ClientRequest, RequestOptions};
use crate::http::response::HttpResponse;
use crate::socket::binder::{self, Command, EventReceiver};
use crate::socket::pool::{Allocator, ClientSocketPool, PoolConfig};
use crate::socket::stream::BoxedSocket;
use bytes::{Bytes, BytesMut};
use http::Method;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

static GLOBAL: Lazy<Client> = Lazy::new(Client::new);

/// HTTP Client for making requests.
///
/// Use [`Client::builder()`] to configure and create a client. Clones share
/// the same connection allocator.
#[derive(Clone, Debug)]
pub struct Client {
    allocator: Arc<dyn Allocator>,
    timeout: Option<Duration>,
    set_host: bool,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Create a new client with default settings.
    pub fn new() -> Self {
        Self {
            allocator: Arc::new(ClientSocketPool::default()),
            timeout: None,
            set_host: true,
        }
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Process-wide client used when no allocator is supplied.
    pub fn global() -> &'static Client {
        &GLOBAL
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Start building a GET request.
    pub fn get<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Start building a POST request.
    pub fn post<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Start building a PUT request.
    pub fn put<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Start building a DELETE request.
    pub fn delete<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Start building a HEAD request.
    pub fn head<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a PATCH request.
    pub fn patch<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Start building a request with custom method.
    pub fn request<U: AsRef<str>>(&self, method: Method, url: U) -> RequestBuilder {
        RequestBuilder {
            client: self.clone(),
            method,
            url: url.as_ref().to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
            keep_alive: None,
            agent: AgentMode::Pooled,
            upgrade: false,
            connect: false,
        }
    }

    /// Construct a request against this client's allocator.
    ///
    /// Client defaults fill in what `options` leaves unset.
    pub fn request_with(&self, mut options: RequestOptions) -> Result<ClientRequest, NetError> {
        if options.timeout.is_none() {
            options.timeout = self.timeout;
        }
        if !self.set_host {
            options.set_host = false;
        }
        ClientRequest::new(options, self.allocator.as_ref())
    }

    /// Bind `request` to a connection on the current tokio runtime.
    pub fn start(&self, request: ClientRequest) -> RequestHandle {
        let allocator = match request.agent() {
            AgentMode::Pooled => Arc::clone(&self.allocator),
            AgentMode::Exclusive => {
                let config = PoolConfig::new()
                    .keep_alive(false)
                    .max_sockets_per_group(None)
                    .protocol(self.allocator.protocol())
                    .default_port(self.allocator.default_port());
                Arc::new(ClientSocketPool::new(config)) as Arc<dyn Allocator>
            }
        };
        let (commands, events) = binder::spawn(request, allocator);
        RequestHandle { commands, events, ended: false }
    }
}

/// Builder for creating a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    allocator: Option<Arc<dyn Allocator>>,
    pool_config: Option<PoolConfig>,
    keep_alive: Option<bool>,
    timeout: Option<Duration>,
    set_host: Option<bool>,
}

impl ClientBuilder {
    /// Use a custom connection allocator. Overrides any pool settings.
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Configure the built-in connection pool.
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = Some(config);
        self
    }

    /// Keep pooled connections open between requests.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Set the default idle timeout for requests.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether requests get a `Host` header when the caller sets none.
    pub fn set_host(mut self, set_host: bool) -> Self {
        self.set_host = Some(set_host);
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        let allocator: Arc<dyn Allocator> = match self.allocator {
            Some(allocator) => allocator,
            None => {
                let mut config = self.pool_config.unwrap_or_default();
                if let Some(keep_alive) = self.keep_alive {
                    config = config.keep_alive(keep_alive);
                }
                Arc::new(ClientSocketPool::new(config))
            }
        };

        Client {
            allocator,
            timeout: self.timeout,
            set_host: self.set_host.unwrap_or(true),
        }
    }
}

/// Caller side of a running request.
///
/// Dropping the handle before [`end`](Self::end) aborts the request.
#[derive(Debug)]
pub struct RequestHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventReceiver,
    ended: bool,
}

impl RequestHandle {
    /// Queue a body chunk.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<(), NetError> {
        if self.ended {
            return Err(NetError::WriteAfterEnd);
        }
        self.send(Command::Write(data.into()))
    }

    /// Finish the request body, optionally with a last chunk.
    pub fn end(&mut self, data: Option<Bytes>) -> Result<(), NetError> {
        if self.ended {
            return match data {
                Some(_) => Err(NetError::WriteAfterEnd),
                None => Ok(()),
            };
        }
        self.ended = true;
        self.send(Command::End(data))
    }

    /// Abort the request. Idempotent.
    pub fn abort(&self) {
        let _ = self.commands.send(Command::Abort);
    }

    /// Arm (or with zero, disarm) the idle timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        let _ = self.commands.send(Command::SetTimeout(timeout));
    }

    /// Next event, or `None` once the request is closed.
    pub async fn next_event(&mut self) -> Option<RequestEvent<BoxedSocket>> {
        self.events.recv().await
    }

    fn send(&self, cmd: Command) -> Result<(), NetError> {
        self.commands.send(cmd).map_err(|_| NetError::ConnectionAborted)
    }
}

/// Builder for a single request.
pub struct RequestBuilder {
    client: Client,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    keep_alive: Option<bool>,
    agent: AgentMode,
    upgrade: bool,
    connect: bool,
}

impl RequestBuilder {
    /// Add a header. Repeated names are sent as separate lines.
    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set request body.
    pub fn body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set JSON body.
    #[cfg(feature = "json")]
    pub fn json<T: serde::Serialize>(mut self, json: &T) -> Self {
        if let Ok(bytes) = serde_json::to_vec(json) {
            self.body = Some(Bytes::from(bytes));
            self.headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        self
    }

    /// Idle timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the client's keep-alive intent.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Use a dedicated connection that is closed afterwards.
    pub fn exclusive(mut self) -> Self {
        self.agent = AgentMode::Exclusive;
        self
    }

    /// Take over the connection on `101 Switching Protocols`.
    ///
    /// Only meaningful with [`start`](Self::start).
    pub fn on_upgrade(mut self) -> Self {
        self.upgrade = true;
        self
    }

    /// Take over the connection once a CONNECT tunnel is established.
    ///
    /// Only meaningful with [`start`](Self::start).
    pub fn on_connect(mut self) -> Self {
        self.connect = true;
        self
    }

    /// Build the request without starting it.
    pub fn build(&self) -> Result<ClientRequest, NetError> {
        let mut options = RequestOptions::from_url(&self.url)?.method(self.method.as_str());
        options.headers.extend(self.headers.iter().cloned());
        options.timeout = self.timeout;
        options.keep_alive = self.keep_alive;
        options.agent = self.agent;

        let mut request = self.client.request_with(options)?;
        request.set_upgrade_listener(self.upgrade);
        request.set_connect_listener(self.connect);
        Ok(request)
    }

    /// Start the request and stream it through the returned handle.
    ///
    /// A body set on the builder is written but the request is left open.
    pub fn start(self) -> Result<RequestHandle, NetError> {
        let request = self.build()?;
        let mut handle = self.client.start(request);
        if let Some(body) = self.body {
            handle.write(body)?;
        }
        Ok(handle)
    }

    /// Send the request and collect the whole response.
    pub async fn send(mut self) -> Result<HttpResponse, NetError> {
        self.upgrade = false;
        self.connect = false;
        let body = self.body.take();
        let mut handle = self.start()?;
        handle.end(body)?;

        let mut head = None;
        let mut buf = BytesMut::new();
        while let Some(event) = handle.next_event().await {
            match event {
                RequestEvent::Response(response) => head = Some(response),
                RequestEvent::Data(chunk) => buf.extend_from_slice(&chunk),
                RequestEvent::ResponseEnd => {
                    if let Some(head) = head.take() {
                        return Ok(HttpResponse::new(head, buf.freeze()));
                    }
                }
                RequestEvent::ResponseAborted => {
                    return Err(NetError::ConnectionReset { message: "aborted" });
                }
                RequestEvent::Timeout => {
                    handle.abort();
                    return Err(NetError::TimedOut);
                }
                RequestEvent::Error(err) => return Err(err),
                RequestEvent::Close => break,
                _ => {}
            }
        }
        Err(NetError::ConnectionAborted)
    }
}
