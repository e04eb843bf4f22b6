use crate::base::neterror::NetError;
use crate::socket::connectjob::ConnectJob;
use crate::socket::stream::BoxedSocket;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Identifies a connection group (host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A connection handed out by an [`Allocator`].
#[derive(Debug)]
pub struct PooledSocket {
    pub socket: BoxedSocket,
    /// True if the connection already served an earlier request.
    pub reused: bool,
}

/// Hands out connections and takes them back.
///
/// Every successful `acquire` must be balanced by exactly one `release` or
/// `destroy` for the same target, unless the connection was handed to the
/// caller after an upgrade, in which case `destroy` is still called so the
/// slot is freed.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Scheme this allocator speaks, e.g. `"http:"`.
    fn protocol(&self) -> &str;

    fn default_port(&self) -> u16;

    /// Whether idle connections are kept for reuse.
    fn keep_alive(&self) -> bool;

    /// Per-target connection limit, `None` for unlimited.
    fn max_sockets(&self) -> Option<usize>;

    /// Idle timeout applied to every request bound to one of its connections.
    fn timeout(&self) -> Option<Duration>;

    /// Get a connection, waiting for a free slot if the target is at its limit.
    fn acquire<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<PooledSocket, NetError>>;

    /// Return a healthy connection for reuse.
    fn release(&self, target: &Target, socket: BoxedSocket);

    /// Forget a connection that was closed or handed off.
    fn destroy(&self, target: &Target);
}

/// Socket pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub keep_alive: bool,
    pub max_sockets_per_group: Option<usize>,
    pub max_sockets_total: usize,
    pub default_port: u16,
    pub protocol: String,
    pub timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: false,
            max_sockets_per_group: Some(6),
            max_sockets_total: 256,
            default_port: 80,
            protocol: "http:".to_string(),
            timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn max_sockets_per_group(mut self, max: Option<usize>) -> Self {
        self.max_sockets_per_group = max;
        self
    }

    pub fn max_sockets_total(mut self, max: usize) -> Self {
        self.max_sockets_total = max;
        self
    }

    pub fn default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a queued request is woken with.
#[derive(Debug)]
enum Grant {
    /// An idle connection handed over directly.
    Socket(BoxedSocket),
    /// A slot was freed; the waiter connects on its own.
    Slot,
}

#[derive(Debug)]
enum Reservation {
    Idle(BoxedSocket),
    Connect,
    Wait(oneshot::Receiver<Grant>),
}

/// Per-group state tracking.
#[derive(Debug, Default)]
struct Group {
    idle_sockets: VecDeque<BoxedSocket>,
    active_count: usize,
    pending_requests: VecDeque<oneshot::Sender<Grant>>,
}

impl Group {
    fn has_available_slot(&self, max_per_group: Option<usize>) -> bool {
        max_per_group.map_or(true, |max| self.active_count + self.idle_sockets.len() < max)
    }
}

/// Connection pool enforcing Chromium-like per-host limits, with a FIFO
/// queue of requests waiting for a slot.
#[derive(Clone)]
pub struct ClientSocketPool {
    config: PoolConfig,
    groups: Arc<DashMap<Target, Group>>,
    total_active: Arc<AtomicUsize>,
}

impl fmt::Debug for ClientSocketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketPool")
            .field("config", &self.config)
            .field("total_active", &self.total_active.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for ClientSocketPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ClientSocketPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            groups: Arc::new(DashMap::new()),
            total_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take an idle socket, claim a slot, or join the queue, atomically with
    /// respect to `release` and `destroy` on the same group.
    fn reserve(&self, target: &Target) -> Reservation {
        let mut group = self.groups.entry(target.clone()).or_default();

        while let Some(socket) = group.idle_sockets.pop_front() {
            if socket.is_connected_and_idle() {
                group.active_count += 1;
                self.total_active.fetch_add(1, Ordering::Relaxed);
                return Reservation::Idle(socket);
            }
            tracing::debug!(%target, "dropping dead idle socket");
        }

        let total = self.total_active.load(Ordering::Relaxed);
        if group.has_available_slot(self.config.max_sockets_per_group)
            && total < self.config.max_sockets_total
        {
            group.active_count += 1;
            self.total_active.fetch_add(1, Ordering::Relaxed);
            return Reservation::Connect;
        }

        let (tx, rx) = oneshot::channel();
        group.pending_requests.push_back(tx);
        tracing::debug!(%target, queued = group.pending_requests.len(), "socket request queued");
        Reservation::Wait(rx)
    }

    async fn connect(&self, target: &Target) -> Result<PooledSocket, NetError> {
        match ConnectJob::connect(target).await {
            Ok(socket) => Ok(PooledSocket { socket, reused: false }),
            Err(e) => {
                self.destroy_socket(target);
                Err(e)
            }
        }
    }

    /// Request a socket, queueing when the group is at its limit.
    pub async fn request_socket(&self, target: &Target) -> Result<PooledSocket, NetError> {
        match self.reserve(target) {
            Reservation::Idle(socket) => Ok(PooledSocket { socket, reused: true }),
            Reservation::Connect => self.connect(target).await,
            Reservation::Wait(rx) => match rx.await.map_err(|_| NetError::PoolClosed)? {
                Grant::Socket(socket) => Ok(PooledSocket { socket, reused: true }),
                Grant::Slot => self.connect(target).await,
            },
        }
    }

    /// Release a socket back to the pool.
    ///
    /// A waiting request gets it directly; otherwise it is parked as idle
    /// when keep-alive is on and closed when it is off.
    pub fn release_socket(&self, target: &Target, socket: BoxedSocket) {
        if !socket.is_connected() {
            tracing::debug!(%target, "released socket is dead");
            self.destroy_socket(target);
            return;
        }

        let mut group = self.groups.entry(target.clone()).or_default();
        let mut socket = socket;
        while let Some(waiter) = group.pending_requests.pop_front() {
            match waiter.send(Grant::Socket(socket)) {
                Ok(()) => return,
                Err(Grant::Socket(returned)) => socket = returned,
                Err(Grant::Slot) => return,
            }
        }

        group.active_count = group.active_count.saturating_sub(1);
        self.total_active.fetch_sub(1, Ordering::Relaxed);
        if self.config.keep_alive {
            group.idle_sockets.push_back(socket);
        } else {
            tracing::trace!(%target, "closing released socket, keep-alive off");
        }
        drop(group);
        self.wake_blocked_group();
    }

    /// Discard a socket without returning it to the pool.
    pub fn destroy_socket(&self, target: &Target) {
        let mut group = self.groups.entry(target.clone()).or_default();
        while let Some(waiter) = group.pending_requests.pop_front() {
            // The freed slot passes straight to the waiter.
            if waiter.send(Grant::Slot).is_ok() {
                return;
            }
        }
        group.active_count = group.active_count.saturating_sub(1);
        self.total_active.fetch_sub(1, Ordering::Relaxed);
        drop(group);
        self.wake_blocked_group();
    }

    /// Hand capacity freed under the total limit to a request queued on
    /// another group.
    fn wake_blocked_group(&self) {
        for mut group in self.groups.iter_mut() {
            if self.total_active.load(Ordering::Relaxed) >= self.config.max_sockets_total {
                return;
            }
            if !group.has_available_slot(self.config.max_sockets_per_group) {
                continue;
            }
            while let Some(waiter) = group.pending_requests.pop_front() {
                if waiter.send(Grant::Slot).is_ok() {
                    group.active_count += 1;
                    self.total_active.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }

    /// Get number of pending requests for a group.
    pub fn pending_request_count(&self, target: &Target) -> usize {
        self.groups.get(target).map(|g| g.pending_requests.len()).unwrap_or(0)
    }

    /// Get total active socket count.
    pub fn total_active_count(&self) -> usize {
        self.total_active.load(Ordering::Relaxed)
    }

    /// Get total idle socket count across all groups.
    pub fn idle_socket_count(&self) -> usize {
        self.groups.iter().map(|g| g.idle_sockets.len()).sum()
    }

    /// Close every idle socket.
    pub fn close_idle_sockets(&self) {
        for mut group in self.groups.iter_mut() {
            group.idle_sockets.clear();
        }
    }
}

impl Allocator for ClientSocketPool {
    fn protocol(&self) -> &str {
        &self.config.protocol
    }

    fn default_port(&self) -> u16 {
        self.config.default_port
    }

    fn keep_alive(&self) -> bool {
        self.config.keep_alive
    }

    fn max_sockets(&self) -> Option<usize> {
        self.config.max_sockets_per_group
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    fn acquire<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<PooledSocket, NetError>> {
        Box::pin(self.request_socket(target))
    }

    fn release(&self, target: &Target, socket: BoxedSocket) {
        self.release_socket(target, socket);
    }

    fn destroy(&self, target: &Target) {
        self.destroy_socket(target);
    }
}
