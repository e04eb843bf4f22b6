//! Binds a [`ClientRequest`] to a real connection.
//!
//! One task per request owns the core, the socket and the idle timer. It
//! acquires a connection from the allocator, feeds socket reads, timer
//! expiry and caller commands into the core, carries out the connection
//! actions the core asks for and forwards its events to the caller.

use crate::base::context::from_io;
use crate::http::events::RequestEvent;
use crate::http::request::{ClientRequest, ConnAction};
use crate::socket::pool::{Allocator, PooledSocket, Target};
use crate::socket::stream::BoxedSocket;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;

/// Caller operations forwarded to the task that owns the request.
#[derive(Debug)]
pub(crate) enum Command {
    Write(Bytes),
    End(Option<Bytes>),
    Abort,
    SetTimeout(Duration),
}

pub(crate) type EventSender = mpsc::UnboundedSender<RequestEvent<BoxedSocket>>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<RequestEvent<BoxedSocket>>;

/// Start driving `core` on the current runtime.
pub(crate) fn spawn(
    core: ClientRequest,
    allocator: Arc<dyn Allocator>,
) -> (mpsc::UnboundedSender<Command>, EventReceiver) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let binder = Binder {
        target: core.target().clone(),
        core,
        allocator,
        socket: None,
        handoff: None,
        reading: false,
        idle: None,
        deadline: None,
        commands: cmd_rx,
        commands_open: true,
        events: event_tx,
        read_buf: BytesMut::with_capacity(READ_CHUNK),
    };
    tokio::spawn(binder.run());
    (cmd_tx, event_rx)
}

async fn read_some(socket: &mut Option<BoxedSocket>, buf: &mut BytesMut) -> std::io::Result<usize> {
    match socket {
        Some(socket) => {
            buf.clear();
            buf.reserve(READ_CHUNK);
            socket.read_buf(buf).await
        }
        None => std::future::pending().await,
    }
}

struct Binder {
    core: ClientRequest,
    allocator: Arc<dyn Allocator>,
    target: Target,
    socket: Option<BoxedSocket>,
    /// Connection detached for an upgrade, waiting for its event.
    handoff: Option<BoxedSocket>,
    reading: bool,
    idle: Option<Duration>,
    deadline: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    events: EventSender,
    read_buf: BytesMut,
}

impl Binder {
    async fn run(mut self) {
        let allocator = Arc::clone(&self.allocator);
        let target = self.target.clone();

        let acquired = {
            let mut acquire = allocator.acquire(&target);
            loop {
                tokio::select! {
                    res = &mut acquire => break res,
                    cmd = self.commands.recv(), if self.commands_open => {
                        self.command(cmd);
                        self.pump().await;
                    }
                }
            }
        };

        match acquired {
            Ok(PooledSocket { socket, reused }) => {
                trace!(target = %self.target, reused, "socket acquired");
                self.socket = Some(socket);
                self.reading = true;
                self.core.on_socket(reused);
            }
            Err(err) => {
                debug!(target = %self.target, error = %err, "socket acquisition failed");
                self.core.on_acquire_failed(err);
            }
        }
        self.pump().await;

        while !self.core.is_done() {
            let deadline = self.deadline;
            tokio::select! {
                res = read_some(&mut self.socket, &mut self.read_buf), if self.reading => {
                    self.on_read(res);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    self.core.on_timeout();
                }
                cmd = self.commands.recv(), if self.commands_open => {
                    self.command(cmd);
                }
                else => break,
            }
            self.pump().await;
        }

        if self.socket.take().is_some() {
            warn!(target = %self.target, "request finished while still holding its socket");
            self.allocator.destroy(&self.target);
        }
        trace!(target = %self.target, "binder done");
    }

    fn on_read(&mut self, res: std::io::Result<usize>) {
        match res {
            Ok(0) => {
                self.reading = false;
                self.core.on_end();
            }
            Ok(n) => {
                self.touch();
                trace!(bytes = n, "read");
                self.core.on_data(&self.read_buf[..n]);
            }
            Err(e) => {
                self.reading = false;
                self.core.on_error(from_io(e));
            }
        }
    }

    fn command(&mut self, cmd: Option<Command>) {
        let result = match cmd {
            Some(Command::Write(data)) => self.core.write(&data),
            Some(Command::End(data)) => self.core.end(data.as_deref()),
            Some(Command::Abort) => {
                self.core.abort();
                Ok(())
            }
            Some(Command::SetTimeout(timeout)) => {
                self.core.set_timeout(timeout);
                Ok(())
            }
            None => {
                // Every handle is gone; nobody can finish the body any more.
                self.commands_open = false;
                if !self.core.is_finished() {
                    self.core.abort();
                }
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!(error = %err, "request command failed");
        }
    }

    /// Push the idle deadline out after activity.
    fn touch(&mut self) {
        if let (Some(idle), Some(_)) = (self.idle, self.deadline) {
            self.deadline = Some(Instant::now() + idle);
        }
    }

    /// Carry out queued connection actions, then deliver queued events.
    /// A release waits until the caller has seen every event.
    async fn pump(&mut self) {
        let mut release = false;
        while let Some(action) = self.core.poll_action() {
            match action {
                ConnAction::Write(bytes) => {
                    let Some(socket) = self.socket.as_mut() else { continue };
                    match socket.write_all(&bytes).await {
                        Ok(()) => self.touch(),
                        Err(e) => self.core.on_error(from_io(e)),
                    }
                }
                ConnAction::Shutdown => {
                    if let Some(mut socket) = self.socket.take() {
                        if let Err(e) = socket.shutdown().await {
                            trace!(error = %e, "shutdown failed");
                        }
                        self.allocator.destroy(&self.target);
                    }
                    self.reading = false;
                    self.core.on_close();
                }
                ConnAction::Destroy => {
                    if self.socket.take().is_some() {
                        self.allocator.destroy(&self.target);
                    }
                    self.reading = false;
                    self.core.on_close();
                }
                ConnAction::Release => release = true,
                ConnAction::Detach => {
                    self.handoff = self.socket.take();
                    self.reading = false;
                    // The connection leaves the pool's accounting.
                    if self.handoff.is_some() {
                        self.allocator.destroy(&self.target);
                    }
                }
                ConnAction::ArmTimer(timeout) => {
                    self.idle = Some(timeout);
                    self.deadline = Some(Instant::now() + timeout);
                }
                ConnAction::DisarmTimer => {
                    self.idle = None;
                    self.deadline = None;
                }
            }
        }

        while let Some(event) = self.core.poll_event() {
            let handoff = &mut self.handoff;
            match event.map_connection(|| handoff.take()) {
                Some(event) => {
                    // The caller may have stopped listening; the request still
                    // has to run to completion to settle the connection.
                    let _ = self.events.send(event);
                }
                None => warn!(target = %self.target, "hand-off event without a connection"),
            }
        }

        if release {
            self.reading = false;
            if let Some(socket) = self.socket.take() {
                debug!(target = %self.target, "releasing socket");
                self.allocator.release(&self.target, socket);
            }
        }
    }
}
