//! Relay engine.
//!
//! One task owns the [`Registry`] and the write half of every accepted
//! socket. Each connection also gets a small reader task that performs
//! bounded reads and forwards the chunks back over a channel, so every
//! registry mutation happens on the engine task and nothing is locked.
//!
//! An iteration of the loop handles one readiness event (accept, inbound
//! message, or closed reader), then attempts one queued write per client,
//! then tears down the connections whose writes failed. A client whose send
//! buffer was full is retried on a fixed tick that other traffic cannot
//! postpone.

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    time::Duration,
};

use anyhow::Result;
use bytes::Buf;
use futures::StreamExt;
use tokio::{
    net::{
        TcpListener, TcpSocket, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{
    codec::{FrameCodec, Framing, Message, SYS_PREFIX},
    config::ServerConfig,
    registry::{ClientId, ClientRecord, Registry},
};

/// Largest chunk a single read hands to the engine.
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

// Reader tasks wait on this channel when the engine falls behind.
const INBOUND_CAPACITY: usize = 256;

const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// One line of the relay's activity log, meant for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine(pub String);

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binds the listening socket with `SO_REUSEADDR` and the configured backlog.
pub fn bind_listener(config: &ServerConfig) -> io::Result<TcpListener> {
    let socket = if config.listen.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(config.listen)?;
    socket.listen(config.backlog)
}

pub struct RelayServer {
    listener: TcpListener,
    framing: Framing,
    logs: mpsc::UnboundedSender<LogLine>,
}

impl RelayServer {
    /// Wraps an already bound listener. The returned receiver yields the
    /// relay's log lines; dropping it simply discards them.
    pub fn new(
        listener: TcpListener,
        framing: Framing,
    ) -> (Self, mpsc::UnboundedReceiver<LogLine>) {
        let (logs, log_rx) = mpsc::unbounded_channel();
        let server = Self {
            listener,
            framing,
            logs,
        };
        (server, log_rx)
    }

    pub fn bind(config: &ServerConfig) -> io::Result<(Self, mpsc::UnboundedReceiver<LogLine>)> {
        let listener = bind_listener(config)?;
        Ok(Self::new(listener, config.framing))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the relay loop until `shutdown` resolves, then closes the
    /// listener. Client sockets are released when the engine is dropped.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            framing,
            logs,
        } = self;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut engine = Engine::new(framing, logs, inbound_tx);
        let retry = sleep(WRITE_RETRY_INTERVAL);
        tokio::pin!(shutdown, retry);

        engine.log("Server started. Waiting for connections.");

        loop {
            let writes_ready = engine.has_ready_writes();
            let writes_blocked = engine.has_blocked_writes();

            select! {
                biased;
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                // Ahead of the busy branches so steady inbound traffic
                // cannot keep a blocked client waiting.
                _ = &mut retry, if writes_blocked => {
                    engine.unblock_writes();
                    retry.as_mut().reset(Instant::now() + WRITE_RETRY_INTERVAL);
                }
                accepted = listener.accept() => engine.handle_accept(accepted),
                Some(event) = inbound_rx.recv() => engine.handle_inbound(event),
                _ = tokio::task::yield_now(), if writes_ready => {}
            }

            engine.flush_writes();
            engine.reap();
        }

        drop(listener);
        engine.log("Server stopped.");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Engine-side state of one accepted socket.
struct Peer {
    addr: SocketAddr,
    writer: OwnedWriteHalf,
    reader: Option<JoinHandle<()>>,
    /// Last write hit a full send buffer; wait for the retry tick.
    blocked: bool,
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Received { id: ClientId, message: Message },
    Closed { id: ClientId },
    Failed { id: ClientId, error: io::Error },
}

struct Engine {
    registry: Registry<Peer>,
    framing: Framing,
    logs: mpsc::UnboundedSender<LogLine>,
    inbound: mpsc::Sender<Inbound>,
    /// Connections whose writes failed this iteration.
    doomed: Vec<ClientId>,
}

impl Engine {
    fn new(
        framing: Framing,
        logs: mpsc::UnboundedSender<LogLine>,
        inbound: mpsc::Sender<Inbound>,
    ) -> Self {
        Self {
            registry: Registry::new(),
            framing,
            logs,
            inbound,
            doomed: Vec::new(),
        }
    }

    fn log(&self, line: impl Into<String>) {
        // A closed log receiver only means nobody is watching.
        let _ = self.logs.send(LogLine(line.into()));
    }

    fn handle_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, addr)) => {
                self.admit(stream, addr);
            }
            Err(err) => {
                warn!(error = ?err, "failed to accept connection");
                self.log(format!("Failed to accept connection: {err}"));
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) -> ClientId {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = ?err, "failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let id = self.registry.register(Peer {
            addr,
            writer,
            reader: None,
            blocked: false,
        });

        let frames = FramedRead::with_capacity(
            reader,
            FrameCodec::new(self.framing),
            RECEIVE_BUFFER_SIZE,
        );
        let task = tokio::spawn(read_loop(id, frames, self.inbound.clone()));
        if let Some(peer) = self.registry.connection_mut(id) {
            peer.reader = Some(task);
        }

        debug!(client_id = id, peer = %addr, clients = self.registry.len(), "client connected");
        self.log(format!("New connection from {addr}"));
        id
    }

    fn handle_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Received { id, message } => self.dispatch(id, message),
            Inbound::Closed { id } => self.disconnect(id),
            Inbound::Failed { id, error } => {
                warn!(client_id = id, error = ?error, "read from client failed");
                self.log(format!("Error handling client data: {error}"));
                self.disconnect(id);
            }
        }
    }

    fn dispatch(&mut self, id: ClientId, message: Message) {
        if !self.registry.contains(id) {
            debug!(client_id = id, "dropping message from removed client");
            return;
        }
        match self.registry.display_name(id).map(str::to_owned) {
            None => self.handle_registration(id, message),
            Some(name) => self.handle_chat(id, name, message),
        }
    }

    fn handle_registration(&mut self, id: ClientId, message: Message) {
        let name = match message {
            Message::NameAnnounce { name } => name,
            other => {
                debug!(client_id = id, message = ?other, "ignoring message before registration");
                return;
            }
        };

        let name = if name.trim().is_empty() {
            match self.registry.connection(id) {
                Some(peer) => peer.addr.to_string(),
                None => return,
            }
        } else {
            name
        };

        self.registry.set_name(id, name.clone());
        info!(client_id = id, %name, "client registered");

        let notice = format!("{name} joined");
        self.log(format!("{SYS_PREFIX}{notice}"));
        self.broadcast(Message::notice(notice));
    }

    fn handle_chat(&mut self, id: ClientId, name: String, message: Message) {
        match message {
            Message::Chat { text } => {
                self.log(format!("{name}: {text}"));
                self.broadcast(Message::relayed(name, text));
            }
            other => debug!(client_id = id, message = ?other, "ignoring non-chat message"),
        }
    }

    fn broadcast(&mut self, message: Message) {
        let encoded = message.encode();
        let recipients = self.registry.broadcast_enqueue(&encoded, None);
        debug!(recipients, "broadcast queued");
    }

    fn has_ready_writes(&self) -> bool {
        self.registry
            .pending()
            .into_iter()
            .any(|id| matches!(self.registry.connection(id), Some(peer) if !peer.blocked))
    }

    fn has_blocked_writes(&self) -> bool {
        self.registry
            .pending()
            .into_iter()
            .any(|id| matches!(self.registry.connection(id), Some(peer) if peer.blocked))
    }

    fn unblock_writes(&mut self) {
        for id in self.registry.pending() {
            if let Some(peer) = self.registry.connection_mut(id) {
                peer.blocked = false;
            }
        }
    }

    /// Attempts one non-blocking write of the oldest queued entry for every
    /// client that has output and is not waiting on a full send buffer.
    fn flush_writes(&mut self) {
        for id in self.registry.pending() {
            if matches!(self.registry.connection(id), Some(peer) if peer.blocked) {
                continue;
            }
            let Some(mut entry) = self.registry.dequeue_next(id) else {
                continue;
            };
            let Some(peer) = self.registry.connection_mut(id) else {
                continue;
            };

            match peer.writer.try_write(&entry) {
                Ok(written) if written == entry.len() => {}
                Ok(written) => {
                    entry.advance(written);
                    self.registry.requeue_front(id, entry);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    peer.blocked = true;
                    self.registry.requeue_front(id, entry);
                }
                Err(err) => {
                    warn!(client_id = id, error = ?err, "write to client failed");
                    self.doomed.push(id);
                }
            }
        }
    }

    fn reap(&mut self) {
        for id in std::mem::take(&mut self.doomed) {
            self.disconnect(id);
        }
    }

    /// Removes the client and closes its socket. Safe to call more than once
    /// for the same client; only the first call has any effect.
    fn disconnect(&mut self, id: ClientId) {
        let Some(ClientRecord {
            connection: peer,
            display_name,
            ..
        }) = self.registry.remove(id)
        else {
            return;
        };

        let addr = peer.addr;
        drop(peer);

        info!(client_id = id, peer = %addr, name = ?display_name, "client disconnected");
        self.log(format!("Client disconnected: {addr}"));

        if let Some(name) = display_name {
            let notice = format!("{name} left");
            self.log(format!("{SYS_PREFIX}{notice}"));
            self.broadcast(Message::notice(notice));
        }
    }
}

async fn read_loop(
    id: ClientId,
    mut frames: FramedRead<OwnedReadHalf, FrameCodec>,
    inbound: mpsc::Sender<Inbound>,
) {
    loop {
        let event = match frames.next().await {
            Some(Ok(message)) => Inbound::Received { id, message },
            Some(Err(error)) => Inbound::Failed { id, error },
            None => Inbound::Closed { id },
        };

        let finished = !matches!(event, Inbound::Received { .. });
        if inbound.send(event).await.is_err() || finished {
            break;
        }
    }
}
