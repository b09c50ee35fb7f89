//! Client connection state machine.
//!
//! [`spawn`] starts a background task that keeps one connection to the relay
//! alive: connect, announce the display name, deliver whatever arrives, and
//! reconnect with exponential backoff whenever the connection is lost. The
//! display side drives it through a [`ClientHandle`] and consumes
//! [`ClientEvent`]s; the task never touches display state itself.

use std::{fmt, io, time::Duration};

use futures::StreamExt;
use rand::Rng;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, watch},
    time::{sleep, timeout},
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{
    backoff::{Backoff, format_delay},
    codec::{FrameCodec, Message},
    config::ClientConfig,
    error::SessionError,
    shutdown::StopSignal,
};

pub const RECEIVE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// What the display adapter is asked to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    OwnMessage(String),
    OtherMessage { sender: String, text: String },
    SystemNotice(String),
}

/// Maps a message from the relay to the event shown to the user. Relayed
/// chat whose sender matches `identity` is the user's own message echoed
/// back; everything that is not chat is shown as a notice, verbatim if it
/// could not be understood.
pub fn dispatch(identity: &str, message: Message) -> ClientEvent {
    match message {
        Message::Relayed { sender, text } if sender == identity => ClientEvent::OwnMessage(text),
        Message::Relayed { sender, text } => ClientEvent::OtherMessage { sender, text },
        Message::SystemNotice { text } => ClientEvent::SystemNotice(text),
        Message::Unrecognized(raw) => ClientEvent::SystemNotice(raw),
        other @ (Message::Chat { .. } | Message::NameAnnounce { .. }) => {
            let raw = other.encode();
            ClientEvent::SystemNotice(String::from_utf8_lossy(&raw).trim_end().to_string())
        }
    }
}

/// Picks the name to announce: the configured one if it is not blank,
/// otherwise `User-<n>`.
pub fn resolve_name(configured: Option<&str>) -> String {
    match configured.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("User-{}", rand::thread_rng().gen_range(0..100_000)),
    }
}

/// Starts the session task on the current runtime.
pub fn spawn(config: ClientConfig) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
    let identity = resolve_name(config.name.as_deref());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
    let stop = StopSignal::new();

    let backoff = Backoff::new(config.reconnect_base, config.reconnect_max);
    let session = Session {
        config,
        identity: identity.clone(),
        events: events_tx,
        outgoing: outgoing_rx,
        state: state_tx,
        stop: stop.clone(),
        backoff,
    };
    tokio::spawn(session.run());

    let handle = ClientHandle {
        identity,
        outgoing: outgoing_tx,
        state: state_rx,
        stop,
    };
    (handle, events_rx)
}

/// Display-side control of a running session. Dropping the handle stops
/// the session.
#[derive(Debug)]
pub struct ClientHandle {
    identity: String,
    outgoing: mpsc::UnboundedSender<String>,
    state: watch::Receiver<SessionState>,
    stop: StopSignal,
}

impl ClientHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Queues chat text for the relay. Blank text is ignored. If the session
    /// is not connected when it picks the text up, it reports that with a
    /// notice instead of sending.
    pub fn send_chat(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.outgoing.send(text.to_string()).is_err() {
            debug!("session already stopped; chat dropped");
        }
    }

    /// Requests shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.stop.trigger();
    }

    /// Waits until the session reaches `state`. Returns `false` if the
    /// session stopped first.
    pub async fn wait_for(&self, state: SessionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx
            .wait_for(|current| *current == state || *current == SessionState::Stopped)
            .await
            .map(|current| *current == state);
        reached.unwrap_or(state == SessionState::Stopped)
    }

    /// Waits for the background task to finish after a shutdown request.
    pub async fn stopped(&self) {
        self.wait_for(SessionState::Stopped).await;
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

/// Result of one bounded wait for the next message on a connection.
#[derive(Debug)]
enum PollOutcome {
    Idle,
    Delivered(Message),
    Closed,
    Failed(io::Error),
}

/// One established socket. Replaced wholesale on reconnect.
struct Connection {
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn poll(&mut self, wait: Duration) -> PollOutcome {
        match timeout(wait, self.frames.next()).await {
            Err(_) => PollOutcome::Idle,
            Ok(None) => PollOutcome::Closed,
            Ok(Some(Ok(message))) => PollOutcome::Delivered(message),
            Ok(Some(Err(err))) => PollOutcome::Failed(err),
        }
    }
}

enum Step {
    Stop,
    Send(String),
    Poll(PollOutcome),
}

struct Session {
    config: ClientConfig,
    identity: String,
    events: mpsc::UnboundedSender<ClientEvent>,
    outgoing: mpsc::UnboundedReceiver<String>,
    state: watch::Sender<SessionState>,
    stop: StopSignal,
    backoff: Backoff,
}

impl Session {
    async fn run(mut self) {
        while !self.stop.is_triggered() {
            self.set_state(SessionState::Connecting);
            match self.connect().await {
                Ok(connection) => {
                    self.backoff.reset();
                    self.set_state(SessionState::Connected);
                    info!(server = %self.config.server, name = %self.identity, "connected");
                    self.notify("Connected to chat server");
                    self.run_connected(connection).await;
                }
                Err(SessionError::Stopped) => break,
                Err(error) => {
                    warn!(%error, "connection attempt failed");
                    self.set_state(SessionState::Disconnected);
                    let delay = self.backoff.next_delay();
                    self.notify(format!(
                        "Connection failed, retrying in {}",
                        format_delay(delay)
                    ));
                    self.pause(delay).await;
                }
            }
        }

        self.set_state(SessionState::Stopped);
        debug!("client session stopped");
    }

    async fn connect(&mut self) -> Result<Connection, SessionError> {
        let addr = self.config.server;
        let connect_timeout = self.config.connect_timeout;
        self.notify(format!("Connecting to {addr}..."));

        let attempt = timeout(connect_timeout, TcpStream::connect(addr));
        tokio::pin!(attempt);

        let result = loop {
            select! {
                biased;
                _ = self.stop.wait() => return Err(SessionError::Stopped),
                result = &mut attempt => break result,
                Some(text) = self.outgoing.recv() => self.reject_send(&text),
            }
        };

        let stream = match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(SessionError::Connect { addr, source }),
            Err(_) => {
                return Err(SessionError::ConnectTimeout {
                    addr,
                    timeout: connect_timeout,
                })
            }
        };

        let (reader, mut writer) = stream.into_split();
        self.handshake(&mut writer).await?;

        let codec = FrameCodec::new(self.config.framing);
        Ok(Connection {
            frames: FramedRead::with_capacity(reader, codec, RECEIVE_BUFFER_SIZE),
            writer,
        })
    }

    async fn handshake(&self, writer: &mut OwnedWriteHalf) -> Result<(), SessionError> {
        let announce = Message::name(self.identity.as_str());
        match self.write_message(writer, &announce).await {
            Err(SessionError::Write(source)) => Err(SessionError::Handshake(source)),
            other => other,
        }
    }

    /// Writes one message. Gives up after `connect_timeout` if the relay
    /// stops reading, and immediately on stop.
    async fn write_message(
        &self,
        writer: &mut OwnedWriteHalf,
        message: &Message,
    ) -> Result<(), SessionError> {
        let bytes = message.encode();
        let limit = self.config.connect_timeout;

        select! {
            biased;
            _ = self.stop.wait() => Err(SessionError::Stopped),
            written = timeout(limit, writer.write_all(&bytes)) => match written {
                Ok(result) => result.map_err(SessionError::Write),
                Err(_) => Err(SessionError::WriteTimeout(limit)),
            },
        }
    }

    /// Serves one connection until it drops or a stop is requested. The
    /// connection is closed when this returns.
    async fn run_connected(&mut self, mut connection: Connection) {
        let poll_timeout = self.config.poll_timeout;

        while !self.stop.is_triggered() {
            let step = select! {
                biased;
                _ = self.stop.wait() => Step::Stop,
                Some(text) = self.outgoing.recv() => Step::Send(text),
                outcome = connection.poll(poll_timeout) => Step::Poll(outcome),
            };

            match step {
                Step::Stop => break,
                Step::Send(text) => self.send_chat(&mut connection.writer, &text).await,
                Step::Poll(PollOutcome::Idle) => {}
                Step::Poll(PollOutcome::Delivered(message)) => {
                    self.emit(dispatch(&self.identity, message));
                }
                Step::Poll(PollOutcome::Closed) => {
                    info!("server closed the connection");
                    self.connection_lost();
                    return;
                }
                Step::Poll(PollOutcome::Failed(error)) => {
                    warn!(%error, "read from server failed");
                    self.connection_lost();
                    return;
                }
            }
        }
    }

    async fn send_chat(&self, writer: &mut OwnedWriteHalf, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        // A dead socket is detected by the next read, not here.
        match self.write_message(writer, &Message::chat(text)).await {
            Ok(()) | Err(SessionError::Stopped) => {}
            // Bare io error, without the "failed to write" wrapper.
            Err(SessionError::Write(error)) => self.send_failed(&error),
            Err(error) => self.send_failed(&error),
        }
    }

    fn send_failed(&self, error: &dyn fmt::Display) {
        warn!(%error, "failed to send chat message");
        self.notify(format!("Failed to send message: {error}"));
    }

    fn reject_send(&self, text: &str) {
        debug!(len = text.len(), "chat requested while not connected");
        self.notify("Not connected to server");
    }

    fn connection_lost(&self) {
        self.set_state(SessionState::Disconnected);
        self.notify("Disconnected from server; reconnecting...");
    }

    /// Sleeps for `delay` unless a stop arrives first.
    async fn pause(&mut self, delay: Duration) {
        let nap = sleep(delay);
        tokio::pin!(nap);

        loop {
            select! {
                biased;
                _ = self.stop.wait() => return,
                _ = &mut nap => return,
                Some(text) = self.outgoing.recv() => self.reject_send(&text),
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "session state changed");
        }
    }

    fn notify(&self, text: impl Into<String>) {
        self.emit(ClientEvent::SystemNotice(text.into()));
    }

    fn emit(&self, event: ClientEvent) {
        // The display may already be gone during shutdown.
        let _ = self.events.send(event);
    }
}
