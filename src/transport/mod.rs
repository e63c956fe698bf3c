//! Telemetry transport
//!
//! A single self-healing duplex channel to the analysis backend. One task
//! owns the connection and runs the state machine
//!
//! ```text
//! Connecting -> Open -> Closed -> Reconnecting -> Connecting -> ...
//! ```
//!
//! Reconnection is unconditional and indefinite with a fixed delay. Sends are
//! only forwarded while `Open`; anything else is dropped (at-most-once, no
//! queueing across disconnects). Inbound frames are parsed as JSON and handed
//! to the registered handler in receive order, from the transport task only.

pub mod messages;
pub mod websocket;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use messages::{InferenceResult, TelemetrySample};
pub use websocket::WsConnector;

use crate::error::TransportError;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Events surfaced by an open link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Text(String),
    Error(String),
    Closed,
}

/// An established duplex connection. Dropping `outbound` closes it.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens links to the backend
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}

/// Receives every parsed inbound message
pub type MessageHandler = Box<dyn FnMut(InferenceResult) + Send + 'static>;

#[derive(Debug)]
enum Command {
    Send(String),
    Start,
    Close,
    Shutdown,
}

enum LinkEnd {
    /// Remote close or socket error; reconnect
    Dropped,
    /// Explicit `close()`; wait for `start()`
    ClosedByUser,
    Shutdown,
}

/// Cloneable handle to a running transport
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl TransportHandle {
    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send a sample if the connection is open. Returns whether it was
    /// handed to the connection; a dropped send is not an error.
    pub fn send(&self, sample: &TelemetrySample) -> bool {
        if self.state() != ConnectionState::Open {
            tracing::debug!("Transport not open ({}), dropping sample", self.state());
            return false;
        }
        match sample.to_json() {
            Ok(text) => self.commands.send(Command::Send(text)).is_ok(),
            Err(e) => {
                tracing::warn!("Failed to encode sample: {}", e);
                false
            }
        }
    }

    /// Close the connection without scheduling a reconnect
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Resume connecting after `close()`
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    /// Stop the transport task for good
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Wait until the transport reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), TransportError> {
        let mut rx = self.state.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return Ok(());
            }
            rx.changed().await.map_err(|_| TransportError::Closed)?;
        }
    }
}

/// The transport state machine. Owned by its task; use [`TransportHandle`].
pub struct TelemetryTransport<C: Connector> {
    url: String,
    connector: C,
    reconnect_delay: Duration,
    handler: MessageHandler,
    state_tx: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<C: Connector> TelemetryTransport<C> {
    /// Spawn the transport task; it starts connecting immediately.
    pub fn spawn(
        url: impl Into<String>,
        reconnect_delay: Duration,
        connector: C,
        handler: MessageHandler,
    ) -> (TransportHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let transport = Self {
            url: url.into(),
            connector,
            reconnect_delay,
            handler,
            state_tx,
            commands: cmd_rx,
        };
        let task = tokio::spawn(transport.run());

        (
            TransportHandle {
                commands: cmd_tx,
                state: state_rx,
            },
            task,
        )
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!("Transport {} -> {}", previous, state);
        }
    }

    async fn run(mut self) {
        let mut active = true;

        loop {
            if !active {
                self.set_state(ConnectionState::Closed);
                match self.commands.recv().await {
                    Some(Command::Start) => {
                        active = true;
                        continue;
                    }
                    Some(Command::Send(_)) => {
                        tracing::debug!("Transport closed, dropping sample");
                        continue;
                    }
                    Some(Command::Close) => continue,
                    Some(Command::Shutdown) | None => return,
                }
            }

            self.set_state(ConnectionState::Connecting);
            tracing::info!("Connecting to {}", self.url);

            let connected = {
                let connect = self.connector.connect(&self.url);
                tokio::pin!(connect);
                loop {
                    tokio::select! {
                        result = &mut connect => break Some(result),
                        cmd = self.commands.recv() => match cmd {
                            Some(Command::Send(_)) => {
                                tracing::debug!("Transport connecting, dropping sample");
                            }
                            Some(Command::Start) => {}
                            Some(Command::Close) => break None,
                            Some(Command::Shutdown) | None => {
                                self.set_state(ConnectionState::Closed);
                                return;
                            }
                        },
                    }
                }
            };

            let end = match connected {
                None => LinkEnd::ClosedByUser,
                Some(Ok(link)) => {
                    self.set_state(ConnectionState::Open);
                    self.serve(link).await
                }
                Some(Err(e)) => {
                    tracing::warn!("Transport error: {}", e);
                    LinkEnd::Dropped
                }
            };

            match end {
                LinkEnd::Shutdown => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                LinkEnd::ClosedByUser => {
                    active = false;
                    continue;
                }
                LinkEnd::Dropped => {}
            }

            self.set_state(ConnectionState::Closed);
            self.set_state(ConnectionState::Reconnecting);
            tracing::info!("Reconnecting in {:?}", self.reconnect_delay);

            let sleep = tokio::time::sleep(self.reconnect_delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    cmd = self.commands.recv() => match cmd {
                        Some(Command::Send(_)) => {
                            tracing::debug!("Transport reconnecting, dropping sample");
                        }
                        Some(Command::Start) => {}
                        Some(Command::Close) => {
                            active = false;
                            break;
                        }
                        Some(Command::Shutdown) | None => {
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                    },
                }
            }
        }
    }

    async fn serve(&mut self, mut link: Link) -> LinkEnd {
        loop {
            tokio::select! {
                event = link.inbound.recv() => match event {
                    Some(LinkEvent::Text(text)) => self.deliver(&text),
                    Some(LinkEvent::Error(e)) => {
                        tracing::warn!("Transport error: {}", e);
                        return LinkEnd::Dropped;
                    }
                    Some(LinkEvent::Closed) | None => {
                        tracing::info!("Transport closed by remote");
                        return LinkEnd::Dropped;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(text)) => {
                        if link.outbound.send(text).is_err() {
                            tracing::warn!("Transport link went away while sending");
                            return LinkEnd::Dropped;
                        }
                    }
                    Some(Command::Start) => {
                        tracing::debug!("Transport already open");
                    }
                    Some(Command::Close) => return LinkEnd::ClosedByUser,
                    Some(Command::Shutdown) | None => return LinkEnd::Shutdown,
                },
            }
        }
    }

    fn deliver(&mut self, text: &str) {
        match InferenceResult::parse(text) {
            Ok(result) => (self.handler)(result),
            Err(e) => tracing::warn!("Dropping inbound frame: {}", e),
        }
    }
}
