//! Persistent control channel to the collection service.
//!
//! [`ConnectionManager`] owns the only connection. It dials, joins the
//! namespace, then reads frames until anything fails, at which point it drops
//! the connection, waits a flat delay and dials again, forever. Recognized
//! "watch set changed" events are forwarded as a coalesced refresh signal.
//! Other tasks push frames through a [`ControlSender`], which refuses while
//! no connection is joined.

mod frame;
mod transport;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControlConfig;
use crate::refresh::RefreshSender;

pub use frame::{event_frame, handshake_frame, ControlFrame, EventKind, PONG};
pub use transport::{control_url, ControlLink, ControlTransport, WsTransport};

/// Frames accepted from senders but not yet written. Senders get
/// [`SendError::Backlogged`] beyond this.
const OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Joined,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Joined => "joined",
        })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SendError {
    #[error("control channel is not joined")]
    NotJoined,
    #[error("control channel outbound queue is full")]
    Backlogged,
    #[error("control channel has shut down")]
    Closed,
}

/// Handle for pushing events over the control channel.
#[derive(Clone)]
pub struct ControlSender {
    namespace: String,
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::Sender<String>,
}

impl ControlSender {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queues `event` with one JSON argument. Never waits.
    pub fn emit(&self, event: &str, payload: &serde_json::Value) -> Result<(), SendError> {
        if self.state() != ConnectionState::Joined {
            return Err(SendError::NotJoined);
        }
        self.outbound
            .try_send(event_frame(&self.namespace, event, payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Backlogged,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn ControlTransport>,
    namespace: String,
    refresh_marker: String,
    reconnect_delay: Duration,
    refresh: RefreshSender,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Receiver<String>,
}

enum Step {
    Shutdown,
    Inbound(Result<Option<String>>),
    Outbound(String),
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn ControlTransport>,
        cfg: &ControlConfig,
        refresh: RefreshSender,
    ) -> (Self, ControlSender) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let manager = Self {
            transport,
            namespace: cfg.namespace.clone(),
            refresh_marker: cfg.refresh_marker.clone(),
            reconnect_delay: cfg.reconnect_delay(),
            refresh,
            state: state_tx,
            outbound: out_rx,
        };
        let sender = ControlSender {
            namespace: cfg.namespace.clone(),
            state: state_rx,
            outbound: out_tx,
        };
        (manager, sender)
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "control channel state");
            *current = next;
            true
        });
    }

    /// Runs the connect/read/reconnect cycle until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        loop {
            self.set_state(ConnectionState::Connecting);
            if let Err(e) = self.session(&token).await {
                warn!(
                    error = %format!("{e:#}"),
                    retry_in = ?self.reconnect_delay,
                    "control channel lost"
                );
            }
            self.set_state(ConnectionState::Disconnected);
            // Frames queued for the dead connection are stale.
            while self.outbound.try_recv().is_ok() {}

            if token.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        info!("control channel stopped");
    }

    /// One connection from dial to failure. `Ok` only on cancellation.
    async fn session(&mut self, token: &CancellationToken) -> Result<()> {
        let mut link = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            dialed = self.transport.dial() => dialed?,
        };
        link.send_text(handshake_frame(&self.namespace))
            .await
            .context("joining namespace")?;
        self.set_state(ConnectionState::Joined);
        info!(namespace = %self.namespace, "control channel joined");

        loop {
            let step = tokio::select! {
                _ = token.cancelled() => Step::Shutdown,
                inbound = link.recv_text() => Step::Inbound(inbound),
                Some(frame) = self.outbound.recv() => Step::Outbound(frame),
            };
            match step {
                Step::Shutdown => return Ok(()),
                Step::Inbound(Ok(Some(text))) => {
                    if let Some(reply) = self.on_frame(&text) {
                        link.send_text(reply.to_string())
                            .await
                            .context("answering ping")?;
                    }
                }
                Step::Inbound(Ok(None)) => bail!("closed by peer"),
                Step::Inbound(Err(e)) => return Err(e),
                Step::Outbound(frame) => link
                    .send_text(frame)
                    .await
                    .context("sending event frame")?,
            }
        }
    }

    /// Handles one inbound frame. Returns the reply to write, if any.
    fn on_frame(&self, text: &str) -> Option<&'static str> {
        match ControlFrame::parse(text, &self.namespace, &self.refresh_marker) {
            ControlFrame::Ping => return Some(PONG),
            ControlFrame::Event(EventKind::WatchSetChanged) => {
                if self.refresh.post() {
                    info!("watch set changed, refresh queued");
                } else {
                    debug!("watch set changed, refresh already pending");
                }
            }
            ControlFrame::Event(EventKind::Other(name)) => debug!(event = %name, "ignoring event"),
            ControlFrame::Open | ControlFrame::Handshake => debug!(frame = text, "session frame"),
            ControlFrame::Unknown => debug!(frame = text, "unrecognized frame"),
        }
        None
    }
}
