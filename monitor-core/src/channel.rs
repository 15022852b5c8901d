use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::article::DisasterEvent;
use crate::error::TransportError;

/// How long a connection attempt may take to reach open.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    NewDisaster {
        data: DisasterEvent,
        #[serde(default)]
        timestamp: Option<String>,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<String>,
    },
    Connected {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    Message(PushMessage),
    Closed { terminal: bool },
}

struct ActiveConnection {
    outbound: mpsc::UnboundedSender<serde_json::Value>,
    shutdown: broadcast::Sender<()>,
}

/// Push connection to the disaster feed. Owns a single socket; every
/// subscriber receives every event. One `connect()` call is one attempt,
/// scheduling retries is the reconnect supervisor's job.
pub struct DisasterChannel {
    url: String,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ChannelEvent>,
    terminal: Arc<AtomicBool>,
    conn: Mutex<Option<ActiveConnection>>,
}

impl DisasterChannel {
    pub fn new(url: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            url: url.into(),
            state_tx,
            events_tx,
            terminal: Arc::new(AtomicBool::new(false)),
            conn: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Whether the server rejected this channel for good; no reconnect
    /// may follow.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_terminal() {
            return Err(TransportError::Terminal);
        }
        let mut conn = self.conn.lock().await;
        if self.state().is_open() {
            return Ok(());
        }
        self.state_tx.send_replace(ConnectionState::Connecting);

        let stream = match timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
            Err(_) => {
                self.state_tx.send_replace(ConnectionState::Failed);
                return Err(TransportError::Timeout);
            }
            Ok(Err(err)) => {
                self.state_tx.send_replace(ConnectionState::Failed);
                return Err(TransportError::Handshake(err.to_string()));
            }
            Ok(Ok((stream, _response))) => stream,
        };

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let events = self.events_tx.clone();
        let state = self.state_tx.clone();
        let terminal = self.terminal.clone();
        let mut read_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut terminal_close = false;
            loop {
                tokio::select! {
                    _ = read_shutdown.recv() => break,
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<PushMessage>(&text) {
                                Ok(message) => {
                                    let _ = events.send(ChannelEvent::Message(message));
                                }
                                Err(err) => {
                                    warn!(%err, "dropping malformed realtime message");
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            if let Some(frame) = frame {
                                let code = u16::from(frame.code);
                                if frame.code == CloseCode::Policy || code == 403 {
                                    terminal_close = true;
                                }
                                info!(code, "realtime channel closed by server");
                            } else {
                                info!("realtime channel closed by server");
                            }
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ping/pong are answered by tungstenite itself;
                            // binary frames are not part of the protocol.
                        }
                        Some(Err(err)) => {
                            warn!(%err, "realtime channel read error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            if terminal_close {
                terminal.store(true, Ordering::SeqCst);
            }
            state.send_replace(ConnectionState::Closed);
            let _ = events.send(ChannelEvent::Closed {
                terminal: terminal_close,
            });
        });

        let mut write_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_shutdown.recv() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    payload = outbound_rx.recv() => match payload {
                        Some(value) => match serde_json::to_string(&value) {
                            Ok(json) => {
                                if let Err(err) = write.send(Message::Text(json.into())).await {
                                    warn!(%err, "realtime send failed");
                                    break;
                                }
                            }
                            Err(err) => warn!(%err, "failed to encode outbound payload"),
                        },
                        None => break,
                    }
                }
            }
        });

        *conn = Some(ActiveConnection {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        });
        self.state_tx.send_replace(ConnectionState::Open);
        let _ = self.events_tx.send(ChannelEvent::Connected);
        info!(url = %self.url, "realtime channel connected");
        Ok(())
    }

    // Logged no-op when the channel is not open.
    pub async fn send(&self, payload: serde_json::Value) {
        if !self.state().is_open() {
            warn!("realtime channel is not open; dropping outbound message");
            return;
        }
        let conn = self.conn.lock().await;
        match conn.as_ref() {
            Some(active) => {
                if active.outbound.send(payload).is_err() {
                    warn!("realtime channel writer is gone; dropping outbound message");
                }
            }
            None => warn!("realtime channel is not open; dropping outbound message"),
        }
    }

    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(active) = conn.take() {
            debug!("disconnecting realtime channel");
            let _ = active.shutdown.send(());
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }
}
