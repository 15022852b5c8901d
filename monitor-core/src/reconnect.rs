use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, DisasterChannel};
use crate::error::TransportError;

/// Reconnect bounds: after `max_attempts` consecutive failed attempts
/// the channel is abandoned and polling carries the dashboard.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// `attempt` is the 1-based number of the connection attempt within the
/// current failure streak; reaching open starts a fresh streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Connecting { attempt: u32 },
    Open,
    Backoff { attempt: u32 },
    Terminal,
}

/// Pure transition core of the reconnect loop; holds no timers and does
/// no I/O.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    policy: ReconnectPolicy,
    state: ReconnectState,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ReconnectState::Connecting { attempt: 1 },
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn retry_delay(&self) -> Duration {
        self.policy.retry_delay
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ReconnectState::Terminal)
    }

    pub fn on_open(&mut self) -> ReconnectState {
        self.state = ReconnectState::Open;
        self.state
    }

    // Once max_attempts consecutive attempts have failed there is no
    // backoff: the machine lands in Terminal and no further attempt fires.
    pub fn on_failure(&mut self) -> ReconnectState {
        self.state = match self.state {
            ReconnectState::Connecting { attempt } if attempt >= self.policy.max_attempts => {
                ReconnectState::Terminal
            }
            ReconnectState::Connecting { attempt } => ReconnectState::Backoff { attempt },
            ReconnectState::Open => ReconnectState::Backoff { attempt: 1 },
            other => other,
        };
        self.state
    }

    // Short-circuits to Terminal regardless of the attempt count.
    pub fn on_terminal_close(&mut self) -> ReconnectState {
        self.state = ReconnectState::Terminal;
        self.state
    }

    pub fn begin_retry(&mut self) -> ReconnectState {
        if let ReconnectState::Backoff { attempt } = self.state {
            self.state = ReconnectState::Connecting {
                attempt: attempt + 1,
            };
        }
        self.state
    }
}

pub struct SupervisorHandle {
    cancel_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Cancels any pending retry timer and joins the loop.
    pub async fn stop(self) -> Result<(), TransportError> {
        let _ = self.cancel_tx.send(());
        self.join.await.map_err(TransportError::from)
    }
}

/// Drives the channel through the reconnect state machine. The single
/// loop owns the only retry timer, so at most one retry is ever pending.
pub fn spawn_supervisor(channel: Arc<DisasterChannel>, policy: ReconnectPolicy) -> SupervisorHandle {
    let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
    let join = tokio::spawn(async move {
        let mut machine = ReconnectMachine::new(policy);
        loop {
            let ReconnectState::Connecting { attempt } = machine.state() else {
                break;
            };
            // Subscribe before connecting so a close racing the
            // handshake is not missed.
            let mut events = channel.subscribe();
            debug!(attempt, "opening realtime channel");
            let connected = tokio::select! {
                _ = cancel_rx.recv() => return,
                result = channel.connect() => result,
            };
            match connected {
                Ok(()) => {
                    machine.on_open();
                    let outcome = loop {
                        tokio::select! {
                            _ = cancel_rx.recv() => break None,
                            event = events.recv() => match event {
                                Ok(ChannelEvent::Closed { terminal }) => break Some(terminal),
                                Ok(_) => continue,
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    warn!(skipped, "reconnect supervisor lagged behind channel events");
                                    continue;
                                }
                                Err(broadcast::error::RecvError::Closed) => break Some(false),
                            }
                        }
                    };
                    match outcome {
                        None => {
                            channel.disconnect().await;
                            return;
                        }
                        Some(true) => {
                            machine.on_terminal_close();
                        }
                        Some(false) => {
                            machine.on_failure();
                        }
                    }
                }
                Err(TransportError::Terminal) => {
                    machine.on_terminal_close();
                }
                Err(err) => {
                    warn!(%err, attempt, "realtime connection attempt failed");
                    machine.on_failure();
                }
            }

            if let ReconnectState::Backoff { attempt } = machine.state() {
                info!(
                    failures = attempt,
                    delay_ms = policy.retry_delay.as_millis() as u64,
                    "scheduling realtime reconnect"
                );
                tokio::select! {
                    _ = cancel_rx.recv() => return,
                    _ = tokio::time::sleep(policy.retry_delay) => {
                        machine.begin_retry();
                    }
                }
            }
        }
        info!("realtime channel permanently unavailable; polling carries updates");
    });
    SupervisorHandle { cancel_tx, join }
}
