// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the single broker connection and the channel derived from it.
//!
//! `connect()` runs under an async mutex that doubles as the in-flight guard:
//! concurrent callers queue on the lock and find the channel already open once
//! they get it. Each attempt bumps a generation number. After a channel is
//! established every registered `ChannelSetup` (queue topology, reply consumer)
//! runs against it; a setup failure counts as a failed attempt.
//!
//! Connection and channel errors arrive as `LifecycleEvent`s on a queue drained
//! by one supervising task. Events from an older generation are ignored, the
//! rest drive the supervisor to `Reconnecting` and through the same bounded
//! retry loop as the initial connect.

use crate::{
    broker::{BrokerChannel, Connector, LifecycleEvent, LifecycleSender},
    errors::AmqpError,
};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Lifecycle of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl ReconnectPolicy {
    /// A policy always makes at least one attempt.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        ReconnectPolicy {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::new(5, Duration::from_millis(5_000))
    }
}

/// Work that must be redone on every newly established channel.
#[async_trait]
pub trait ChannelSetup: Send + Sync {
    async fn setup(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError>;
}

struct Session {
    channel: Option<Arc<dyn BrokerChannel>>,
    generation: u64,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    setups: Vec<Arc<dyn ChannelSetup>>,
    session: Mutex<Session>,
    attempts: AtomicU32,
    state: watch::Sender<ConnectionState>,
    events_tx: LifecycleSender,
    events_rx: SyncMutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        setups: Vec<Arc<dyn ChannelSetup>>,
    ) -> Arc<ConnectionSupervisor> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(ConnectionSupervisor {
            connector,
            policy,
            setups,
            session: Mutex::new(Session {
                channel: None,
                generation: 0,
            }),
            attempts: AtomicU32::new(0),
            state,
            events_tx,
            events_rx: SyncMutex::new(Some(events_rx)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Attempts made by the connect in progress, or by the last failed one.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Establishes the session if there is no open channel.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.channel().await.map(|_| ())
    }

    /// Returns the open channel, connecting first when there is none or the
    /// current one has been reported closed.
    pub async fn channel(self: &Arc<Self>) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut session = self.session.lock().await;
        if let Some(channel) = session.channel.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }

        self.connect_locked(&mut session).await
    }

    /// Releases the channel, then the connection. Safe to call when nothing
    /// is connected.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        session.generation += 1;

        let result = match session.channel.take() {
            Some(channel) => {
                debug!("closing amqp channel and connection...");
                channel.close().await
            }
            None => Ok(()),
        };

        self.state.send_replace(ConnectionState::Disconnected);
        result
    }

    async fn connect_locked(
        self: &Arc<Self>,
        session: &mut Session,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.start_supervising();

        let phase = match session.channel.take() {
            Some(stale) => {
                if let Err(err) = stale.close().await {
                    debug!(error = err.to_string(), "failure to close stale channel");
                }
                ConnectionState::Reconnecting
            }
            None if self.state() == ConnectionState::Reconnecting => ConnectionState::Reconnecting,
            None => ConnectionState::Connecting,
        };

        self.attempts.store(0, Ordering::SeqCst);
        self.state.send_replace(phase);

        loop {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            session.generation += 1;
            debug!(attempt, generation = session.generation, "creating amqp connection...");

            match self.open(session.generation).await {
                Ok(channel) => {
                    session.channel = Some(channel.clone());
                    self.attempts.store(0, Ordering::SeqCst);
                    self.state.send_replace(ConnectionState::Connected);
                    info!(generation = session.generation, "amqp connected");
                    return Ok(channel);
                }
                Err(err) if attempt >= self.policy.max_attempts => {
                    error!(
                        error = err.to_string(),
                        attempts = attempt,
                        "giving up connecting to the broker"
                    );
                    self.state.send_replace(ConnectionState::Failed);
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        "failure to connect, retrying"
                    );
                    tokio::time::sleep(self.policy.delay).await;
                }
            }
        }
    }

    async fn open(&self, generation: u64) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self
            .connector
            .connect(generation, self.events_tx.clone())
            .await?;

        for setup in &self.setups {
            if let Err(err) = setup.setup(&channel).await {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "failure to close channel");
                }
                return Err(err);
            }
        }

        Ok(channel)
    }

    fn start_supervising(self: &Arc<Self>) {
        if let Some(events) = self.events_rx.lock().take() {
            tokio::spawn(supervise(Arc::downgrade(self), events));
        }
    }

    async fn handle_lifecycle(self: &Arc<Self>, event: LifecycleEvent) {
        let mut session = self.session.lock().await;
        if event.generation() != session.generation || session.channel.is_none() {
            debug!(
                generation = event.generation(),
                current = session.generation,
                "ignoring lifecycle event from a superseded session"
            );
            return;
        }

        warn!(reason = event.reason(), "broker session lost, reconnecting");
        self.state.send_replace(ConnectionState::Reconnecting);

        if let Err(err) = self.connect_locked(&mut session).await {
            error!(error = err.to_string(), "failure to reconnect");
        }
    }
}

async fn supervise(
    supervisor: Weak<ConnectionSupervisor>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };
        supervisor.handle_lifecycle(event).await;
    }
    debug!("connection supervision stopped");
}
