//! Broker connection manager with indefinite reconnect and observable health.
//!
//! Uses `ArcSwap` for lock-free health reads and a `watch` channel for
//! health change notifications. A single async mutex guards the cached
//! channel, so at most one connect loop runs per manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Connector};
use crate::config::BrokerConfig;
use crate::telemetry::BROKER_CONNECT_FAILURES_TOTAL;

/// Health of the broker connection.
///
/// State machine: Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel has been requested yet, or the last one was invalidated.
    Disconnected,
    /// First connect loop is running.
    Connecting,
    /// A channel is open and cached.
    Connected,
    /// A previously open channel was lost and the connect loop is running again.
    Reconnecting,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Owns the broker channel shared by publishers and servers of one process.
///
/// `get_channel()` never fails: it retries until the broker accepts a
/// connection, sleeping between attempts according to [`BrokerConfig`].
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: BrokerConfig,
    channel: Mutex<Option<Arc<dyn Broker>>>,
    state: ArcSwap<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    failed_attempts: AtomicU64,
    connections: AtomicU64,
}

impl ConnectionManager {
    /// Creates a manager without connecting.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: BrokerConfig) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            config,
            channel: Mutex::new(None),
            state: ArcSwap::from_pointee(ConnectionState::Disconnected),
            state_tx,
            failed_attempts: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        }
    }

    /// Returns an open channel, connecting (and retrying forever) if needed.
    pub async fn get_channel(&self) -> Arc<dyn Broker> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Arc::clone(channel);
            }
        }

        let had_channel = slot.take().is_some() || self.connections.load(Ordering::Relaxed) > 0;
        self.set_state(if had_channel {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let endpoint = self.connector.endpoint();
        let mut delay = self.config.retry_interval;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(channel) => {
                    self.failed_attempts.store(0, Ordering::Relaxed);
                    self.connections.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    info!(endpoint = %endpoint, attempt, "connected to broker");
                    *slot = Some(Arc::clone(&channel));
                    return channel;
                }
                Err(err) => {
                    self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(BROKER_CONNECT_FAILURES_TOTAL).increment(1);
                    let retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        retry_in_ms,
                        error = %err,
                        "broker connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.config.next_delay(delay);
                }
            }
        }
    }

    /// Drops the cached channel if it is still `stale`, forcing the next
    /// `get_channel()` to reconnect. A channel replaced in the meantime is kept.
    pub async fn invalidate(&self, stale: &Arc<dyn Broker>) {
        let mut slot = self.channel.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *slot = None;
            self.set_state(ConnectionState::Disconnected);
            warn!(endpoint = %self.connector.endpoint(), "broker channel invalidated");
        }
    }

    /// Returns the current connection health.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        **self.state.load()
    }

    /// Returns a receiver notified on every health transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Failed connect attempts since the last successful connection.
    #[must_use]
    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// Successful connections over the manager's lifetime.
    #[must_use]
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Base delay between reconnect attempts.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.config.retry_interval
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(state = state.as_str(), "broker connection state changed");
        self.state.store(Arc::new(state));
        self.state_tx.send_replace(state);
    }
}
