// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! The `ConnectionManager` owns the single broker connection of the process and
//! the channel pool bound to it. It connects with bounded retries, reconnects on
//! its own after an unexpected loss, and reports every lifecycle transition on a
//! `watch` channel:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!                     |                           |
//!                     +----------> Failed <-------+
//! any -> Closing -> Closed
//! ```
//!
//! `Closed` and `Failed` are terminal: no operation leaves them except that a
//! failed manager can still be shut down.

use crate::{
    backoff::ExponentialBackoff,
    channel::{ChannelKey, ChannelPool},
    configs::RabbitMQConfigs,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Failed)
                | (Disconnected | Connecting | Connected | Reconnecting | Failed, Closing)
                | (Closing, Closed)
        )
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str, name: &str) -> Result<Connection, AmqpError>;
}

/// Connector backed by `lapin`.
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str, name: &str) -> Result<Connection, AmqpError> {
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

        Connection::connect(uri, options)
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// Retry limits of the connection manager.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts made by `connect()`.
    pub connect_attempts: u32,
    /// Attempts made after an unexpected loss.
    pub reconnect_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl From<&RabbitMQConfigs> for ReconnectPolicy {
    fn from(cfg: &RabbitMQConfigs) -> Self {
        ReconnectPolicy {
            connect_attempts: cfg.connect_attempts.max(1),
            reconnect_attempts: cfg.max_reconnect_attempts.max(1),
            backoff: ExponentialBackoff::new(cfg.connect_delay, cfg.max_delay, cfg.jitter),
        }
    }
}

/// Supervises the single broker connection of the process.
///
/// Shared as `Arc<ConnectionManager>`; the publisher, the dispatcher and the
/// topology setup all take their channels from its pool.
pub struct ConnectionManager {
    uri: String,
    name: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connection: Mutex<Option<Arc<Connection>>>,
    connect_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
    closing: AtomicBool,
    failed: AtomicBool,
    attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
    channels: ChannelPool<Channel>,
}

impl ConnectionManager {
    /// Creates a manager in the `Disconnected` state.
    ///
    /// # Parameters
    /// * `uri` - AMQP URI of the broker
    /// * `name` - Connection name shown in the broker's management UI
    /// * `connector` - Opens the actual connections
    /// * `policy` - Attempt limits and backoff for connecting and reconnecting
    ///
    /// # Returns
    /// An Arc-wrapped manager; reconnect callbacks hold a weak reference to it
    pub fn new(
        uri: &str,
        name: &str,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Arc<ConnectionManager> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(ConnectionManager {
            uri: uri.to_owned(),
            name: name.to_owned(),
            connector,
            policy,
            connection: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            state,
            closing: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
            channels: ChannelPool::new(),
        })
    }

    /// Builds a manager that connects with `lapin` using the given settings.
    pub fn from_configs(cfg: &RabbitMQConfigs, name: &str) -> Arc<ConnectionManager> {
        ConnectionManager::new(&cfg.uri(), name, Arc::new(AmqpConnector), cfg.into())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// True when the connection is currently established and open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.current().is_some()
    }

    /// Attempts made by the connect/reconnect cycle in progress (or the last one).
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connects to the broker.
    ///
    /// Returns at once when already connected; a caller arriving while an
    /// attempt is in flight waits for that attempt instead of starting another.
    ///
    /// # Returns
    /// The live connection, or `PermanentConnectionFailure` once every attempt
    /// allowed by the policy has failed
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<Connection>, AmqpError> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }
        self.ensure_usable()?;

        let _guard = self.connect_lock.lock().await;

        if let Some(conn) = self.current() {
            return Ok(conn);
        }
        self.ensure_usable()?;

        self.establish(self.policy.connect_attempts).await
    }

    /// Returns the pooled channel for `key`, creating it with `prepare` when needed.
    ///
    /// # Parameters
    /// * `key` - Purpose and queue of the channel
    /// * `prepare` - Runs once on a freshly created channel (confirm mode, queue
    ///   assertion, ...) before it enters the pool
    ///
    /// # Returns
    /// The shared channel, `ConnectionUnavailable` when there is no live
    /// connection, or the permanent failure once the manager gave up
    pub async fn channel<F, Fut>(
        &self,
        key: &ChannelKey,
        prepare: F,
    ) -> Result<Arc<Channel>, AmqpError>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<Channel, AmqpError>>,
    {
        self.ensure_usable()?;
        let conn = self.current().ok_or(AmqpError::ConnectionUnavailable)?;

        self.channels
            .get_or_create(key, || async move {
                let channel = conn.create_channel().await.map_err(|err| {
                    error!(error = err.to_string(), key = %key, "error to create the channel");
                    AmqpError::ChannelError(err.to_string())
                })?;
                prepare(channel).await
            })
            .await
    }

    /// Drops the pooled channel for `key` so the next request recreates it.
    pub fn evict_channel(&self, key: &ChannelKey) {
        if self.channels.evict(key).is_some() {
            debug!(key = %key, "channel evicted");
        }
    }

    /// Closes every channel and then the connection.
    ///
    /// Suppresses any further reconnect. If the graceful close does not finish
    /// within `timeout` the connection is dropped instead.
    pub async fn close(&self, timeout: Duration) -> Result<(), AmqpError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("connection already closing");
            return Ok(());
        }
        self.transition(ConnectionState::Closing);

        let channels = self.channels.drain();
        let conn = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let graceful = async {
            for channel in channels {
                if channel.status().connected() {
                    if let Err(err) = channel.close(200, "shutdown").await {
                        warn!(error = err.to_string(), "error closing channel");
                    }
                }
            }

            if let Some(conn) = &conn {
                if conn.status().connected() {
                    if let Err(err) = conn.close(200, "shutdown").await {
                        warn!(error = err.to_string(), "error closing connection");
                    }
                }
            }
        };

        let result = match tokio::time::timeout(timeout, graceful).await {
            Ok(()) => {
                info!("connection closed");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?timeout, "graceful close timed out, forcing disconnect");
                Err(AmqpError::ShutdownTimeout(timeout))
            }
        };

        drop(conn);
        self.transition(ConnectionState::Closed);
        result
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|conn| conn.status().connected())
            .cloned()
    }

    fn ensure_usable(&self) -> Result<(), AmqpError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionClosed);
        }
        if self.failed.load(Ordering::SeqCst) {
            return Err(AmqpError::PermanentConnectionFailure(
                self.attempts.load(Ordering::SeqCst),
            ));
        }
        Ok(())
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if state.can_transition(next) {
                debug!(from = ?*state, to = ?next, "connection state changed");
                *state = next;
                true
            } else {
                if *state != next {
                    warn!(
                        from = ?*state,
                        to = ?next,
                        "ignoring invalid connection state transition"
                    );
                }
                false
            }
        });
    }

    fn record_error(&self, err: &AmqpError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    /// Runs the connect loop; the caller must hold `connect_lock`.
    async fn establish(self: &Arc<Self>, max_attempts: u32) -> Result<Arc<Connection>, AmqpError> {
        self.attempts.store(0, Ordering::SeqCst);

        for attempt in 0..max_attempts {
            if self.closing.load(Ordering::SeqCst) {
                return Err(AmqpError::ConnectionClosed);
            }

            self.attempts.store(attempt + 1, Ordering::SeqCst);
            self.transition(ConnectionState::Connecting);
            debug!(attempt = attempt + 1, "creating amqp connection...");

            match self.connector.connect(&self.uri, &self.name).await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    self.watch_connection(&conn);
                    self.channels.drain();

                    if let Err(stale) =
                        store_unless_closing(&self.connection, &self.closing, conn.clone())
                    {
                        if let Some(stale) = stale {
                            let _ = stale.close(200, "shutdown").await;
                        }
                        return Err(AmqpError::ConnectionClosed);
                    }
                    self.transition(ConnectionState::Connected);
                    info!(attempt = attempt + 1, "amqp connected");

                    return Ok(conn);
                }
                Err(err) => {
                    self.record_error(&err);

                    if attempt + 1 >= max_attempts {
                        break;
                    }

                    let delay = self.policy.backoff.delay(attempt);
                    warn!(
                        error = err.to_string(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "failure to connect, retrying"
                    );
                    self.transition(ConnectionState::Reconnecting);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        error!(attempts = max_attempts, "giving up connecting to the broker");
        self.failed.store(true, Ordering::SeqCst);
        self.transition(ConnectionState::Failed);

        Err(AmqpError::PermanentConnectionFailure(max_attempts))
    }

    /// Hooks the connection's error callback up to the reconnect loop.
    fn watch_connection(self: &Arc<Self>, conn: &Connection) {
        let manager: Weak<ConnectionManager> = Arc::downgrade(self);
        let runtime = Handle::current();

        conn.on_error(move |err| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let reason = err.to_string();
            runtime.spawn(async move { manager.recover(reason).await });
        });
    }

    async fn recover(self: Arc<Self>, reason: String) {
        if self.closing.load(Ordering::SeqCst) {
            debug!("connection closed on request, not reconnecting");
            return;
        }

        let _guard = self.connect_lock.lock().await;
        if self.current().is_some() || self.closing.load(Ordering::SeqCst) {
            return;
        }

        warn!(error = reason, "amqp connection lost, reconnecting");
        self.record_error(&AmqpError::ConnectionError(reason));
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.channels.drain();
        self.transition(ConnectionState::Reconnecting);

        if let Err(err) = self.establish(self.policy.reconnect_attempts).await {
            error!(error = err.to_string(), "reconnect failed");
        }
    }
}

/// Stores `conn` in `slot` unless a close has begun.
///
/// The closing flag is read again after the store, so a `close()` racing the
/// store either takes the connection out of the slot itself or the connection
/// is handed back here to be closed by the caller.
fn store_unless_closing<T>(
    slot: &Mutex<Option<T>>,
    closing: &AtomicBool,
    conn: T,
) -> Result<(), Option<T>> {
    if closing.load(Ordering::SeqCst) {
        return Err(Some(conn));
    }

    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);

    if closing.load(Ordering::SeqCst) {
        return Err(slot.lock().unwrap_or_else(PoisonError::into_inner).take());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RefusingConnector {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _uri: &str, _name: &str) -> Result<Connection, AmqpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(AmqpError::ConnectionError("connection refused".to_owned()))
        }
    }

    fn manager(attempts: u32) -> (Arc<ConnectionManager>, Arc<RefusingConnector>) {
        let connector = Arc::new(RefusingConnector {
            calls: AtomicUsize::new(0),
        });
        let policy = ReconnectPolicy {
            connect_attempts: attempts,
            reconnect_attempts: attempts,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_millis(10),
            ),
        };
        let manager = ConnectionManager::new("amqp://localhost", "test", connector.clone(), policy);
        (manager, connector)
    }

    fn connected(manager: &ConnectionManager) {
        manager.transition(ConnectionState::Connecting);
        manager.transition(ConnectionState::Connected);
    }

    #[test]
    fn state_machine_transitions() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Reconnecting));
        assert!(Reconnecting.can_transition(Connecting));
        assert!(Connected.can_transition(Closing));
        assert!(Closing.can_transition(Closed));
        assert!(Failed.can_transition(Closing));

        assert!(!Closed.can_transition(Connecting));
        assert!(!Closed.can_transition(Disconnected));
        assert!(!Failed.can_transition(Connecting));
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Closing.can_transition(Connecting));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let (manager, connector) = manager(3);
        let mut states = manager.subscribe_state();

        let err = manager.connect().await.unwrap_err();

        assert_eq!(err, AmqpError::PermanentConnectionFailure(3));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Failed);
        assert!(manager.last_error().unwrap().contains("connection refused"));
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_with_backoff_between_attempts() {
        let (manager, _) = manager(3);
        let started = tokio::time::Instant::now();

        let _ = manager.connect().await;

        // 3 connect calls of 5ms, then 100ms and 200ms of backoff plus up to 10ms jitter each.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(315));
        assert!(elapsed <= Duration::from_millis(335));
    }

    #[tokio::test(start_paused = true)]
    async fn fails_fast_after_permanent_failure() {
        let (manager, connector) = manager(2);

        let _ = manager.connect().await;
        let err = manager.connect().await.unwrap_err();

        assert_eq!(err, AmqpError::PermanentConnectionFailure(2));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);

        let err = manager
            .channel(&ChannelKey::publish("q"), |channel| async move { Ok(channel) })
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::PermanentConnectionFailure(2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_attempt_cycle() {
        let (manager, connector) = manager(2);

        let (a, b) = tokio::join!(manager.connect(), manager.connect());

        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_requires_a_connection() {
        let (manager, _) = manager(1);

        let err = manager
            .channel(&ChannelKey::setup("q"), |channel| async move { Ok(channel) })
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::ConnectionUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_terminal() {
        let (manager, connector) = manager(3);

        manager.close(Duration::from_secs(1)).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.connect().await.unwrap_err(), AmqpError::ConnectionClosed);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_reconnects_until_giving_up() {
        let (manager, connector) = manager(3);
        connected(&manager);

        let mut states = manager.subscribe_state();
        let observer = tokio::spawn(async move {
            let mut seen = vec![];
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == ConnectionState::Failed {
                    break;
                }
            }
            seen
        });

        manager.clone().recover("connection reset by peer".to_owned()).await;
        let seen = observer.await.unwrap();

        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.reconnect_attempts(), 3);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(
            seen.iter()
                .filter(|state| **state == ConnectionState::Connecting)
                .count(),
            3
        );
        assert!(seen.contains(&ConnectionState::Reconnecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Failed));
        assert_eq!(
            manager.connect().await.unwrap_err(),
            AmqpError::PermanentConnectionFailure(3)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_suppresses_reconnect() {
        let (manager, connector) = manager(3);
        connected(&manager);

        manager.close(Duration::from_secs(1)).await.unwrap();
        manager.clone().recover("connection closed".to_owned()).await;

        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[test]
    fn stores_connection_while_open() {
        let slot = Mutex::new(None);
        let closing = AtomicBool::new(false);

        assert_eq!(store_unless_closing(&slot, &closing, 7u8), Ok(()));
        assert_eq!(*slot.lock().unwrap(), Some(7));
    }

    #[test]
    fn hands_back_connection_when_closing() {
        let slot = Mutex::new(None);
        let closing = AtomicBool::new(true);

        assert_eq!(store_unless_closing(&slot, &closing, 7u8), Err(Some(7)));
        assert_eq!(*slot.lock().unwrap(), None);
    }
}
