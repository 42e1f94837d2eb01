//! The feed-notification hub.
//!
//! One coordinator loop ([`Hub::run`]) owns the registry of live connections.
//! Registration, unregistration and broadcast triggers reach it as messages,
//! so the registry itself is never shared. Deliveries run on their own tasks
//! and never block the loop.

use bytes::Bytes;
use feedhub_protocol::CounterRenderer;
use feedhub_transport::Transport;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{wait_until_set, Connection, ConnectionId, Enqueue};
use crate::counter::{render_counter, CounterError};
use crate::feed::{FeedId, UserId};
use crate::store::FeedStore;

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The coordinator loop is not running anymore.
    #[error("Hub stopped")]
    Stopped,

    /// The coordinator loop was started twice.
    #[error("Hub already running")]
    AlreadyRunning,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Deadline for a single transport write.
    pub write_timeout: Duration,
    /// Period of the `ping` keepalive probe.
    pub keepalive_interval: Duration,
    /// How long a delivery waits for outbound queue space.
    pub delivery_timeout: Duration,
    /// Capacity of the broadcast trigger queue.
    pub broadcast_capacity: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Number of newest feeds considered when counting unread items.
    pub feed_window: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5 * 60),
            delivery_timeout: Duration::from_secs(30),
            broadcast_capacity: 100,
            outbound_capacity: 256,
            feed_window: 100,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of registered connections.
    pub connections: usize,
    /// Fan-outs performed.
    pub broadcasts_processed: u64,
    /// Triggers folded into an earlier fan-out.
    pub broadcasts_coalesced: u64,
    /// Triggers dropped because the trigger queue was full.
    pub broadcasts_dropped: u64,
    /// Initial sends and fan-out deliveries started.
    pub deliveries_attempted: u64,
    /// Deliveries that reached an outbound queue.
    pub deliveries_queued: u64,
    /// Deliveries dropped after waiting for queue space.
    pub deliveries_timed_out: u64,
    /// Deliveries skipped because the counter could not be produced.
    pub render_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicUsize,
    broadcasts_processed: AtomicU64,
    broadcasts_coalesced: AtomicU64,
    broadcasts_dropped: AtomicU64,
    deliveries_attempted: AtomicU64,
    deliveries_queued: AtomicU64,
    deliveries_timed_out: AtomicU64,
    render_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> HubStats {
        HubStats {
            connections: self.connections.load(Ordering::Acquire),
            broadcasts_processed: self.broadcasts_processed.load(Ordering::Relaxed),
            broadcasts_coalesced: self.broadcasts_coalesced.load(Ordering::Relaxed),
            broadcasts_dropped: self.broadcasts_dropped.load(Ordering::Relaxed),
            deliveries_attempted: self.deliveries_attempted.load(Ordering::Relaxed),
            deliveries_queued: self.deliveries_queued.load(Ordering::Relaxed),
            deliveries_timed_out: self.deliveries_timed_out.load(Ordering::Relaxed),
            render_failures: self.render_failures.load(Ordering::Relaxed),
        }
    }
}

/// A cloneable, non-blocking broadcast trigger.
///
/// Feed writers hold one of these instead of the hub itself.
#[derive(Debug, Clone)]
pub struct BroadcastHandle {
    triggers: mpsc::Sender<()>,
    counters: Arc<Counters>,
}

impl BroadcastHandle {
    /// Ask the hub to push fresh counters to every connection.
    ///
    /// Never blocks. When the trigger queue is full the request is dropped:
    /// the queued triggers already recompute the full current state.
    pub fn broadcast(&self) {
        match self.triggers.try_send(()) {
            Ok(()) => debug!("Feed update notification queued"),
            Err(TrySendError::Full(())) => {
                self.counters
                    .broadcasts_dropped
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Broadcast channel full, skipping notification");
            }
            Err(TrySendError::Closed(())) => {
                debug!("Hub stopped, dropping broadcast");
            }
        }
    }
}

enum Command {
    Register {
        connection: Arc<Connection>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
        ack: oneshot::Sender<bool>,
    },
}

struct Receivers {
    commands: mpsc::UnboundedReceiver<Command>,
    triggers: mpsc::Receiver<()>,
}

/// State shared between the coordinator and delivery tasks.
struct Shared {
    config: HubConfig,
    store: Arc<dyn FeedStore>,
    renderer: Arc<dyn CounterRenderer>,
    counters: Arc<Counters>,
}

#[derive(Debug, Clone, Copy)]
enum DeliveryKind {
    Initial,
    Update,
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Update => write!(f, "update"),
        }
    }
}

impl Shared {
    async fn render(&self, watermark: FeedId) -> Result<Bytes, CounterError> {
        render_counter(
            self.store.as_ref(),
            self.renderer.as_ref(),
            watermark,
            self.config.feed_window,
        )
        .await
    }

    async fn deliver(&self, connection: &Connection, kind: DeliveryKind) {
        self.counters
            .deliveries_attempted
            .fetch_add(1, Ordering::Relaxed);

        let payload = match self.render(connection.watermark()).await {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.render_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    user_id = connection.user_id(),
                    connection = %connection.id(),
                    %kind,
                    error = %e,
                    "Error rendering feed counter"
                );
                return;
            }
        };

        match connection
            .enqueue(payload, self.config.delivery_timeout)
            .await
        {
            Enqueue::Queued => {
                self.counters
                    .deliveries_queued
                    .fetch_add(1, Ordering::Relaxed);
                trace!(connection = %connection.id(), %kind, "Feed counter queued");
            }
            Enqueue::TimedOut => {
                // The client may only be suspended; keep it registered
                self.counters
                    .deliveries_timed_out
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    user_id = connection.user_id(),
                    connection = %connection.id(),
                    %kind,
                    "Timeout sending feed counter"
                );
            }
            Enqueue::Closed => {
                debug!(connection = %connection.id(), %kind, "Connection closed before delivery");
            }
        }
    }
}

/// Handle to the feed-notification hub.
///
/// Cloning is cheap; every clone talks to the same coordinator.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    broadcaster: BroadcastHandle,
    receivers: Arc<Mutex<Option<Receivers>>>,
}

impl Hub {
    /// Create a hub reading `store` and rendering with `renderer`.
    ///
    /// Nothing happens until [`Hub::run`] is spawned.
    #[must_use]
    pub fn new(
        config: HubConfig,
        store: Arc<dyn FeedStore>,
        renderer: Arc<dyn CounterRenderer>,
    ) -> Self {
        info!("Creating feed hub with config: {:?}", config);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (triggers_tx, triggers_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let counters = Arc::new(Counters::default());

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                renderer,
                counters: counters.clone(),
            }),
            commands: commands_tx,
            broadcaster: BroadcastHandle {
                triggers: triggers_tx,
                counters,
            },
            receivers: Arc::new(Mutex::new(Some(Receivers {
                commands: commands_rx,
                triggers: triggers_rx,
            }))),
        }
    }

    /// Get the hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Get a broadcast trigger for feed writers.
    #[must_use]
    pub fn broadcaster(&self) -> BroadcastHandle {
        self.broadcaster.clone()
    }

    /// Run the coordinator loop until `shutdown` turns `true`.
    ///
    /// On shutdown every registered connection is closed and the registry is
    /// emptied before this returns. A dropped shutdown sender counts as
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::AlreadyRunning`] if the loop was started before.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), HubError> {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Receivers {
            mut commands,
            mut triggers,
        }) = receivers
        else {
            return Err(HubError::AlreadyRunning);
        };

        info!("Starting feed notification hub");

        let mut registry: HashMap<ConnectionId, Arc<Connection>> = HashMap::new();

        loop {
            tokio::select! {
                _ = wait_until_set(&mut shutdown) => break,
                Some(command) = commands.recv() => self.handle_command(&mut registry, command),
                Some(()) = triggers.recv() => {
                    let mut coalesced = 0u64;
                    while triggers.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    self.fan_out(&registry, coalesced);
                }
            }
        }

        info!("Shutting down feed notification hub");
        self.close_all(&mut registry);
        Ok(())
    }

    /// Register a connection for `user_id`.
    ///
    /// `watermark` is the id of the last feed the user has seen; it is
    /// captured once and used for every count sent to this connection. The
    /// connection is in the registry when this returns, and its initial
    /// counter is on its way. Start [`Connection::write_pump`] and
    /// [`Connection::read_pump`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Stopped`] if the coordinator is not running.
    pub async fn register(
        &self,
        user_id: UserId,
        watermark: FeedId,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Connection>, HubError> {
        let connection = Arc::new(Connection::new(
            user_id,
            watermark,
            transport,
            &self.shared.config,
        ));
        info!(user_id, connection = %connection.id(), watermark, "Registering new connection");

        let (ack, registered) = oneshot::channel();
        self.commands
            .send(Command::Register {
                connection: connection.clone(),
                ack,
            })
            .map_err(|_| HubError::Stopped)?;
        registered.await.map_err(|_| HubError::Stopped)?;

        Ok(connection)
    }

    /// Remove `connection` from the registry and close its queue and done
    /// signal.
    ///
    /// Returns `true` if the connection was registered. Unknown connections
    /// and a stopped hub are silent no-ops.
    pub async fn unregister(&self, connection: &Connection) -> bool {
        let (ack, removed) = oneshot::channel();
        if self
            .commands
            .send(Command::Unregister {
                id: connection.id(),
                ack,
            })
            .is_err()
        {
            debug!(connection = %connection.id(), "Hub stopped, nothing to unregister");
            return false;
        }

        removed.await.unwrap_or(false)
    }

    /// Queue a counter refresh for every connection. Never blocks.
    pub fn broadcast(&self) {
        self.broadcaster.broadcast();
    }

    /// Get the number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.counters.connections.load(Ordering::Acquire)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        self.shared.counters.snapshot()
    }

    fn handle_command(
        &self,
        registry: &mut HashMap<ConnectionId, Arc<Connection>>,
        command: Command,
    ) {
        match command {
            Command::Register { connection, ack } => {
                if !connection.mark_active() {
                    warn!(connection = %connection.id(), state = ?connection.state(), "Refusing to register inactive connection");
                    return;
                }
                registry.insert(connection.id(), connection.clone());
                self.publish_count(registry);
                let _ = ack.send(());

                info!(
                    user_id = connection.user_id(),
                    connection = %connection.id(),
                    transport = connection.transport(),
                    remote = connection.remote_addr().unwrap_or("-"),
                    connections = registry.len(),
                    "Registered connection"
                );

                self.spawn_delivery(connection, DeliveryKind::Initial);
            }
            Command::Unregister { id, ack } => {
                let removed = match registry.remove(&id) {
                    Some(connection) => {
                        self.publish_count(registry);
                        connection.begin_draining();
                        connection.close_resources();
                        info!(
                            user_id = connection.user_id(),
                            connection = %id,
                            remote = connection.remote_addr().unwrap_or("-"),
                            connections = registry.len(),
                            "Unregistered connection"
                        );
                        true
                    }
                    None => {
                        debug!(connection = %id, "Unregister of unknown connection");
                        false
                    }
                };
                let _ = ack.send(removed);
            }
        }
    }

    fn fan_out(&self, registry: &HashMap<ConnectionId, Arc<Connection>>, coalesced: u64) {
        let counters = &self.shared.counters;
        counters.broadcasts_processed.fetch_add(1, Ordering::Relaxed);
        counters
            .broadcasts_coalesced
            .fetch_add(coalesced, Ordering::Relaxed);

        let connections: Vec<Arc<Connection>> = registry.values().cloned().collect();
        debug!(
            connections = connections.len(),
            coalesced, "Broadcasting feed counter update to connections"
        );

        for connection in connections {
            self.spawn_delivery(connection, DeliveryKind::Update);
        }
    }

    fn spawn_delivery(&self, connection: Arc<Connection>, kind: DeliveryKind) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            shared.deliver(&connection, kind).await;
        });
    }

    fn close_all(&self, registry: &mut HashMap<ConnectionId, Arc<Connection>>) {
        let count = registry.len();
        for (_, connection) in registry.drain() {
            connection.close_resources();
            tokio::spawn(async move {
                connection.close_transport().await;
            });
        }
        self.publish_count(registry);

        info!(connections = count, "Closed all WebSocket connections");
    }

    fn publish_count(&self, registry: &HashMap<ConnectionId, Arc<Connection>>) {
        self.shared
            .counters
            .connections
            .store(registry.len(), Ordering::Release);
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::feed::Feed;
    use crate::store::{MemoryFeedStore, StoreError};
    use async_trait::async_trait;
    use feedhub_protocol::RenderError;
    use feedhub_transport::memory::{self, MemoryPeer};
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    fn count_renderer() -> Arc<dyn CounterRenderer> {
        Arc::new(|count: usize| Ok::<_, RenderError>(Bytes::from(count.to_string())))
    }

    fn store_with(ids: &[FeedId]) -> Arc<MemoryFeedStore> {
        Arc::new(MemoryFeedStore::with_feeds(ids.iter().map(|&id| {
            Feed::new(id, "trouble_report_add", serde_json::Value::Null, 1)
        })))
    }

    fn start(hub: &Hub) -> (watch::Sender<bool>, JoinHandle<Result<(), HubError>>) {
        let (shutdown, rx) = watch::channel(false);
        let runner = hub.clone();
        (shutdown, tokio::spawn(async move { runner.run(rx).await }))
    }

    async fn register(hub: &Hub, user_id: UserId, watermark: FeedId) -> (Arc<Connection>, MemoryPeer) {
        let (transport, peer) = memory::pair();
        let conn = hub.register(user_id, watermark, Box::new(transport)).await.unwrap();
        (conn, peer)
    }

    async fn wait_for(hub: &Hub, done: impl Fn(&HubStats) -> bool) {
        for _ in 0..1000 {
            if done(&hub.stats()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached: {:?}", hub.stats());
    }

    struct FailingStore;

    #[async_trait]
    impl FeedStore for FailingStore {
        async fn recent(&self, _limit: usize) -> Result<Vec<Feed>, StoreError> {
            Err(StoreError::Unavailable("database is locked".into()))
        }
    }

    #[tokio::test]
    async fn test_initial_count_for_new_connection() {
        let hub = Hub::new(HubConfig::default(), store_with(&[9, 8, 7, 6, 5, 4]), count_renderer());
        let (shutdown, task) = start(&hub);

        let (conn, _peer) = register(&hub, 42, 5).await;
        assert_eq!(conn.user_id(), 42);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(hub.connection_count(), 1);

        let mut outbound = conn.take_outbound().unwrap();
        assert_eq!(outbound.recv().await.unwrap(), Bytes::from_static(b"4"));

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_register_then_unregister() {
        let hub = Hub::new(HubConfig::default(), store_with(&[]), count_renderer());
        let (shutdown, task) = start(&hub);
        let before = hub.connection_count();

        let (conn, _peer) = register(&hub, 1, 0).await;
        let mut outbound = conn.take_outbound().unwrap();
        assert!(hub.unregister(&conn).await);

        assert_eq!(hub.connection_count(), before);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.is_done());
        // Whatever made it into the queue is still readable, then it ends
        while outbound.recv().await.is_some() {}

        // Second close is silent
        assert!(!conn.close_resources());
        assert!(!hub.unregister(&conn).await);

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unregister_unknown_connection() {
        let hub = Hub::new(HubConfig::default(), store_with(&[]), count_renderer());
        let other = Hub::new(HubConfig::default(), store_with(&[]), count_renderer());
        let (shutdown, task) = start(&hub);
        let (other_shutdown, other_task) = start(&other);

        let (_conn, _peer) = register(&hub, 1, 0).await;
        let (stranger, _stranger_peer) = register(&other, 2, 0).await;

        assert!(!hub.unregister(&stranger).await);
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(other.connection_count(), 1);
        // A connection held elsewhere is left untouched
        assert_eq!(stranger.state(), ConnectionState::Active);
        assert!(!stranger.is_done());

        shutdown.send_replace(true);
        other_shutdown.send_replace(true);
        task.await.unwrap().unwrap();
        other_task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_reaches_every_connection_independently() {
        let config = HubConfig {
            outbound_capacity: 1,
            ..HubConfig::default()
        };
        let store = store_with(&[3, 2, 1]);
        let hub = Hub::new(config.clone(), store.clone(), count_renderer());
        let (shutdown, task) = start(&hub);

        let (stuck, _p1) = register(&hub, 1, 0).await;
        let (fast_a, _p2) = register(&hub, 2, 1).await;
        let (fast_b, _p3) = register(&hub, 3, 2).await;
        let _stuck_rx = stuck.take_outbound().unwrap();
        let mut a_rx = fast_a.take_outbound().unwrap();
        let mut b_rx = fast_b.take_outbound().unwrap();

        wait_for(&hub, |s| s.deliveries_queued == 3).await;
        assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"2"));
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"1"));

        // The stuck connection never drains its full queue
        let start = Instant::now();
        store.insert("tool_add", serde_json::Value::Null, 9).await;
        hub.broadcast();

        assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"3"));
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"2"));
        assert!(start.elapsed() < config.delivery_timeout);

        tokio::time::sleep(config.delivery_timeout + Duration::from_secs(1)).await;
        let stats = hub.stats();
        assert_eq!(stats.broadcasts_processed, 1);
        assert_eq!(stats.deliveries_attempted, 6);
        assert_eq!(stats.deliveries_queued, 5);
        assert_eq!(stats.deliveries_timed_out, 1);

        // Timeouts do not unregister
        assert_eq!(hub.connection_count(), 3);
        assert_eq!(stuck.state(), ConnectionState::Active);

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_saturated_broadcasts_coalesce() {
        let config = HubConfig {
            broadcast_capacity: 100,
            ..HubConfig::default()
        };
        let hub = Hub::new(config, store_with(&[]), count_renderer());

        for _ in 0..150 {
            hub.broadcast();
        }
        assert_eq!(hub.stats().broadcasts_dropped, 50);

        let (shutdown, task) = start(&hub);
        wait_for(&hub, |s| s.broadcasts_processed == 1).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let stats = hub.stats();
        assert_eq!(stats.broadcasts_processed, 1);
        assert_eq!(stats.broadcasts_coalesced, 99);

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_render_failure_keeps_connection() {
        let hub = Hub::new(HubConfig::default(), Arc::new(FailingStore), count_renderer());
        let (shutdown, task) = start(&hub);

        let (conn, _peer) = register(&hub, 1, 0).await;
        wait_for(&hub, |s| s.render_failures == 1).await;

        hub.broadcast();
        wait_for(&hub, |s| s.render_failures == 2).await;

        assert_eq!(hub.connection_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(hub.stats().deliveries_queued, 0);

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = Hub::new(HubConfig::default(), store_with(&[1]), count_renderer());
        let (shutdown, task) = start(&hub);

        let (first, mut first_peer) = register(&hub, 1, 0).await;
        let (second, _second_peer) = register(&hub, 2, 0).await;
        assert_eq!(hub.connection_count(), 2);

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();

        assert_eq!(hub.connection_count(), 0);
        for conn in [&first, &second] {
            assert!(conn.is_done());
            assert_eq!(conn.state(), ConnectionState::Closed);
            assert!(!conn.close_resources());
        }
        assert_eq!(
            first_peer.recv().await,
            Some(memory::PeerEvent::Closed)
        );

        // Everything after shutdown is a quiet no-op or a clear error
        hub.broadcast();
        assert!(!hub.unregister(&first).await);
        let (transport, _peer) = memory::pair();
        assert!(matches!(
            hub.register(3, 0, Box::new(transport)).await,
            Err(HubError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_run_twice() {
        let hub = Hub::new(HubConfig::default(), store_with(&[]), count_renderer());
        let (shutdown, task) = start(&hub);
        let (_conn, _peer) = register(&hub, 1, 0).await;

        let (_tx, rx) = watch::channel(false);
        assert!(matches!(hub.run(rx).await, Err(HubError::AlreadyRunning)));

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_store_insert_triggers_broadcast() {
        let store = store_with(&[1, 2]);
        let hub = Hub::new(HubConfig::default(), store.clone(), count_renderer());
        assert!(store.attach_broadcaster(hub.broadcaster()));
        assert!(!store.attach_broadcaster(hub.broadcaster()));
        let (shutdown, task) = start(&hub);

        let (conn, _peer) = register(&hub, 1, 2).await;
        let mut outbound = conn.take_outbound().unwrap();
        assert_eq!(outbound.recv().await.unwrap(), Bytes::from_static(b"0"));

        store.insert("metal_sheet_add", serde_json::Value::Null, 5).await;
        assert_eq!(outbound.recv().await.unwrap(), Bytes::from_static(b"1"));

        shutdown.send_replace(true);
        task.await.unwrap().unwrap();
    }
}
