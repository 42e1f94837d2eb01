//! One live client connection and its two pumps.
//!
//! A connection moves through `Unregistered → Active → Draining → Closed`.
//! The writer pump drains the outbound queue and sends keepalive probes; the
//! reader pump answers client probes and classifies read errors. Whichever
//! pump exits first closes the transport, which makes the other one exit.

use bytes::Bytes;
use feedhub_protocol::{ClientMessage, PING, PONG};
use feedhub_transport::{MessageSink, MessageSource, Transport, TransportError};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::feed::{FeedId, UserId};
use crate::hub::{Hub, HubConfig};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shortest keepalive period a connection accepts.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, not yet in a hub registry.
    Unregistered = 0,
    /// In a registry; both pumps may run.
    Active = 1,
    /// A pump decided to exit or unregistration was requested.
    Draining = 2,
    /// Outbound queue and done signal are closed. Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unregistered,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Result of handing a payload to the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    TimedOut,
    Closed,
}

/// A registered client connection.
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    watermark: FeedId,
    transport: &'static str,
    remote_addr: Option<String>,
    write_timeout: Duration,
    keepalive_interval: Duration,
    state: AtomicU8,
    outbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    done: watch::Sender<bool>,
    sink: tokio::sync::Mutex<Box<dyn MessageSink>>,
    source: Mutex<Option<Box<dyn MessageSource>>>,
    transport_closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap `transport` for `user_id`, capturing `watermark` for its lifetime.
    pub(crate) fn new(
        user_id: UserId,
        watermark: FeedId,
        transport: Box<dyn Transport>,
        config: &HubConfig,
    ) -> Self {
        let name = transport.name();
        let remote_addr = transport.remote_addr();
        let (sink, source) = transport.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (done, _) = watch::channel(false);
        let (transport_closed, _) = watch::channel(false);

        Self {
            id: ConnectionId::next(),
            user_id,
            watermark,
            transport: name,
            remote_addr,
            write_timeout: config.write_timeout,
            keepalive_interval: config.keepalive_interval.max(MIN_KEEPALIVE_INTERVAL),
            state: AtomicU8::new(ConnectionState::Unregistered as u8),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            done,
            sink: tokio::sync::Mutex::new(sink),
            source: Mutex::new(Some(source)),
            transport_closed,
        }
    }

    /// Get the connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the user this connection belongs to.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Get the last-seen feed id captured at registration.
    #[must_use]
    pub fn watermark(&self) -> FeedId {
        self.watermark
    }

    /// Get the transport name.
    #[must_use]
    pub fn transport(&self) -> &'static str {
        self.transport
    }

    /// Get the client's address, if the transport knows it.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Check if the done signal has fired.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Check if the transport has been closed.
    #[must_use]
    pub fn is_transport_closed(&self) -> bool {
        *self.transport_closed.borrow()
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Unregistered as u8,
                ConnectionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn begin_draining(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
                match ConnectionState::from_u8(state) {
                    ConnectionState::Unregistered | ConnectionState::Active => {
                        Some(ConnectionState::Draining as u8)
                    }
                    ConnectionState::Draining | ConnectionState::Closed => None,
                }
            });
    }

    /// Close the outbound queue and fire the done signal.
    ///
    /// Only the hub calls this, after removing the connection from its
    /// registry. Returns `true` if this call closed them; repeated calls are
    /// silent no-ops.
    pub(crate) fn close_resources(&self) -> bool {
        let queue_closed = lock(&self.outbound_tx).take().is_some();
        let already_done = self.done.send_replace(true);
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        queue_closed || !already_done
    }

    /// Hand `payload` to the writer pump.
    ///
    /// Waits at most `timeout` for queue space and gives up early when the
    /// done signal fires.
    pub(crate) async fn enqueue(&self, payload: Bytes, timeout: Duration) -> Enqueue {
        let sender = lock(&self.outbound_tx).clone();
        let Some(sender) = sender else {
            return Enqueue::Closed;
        };
        let mut done = self.done.subscribe();

        // A set done signal wins over free queue space
        tokio::select! {
            biased;
            _ = wait_until_set(&mut done) => Enqueue::Closed,
            sent = sender.send_timeout(payload, timeout) => match sent {
                Ok(()) => Enqueue::Queued,
                Err(SendTimeoutError::Timeout(_)) => Enqueue::TimedOut,
                Err(SendTimeoutError::Closed(_)) => Enqueue::Closed,
            },
        }
    }

    /// Close the transport once; later calls return immediately.
    ///
    /// Sends a close notification to the client and wakes both pumps.
    pub async fn close_transport(&self) {
        if self.transport_closed.send_replace(true) {
            return;
        }

        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(self.write_timeout, sink.close()).await {
            Ok(Ok(())) => debug!(connection = %self.id, "Transport closed"),
            Ok(Err(e)) => debug!(connection = %self.id, error = %e, "Transport close failed"),
            Err(_) => debug!(connection = %self.id, "Transport close timed out"),
        }
    }

    /// Write one text frame, bounded by the write deadline.
    async fn write(&self, payload: Bytes) -> Result<(), TransportError> {
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send_text(payload).await
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Drain the outbound queue into the transport.
    ///
    /// Also sends a `ping` probe every keepalive interval. Returns when the
    /// queue is closed, the done signal fires, the transport is closed or a
    /// write fails; the transport is closed on the way out.
    pub async fn write_pump(self: Arc<Self>) {
        let outbound = lock(&self.outbound_rx).take();
        let Some(mut outbound) = outbound else {
            warn!(connection = %self.id, "Writer pump already started");
            return;
        };

        let period = self.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut done = self.done.subscribe();
        let mut closed = self.transport_closed.subscribe();

        debug!(user_id = self.user_id, connection = %self.id, "Writer pump started");

        loop {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(payload) => {
                        if let Err(e) = self.write(payload).await {
                            error!(user_id = self.user_id, connection = %self.id, error = %e, "Error writing message");
                            break;
                        }
                    }
                    None => {
                        debug!(connection = %self.id, "Outbound queue closed");
                        break;
                    }
                },
                _ = keepalive.tick() => {
                    if let Err(e) = self.write(Bytes::from_static(PING.as_bytes())).await {
                        error!(user_id = self.user_id, connection = %self.id, error = %e, "Error sending ping");
                        break;
                    }
                    trace!(connection = %self.id, "Keepalive sent");
                }
                _ = wait_until_set(&mut done) => break,
                _ = wait_until_set(&mut closed) => break,
            }
        }

        self.begin_draining();
        self.close_transport().await;
        debug!(user_id = self.user_id, connection = %self.id, "Writer pump finished");
    }

    /// Receive client messages until the connection ends.
    ///
    /// Answers `ping` with `pong`, keeps going on transient read errors and
    /// stops on anything fatal. On the way out the connection is always
    /// unregistered from `hub` and its transport closed.
    pub async fn read_pump(self: Arc<Self>, hub: Hub) {
        let source = lock(&self.source).take();
        if let Some(mut source) = source {
            debug!(user_id = self.user_id, connection = %self.id, "Reader pump started");
            self.receive_loop(source.as_mut()).await;
        } else {
            warn!(connection = %self.id, "Reader pump already started");
            return;
        }

        self.begin_draining();
        hub.unregister(&self).await;
        self.close_transport().await;
        debug!(user_id = self.user_id, connection = %self.id, "Reader pump finished");
    }

    async fn receive_loop(&self, source: &mut dyn MessageSource) {
        let mut done = self.done.subscribe();
        let mut closed = self.transport_closed.subscribe();

        loop {
            let received = tokio::select! {
                received = source.recv() => received,
                _ = wait_until_set(&mut done) => {
                    debug!(connection = %self.id, "Connection closed by hub");
                    return;
                }
                _ = wait_until_set(&mut closed) => {
                    debug!(connection = %self.id, "Transport closed");
                    return;
                }
            };

            match received {
                Ok(Some(text)) => match ClientMessage::parse(&text) {
                    ClientMessage::Ping => {
                        if let Err(e) = self.write(Bytes::from_static(PONG.as_bytes())).await {
                            error!(user_id = self.user_id, connection = %self.id, error = %e, "Error sending pong");
                            return;
                        }
                    }
                    ClientMessage::Pong => {
                        debug!(connection = %self.id, "Received pong");
                    }
                    ClientMessage::Other(_) => {
                        trace!(connection = %self.id, len = text.len(), "Ignoring client message");
                    }
                },
                Ok(None) => {
                    info!(user_id = self.user_id, connection = %self.id, "Connection closed normally");
                    return;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        user_id = self.user_id,
                        connection = %self.id,
                        error = %e,
                        "Temporary read error (possibly suspended)"
                    );
                }
                Err(e) => {
                    error!(user_id = self.user_id, connection = %self.id, error = %e, "Error reading message");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn take_outbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        lock(&self.outbound_rx).take()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("watermark", &self.watermark)
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolve once the watched flag is set, or its sender is gone.
pub(crate) async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            return;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFeedStore;
    use feedhub_protocol::RenderError;
    use feedhub_transport::memory::{self, MemoryPeer, PeerEvent};

    fn test_config() -> HubConfig {
        HubConfig {
            write_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(300),
            delivery_timeout: Duration::from_secs(30),
            ..HubConfig::default()
        }
    }

    fn unregistered() -> (Connection, MemoryPeer) {
        let (transport, peer) = memory::pair();
        let conn = Connection::new(42, 5, Box::new(transport), &test_config());
        (conn, peer)
    }

    struct Running {
        hub: Hub,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<(), crate::hub::HubError>>,
    }

    fn running_hub(config: HubConfig) -> Running {
        let store = Arc::new(MemoryFeedStore::new());
        let renderer = Arc::new(|count: usize| Ok::<_, RenderError>(Bytes::from(count.to_string())));
        let hub = Hub::new(config, store, renderer);
        let (shutdown, rx) = watch::channel(false);
        let runner = hub.clone();
        let task = tokio::spawn(async move { runner.run(rx).await });
        Running { hub, shutdown, task }
    }

    async fn next_text(peer: &mut MemoryPeer) -> String {
        match peer.recv().await {
            Some(PeerEvent::Text(text)) => text,
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn_"));
    }

    #[test]
    fn test_state_transitions() {
        let (conn, _peer) = unregistered();
        assert_eq!(conn.state(), ConnectionState::Unregistered);
        assert_eq!(conn.transport(), "memory");
        assert_eq!(conn.remote_addr(), None);
        assert_eq!(conn.watermark(), 5);

        assert!(conn.mark_active());
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(!conn.mark_active());

        conn.begin_draining();
        assert_eq!(conn.state(), ConnectionState::Draining);

        assert!(conn.close_resources());
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Closed is terminal
        conn.begin_draining();
        assert!(!conn.mark_active());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_resources_is_idempotent() {
        let (conn, _peer) = unregistered();
        let mut outbound = conn.take_outbound().unwrap();

        assert!(conn.close_resources());
        assert!(!conn.close_resources());
        assert!(conn.is_done());
        assert_eq!(outbound.recv().await, None);
        assert_eq!(
            conn.enqueue(Bytes::from_static(b"late"), Duration::from_secs(1)).await,
            Enqueue::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_times_out_on_full_queue() {
        let (transport, _peer) = memory::pair();
        let config = HubConfig {
            outbound_capacity: 1,
            ..test_config()
        };
        let conn = Connection::new(1, 0, Box::new(transport), &config);
        let _outbound = conn.take_outbound().unwrap();

        let timeout = Duration::from_secs(30);
        assert_eq!(conn.enqueue(Bytes::from_static(b"1"), timeout).await, Enqueue::Queued);
        assert_eq!(conn.enqueue(Bytes::from_static(b"2"), timeout).await, Enqueue::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_gives_up_when_done() {
        let (transport, _peer) = memory::pair();
        let config = HubConfig {
            outbound_capacity: 1,
            ..test_config()
        };
        let conn = Arc::new(Connection::new(1, 0, Box::new(transport), &config));
        let _outbound = conn.take_outbound().unwrap();
        let timeout = Duration::from_secs(30);
        conn.enqueue(Bytes::from_static(b"1"), timeout).await;

        let blocked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.enqueue(Bytes::from_static(b"2"), timeout).await })
        };
        tokio::task::yield_now().await;
        conn.close_resources();

        let start = Instant::now();
        assert_eq!(blocked.await.unwrap(), Enqueue::Closed);
        assert!(start.elapsed() < timeout);
    }

    #[tokio::test]
    async fn test_enqueue_after_done_is_dropped() {
        let (conn, _peer) = unregistered();
        let mut outbound = conn.take_outbound().unwrap();

        // Done already fired while the queue sender is still in place
        conn.done.send_replace(true);
        assert_eq!(
            conn.enqueue(Bytes::from_static(b"late"), Duration::from_secs(1)).await,
            Enqueue::Closed
        );
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_transport_once() {
        let (conn, mut peer) = unregistered();

        conn.close_transport().await;
        conn.close_transport().await;

        assert!(conn.is_transport_closed());
        assert_eq!(peer.drain(), vec![PeerEvent::Closed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_once_per_interval() {
        let config = test_config();
        let running = running_hub(config.clone());
        let (transport, mut peer) = memory::pair();
        let conn = running.hub.register(42, 0, Box::new(transport)).await.unwrap();
        tokio::spawn(conn.clone().write_pump());

        // Initial counter
        assert_eq!(next_text(&mut peer).await, "0");

        tokio::time::sleep(config.keepalive_interval - Duration::from_secs(1)).await;
        assert!(peer.drain().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(peer.drain(), vec![PeerEvent::Text(PING.to_string())]);

        tokio::time::sleep(config.keepalive_interval).await;
        assert_eq!(peer.drain(), vec![PeerEvent::Text(PING.to_string())]);

        running.shutdown.send_replace(true);
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_keepalive_is_clamped() {
        let config = HubConfig {
            keepalive_interval: Duration::ZERO,
            ..test_config()
        };
        let running = running_hub(config);
        let (transport, mut peer) = memory::pair();
        let conn = running.hub.register(42, 0, Box::new(transport)).await.unwrap();
        let writer = tokio::spawn(conn.clone().write_pump());

        assert_eq!(next_text(&mut peer).await, "0");

        tokio::time::sleep(MIN_KEEPALIVE_INTERVAL + Duration::from_millis(100)).await;
        assert_eq!(peer.drain(), vec![PeerEvent::Text(PING.to_string())]);
        assert!(!writer.is_finished());
        assert!(!conn.is_transport_closed());

        running.shutdown.send_replace(true);
        running.task.await.unwrap().unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_answers_ping() {
        let running = running_hub(test_config());
        let (transport, mut peer) = memory::pair();
        let conn = running.hub.register(42, 0, Box::new(transport)).await.unwrap();
        let reader = tokio::spawn(conn.clone().read_pump(running.hub.clone()));

        assert!(peer.send("ping"));
        assert_eq!(next_text(&mut peer).await, PONG);

        // Acknowledged and ignored payloads produce no output
        assert!(peer.send("pong"));
        assert!(peer.send("refresh"));
        assert!(peer.send("ping"));
        assert_eq!(next_text(&mut peer).await, PONG);

        peer.hang_up();
        reader.await.unwrap();
        assert_eq!(running.hub.connection_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.is_transport_closed());

        running.shutdown.send_replace(true);
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reader_survives_transient_errors() {
        let running = running_hub(test_config());
        let (transport, mut peer) = memory::pair();
        let conn = running.hub.register(42, 0, Box::new(transport)).await.unwrap();
        let reader = tokio::spawn(conn.clone().read_pump(running.hub.clone()));

        peer.fail_read(TransportError::Timeout);
        peer.fail_read(TransportError::ConnectionReset);
        assert!(peer.send("ping"));
        assert_eq!(next_text(&mut peer).await, PONG);
        assert_eq!(running.hub.connection_count(), 1);

        peer.fail_read(TransportError::Other("protocol violation".into()));
        reader.await.unwrap();
        assert_eq!(running.hub.connection_count(), 0);
        assert_eq!(peer.drain(), vec![PeerEvent::Closed]);

        running.shutdown.send_replace(true);
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unregister_stops_both_pumps() {
        let running = running_hub(test_config());
        let (transport, mut peer) = memory::pair();
        let conn = running.hub.register(42, 0, Box::new(transport)).await.unwrap();
        let writer = tokio::spawn(conn.clone().write_pump());
        let reader = tokio::spawn(conn.clone().read_pump(running.hub.clone()));

        assert_eq!(next_text(&mut peer).await, "0");
        assert!(running.hub.unregister(&conn).await);

        writer.await.unwrap();
        reader.await.unwrap();
        assert!(conn.is_done());
        assert!(conn.is_transport_closed());
        assert_eq!(peer.drain(), vec![PeerEvent::Closed]);

        running.shutdown.send_replace(true);
        running.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline_tears_connection_down() {
        let config = test_config();
        let running = running_hub(config.clone());
        let (transport, peer) = memory::pair();
        peer.stall_writes();

        let conn = running.hub.register(42, 0, Box::new(transport)).await.unwrap();
        let writer = tokio::spawn(conn.clone().write_pump());
        let reader = tokio::spawn(conn.clone().read_pump(running.hub.clone()));

        let start = Instant::now();
        writer.await.unwrap();
        assert!(start.elapsed() >= config.write_timeout);

        reader.await.unwrap();
        assert!(conn.is_transport_closed());
        assert_eq!(running.hub.connection_count(), 0);

        running.shutdown.send_replace(true);
        running.task.await.unwrap().unwrap();
    }
}
