//! In-memory transport.
//!
//! [`pair`] returns a [`MemoryTransport`] for the hub and a [`MemoryPeer`]
//! playing the browser. The peer can push text, inject read errors, end the
//! stream, observe every frame written by the hub and stall writes to
//! exercise write deadlines.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

use crate::traits::{MessageSink, MessageSource, Transport, TransportError};

/// What the hub wrote to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A text frame.
    Text(String),
    /// A close notification.
    Closed,
}

#[derive(Debug, Default)]
struct StallGate {
    stalled: AtomicBool,
    released: Notify,
}

/// Create a connected transport/peer pair.
#[must_use]
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(StallGate::default());

    let transport = MemoryTransport {
        inbound: inbound_rx,
        outbound: outbound_tx,
        gate: gate.clone(),
    };
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
        gate,
    };
    (transport, peer)
}

/// The hub side of an in-memory connection.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    outbound: mpsc::UnboundedSender<PeerEvent>,
    gate: Arc<StallGate>,
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        let this = *self;
        (
            Box::new(MemorySink {
                outbound: this.outbound,
                gate: this.gate,
                closed: false,
            }),
            Box::new(MemorySource {
                inbound: this.inbound,
            }),
        )
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<PeerEvent>,
    gate: Arc<StallGate>,
    closed: bool,
}

impl MemorySink {
    async fn wait_until_released(&self) {
        loop {
            let released = self.gate.released.notified();
            if !self.gate.stalled.load(Ordering::SeqCst) {
                return;
            }
            released.await;
        }
    }

    fn deliver(&self, event: PeerEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(event)
            .map_err(|_| TransportError::BrokenPipe)
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send_text(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.wait_until_released().await;
        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| TransportError::SendFailed(format!("payload is not UTF-8: {}", e)))?;
        trace!(len = text.len(), "Memory transport write");
        self.deliver(PeerEvent::Text(text))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let result = self.deliver(PeerEvent::Closed);
        self.closed = true;
        result
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The client side of an in-memory connection.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<PeerEvent>,
    gate: Arc<StallGate>,
}

impl MemoryPeer {
    /// Send a text frame to the hub.
    ///
    /// Returns `false` once the hub stopped reading.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.push(Ok(text.into()))
    }

    /// Make the hub's next read fail with `error`.
    pub fn fail_read(&self, error: TransportError) -> bool {
        self.push(Err(error))
    }

    /// End the inbound stream cleanly.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Block every write until [`MemoryPeer::resume_writes`] is called.
    pub fn stall_writes(&self) {
        self.gate.stalled.store(true, Ordering::SeqCst);
    }

    /// Release stalled writes.
    pub fn resume_writes(&self) {
        self.gate.stalled.store(false, Ordering::SeqCst);
        self.gate.released.notify_waiters();
    }

    /// Wait for the next event written by the hub.
    ///
    /// Returns `None` once the hub dropped its side.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.outbound.recv().await
    }

    /// Take an already written event without waiting.
    pub fn try_recv(&mut self) -> Option<PeerEvent> {
        self.outbound.try_recv().ok()
    }

    /// Drain every already written event.
    pub fn drain(&mut self) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    fn push(&self, item: Result<String, TransportError>) -> bool {
        self.inbound
            .as_ref()
            .map(|tx| tx.send(item).is_ok())
            .unwrap_or(false)
    }
}
