//! WebSocket transport implementation.
//!
//! This module wraps an upgraded axum [`WebSocket`] so the hub can drive it
//! through the [`Transport`] traits.

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

use crate::traits::{MessageSink, MessageSource, Transport, TransportError};

/// Default maximum inbound message size (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// An upgraded WebSocket connection.
pub struct WebSocketTransport {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketTransport {
    /// Wrap an upgraded WebSocket.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self {
            socket,
            remote_addr: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Record the client's address for logging.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Limit the size of inbound messages.
    #[must_use]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        let this = *self;
        let (sink, stream) = this.socket.split();
        (
            Box::new(WebSocketSink { sink }),
            Box::new(WebSocketSource {
                stream,
                max_message_size: this.max_message_size,
            }),
        )
    }
}

/// The outbound half of a WebSocket.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send_text(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| TransportError::SendFailed(format!("payload is not UTF-8: {}", e)))?;

        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::from_error(&e))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed(""),
        };

        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            debug!(error = %e, "Failed to send close frame");
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::from_error(&e))
    }
}

/// The inbound half of a WebSocket.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

impl WebSocketSource {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(TransportError::MessageTooLarge(len));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    // For compatibility, treat binary as text
                    self.check_size(data.len())?;
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Native control frames are answered by the WebSocket layer
                    trace!("Native control frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::from_error(&e));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

