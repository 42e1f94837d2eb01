//! Transport abstraction traits for feedhub.
//!
//! These traits define the interface every duplex transport provides,
//! so the hub never depends on a concrete WebSocket implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation did not finish before its deadline.
    #[error("Connection timed out")]
    Timeout,

    /// The peer went away while we were writing.
    #[error("Broken pipe")]
    BrokenPipe,

    /// The peer reset the connection.
    #[error("Connection reset")]
    ConnectionReset,

    /// Received a message larger than allowed.
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error may clear up on its own.
    ///
    /// Suspended browser tabs produce timeouts and resets that are followed
    /// by normal traffic once the tab wakes up, so readers keep going on
    /// these instead of tearing the connection down.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::BrokenPipe | Self::ConnectionReset => true,
            Self::Io(err) => is_transient_kind(err.kind()),
            Self::SendFailed(msg) | Self::ReceiveFailed(msg) | Self::Other(msg) => {
                is_transient_message(msg)
            }
            Self::ConnectionClosed | Self::MessageTooLarge(_) => false,
        }
    }

    /// Build a transport error from an opaque library error.
    ///
    /// Walks the source chain looking for an [`io::Error`]; falls back to
    /// matching the rendered message when none is found.
    #[must_use]
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                return Self::from_io_kind(io_err.kind(), err.to_string());
            }
            current = e.source();
        }

        let message = err.to_string();
        if is_transient_message(&message) {
            Self::ReceiveFailed(message)
        } else {
            Self::Other(message)
        }
    }

    fn from_io_kind(kind: io::ErrorKind, message: String) -> Self {
        match kind {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted => {
                Self::ConnectionClosed
            }
            _ => Self::Io(io::Error::new(kind, message)),
        }
    }
}

fn is_transient_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

fn is_transient_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["timeout", "timed out", "deadline", "broken pipe", "connection reset"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// The outbound half of a transport.
#[async_trait]
pub trait MessageSink: Send {
    /// Send a payload as one text frame.
    async fn send_text(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Send a close notification and shut the outbound half down.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The inbound half of a transport.
#[async_trait]
pub trait MessageSource: Send {
    /// Receive the next text payload.
    ///
    /// Returns `None` if the peer ended the stream cleanly.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
}

/// A duplex text-frame transport to a single client.
pub trait Transport: Send {
    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;

    /// Get the remote address of the client, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently usable halves.
    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageSource>);
}
