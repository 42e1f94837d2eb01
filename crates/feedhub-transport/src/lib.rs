//! # feedhub-transport
//!
//! Transport abstraction layer for the feedhub notification hub.
//!
//! A transport is a duplex text-frame channel to one browser session. It is
//! split once into a [`MessageSink`] (shared by both pumps of a connection)
//! and a [`MessageSource`] (owned by the reader pump):
//!
//! - **WebSocket** - axum upgrade, the production transport
//! - **Memory** - channel-backed pair for tests and benchmarks
//!
//! ```rust,ignore
//! use feedhub_transport::Transport;
//!
//! async fn echo(transport: Box<dyn Transport>) {
//!     let (mut sink, mut source) = transport.split();
//!     while let Ok(Some(text)) = source.recv().await {
//!         let _ = sink.send_text(text.into()).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{MessageSink, MessageSource, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
