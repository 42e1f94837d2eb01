//! # feedhub-protocol
//!
//! Wire vocabulary for the feedhub live notification hub.
//!
//! The hub speaks plain text frames. Outbound frames are opaque payloads
//! produced by a [`CounterRenderer`]; two literal payloads are reserved as
//! application-level keepalive messages because the browser side cannot
//! observe native WebSocket control frames.
//!
//! ## Control messages
//!
//! - `ping` - liveness probe, answered with `pong`
//! - `pong` - probe answer, acknowledged and otherwise ignored
//!
//! ## Example
//!
//! ```rust
//! use feedhub_protocol::{ClientMessage, CounterRenderer, HtmlCounterRenderer};
//!
//! assert_eq!(ClientMessage::parse("ping"), ClientMessage::Ping);
//!
//! let payload = HtmlCounterRenderer::default().render(3).unwrap();
//! assert!(std::str::from_utf8(&payload).unwrap().contains(">3<"));
//! ```

pub mod control;
pub mod render;

pub use control::{ClientMessage, PING, PONG};
pub use render::{CounterRenderer, HtmlCounterRenderer, JsonCounterRenderer, RenderError};
