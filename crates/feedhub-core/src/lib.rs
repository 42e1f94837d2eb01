//! # feedhub-core
//!
//! Live feed-notification hub: keeps every connected browser session
//! informed of how many activity-feed items it has not seen yet.
//!
//! This crate provides the moving parts:
//!
//! - **Hub** - single coordinator owning the registry of live connections
//! - **Connection** - one client, driven by a writer pump and a reader pump
//! - **Counter** - unread-count computation and payload rendering
//! - **Store** - the feed store boundary and an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ broadcast ┌─────────────┐ deliver  ┌─────────────┐
//! │  FeedStore  │──────────▶│     Hub     │─────────▶│ Connection  │
//! └─────────────┘           └─────────────┘          └─────────────┘
//!        ▲                         │ register/unregister     │ pumps
//!        └──── recent(limit) ──────┘                         ▼
//!                                                     ┌─────────────┐
//!                                                     │  Transport  │
//!                                                     └─────────────┘
//! ```

pub mod connection;
pub mod counter;
pub mod feed;
pub mod hub;
pub mod store;

pub use connection::{Connection, ConnectionId, ConnectionState, MIN_KEEPALIVE_INTERVAL};
pub use counter::{render_counter, unread_count, CounterError};
pub use feed::{Feed, FeedId, UserId};
pub use hub::{BroadcastHandle, Hub, HubConfig, HubError, HubStats};
pub use store::{FeedStore, MemoryFeedStore, StoreError};
