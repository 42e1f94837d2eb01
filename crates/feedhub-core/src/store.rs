//! Feed store boundary.
//!
//! The hub only ever reads the newest feeds. Writers notify the hub through
//! a [`BroadcastHandle`] after every successful insert.

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::feed::{Feed, FeedId, UserId};
use crate::hub::BroadcastHandle;

/// Feed store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store is not reachable.
    #[error("Feed store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the activity feed.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// List up to `limit` feeds, most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<Feed>, StoreError>;
}

/// An in-memory feed store.
#[derive(Debug)]
pub struct MemoryFeedStore {
    feeds: RwLock<Vec<Feed>>,
    next_id: AtomicI64,
    broadcaster: OnceLock<BroadcastHandle>,
}

impl MemoryFeedStore {
    /// Create an empty store. The first inserted feed gets id 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            feeds: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
            broadcaster: OnceLock::new(),
        }
    }

    /// Create a store holding `feeds`, in any order.
    #[must_use]
    pub fn with_feeds(feeds: impl IntoIterator<Item = Feed>) -> Self {
        let mut feeds: Vec<Feed> = feeds.into_iter().collect();
        feeds.sort_by_key(|feed| feed.id);
        let next_id = feeds.last().map(|feed| feed.id + 1).unwrap_or(1);

        Self {
            feeds: RwLock::new(feeds),
            next_id: AtomicI64::new(next_id),
            broadcaster: OnceLock::new(),
        }
    }

    /// Notify `broadcaster` after every insert.
    ///
    /// Returns `false` if a broadcaster was already attached.
    pub fn attach_broadcaster(&self, broadcaster: BroadcastHandle) -> bool {
        self.broadcaster.set(broadcaster).is_ok()
    }

    /// Persist a new feed item and trigger a broadcast.
    pub async fn insert(
        &self,
        kind: impl Into<String>,
        data: serde_json::Value,
        user_id: UserId,
    ) -> Feed {
        let feed = {
            let mut feeds = self.feeds.write().await;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let feed = Feed::new(id, kind, data, user_id);
            feeds.push(feed.clone());
            feed
        };

        debug!(feed = feed.id, kind = %feed.kind, user_id, "Inserted feed");

        if let Some(broadcaster) = self.broadcaster.get() {
            broadcaster.broadcast();
        }

        feed
    }

    /// Get the id of the newest feed, if any.
    pub async fn latest_id(&self) -> Option<FeedId> {
        self.feeds.read().await.last().map(|feed| feed.id)
    }

    /// Get the number of stored feeds.
    pub async fn len(&self) -> usize {
        self.feeds.read().await.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.feeds.read().await.is_empty()
    }
}

impl Default for MemoryFeedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn recent(&self, limit: usize) -> Result<Vec<Feed>, StoreError> {
        let feeds = self.feeds.read().await;
        Ok(feeds.iter().rev().take(limit).cloned().collect())
    }
}
