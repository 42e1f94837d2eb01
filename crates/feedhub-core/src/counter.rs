//! Unread-count computation.

use bytes::Bytes;
use feedhub_protocol::{CounterRenderer, RenderError};
use thiserror::Error;

use crate::feed::FeedId;
use crate::store::{FeedStore, StoreError};

/// Errors while producing a counter payload.
#[derive(Debug, Error)]
pub enum CounterError {
    /// Reading the feed store failed.
    #[error("Feed store error: {0}")]
    Store(#[from] StoreError),

    /// Rendering the payload failed.
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
}

/// Count the leading feed ids strictly newer than `watermark`.
///
/// `ids` must be ordered most-recent-first; the scan stops at the first id
/// that is not newer than the watermark.
#[must_use]
pub fn unread_count<I>(watermark: FeedId, ids: I) -> usize
where
    I: IntoIterator<Item = FeedId>,
{
    ids.into_iter().take_while(|&id| id > watermark).count()
}

/// Read the newest `window` feeds and render the unread count for `watermark`.
///
/// # Errors
///
/// Returns an error if the store cannot be read or the renderer fails.
pub async fn render_counter(
    store: &dyn FeedStore,
    renderer: &dyn CounterRenderer,
    watermark: FeedId,
    window: usize,
) -> Result<Bytes, CounterError> {
    let feeds = store.recent(window).await?;
    let count = unread_count(watermark, feeds.iter().map(|feed| feed.id));
    Ok(renderer.render(count)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFeedStore;

    fn count_renderer(count: usize) -> Result<Bytes, RenderError> {
        Ok(Bytes::from(count.to_string()))
    }

    #[test]
    fn test_unread_count_stops_at_watermark() {
        assert_eq!(unread_count(8, [10, 9, 8, 7]), 2);
    }

    #[test]
    fn test_unread_count_edges() {
        assert_eq!(unread_count(8, []), 0);
        assert_eq!(unread_count(10, [10, 9]), 0);
        assert_eq!(unread_count(0, [3, 2, 1]), 3);
        // Items after the first seen id are never counted
        assert_eq!(unread_count(5, [7, 4, 9]), 1);
    }

    #[tokio::test]
    async fn test_render_counter_uses_window() {
        let store = MemoryFeedStore::new();
        for _ in 0..10 {
            store.insert("tool_add", serde_json::Value::Null, 1).await;
        }

        let payload = render_counter(&store, &count_renderer, 2, 100).await.unwrap();
        assert_eq!(&payload[..], b"8");

        let payload = render_counter(&store, &count_renderer, 2, 3).await.unwrap();
        assert_eq!(&payload[..], b"3");
    }
}
