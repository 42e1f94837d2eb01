//! Activity feed items.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Feed item identifier. Ids grow monotonically with insertion order.
pub type FeedId = i64;

/// User identifier as supplied by the session layer.
pub type UserId = i64;

/// One activity-feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    /// Unique feed id.
    pub id: FeedId,
    /// Activity kind, e.g. `trouble_report_add` or `tool_update`.
    pub kind: String,
    /// Kind-specific payload.
    pub data: serde_json::Value,
    /// User who caused the activity.
    pub user_id: UserId,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Feed {
    /// Create a feed item stamped with the current time.
    #[must_use]
    pub fn new(id: FeedId, kind: impl Into<String>, data: serde_json::Value, user_id: UserId) -> Self {
        Self {
            id,
            kind: kind.into(),
            data,
            user_id,
            created_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_creation() {
        let feed = Feed::new(3, "tool_add", serde_json::json!({ "tool": "T-100" }), 42);
        assert_eq!(feed.id, 3);
        assert_eq!(feed.kind, "tool_add");
        assert_eq!(feed.user_id, 42);
        assert!(feed.created_at > 0);
    }
}
