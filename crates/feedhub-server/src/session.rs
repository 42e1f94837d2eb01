//! Session lookup.
//!
//! Requests identify their user with an API key, either in the `X-Api-Key`
//! header or the `feedhub-api-key` cookie. Keys come from the configured
//! user list.

use axum::http::{header, HeaderMap};
use dashmap::DashMap;
use feedhub_core::{FeedId, UserId};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::UserConfig;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Cookie carrying the API key.
pub const API_KEY_COOKIE: &str = "feedhub-api-key";

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// User id.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Id of the last feed the user has seen.
    pub last_feed: FeedId,
}

/// Resolves API keys to sessions.
#[derive(Debug, Default)]
pub struct SessionProvider {
    keys: DashMap<String, UserId>,
    users: DashMap<UserId, Session>,
}

impl SessionProvider {
    /// Build a provider from the configured users.
    #[must_use]
    pub fn from_users(users: &[UserConfig]) -> Self {
        let provider = Self::default();
        for user in users {
            if provider
                .keys
                .insert(user.api_key.clone(), user.user_id)
                .is_some()
            {
                warn!(user_id = user.user_id, "Duplicate API key, last entry wins");
            }
            provider.users.insert(
                user.user_id,
                Session {
                    user_id: user.user_id,
                    name: user.name.clone(),
                    last_feed: user.last_feed,
                },
            );
        }
        provider
    }

    /// Get the number of known users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Look up the session for a request.
    ///
    /// The returned session is a snapshot; later [`SessionProvider::mark_seen`]
    /// calls do not change it.
    #[must_use]
    pub fn authenticate(&self, headers: &HeaderMap) -> Option<Session> {
        let key = api_key(headers)?;
        let user_id = *self.keys.get(key.as_str())?;
        let session = self.users.get(&user_id).map(|session| session.clone());
        if session.is_none() {
            debug!(user_id, "API key without user");
        }
        session
    }

    /// Move the user's last-seen feed forward to `feed_id`.
    ///
    /// Never moves backwards. Returns the stored value, or `None` for an
    /// unknown user.
    pub fn mark_seen(&self, user_id: UserId, feed_id: FeedId) -> Option<FeedId> {
        let mut session = self.users.get_mut(&user_id)?;
        session.last_feed = session.last_feed.max(feed_id);
        Some(session.last_feed)
    }
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER) {
        return value.to_str().ok().map(str::to_string);
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| *name == API_KEY_COOKIE)
        .map(|(_, value)| value.to_string())
}
