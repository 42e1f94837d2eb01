//! Counter renderers.
//!
//! A renderer turns an unread count into the payload pushed to one client.
//! Renderers are pure: the same count always yields the same bytes.

use bytes::Bytes;
use serde::Serialize;
use std::fmt::Write as _;
use thiserror::Error;

/// Counts above this value are displayed as `99+` by the HTML badge.
pub const MAX_DISPLAYED_COUNT: usize = 99;

/// Default DOM id of the navigation feed badge.
pub const DEFAULT_ELEMENT_ID: &str = "feed-counter";

/// Rendering errors.
#[derive(Debug, Error)]
pub enum RenderError {
    /// JSON encoding failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Template formatting failed.
    #[error("Template error: {0}")]
    Template(#[from] std::fmt::Error),
}

/// Turns an unread count into a wire payload.
pub trait CounterRenderer: Send + Sync {
    /// Render the payload for `count` unread feed items.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be produced.
    fn render(&self, count: usize) -> Result<Bytes, RenderError>;
}

impl<F> CounterRenderer for F
where
    F: Fn(usize) -> Result<Bytes, RenderError> + Send + Sync,
{
    fn render(&self, count: usize) -> Result<Bytes, RenderError> {
        self(count)
    }
}

/// Renders the navigation badge as an htmx out-of-band swap fragment.
///
/// The fragment replaces the element with the configured id wherever the
/// htmx WebSocket extension receives it.
#[derive(Debug, Clone)]
pub struct HtmlCounterRenderer {
    element_id: String,
}

impl HtmlCounterRenderer {
    /// Create a renderer targeting a specific element id.
    #[must_use]
    pub fn new(element_id: impl Into<String>) -> Self {
        Self {
            element_id: element_id.into(),
        }
    }

    /// Get the targeted element id.
    #[must_use]
    pub fn element_id(&self) -> &str {
        &self.element_id
    }
}

impl Default for HtmlCounterRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_ELEMENT_ID)
    }
}

impl CounterRenderer for HtmlCounterRenderer {
    fn render(&self, count: usize) -> Result<Bytes, RenderError> {
        let mut html = String::with_capacity(96);
        write!(
            html,
            r#"<span id="{}" class="feed-counter" hx-swap-oob="true" data-count="{}""#,
            self.element_id, count
        )?;
        if count == 0 {
            html.push_str(" hidden></span>");
        } else if count > MAX_DISPLAYED_COUNT {
            write!(html, ">{}+</span>", MAX_DISPLAYED_COUNT)?;
        } else {
            write!(html, ">{}</span>", count)?;
        }
        Ok(Bytes::from(html))
    }
}

#[derive(Serialize)]
struct CounterMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    count: usize,
}

/// Renders `{"type":"feed_counter","count":N}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCounterRenderer;

impl CounterRenderer for JsonCounterRenderer {
    fn render(&self, count: usize) -> Result<Bytes, RenderError> {
        let message = CounterMessage {
            kind: "feed_counter",
            count,
        };
        Ok(Bytes::from(serde_json::to_vec(&message)?))
    }
}
