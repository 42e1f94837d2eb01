//! Reserved control payloads and inbound message classification.

/// Keepalive probe payload.
pub const PING: &str = "ping";

/// Keepalive answer payload.
pub const PONG: &str = "pong";

/// A message received from a client, classified by the reader pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// The client probes liveness and expects a `pong`.
    Ping,
    /// The client answered one of our probes.
    Pong,
    /// Anything else. Reserved for client-initiated refreshes.
    Other(String),
}

impl ClientMessage {
    /// Classify a received text payload.
    ///
    /// Control payloads are matched literally, surrounding whitespace is not
    /// tolerated.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text {
            PING => Self::Ping,
            PONG => Self::Pong,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this is one of the reserved control payloads.
    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

impl From<&str> for ClientMessage {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}
