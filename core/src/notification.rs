//! Notification type for notifybus-core

use crate::Result;
use serde::{Deserialize, Serialize};

/// A single payload addressed to a topic
///
/// Notifications are never stored by the broker; they reach whoever is
/// listening on the topic's channel at commit time and nobody else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Caller-facing topic (encoded to a channel on publish)
    pub topic: String,

    /// Opaque payload; `None` is delivered to callbacks as ""
    #[serde(default)]
    pub payload: Option<String>,
}

impl Notification {
    /// Create a notification with a payload
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: Some(payload.into()),
        }
    }

    /// Create a notification without a payload
    pub fn empty(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: None,
        }
    }

    /// Create a notification with a JSON payload
    pub fn with_json<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        let json = serde_json::to_string(payload)?;
        Ok(Self::new(topic, json))
    }
}

impl<T: Into<String>, P: Into<String>> From<(T, P)> for Notification {
    fn from((topic, payload): (T, P)) -> Self {
        Self::new(topic, payload)
    }
}
