//! Raw payload publisher for Zenoh.

use std::sync::Arc;

use modgate_common::topic_to_key_expr;

use crate::error::{BridgeError, Result};

/// Publisher for sending payloads to Zenoh.
///
/// Wraps a Zenoh session. Payloads are published as-is; dotted gateway
/// topics are converted to key expressions on the way out.
#[derive(Clone, Debug)]
pub struct Publisher {
    session: Arc<zenoh::Session>,
    key_prefix: String,
}

impl Publisher {
    /// Create a new publisher.
    pub fn new(session: Arc<zenoh::Session>, key_prefix: impl Into<String>) -> Self {
        Self {
            session,
            key_prefix: key_prefix.into(),
        }
    }

    /// Get the key prefix.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Publish raw bytes to a key expression.
    pub async fn publish_raw(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.session
            .put(key, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    /// Publish raw bytes to a dotted topic (`channels.1.modbus.response.100`).
    pub async fn publish_topic(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let key = topic_to_key_expr(topic).map_err(|e| BridgeError::Publish {
            key: topic.to_string(),
            message: e.to_string(),
        })?;

        tracing::trace!(%key, bytes = payload.len(), "Publishing");
        self.publish_raw(&key, payload).await
    }

    /// Publish a JSON value to a key.
    pub async fn publish_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish_raw(key, payload).await
    }
}
