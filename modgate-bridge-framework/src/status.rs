//! Bridge status reporting.

use serde::{Deserialize, Serialize};

use modgate_common::status_key;

use crate::Result;
use crate::publisher::Publisher;

/// Bridge status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeStatus {
    /// Bridge name (e.g., "modbus").
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Instance identifier, distinguishes gateways sharing one bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Current status ("running", "offline", "error").
    pub status: String,
    /// Additional metadata (protocol-specific).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeStatus {
    fn with_state(bridge: impl Into<String>, version: impl Into<String>, state: &str) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            instance_id: None,
            status: state.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Create a new status with "running" state.
    pub fn running(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "running")
    }

    /// Create a status with "offline" state.
    pub fn offline(bridge: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_state(bridge, version, "offline")
    }

    /// Create a status with "error" state.
    pub fn error(
        bridge: impl Into<String>,
        version: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::with_state(bridge, version, "error")
            .with_metadata(serde_json::json!({ "error": error.into() }))
    }

    /// Set the instance identifier.
    pub fn with_instance_id(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Add metadata to the status.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this status to Zenoh.
    ///
    /// Publishes to `{key_prefix}/@/status`.
    pub async fn publish(&self, publisher: &Publisher) -> Result<()> {
        let key = status_key(publisher.key_prefix());
        publisher.publish_json(&key, self).await
    }
}

/// Helper to publish bridge status on startup and shutdown.
pub struct StatusPublisher {
    publisher: Publisher,
    bridge_name: String,
    version: String,
    instance_id: Option<String>,
}

impl StatusPublisher {
    /// Create a new status publisher.
    pub fn new(
        publisher: Publisher,
        bridge_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            bridge_name: bridge_name.into(),
            version: version.into(),
            instance_id: None,
        }
    }

    /// Tag every published status with an instance identifier.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Publish "running" status with optional metadata.
    pub async fn publish_running(&self, metadata: Option<serde_json::Value>) -> Result<()> {
        let mut status = BridgeStatus::running(&self.bridge_name, &self.version)
            .with_instance_id(self.instance_id.clone());
        if let Some(meta) = metadata {
            status = status.with_metadata(meta);
        }
        status.publish(&self.publisher).await
    }

    /// Publish "offline" status.
    pub async fn publish_offline(&self) -> Result<()> {
        BridgeStatus::offline(&self.bridge_name, &self.version)
            .with_instance_id(self.instance_id.clone())
            .publish(&self.publisher)
            .await
    }

    /// Publish "error" status.
    pub async fn publish_error(&self, error: impl Into<String>) -> Result<()> {
        BridgeStatus::error(&self.bridge_name, &self.version, error)
            .with_instance_id(self.instance_id.clone())
            .publish(&self.publisher)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_running() {
        let status = BridgeStatus::running("modbus", "0.2.0");
        assert_eq!(status.bridge, "modbus");
        assert_eq!(status.status, "running");
        assert!(status.instance_id.is_none());
    }

    #[test]
    fn test_status_error_carries_message() {
        let status = BridgeStatus::error("modbus", "0.2.0", "serial port busy");
        assert_eq!(status.status, "error");
        assert_eq!(status.metadata["error"], "serial port busy");
    }

    #[test]
    fn test_status_serialization() {
        let status = BridgeStatus::running("modbus", "1.0.0")
            .with_instance_id(Some("edge-01".to_string()))
            .with_metadata(serde_json::json!({ "http": "127.0.0.1:8855" }));

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"bridge\":\"modbus\""));
        assert!(json.contains("\"instance_id\":\"edge-01\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"http\":\"127.0.0.1:8855\""));
    }

    #[test]
    fn test_offline_without_instance_omits_field() {
        let json = serde_json::to_string(&BridgeStatus::offline("modbus", "1.0.0")).unwrap();
        assert!(!json.contains("instance_id"));
    }
}
