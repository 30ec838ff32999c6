//! Configuration for the Modbus gateway.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use modgate_bridge_framework::{BridgeConfig, BridgeError, LoggingConfig, ZenohConfig};

use crate::topic::{DEFAULT_ROOT, PROTOCOL_SEGMENT};

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Zenoh connection settings
    #[serde(default)]
    pub zenoh: ZenohConfig,

    /// Gateway settings
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway surfaces and identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// First topic segment (default: "channels")
    #[serde(default = "default_topic_root")]
    pub topic_root: String,

    /// Subscribe to read/write/stop intents on the bus
    #[serde(default = "default_subscribe")]
    pub subscribe: bool,

    /// HTTP surface, disabled when absent
    #[serde(default)]
    pub http: Option<HttpConfig>,

    /// Identifier reported in status messages (random when absent)
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_topic_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_subscribe() -> bool {
    true
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            topic_root: default_topic_root(),
            subscribe: default_subscribe(),
            http: None,
            instance_id: None,
        }
    }
}

impl GatewaySettings {
    /// Configured instance id, or a fresh UUID v4.
    pub fn resolve_instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address (default: "127.0.0.1:8855")
    #[serde(default = "default_http_listen")]
    pub listen: String,
}

fn default_http_listen() -> String {
    "127.0.0.1:8855".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
        }
    }
}

impl HttpConfig {
    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.listen.parse().map_err(|e| {
            BridgeError::validation(format!("invalid http listen address '{}': {}", self.listen, e))
        })
    }
}

impl BridgeConfig for GatewayConfig {
    fn zenoh(&self) -> &ZenohConfig {
        &self.zenoh
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn key_prefix(&self) -> String {
        format!("{}/{}", self.gateway.topic_root, PROTOCOL_SEGMENT)
    }

    fn validate(&self) -> Result<(), BridgeError> {
        let root = &self.gateway.topic_root;
        if root.is_empty() {
            return Err(BridgeError::validation("gateway.topic_root cannot be empty"));
        }
        if root.contains(['.', '/', '*', '$', '#', '?']) {
            return Err(BridgeError::validation(format!(
                "gateway.topic_root '{}' must be a single segment",
                root
            )));
        }

        match &self.gateway.http {
            Some(http) => {
                http.listen_addr()?;
            }
            None if !self.gateway.subscribe => {
                return Err(BridgeError::validation(
                    "enable the bus subscription or the HTTP surface",
                ));
            }
            None => {}
        }

        Ok(())
    }
}
