//! Topic routing.
//!
//! ```text
//! <root>[.<channel-id>].modbus.read.<tcp|rtu>.<data-point>
//! <root>[.<channel-id>].modbus.write.<tcp|rtu>.<data-point>
//! <root>[.<channel-id>].modbus.stop.<register-address>
//! <root>[.<channel-id>].modbus.response.<register-address>   (outbound)
//! ```

use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::request::{DataPoint, ProtocolKind, RegisterRequest};

/// Default topic root.
pub const DEFAULT_ROOT: &str = "channels";

/// Protocol segment.
pub const PROTOCOL_SEGMENT: &str = "modbus";

/// Where an intent came from and where its results go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub root: String,
    pub id: Option<String>,
}

impl Channel {
    pub fn new(root: impl Into<String>, id: Option<String>) -> Self {
        Self {
            root: root.into(),
            id,
        }
    }

    fn prefix(&self) -> String {
        match &self.id {
            Some(id) => format!("{}.{}.{}", self.root, id, PROTOCOL_SEGMENT),
            None => format!("{}.{}", self.root, PROTOCOL_SEGMENT),
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT, None)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}.{}", self.root, id),
            None => f.write_str(&self.root),
        }
    }
}

/// A decoded read or write.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationIntent {
    pub channel: Channel,
    pub protocol: ProtocolKind,
    pub data_point: DataPoint,
    pub request: RegisterRequest,
    /// Protocol-specific configuration, decoded by the session factory.
    pub config: Value,
}

/// A decoded stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopIntent {
    pub channel: Channel,
    pub address: u16,
}

/// Result of routing one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedIntent {
    Read(OperationIntent),
    Write(OperationIntent),
    Stop(StopIntent),
}

#[derive(Deserialize)]
struct Envelope {
    options: Value,
    config: Value,
}

/// Route a message published under the default root.
pub fn route(topic: &str, payload: &[u8]) -> Result<RoutedIntent> {
    route_with_root(DEFAULT_ROOT, topic, payload)
}

/// Route a message published under `root`. Performs no I/O.
pub fn route_with_root(root: &str, topic: &str, payload: &[u8]) -> Result<RoutedIntent> {
    let malformed = |reason: &str| GatewayError::MalformedTopic(format!("{}: {}", topic, reason));

    let segments: Vec<&str> = topic.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(malformed("empty segment"));
    }
    if segments[0] != root {
        return Err(malformed("unexpected root"));
    }

    let (id, rest) = match segments.get(1..) {
        Some([PROTOCOL_SEGMENT, rest @ ..]) => (None, rest),
        Some([id, PROTOCOL_SEGMENT, rest @ ..]) => (Some(id.to_string()), rest),
        _ => return Err(malformed("missing protocol segment")),
    };
    let channel = Channel::new(root, id);

    match rest {
        ["read", protocol, data_point] => {
            operation(channel, protocol, data_point, payload).map(RoutedIntent::Read)
        }
        ["write", protocol, data_point] => {
            operation(channel, protocol, data_point, payload).map(RoutedIntent::Write)
        }
        ["stop", address] => {
            let address = address
                .parse::<u16>()
                .map_err(|_| malformed("stop address is not a register address"))?;
            Ok(RoutedIntent::Stop(StopIntent { channel, address }))
        }
        ["read" | "write" | "stop", ..] => Err(malformed("wrong segment count")),
        _ => Err(malformed("unknown verb")),
    }
}

fn operation(
    channel: Channel,
    protocol: &str,
    data_point: &str,
    payload: &[u8],
) -> Result<OperationIntent> {
    let protocol: ProtocolKind = protocol.parse()?;
    let data_point: DataPoint = data_point.parse()?;

    let envelope: Envelope = serde_json::from_slice(payload)
        .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
    let request = RegisterRequest::from_json(&envelope.options)?;

    Ok(OperationIntent {
        channel,
        protocol,
        data_point,
        request,
        config: envelope.config,
    })
}

/// Topic on which results for `address` are published.
pub fn response_topic(channel: &Channel, address: u16) -> String {
    format!("{}.response.{}", channel.prefix(), address)
}
