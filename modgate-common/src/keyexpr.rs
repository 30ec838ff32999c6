//! Bus topic helpers.
//!
//! Gateway topics are written with `.` separators
//! (`channels.1.modbus.read.tcp.coil`), the way operators address them.
//! Zenoh key expressions use `/`. This module converts between the two and
//! rejects topics that cannot be mapped without ambiguity.

use crate::error::{Error, Result};

/// Separator used in gateway topics.
pub const TOPIC_SEPARATOR: char = '.';

/// Separator used in Zenoh key expressions.
pub const KEY_SEPARATOR: char = '/';

/// Convert a dotted topic into a Zenoh key expression.
///
/// # Example
/// ```
/// use modgate_common::keyexpr::topic_to_key_expr;
///
/// let key = topic_to_key_expr("channels.1.modbus.response.100").unwrap();
/// assert_eq!(key, "channels/1/modbus/response/100");
/// ```
pub fn topic_to_key_expr(topic: &str) -> Result<String> {
    convert(topic, TOPIC_SEPARATOR, KEY_SEPARATOR)
}

/// Convert a Zenoh key expression back into a dotted topic.
///
/// # Example
/// ```
/// use modgate_common::keyexpr::key_expr_to_topic;
///
/// let topic = key_expr_to_topic("channels/modbus/stop/100").unwrap();
/// assert_eq!(topic, "channels.modbus.stop.100");
/// ```
pub fn key_expr_to_topic(key: &str) -> Result<String> {
    convert(key, KEY_SEPARATOR, TOPIC_SEPARATOR)
}

fn convert(input: &str, from: char, to: char) -> Result<String> {
    let mut segments = Vec::new();

    for segment in input.split(from) {
        if segment.is_empty() {
            return Err(Error::KeyExpr(format!("empty segment in '{}'", input)));
        }
        if segment.contains(to) {
            return Err(Error::KeyExpr(format!(
                "segment '{}' of '{}' contains '{}'",
                segment, input, to
            )));
        }
        segments.push(segment);
    }

    Ok(segments.join(&to.to_string()))
}

/// Build the key expression used for bridge status messages.
///
/// # Example
/// ```
/// use modgate_common::keyexpr::status_key;
///
/// assert_eq!(status_key("channels/modbus"), "channels/modbus/@/status");
/// ```
pub fn status_key(prefix: &str) -> String {
    format!("{}/@/status", prefix)
}
