//! Per-protocol session configuration blobs.
//!
//! Every field except `address` is optional. Absent fields fall back to the
//! transport default; explicit zeros are preserved.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{GatewayError, Result};

const TCP_IDLE_TIME: Duration = Duration::from_secs(60);
const TCP_TIMEOUT: Duration = Duration::from_secs(10);
/// Modbus TCP "unit identifier not used".
const TCP_SLAVE_ID: u8 = 255;

const RTU_BAUD_RATE: u32 = 19200;
const RTU_DATA_BITS: u8 = 8;
const RTU_STOP_BITS: u8 = 1;
const RTU_SLAVE_ID: u8 = 1;
const RTU_TIMEOUT: Duration = Duration::from_secs(5);
const RTU_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const SAMPLING_FREQUENCY: Duration = Duration::from_secs(1);

/// Modbus TCP session options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TcpOptions {
    /// `host:port` of the device.
    pub address: String,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub idle_time: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub slave_id: Option<u8>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub sampling_frequency: Option<Duration>,
}

impl TcpOptions {
    /// Decode and validate a TCP configuration blob.
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        let options = Self::deserialize(config)
            .map_err(|e| GatewayError::MalformedPayload(format!("tcp config: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(GatewayError::MalformedPayload(
                "tcp config: address cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_time(&self) -> Duration {
        self.idle_time.unwrap_or(TCP_IDLE_TIME)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(TCP_TIMEOUT)
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id.unwrap_or(TCP_SLAVE_ID)
    }

    pub fn sampling_frequency(&self) -> Duration {
        self.sampling_frequency.unwrap_or(SAMPLING_FREQUENCY)
    }
}

/// RS-485 line settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Rs485Options {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub delay_rts_before_send: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub delay_rts_after_send: Option<Duration>,
    #[serde(default)]
    pub rts_high_during_send: bool,
    #[serde(default)]
    pub rts_high_after_send: bool,
    #[serde(default)]
    pub rx_during_tx: bool,
}

/// Modbus RTU session options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RtuOptions {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub address: String,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    #[serde(default)]
    pub data_bits: Option<u8>,
    #[serde(default)]
    pub stop_bits: Option<u8>,
    #[serde(default)]
    pub parity: Option<String>,
    #[serde(default)]
    pub rs485: Rs485Options,
    #[serde(default)]
    pub slave_id: Option<u8>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub idle_timeout: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub sampling_frequency: Option<Duration>,
}

impl RtuOptions {
    /// Decode and validate an RTU configuration blob.
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        let options = Self::deserialize(config)
            .map_err(|e| GatewayError::MalformedPayload(format!("rtu config: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(GatewayError::MalformedPayload(
                "rtu config: address cannot be empty".to_string(),
            ));
        }
        if self.baud_rate == Some(0) {
            return Err(GatewayError::MalformedPayload(
                "rtu config: baud_rate must be positive".to_string(),
            ));
        }
        self.serial_data_bits()?;
        self.serial_stop_bits()?;
        self.serial_parity()?;
        Ok(())
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.unwrap_or(RTU_BAUD_RATE)
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id.unwrap_or(RTU_SLAVE_ID)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(RTU_TIMEOUT)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout.unwrap_or(RTU_IDLE_TIMEOUT)
    }

    pub fn sampling_frequency(&self) -> Duration {
        self.sampling_frequency.unwrap_or(SAMPLING_FREQUENCY)
    }

    pub fn serial_data_bits(&self) -> Result<tokio_serial::DataBits> {
        match self.data_bits.unwrap_or(RTU_DATA_BITS) {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(GatewayError::MalformedPayload(format!(
                "rtu config: data_bits must be 5-8, got {}",
                other
            ))),
        }
    }

    pub fn serial_stop_bits(&self) -> Result<tokio_serial::StopBits> {
        match self.stop_bits.unwrap_or(RTU_STOP_BITS) {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(GatewayError::MalformedPayload(format!(
                "rtu config: stop_bits must be 1 or 2, got {}",
                other
            ))),
        }
    }

    pub fn serial_parity(&self) -> Result<tokio_serial::Parity> {
        let Some(parity) = self.parity.as_deref() else {
            return Ok(tokio_serial::Parity::Even);
        };
        match parity.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(tokio_serial::Parity::None),
            "e" | "even" => Ok(tokio_serial::Parity::Even),
            "o" | "odd" => Ok(tokio_serial::Parity::Odd),
            _ => Err(GatewayError::MalformedPayload(format!(
                "rtu config: unknown parity '{}'",
                parity
            ))),
        }
    }
}

/// Accepts an integer number of milliseconds or a duration string such as `"1m 30s"`.
fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Millis(ms)) => Ok(Some(Duration::from_millis(ms))),
        Some(Raw::Text(s)) => {
            let d = humantime::parse_duration(&s).map_err(serde::de::Error::custom)?;
            Ok(Some(d))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tcp_defaults() {
        let opts = TcpOptions::from_json(&json!({ "address": "10.0.0.5:502" })).unwrap();
        assert_eq!(opts.idle_time(), Duration::from_secs(60));
        assert_eq!(opts.timeout(), Duration::from_secs(10));
        assert_eq!(opts.slave_id(), 255);
        assert_eq!(opts.sampling_frequency(), Duration::from_secs(1));
    }

    #[test]
    fn test_tcp_explicit_zero_preserved() {
        let opts = TcpOptions::from_json(&json!({
            "address": "10.0.0.5:502",
            "slave_id": 0,
            "timeout": 0,
        }))
        .unwrap();
        assert_eq!(opts.slave_id(), 0);
        assert_eq!(opts.timeout(), Duration::ZERO);
    }

    #[test]
    fn test_tcp_duration_strings() {
        let opts = TcpOptions::from_json(&json!({
            "address": "plc:1502",
            "idle_time": "2m",
            "timeout": "500ms",
            "sampling_frequency": 250,
        }))
        .unwrap();
        assert_eq!(opts.idle_time(), Duration::from_secs(120));
        assert_eq!(opts.timeout(), Duration::from_millis(500));
        assert_eq!(opts.sampling_frequency(), Duration::from_millis(250));
    }

    #[test]
    fn test_tcp_requires_address() {
        assert!(matches!(
            TcpOptions::from_json(&json!({ "timeout": "1s" })),
            Err(GatewayError::MalformedPayload(_))
        ));
        assert!(matches!(
            TcpOptions::from_json(&json!({ "address": "" })),
            Err(GatewayError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_rtu_defaults() {
        let opts = RtuOptions::from_json(&json!({ "address": "/dev/ttyUSB0" })).unwrap();
        assert_eq!(opts.baud_rate(), 19200);
        assert_eq!(opts.serial_data_bits().unwrap(), tokio_serial::DataBits::Eight);
        assert_eq!(opts.serial_stop_bits().unwrap(), tokio_serial::StopBits::One);
        assert_eq!(opts.serial_parity().unwrap(), tokio_serial::Parity::Even);
        assert_eq!(opts.slave_id(), 1);
        assert_eq!(opts.timeout(), Duration::from_secs(5));
        assert_eq!(opts.idle_timeout(), Duration::from_secs(60));
        assert!(!opts.rs485.enabled);
    }

    #[test]
    fn test_rtu_parity_spellings() {
        for (token, expected) in [
            ("N", tokio_serial::Parity::None),
            ("none", tokio_serial::Parity::None),
            ("O", tokio_serial::Parity::Odd),
            ("even", tokio_serial::Parity::Even),
        ] {
            let opts =
                RtuOptions::from_json(&json!({ "address": "/dev/ttyS0", "parity": token })).unwrap();
            assert_eq!(opts.serial_parity().unwrap(), expected);
        }
    }

    #[test]
    fn test_rtu_rejects_bad_framing() {
        for config in [
            json!({ "address": "/dev/ttyS0", "data_bits": 9 }),
            json!({ "address": "/dev/ttyS0", "stop_bits": 3 }),
            json!({ "address": "/dev/ttyS0", "parity": "mark" }),
            json!({ "address": "/dev/ttyS0", "baud_rate": 0 }),
        ] {
            assert!(matches!(
                RtuOptions::from_json(&config),
                Err(GatewayError::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn test_rtu_rs485_block() {
        let opts = RtuOptions::from_json(&json!({
            "address": "/dev/ttyS1",
            "rs485": { "enabled": true, "delay_rts_before_send": "2ms" },
        }))
        .unwrap();
        assert!(opts.rs485.enabled);
        assert_eq!(
            opts.rs485.delay_rts_before_send,
            Some(Duration::from_millis(2))
        );
    }

    #[test]
    fn test_duration_strings_through_humantime() {
        let parse = |value: serde_json::Value| {
            TcpOptions::from_json(&json!({ "address": "plc:502", "timeout": value }))
        };

        assert_eq!(parse(json!("0")).unwrap().timeout(), Duration::ZERO);
        assert_eq!(parse(json!("300us")).unwrap().timeout(), Duration::from_micros(300));
        assert_eq!(parse(json!("1h 2m")).unwrap().timeout(), Duration::from_secs(3720));
        assert_eq!(parse(json!("1m30s")).unwrap().timeout(), Duration::from_secs(90));
        for bad in ["", "10", "s", "5 parsecs"] {
            assert!(
                matches!(parse(json!(bad)), Err(GatewayError::MalformedPayload(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_duration_overflow_rejected() {
        let err = TcpOptions::from_json(&json!({
            "address": "plc:502",
            "sampling_frequency": "99999999999999999999h",
        }))
        .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPayload(_)));
    }
}
