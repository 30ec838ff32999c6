//! Typed register operation requests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};

/// Addressed register or bit category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPoint {
    /// Read/write single-bit outputs.
    Coil,
    /// Holding registers, read-only through this data point.
    HRegister,
    /// Input registers.
    IRegister,
    /// Holding registers, readable and writable.
    Register,
    /// Discrete inputs.
    Discrete,
    /// FIFO queue (function code 0x18).
    Fifo,
}

impl DataPoint {
    /// Topic token for this data point.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataPoint::Coil => "coil",
            DataPoint::HRegister => "h_register",
            DataPoint::IRegister => "i_register",
            DataPoint::Register => "register",
            DataPoint::Discrete => "discrete",
            DataPoint::Fifo => "fifo",
        }
    }

    /// Only coils and generic registers accept writes.
    pub fn is_writable(&self) -> bool {
        matches!(self, DataPoint::Coil | DataPoint::Register)
    }

    /// Fail with `UnsupportedWriteDataPoint` for read-only kinds.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(GatewayError::UnsupportedWriteDataPoint(
                self.as_str().to_string(),
            ))
        }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataPoint {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coil" => Ok(DataPoint::Coil),
            "h_register" => Ok(DataPoint::HRegister),
            "i_register" => Ok(DataPoint::IRegister),
            "register" => Ok(DataPoint::Register),
            "discrete" => Ok(DataPoint::Discrete),
            "fifo" => Ok(DataPoint::Fifo),
            other => Err(GatewayError::MalformedTopic(format!(
                "unknown data point '{}'",
                other
            ))),
        }
    }
}

/// Transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Modbus TCP.
    Tcp,
    /// Modbus RTU over a serial line.
    Rtu,
}

impl ProtocolKind {
    /// Topic token for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::Rtu => "rtu",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(ProtocolKind::Tcp),
            "rtu" => Ok(ProtocolKind::Rtu),
            other => Err(GatewayError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Value carried by a write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteValue {
    /// Single register or coil value.
    Single(u16),
    /// Raw data bytes for a multiple write.
    Multiple(Vec<u8>),
}

impl WriteValue {
    /// Decode from JSON: a u16 number or an array of u8.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .map(WriteValue::Single)
                .ok_or_else(|| {
                    GatewayError::InvalidValueShape(format!("{} is not a 16-bit value", n))
                }),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|v| u8::try_from(v).ok())
                        .ok_or_else(|| {
                            GatewayError::InvalidValueShape(format!("{} is not a byte", item))
                        })
                })
                .collect::<Result<Vec<u8>>>()
                .map(WriteValue::Multiple),
            other => Err(GatewayError::InvalidValueShape(format!(
                "expected a number or a byte array, got {}",
                other
            ))),
        }
    }
}

/// Register operation request: start address, count and optional write value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub address: u16,
    pub quantity: u16,
    pub value: Option<WriteValue>,
}

#[derive(Deserialize)]
struct RawOptions {
    address: u16,
    #[serde(default)]
    quantity: Option<u16>,
    #[serde(default)]
    value: Option<Value>,
}

impl RegisterRequest {
    /// Request for `quantity` items starting at `address`, without a value.
    pub fn read(address: u16, quantity: u16) -> Self {
        Self {
            address,
            quantity,
            value: None,
        }
    }

    /// Decode `{address, quantity?, value?}`. Unknown fields are ignored.
    pub fn from_json(options: &Value) -> Result<Self> {
        let raw = RawOptions::deserialize(options)
            .map_err(|e| GatewayError::MalformedPayload(format!("options: {}", e)))?;

        let quantity = match raw.quantity {
            None => 1,
            Some(0) => {
                return Err(GatewayError::MalformedPayload(
                    "quantity must be at least 1".to_string(),
                ));
            }
            Some(q) => q,
        };

        let value = raw.value.as_ref().map(WriteValue::from_json).transpose()?;

        Ok(Self {
            address: raw.address,
            quantity,
            value,
        })
    }
}
