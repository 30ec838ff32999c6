//! Session construction from declarative configuration blobs.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::options::{RtuOptions, TcpOptions};
use crate::request::ProtocolKind;
use crate::session::Session;
use crate::transport::ModbusTransport;

/// Decoded, validated session options for one protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOptions {
    Tcp(TcpOptions),
    Rtu(RtuOptions),
}

impl SessionOptions {
    /// Decode `config` against the schema of `protocol`.
    pub fn from_json(protocol: ProtocolKind, config: &Value) -> Result<Self> {
        match protocol {
            ProtocolKind::Tcp => TcpOptions::from_json(config).map(SessionOptions::Tcp),
            ProtocolKind::Rtu => RtuOptions::from_json(config).map(SessionOptions::Rtu),
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        match self {
            SessionOptions::Tcp(_) => ProtocolKind::Tcp,
            SessionOptions::Rtu(_) => ProtocolKind::Rtu,
        }
    }

    /// Device address: `host:port` or serial path.
    pub fn address(&self) -> &str {
        match self {
            SessionOptions::Tcp(o) => &o.address,
            SessionOptions::Rtu(o) => &o.address,
        }
    }

    pub fn sampling_interval(&self) -> Duration {
        match self {
            SessionOptions::Tcp(o) => o.sampling_frequency(),
            SessionOptions::Rtu(o) => o.sampling_frequency(),
        }
    }
}

/// Builds sessions from a protocol and its configuration blob.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a session. Returns it with the configured sampling interval.
    async fn build(&self, protocol: ProtocolKind, config: &Value) -> Result<(Session, Duration)>;
}

/// [`SessionFactory`] opening real Modbus TCP / RTU connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusSessionFactory;

#[async_trait]
impl SessionFactory for ModbusSessionFactory {
    async fn build(&self, protocol: ProtocolKind, config: &Value) -> Result<(Session, Duration)> {
        let options = SessionOptions::from_json(protocol, config)?;
        let interval = options.sampling_interval();

        let transport = match &options {
            SessionOptions::Tcp(tcp) => ModbusTransport::connect_tcp(tcp).await?,
            SessionOptions::Rtu(rtu) => ModbusTransport::open_rtu(rtu).await?,
        };

        debug!(%protocol, address = %options.address(), "Session opened");
        Ok((Session::new(protocol, Box::new(transport)), interval))
    }
}
