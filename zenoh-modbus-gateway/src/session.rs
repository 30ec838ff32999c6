//! Device sessions: data-point dispatch over a [`Transport`].

use std::fmt;

use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::request::{DataPoint, ProtocolKind, RegisterRequest, WriteValue};
use crate::transport::Transport;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// A validated write, ready to be executed against a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    SingleCoil { address: u16, on: bool },
    MultipleCoils { address: u16, quantity: u16, data: Vec<u8> },
    SingleRegister { address: u16, value: u16 },
    MultipleRegisters { address: u16, data: Vec<u8> },
}

impl WriteOp {
    /// Check a write request against the data point without touching a device.
    pub fn plan(data_point: DataPoint, request: &RegisterRequest) -> Result<Self> {
        data_point.ensure_writable()?;

        let value = request.value.as_ref().ok_or_else(|| {
            GatewayError::InvalidValueShape("write requires a value".to_string())
        })?;
        let address = request.address;
        let quantity = request.quantity;

        match (data_point, value) {
            (_, WriteValue::Single(_)) if quantity > 1 => Err(GatewayError::InvalidValueShape(
                format!("scalar value cannot cover {} items, send bytes", quantity),
            )),
            (DataPoint::Coil, WriteValue::Single(v)) => match *v {
                COIL_ON => Ok(WriteOp::SingleCoil { address, on: true }),
                COIL_OFF => Ok(WriteOp::SingleCoil { address, on: false }),
                other => Err(GatewayError::InvalidValueShape(format!(
                    "coil value must be 0xFF00 or 0x0000, got {:#06X}",
                    other
                ))),
            },
            (DataPoint::Coil, WriteValue::Multiple(data)) => {
                let expected = (quantity as usize).div_ceil(8);
                if data.len() != expected {
                    return Err(GatewayError::InvalidValueShape(format!(
                        "{} coils need {} bytes, got {}",
                        quantity,
                        expected,
                        data.len()
                    )));
                }
                Ok(WriteOp::MultipleCoils {
                    address,
                    quantity,
                    data: data.clone(),
                })
            }
            (_, WriteValue::Single(v)) => Ok(WriteOp::SingleRegister { address, value: *v }),
            (_, WriteValue::Multiple(data)) => {
                let expected = quantity as usize * 2;
                if data.len() != expected {
                    return Err(GatewayError::InvalidValueShape(format!(
                        "{} registers need {} bytes, got {}",
                        quantity,
                        expected,
                        data.len()
                    )));
                }
                Ok(WriteOp::MultipleRegisters {
                    address,
                    data: data.clone(),
                })
            }
        }
    }
}

/// An open connection to one device, bound to one protocol configuration.
pub struct Session {
    protocol: ProtocolKind,
    transport: Box<dyn Transport>,
    closed: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("protocol", &self.protocol)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    pub fn new(protocol: ProtocolKind, transport: Box<dyn Transport>) -> Self {
        Self {
            protocol,
            transport,
            closed: false,
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read `request.quantity` items of `data_point`. FIFO reads ignore the quantity.
    pub async fn read(&mut self, data_point: DataPoint, request: &RegisterRequest) -> Result<Vec<u8>> {
        let RegisterRequest {
            address, quantity, ..
        } = *request;

        match data_point {
            DataPoint::Coil => self.transport.read_coils(address, quantity).await,
            DataPoint::Discrete => self.transport.read_discrete_inputs(address, quantity).await,
            DataPoint::HRegister | DataPoint::Register => {
                self.transport.read_holding_registers(address, quantity).await
            }
            DataPoint::IRegister => self.transport.read_input_registers(address, quantity).await,
            DataPoint::Fifo => self.transport.read_fifo_queue(address).await,
        }
    }

    /// Validate and perform one write.
    pub async fn write(&mut self, data_point: DataPoint, request: &RegisterRequest) -> Result<Vec<u8>> {
        let op = WriteOp::plan(data_point, request)?;
        self.execute(&op).await
    }

    /// Perform an already validated write.
    pub async fn execute(&mut self, op: &WriteOp) -> Result<Vec<u8>> {
        match op {
            WriteOp::SingleCoil { address, on } => {
                self.transport.write_single_coil(*address, *on).await
            }
            WriteOp::MultipleCoils {
                address,
                quantity,
                data,
            } => {
                self.transport
                    .write_multiple_coils(*address, *quantity, data)
                    .await
            }
            WriteOp::SingleRegister { address, value } => {
                self.transport.write_single_register(*address, *value).await
            }
            WriteOp::MultipleRegisters { address, data } => {
                self.transport.write_multiple_registers(*address, data).await
            }
        }
    }

    /// Close the underlying transport. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(protocol = %self.protocol, "Closing session");
        self.transport.close().await
    }
}
