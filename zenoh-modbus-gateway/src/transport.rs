//! Modbus transports.
//!
//! A [`Transport`] owns one device connection and exposes the primitive
//! register operations. Every operation returns the raw Modbus data bytes:
//! registers as big-endian words, bits packed LSB-first.

use std::borrow::Cow;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_modbus::client::{Client, Context, Reader, Writer};
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::options::{RtuOptions, TcpOptions};

/// Function code for Read FIFO Queue.
const READ_FIFO_QUEUE: u8 = 0x18;

/// Primitive register operations against one device.
#[async_trait]
pub trait Transport: Send {
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>>;

    async fn read_discrete_inputs(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>>;

    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>>;

    async fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>>;

    /// Read the FIFO queue whose count register sits at `address`.
    async fn read_fifo_queue(&mut self, address: u16) -> Result<Vec<u8>>;

    /// Returns the 2-byte echo of the written value (`FF00` or `0000`).
    async fn write_single_coil(&mut self, address: u16, on: bool) -> Result<Vec<u8>>;

    /// `data` holds `quantity` bits packed LSB-first. Returns the quantity, big-endian.
    async fn write_multiple_coils(
        &mut self,
        address: u16,
        quantity: u16,
        data: &[u8],
    ) -> Result<Vec<u8>>;

    /// Returns the 2-byte echo of the written value.
    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<Vec<u8>>;

    /// `data` holds big-endian words. Returns the quantity, big-endian.
    async fn write_multiple_registers(&mut self, address: u16, data: &[u8]) -> Result<Vec<u8>>;

    /// Release the connection. The transport is unusable afterwards.
    async fn close(&mut self) -> Result<()>;
}

/// Pack bits LSB-first into `ceil(n / 8)` bytes.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, on)| **on) {
        bytes[i / 8] |= 1 << (i % 8);
    }
    bytes
}

/// Unpack the first `quantity` bits of LSB-first packed bytes.
pub fn unpack_bits(bytes: &[u8], quantity: u16) -> Vec<bool> {
    (0..quantity as usize)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Registers as big-endian byte pairs.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Big-endian byte pairs as registers. A trailing odd byte is ignored.
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Coil value echoed by a single-coil write.
pub fn coil_echo(on: bool) -> Vec<u8> {
    if on { vec![0xFF, 0x00] } else { vec![0x00, 0x00] }
}

/// Extract the queued registers from a Read FIFO Queue response body
/// (byte count, FIFO count, values).
fn fifo_values(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 4 {
        return Err(GatewayError::Transport(format!(
            "short FIFO response ({} bytes)",
            body.len()
        )));
    }
    let count = u16::from_be_bytes([body[2], body[3]]) as usize;
    let values = &body[4..];
    if values.len() < count * 2 {
        return Err(GatewayError::Transport(format!(
            "FIFO response announces {} registers but carries {} bytes",
            count,
            values.len()
        )));
    }
    Ok(values[..count * 2].to_vec())
}

/// Where a [`ModbusTransport`] (re)connects to.
#[derive(Debug, Clone)]
enum Endpoint {
    Tcp { address: String },
    Rtu { options: RtuOptions },
}

impl Endpoint {
    fn describe(&self) -> &str {
        match self {
            Endpoint::Tcp { address } => address,
            Endpoint::Rtu { options } => &options.address,
        }
    }
}

/// [`Transport`] backed by a `tokio-modbus` client context.
///
/// The connection is dropped after an I/O error, a timeout, or when it sat
/// unused for longer than the idle period, and is re-opened on next use.
pub struct ModbusTransport {
    endpoint: Endpoint,
    slave: Slave,
    timeout: Duration,
    idle: Duration,
    ctx: Option<Context>,
    last_used: Instant,
    closed: bool,
}

impl std::fmt::Debug for ModbusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTransport")
            .field("endpoint", &self.endpoint.describe())
            .field("slave", &self.slave)
            .field("connected", &self.ctx.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ModbusTransport {
    /// Connect to a Modbus TCP device.
    pub async fn connect_tcp(options: &TcpOptions) -> Result<Self> {
        let mut transport = Self {
            endpoint: Endpoint::Tcp {
                address: options.address.clone(),
            },
            slave: Slave(options.slave_id()),
            timeout: options.timeout(),
            idle: options.idle_time(),
            ctx: None,
            last_used: Instant::now(),
            closed: false,
        };
        transport.ctx =
            Some(open_endpoint(&transport.endpoint, transport.slave, transport.timeout).await?);
        Ok(transport)
    }

    /// Open the serial port of a Modbus RTU device.
    pub async fn open_rtu(options: &RtuOptions) -> Result<Self> {
        if options.rs485.enabled {
            warn!(
                port = %options.address,
                "RS-485 line settings are not supported by the serial backend, ignoring"
            );
        }
        let mut transport = Self {
            endpoint: Endpoint::Rtu {
                options: options.clone(),
            },
            slave: Slave(options.slave_id()),
            timeout: options.timeout(),
            idle: options.idle_timeout(),
            ctx: None,
            last_used: Instant::now(),
            closed: false,
        };
        transport.ctx =
            Some(open_endpoint(&transport.endpoint, transport.slave, transport.timeout).await?);
        Ok(transport)
    }

    /// Take the live context, re-opening it when absent or idle for too long.
    async fn checkout(&mut self) -> Result<Context> {
        if self.closed {
            return Err(GatewayError::Transport("transport is closed".to_string()));
        }

        if let Some(mut ctx) = self.ctx.take() {
            if self.idle.is_zero() || self.last_used.elapsed() < self.idle {
                return Ok(ctx);
            }
            debug!(endpoint = %self.endpoint.describe(), "Connection idle, reopening");
            if let Err(e) = ctx.disconnect().await {
                debug!(error = %e, "Error while dropping idle connection");
            }
        }

        open_endpoint(&self.endpoint, self.slave, self.timeout).await
    }

    /// Return the context after an operation. Transport failures drop it.
    fn checkin<T>(&mut self, ctx: Context, outcome: Outcome<T>) -> Result<T> {
        self.last_used = Instant::now();
        match outcome {
            Outcome::Done(value) => {
                self.ctx = Some(ctx);
                Ok(value)
            }
            Outcome::Exception(code) => {
                self.ctx = Some(ctx);
                Err(GatewayError::ProtocolException(code.to_string()))
            }
            Outcome::Failed(message) => {
                debug!(
                    endpoint = %self.endpoint.describe(),
                    error = %message,
                    "Dropping connection after transport failure"
                );
                Err(GatewayError::Transport(message))
            }
        }
    }
}

/// Open a client context for `endpoint`.
async fn open_endpoint(endpoint: &Endpoint, slave: Slave, timeout: Duration) -> Result<Context> {
    match endpoint {
        Endpoint::Tcp { address } => {
            let socket_addr = tokio::net::lookup_host(address.as_str())
                .await
                .map_err(|e| GatewayError::Connect(format!("{}: {}", address, e)))?
                .next()
                .ok_or_else(|| GatewayError::Connect(format!("{}: no address resolved", address)))?;

            let connecting = tcp::connect_slave(socket_addr, slave);
            let ctx = if timeout.is_zero() {
                connecting.await
            } else {
                tokio::time::timeout(timeout, connecting)
                    .await
                    .map_err(|_| GatewayError::Connect(format!("{}: connection timed out", address)))?
            }
            .map_err(|e| GatewayError::Connect(format!("{}: {}", address, e)))?;

            debug!(%address, slave = slave.0, "Connected to Modbus TCP device");
            Ok(ctx)
        }
        Endpoint::Rtu { options } => {
            let mut builder = tokio_serial::new(&options.address, options.baud_rate())
                .data_bits(options.serial_data_bits()?)
                .stop_bits(options.serial_stop_bits()?)
                .parity(options.serial_parity()?);
            if !timeout.is_zero() {
                builder = builder.timeout(timeout);
            }

            let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                GatewayError::Connect(format!("{}: serial open failed: {}", options.address, e))
            })?;

            debug!(port = %options.address, slave = slave.0, "Opened Modbus RTU port");
            Ok(rtu::attach_slave(serial, slave))
        }
    }
}

enum Outcome<T> {
    Done(T),
    Exception(ExceptionCode),
    Failed(String),
}

/// Await a client call, bounded by `timeout` unless it is zero.
async fn with_deadline<T, F>(timeout: Duration, call: F) -> Outcome<T>
where
    F: Future<Output = std::result::Result<std::result::Result<T, ExceptionCode>, tokio_modbus::Error>>,
{
    let result = if timeout.is_zero() {
        call.await
    } else {
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => return Outcome::Failed(format!("no response within {:?}", timeout)),
        }
    };

    match result {
        Ok(Ok(value)) => Outcome::Done(value),
        Ok(Err(code)) => Outcome::Exception(code),
        Err(e) => Outcome::Failed(e.to_string()),
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        let mut ctx = self.checkout().await?;
        let outcome = with_deadline(self.timeout, ctx.read_coils(address, quantity)).await;
        let bits = self.checkin(ctx, outcome)?;
        Ok(pack_bits(&bits[..bits.len().min(quantity as usize)]))
    }

    async fn read_discrete_inputs(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        let mut ctx = self.checkout().await?;
        let outcome =
            with_deadline(self.timeout, ctx.read_discrete_inputs(address, quantity)).await;
        let bits = self.checkin(ctx, outcome)?;
        Ok(pack_bits(&bits[..bits.len().min(quantity as usize)]))
    }

    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        let mut ctx = self.checkout().await?;
        let outcome =
            with_deadline(self.timeout, ctx.read_holding_registers(address, quantity)).await;
        let registers = self.checkin(ctx, outcome)?;
        Ok(registers_to_bytes(&registers))
    }

    async fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        let mut ctx = self.checkout().await?;
        let outcome =
            with_deadline(self.timeout, ctx.read_input_registers(address, quantity)).await;
        let registers = self.checkin(ctx, outcome)?;
        Ok(registers_to_bytes(&registers))
    }

    async fn read_fifo_queue(&mut self, address: u16) -> Result<Vec<u8>> {
        let mut ctx = self.checkout().await?;
        let request = Request::Custom(
            READ_FIFO_QUEUE,
            Cow::Owned(address.to_be_bytes().to_vec()),
        );
        let outcome = with_deadline(self.timeout, ctx.call(request)).await;
        match self.checkin(ctx, outcome)? {
            Response::Custom(READ_FIFO_QUEUE, body) => fifo_values(&body),
            other => Err(GatewayError::Transport(format!(
                "unexpected FIFO response: {:?}",
                other
            ))),
        }
    }

    async fn write_single_coil(&mut self, address: u16, on: bool) -> Result<Vec<u8>> {
        let mut ctx = self.checkout().await?;
        let outcome = with_deadline(self.timeout, ctx.write_single_coil(address, on)).await;
        self.checkin(ctx, outcome)?;
        Ok(coil_echo(on))
    }

    async fn write_multiple_coils(
        &mut self,
        address: u16,
        quantity: u16,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let bits = unpack_bits(data, quantity);
        let mut ctx = self.checkout().await?;
        let outcome = with_deadline(self.timeout, ctx.write_multiple_coils(address, &bits)).await;
        self.checkin(ctx, outcome)?;
        Ok(quantity.to_be_bytes().to_vec())
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<Vec<u8>> {
        let mut ctx = self.checkout().await?;
        let outcome =
            with_deadline(self.timeout, ctx.write_single_register(address, value)).await;
        self.checkin(ctx, outcome)?;
        Ok(value.to_be_bytes().to_vec())
    }

    async fn write_multiple_registers(&mut self, address: u16, data: &[u8]) -> Result<Vec<u8>> {
        let registers = bytes_to_registers(data);
        let quantity = registers.len() as u16;
        let mut ctx = self.checkout().await?;
        let outcome = with_deadline(
            self.timeout,
            ctx.write_multiple_registers(address, &registers),
        )
        .await;
        self.checkin(ctx, outcome)?;
        Ok(quantity.to_be_bytes().to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(mut ctx) = self.ctx.take() {
            ctx.disconnect()
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            debug!(endpoint = %self.endpoint.describe(), "Connection closed");
        }
        Ok(())
    }
}
