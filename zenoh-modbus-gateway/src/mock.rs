//! In-memory doubles for exercising the gateway without devices or a bus.
//!
//! [`MockDevice`] is a shared register map; every [`MockTransport`] opened on
//! it counts as one open connection until closed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::bus::BusPublisher;
use crate::error::{GatewayError, Result};
use crate::factory::{SessionFactory, SessionOptions};
use crate::request::ProtocolKind;
use crate::session::Session;
use crate::transport::{
    Transport, bytes_to_registers, coil_echo, pack_bits, registers_to_bytes, unpack_bits,
};

const ILLEGAL_DATA_ADDRESS: &str = "Illegal data address";

#[derive(Default)]
struct DeviceState {
    holding: HashMap<u16, u16>,
    input: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    discrete: HashMap<u16, bool>,
    fifo: VecDeque<u16>,
    failing_reads: usize,
    failing_writes: usize,
    stalled: bool,
    reads: usize,
    open: usize,
}

/// Shared state of a simulated device. Unset registers read as zero.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.state.lock().holding.insert(address, value);
    }

    pub fn holding(&self, address: u16) -> Option<u16> {
        self.state.lock().holding.get(&address).copied()
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.state.lock().input.insert(address, value);
    }

    pub fn set_coil(&self, address: u16, on: bool) {
        self.state.lock().coils.insert(address, on);
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state.lock().coils.get(&address).copied().unwrap_or(false)
    }

    pub fn set_discrete(&self, address: u16, on: bool) {
        self.state.lock().discrete.insert(address, on);
    }

    pub fn push_fifo(&self, value: u16) {
        self.state.lock().fifo.push_back(value);
    }

    /// The next `count` reads answer with an "Illegal data address" exception.
    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().failing_reads = count;
    }

    /// The next `count` writes answer with an "Illegal data address" exception.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Reads never answer while stalled.
    pub fn stall_reads(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    /// Read attempts, failed ones included.
    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }

    /// Transports opened on this device and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    async fn read<T>(&self, f: impl FnOnce(&DeviceState) -> T) -> Result<T> {
        let stalled = self.state.lock().stalled;
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        state.reads += 1;
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(GatewayError::ProtocolException(
                ILLEGAL_DATA_ADDRESS.to_string(),
            ));
        }
        Ok(f(&*state))
    }

    fn write(&self, f: impl FnOnce(&mut DeviceState)) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(GatewayError::ProtocolException(
                ILLEGAL_DATA_ADDRESS.to_string(),
            ));
        }
        f(&mut *state);
        Ok(())
    }
}

fn words(map: &HashMap<u16, u16>, address: u16, quantity: u16) -> Vec<u16> {
    (0..quantity)
        .map(|i| map.get(&address.wrapping_add(i)).copied().unwrap_or(0))
        .collect()
}

fn bits(map: &HashMap<u16, bool>, address: u16, quantity: u16) -> Vec<bool> {
    (0..quantity)
        .map(|i| map.get(&address.wrapping_add(i)).copied().unwrap_or(false))
        .collect()
}

/// [`Transport`] over a [`MockDevice`].
pub struct MockTransport {
    device: MockDevice,
    closed: bool,
}

impl MockTransport {
    pub fn new(device: MockDevice) -> Self {
        device.state.lock().open += 1;
        Self {
            device,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(GatewayError::Transport("transport is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.device
            .read(|s| pack_bits(&bits(&s.coils, address, quantity)))
            .await
    }

    async fn read_discrete_inputs(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.device
            .read(|s| pack_bits(&bits(&s.discrete, address, quantity)))
            .await
    }

    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.device
            .read(|s| registers_to_bytes(&words(&s.holding, address, quantity)))
            .await
    }

    async fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.device
            .read(|s| registers_to_bytes(&words(&s.input, address, quantity)))
            .await
    }

    async fn read_fifo_queue(&mut self, _address: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.device
            .read(|s| registers_to_bytes(&s.fifo.iter().copied().collect::<Vec<_>>()))
            .await
    }

    async fn write_single_coil(&mut self, address: u16, on: bool) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.device.write(|s| {
            s.coils.insert(address, on);
        })?;
        Ok(coil_echo(on))
    }

    async fn write_multiple_coils(
        &mut self,
        address: u16,
        quantity: u16,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let values = unpack_bits(data, quantity);
        self.device.write(|s| {
            for (i, on) in values.into_iter().enumerate() {
                s.coils.insert(address.wrapping_add(i as u16), on);
            }
        })?;
        Ok(quantity.to_be_bytes().to_vec())
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.device.write(|s| {
            s.holding.insert(address, value);
        })?;
        Ok(value.to_be_bytes().to_vec())
    }

    async fn write_multiple_registers(&mut self, address: u16, data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let values = bytes_to_registers(data);
        let quantity = values.len() as u16;
        self.device.write(|s| {
            for (i, value) in values.into_iter().enumerate() {
                s.holding.insert(address.wrapping_add(i as u16), value);
            }
        })?;
        Ok(quantity.to_be_bytes().to_vec())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.device.state.lock().open -= 1;
        }
        Ok(())
    }
}

/// [`SessionFactory`] decoding real session options but opening [`MockTransport`]s.
pub struct MockFactory {
    device: MockDevice,
    delay: Mutex<Duration>,
    builds: AtomicUsize,
    fail_connect: AtomicBool,
}

impl MockFactory {
    pub fn new(device: MockDevice) -> Self {
        Self {
            device,
            delay: Mutex::new(Duration::ZERO),
            builds: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
        }
    }

    /// Make subsequent builds fail with a connection error.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent builds take `delay` before connecting.
    pub fn connect_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Number of `build` calls so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn build(&self, protocol: ProtocolKind, config: &Value) -> Result<(Session, Duration)> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let options = SessionOptions::from_json(protocol, config)?;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(GatewayError::Connect(format!(
                "{}: connection refused",
                options.address()
            )));
        }
        let transport = MockTransport::new(self.device.clone());
        Ok((
            Session::new(protocol, Box::new(transport)),
            options.sampling_interval(),
        ))
    }
}

/// [`BusPublisher`] that records every publication.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(topic, payload)` pair, in publication order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Payloads published on `topic`, in order.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Wait until at least `count` payloads were published on `topic`.
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.published_on(topic).len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.published_on(topic).len() >= count
    }
}

#[async_trait]
impl BusPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}
