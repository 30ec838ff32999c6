//! Session & polling manager.
//!
//! Owns every device session the gateway opens:
//!
//! - reads start a polling task per register address, republishing samples
//!   on the response topic until stopped (a newer read on the same address
//!   supersedes the running one);
//! - writes open a session, perform exactly one write and close it again;
//! - the session-id API keeps sessions open across calls, one
//!   `tokio::sync::Mutex` per session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bus::BusPublisher;
use crate::error::{GatewayError, Result};
use crate::factory::SessionFactory;
use crate::request::{DataPoint, ProtocolKind, RegisterRequest};
use crate::session::{Session, WriteOp};
use crate::topic::{Channel, OperationIntent, RoutedIntent, StopIntent, response_topic};

/// What a dispatched intent did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// A polling task is running for the address.
    PollStarted { address: u16, superseded: bool },
    /// The write was performed; carries the published result bytes.
    Written(Vec<u8>),
    /// The poll for the address was cancelled.
    Stopped { address: u16 },
}

/// Upper bound on waiting for a session in use when shutting down.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Snapshot of one active poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollInfo {
    pub address: u16,
    pub channel: String,
    pub data_point: DataPoint,
    /// `None` while the device session is still being opened.
    pub interval_ms: Option<u64>,
}

struct PollHandle {
    id: u64,
    token: CancellationToken,
    channel: Channel,
    data_point: DataPoint,
    interval: Option<Duration>,
}

type SharedSession = Arc<tokio::sync::Mutex<Session>>;

/// Dispatches routed intents and owns the lifecycle of device sessions.
pub struct SessionManager {
    factory: Arc<dyn SessionFactory>,
    publisher: Arc<dyn BusPublisher>,
    polls: Mutex<HashMap<u16, PollHandle>>,
    sessions: Mutex<HashMap<u32, SharedSession>>,
    next_session_id: AtomicU32,
    next_poll_id: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn SessionFactory>, publisher: Arc<dyn BusPublisher>) -> Self {
        Self::with_shutdown(factory, publisher, &CancellationToken::new())
    }

    /// Polls are cancelled when `parent` is cancelled.
    pub fn with_shutdown(
        factory: Arc<dyn SessionFactory>,
        publisher: Arc<dyn BusPublisher>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            factory,
            publisher,
            polls: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU32::new(1),
            next_poll_id: AtomicU64::new(1),
            shutdown: parent.child_token(),
            tasks: TaskTracker::new(),
        }
    }

    /// Single entry point for the bus and HTTP surfaces.
    pub async fn dispatch(&self, intent: RoutedIntent) -> Result<Dispatched> {
        match intent {
            RoutedIntent::Read(op) => self.start_poll(op).await,
            RoutedIntent::Write(op) => self.write_once(op).await.map(Dispatched::Written),
            RoutedIntent::Stop(stop) => self.stop(stop),
        }
    }

    /// The slot for the address is claimed before the session is opened, so
    /// a stop or a newer read arriving while connecting cancels this poll.
    async fn start_poll(&self, op: OperationIntent) -> Result<Dispatched> {
        let OperationIntent {
            channel,
            protocol,
            data_point,
            request,
            config,
        } = op;

        let address = request.address;
        let id = self.next_poll_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let previous = self.polls.lock().insert(
            address,
            PollHandle {
                id,
                token: token.clone(),
                channel: channel.clone(),
                data_point,
                interval: None,
            },
        );
        let superseded = match previous {
            Some(old) => {
                old.token.cancel();
                info!(address, old_channel = %old.channel, "Superseding active poll");
                true
            }
            None => false,
        };

        let (mut session, interval) = match self.factory.build(protocol, &config).await {
            Ok(built) => built,
            Err(e) => {
                self.release(address, id);
                return Err(e);
            }
        };
        if interval.is_zero() {
            self.release(address, id);
            close_quietly(&mut session).await;
            return Err(GatewayError::MalformedPayload(
                "sampling_frequency must be greater than zero".to_string(),
            ));
        }

        let claimed = match self.polls.lock().get_mut(&address) {
            Some(handle) if handle.id == id && !token.is_cancelled() => {
                handle.interval = Some(interval);
                true
            }
            _ => false,
        };
        if !claimed {
            debug!(address, "Poll cancelled while connecting");
            close_quietly(&mut session).await;
            return Ok(Dispatched::PollStarted {
                address,
                superseded,
            });
        }

        info!(
            address,
            %channel,
            %data_point,
            quantity = request.quantity,
            interval_ms = millis(interval),
            "Starting poll"
        );

        let topic = response_topic(&channel, address);
        self.tasks.spawn(poll_loop(
            session,
            data_point,
            request,
            interval,
            topic,
            self.publisher.clone(),
            token,
        ));

        Ok(Dispatched::PollStarted {
            address,
            superseded,
        })
    }

    /// Drop the slot for `address` if it still belongs to poll `id`.
    fn release(&self, address: u16, id: u64) {
        let mut polls = self.polls.lock();
        if polls.get(&address).is_some_and(|handle| handle.id == id) {
            polls.remove(&address);
        }
    }

    async fn write_once(&self, op: OperationIntent) -> Result<Vec<u8>> {
        let plan = WriteOp::plan(op.data_point, &op.request)?;

        let (mut session, _) = self.factory.build(op.protocol, &op.config).await?;
        let result = session.execute(&plan).await;
        close_quietly(&mut session).await;
        let bytes = result?;

        debug!(
            address = op.request.address,
            channel = %op.channel,
            data_point = %op.data_point,
            "Write performed"
        );

        self.publisher
            .publish(&response_topic(&op.channel, op.request.address), bytes.clone())
            .await?;
        Ok(bytes)
    }

    fn stop(&self, stop: StopIntent) -> Result<Dispatched> {
        let handle = self
            .polls
            .lock()
            .remove(&stop.address)
            .ok_or(GatewayError::RegisterNotFound(stop.address))?;
        handle.token.cancel();
        info!(address = stop.address, channel = %stop.channel, "Poll stopped");
        Ok(Dispatched::Stopped {
            address: stop.address,
        })
    }

    /// Active polls, ordered by address.
    pub fn active_polls(&self) -> Vec<PollInfo> {
        let mut polls: Vec<PollInfo> = self
            .polls
            .lock()
            .iter()
            .map(|(address, handle)| PollInfo {
                address: *address,
                channel: handle.channel.to_string(),
                data_point: handle.data_point,
                interval_ms: handle.interval.map(millis),
            })
            .collect();
        polls.sort_by_key(|p| p.address);
        polls
    }

    /// Open a session that stays open until [`close_session`](Self::close_session).
    pub async fn configure_session(&self, protocol: ProtocolKind, config: &Value) -> Result<u32> {
        let (session, _) = self.factory.build(protocol, config).await?;
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .insert(id, Arc::new(tokio::sync::Mutex::new(session)));
        info!(id, %protocol, "Session configured");
        Ok(id)
    }

    fn session(&self, id: u32) -> Result<SharedSession> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(GatewayError::DeviceNotConfigured(id))
    }

    /// Read through an open session.
    pub async fn session_read(
        &self,
        id: u32,
        data_point: DataPoint,
        request: &RegisterRequest,
    ) -> Result<Vec<u8>> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        if session.is_closed() {
            return Err(GatewayError::DeviceNotConfigured(id));
        }
        session.read(data_point, request).await
    }

    /// Write through an open session.
    pub async fn session_write(
        &self,
        id: u32,
        data_point: DataPoint,
        request: &RegisterRequest,
    ) -> Result<Vec<u8>> {
        let plan = WriteOp::plan(data_point, request)?;
        let session = self.session(id)?;
        let mut session = session.lock().await;
        if session.is_closed() {
            return Err(GatewayError::DeviceNotConfigured(id));
        }
        session.execute(&plan).await
    }

    /// Close and forget a session id.
    pub async fn close_session(&self, id: u32) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .remove(&id)
            .ok_or(GatewayError::DeviceNotConfigured(id))?;
        let mut session = session.lock().await;
        session.close().await?;
        info!(id, "Session closed");
        Ok(())
    }

    /// Number of sessions opened through the session-id API and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Cancel every poll, close every session and wait for polling tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.polls.lock().clear();
        self.tasks.close();

        let sessions: Vec<(u32, SharedSession)> = self.sessions.lock().drain().collect();
        for (id, session) in sessions {
            let Ok(mut session) = tokio::time::timeout(SESSION_CLOSE_GRACE, session.lock()).await
            else {
                warn!(id, "Session still busy, dropping without close");
                continue;
            };
            if let Err(e) = session.close().await {
                warn!(id, error = %e, "Error closing session");
            }
        }

        self.tasks.wait().await;
        info!("Session manager stopped");
    }
}

async fn poll_loop(
    mut session: Session,
    data_point: DataPoint,
    request: RegisterRequest,
    interval: Duration,
    topic: String,
    publisher: Arc<dyn BusPublisher>,
    token: CancellationToken,
) {
    let address = request.address;
    loop {
        if token.is_cancelled() {
            break;
        }

        let sample = tokio::select! {
            _ = token.cancelled() => break,
            sample = session.read(data_point, &request) => sample,
        };

        match sample {
            Ok(bytes) => {
                if token.is_cancelled() {
                    break;
                }
                if let Err(e) = publisher.publish(&topic, bytes).await {
                    warn!(address, %topic, error = %e, "Failed to publish sample");
                }
            }
            Err(e) => {
                warn!(address, %data_point, error = %e, "Sample failed");
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    close_quietly(&mut session).await;
    debug!(address, "Poll task exited");
}

fn millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

async fn close_quietly(session: &mut Session) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Error closing session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockFactory, RecordingPublisher};
    use crate::request::WriteValue;
    use serde_json::json;

    fn manager(device: &MockDevice) -> (SessionManager, Arc<MockFactory>, Arc<RecordingPublisher>) {
        let factory = Arc::new(MockFactory::new(device.clone()));
        let publisher = Arc::new(RecordingPublisher::new());
        let manager = SessionManager::new(factory.clone(), publisher.clone());
        (manager, factory, publisher)
    }

    fn read_intent(address: u16, data_point: DataPoint, interval: &str) -> RoutedIntent {
        RoutedIntent::Read(OperationIntent {
            channel: Channel::new("channels", Some("1".to_string())),
            protocol: ProtocolKind::Tcp,
            data_point,
            request: RegisterRequest::read(address, 1),
            config: json!({ "address": "plc:502", "sampling_frequency": interval }),
        })
    }

    fn write_intent(address: u16, data_point: DataPoint, value: WriteValue) -> RoutedIntent {
        RoutedIntent::Write(OperationIntent {
            channel: Channel::new("channels", Some("1".to_string())),
            protocol: ProtocolKind::Tcp,
            data_point,
            request: RegisterRequest {
                address,
                quantity: 1,
                value: Some(value),
            },
            config: json!({ "address": "plc:502" }),
        })
    }

    fn stop_intent(address: u16) -> RoutedIntent {
        RoutedIntent::Stop(StopIntent {
            channel: Channel::new("channels", Some("1".to_string())),
            address,
        })
    }

    #[tokio::test]
    async fn test_read_publishes_until_stopped() {
        let device = MockDevice::new();
        device.set_holding(100, 0x002A);
        let (manager, _, publisher) = manager(&device);

        let outcome = manager
            .dispatch(read_intent(100, DataPoint::HRegister, "20ms"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Dispatched::PollStarted {
                address: 100,
                superseded: false
            }
        );

        let topic = "channels.1.modbus.response.100";
        assert!(publisher.wait_for(topic, 3, Duration::from_secs(2)).await);
        assert_eq!(publisher.published_on(topic)[0], vec![0x00, 0x2A]);

        manager.dispatch(stop_intent(100)).await.unwrap();
        assert!(manager.active_polls().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let after_stop = publisher.published_on(topic).len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(publisher.published_on(topic).len(), after_stop);
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_poll() {
        let device = MockDevice::new();
        let (manager, _, _) = manager(&device);

        let err = manager.dispatch(stop_intent(7)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RegisterNotFound(7)));
        assert!(manager.active_polls().is_empty());
    }

    #[tokio::test]
    async fn test_new_read_supersedes_poll() {
        let device = MockDevice::new();
        device.set_holding(5, 1);
        let (manager, factory, _) = manager(&device);

        manager
            .dispatch(read_intent(5, DataPoint::HRegister, "20ms"))
            .await
            .unwrap();
        let outcome = manager
            .dispatch(read_intent(5, DataPoint::Register, "30ms"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Dispatched::PollStarted {
                address: 5,
                superseded: true
            }
        );

        let polls = manager.active_polls();
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].data_point, DataPoint::Register);
        assert_eq!(polls[0].interval_ms, Some(30));
        assert_eq!(factory.builds(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(device.open_connections(), 1);

        manager.shutdown().await;
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_exception_does_not_end_poll() {
        let device = MockDevice::new();
        device.set_holding(9, 0x0101);
        device.fail_next_reads(1);
        let (manager, _, publisher) = manager(&device);

        manager
            .dispatch(read_intent(9, DataPoint::HRegister, "20ms"))
            .await
            .unwrap();

        let topic = "channels.1.modbus.response.9";
        assert!(publisher.wait_for(topic, 1, Duration::from_secs(2)).await);
        assert!(device.reads() >= 2);
        assert_eq!(manager.active_polls().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_sampling_interval_rejected() {
        let device = MockDevice::new();
        let (manager, _, _) = manager(&device);

        let err = manager
            .dispatch(read_intent(1, DataPoint::Coil, "0"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPayload(_)));
        assert!(manager.active_polls().is_empty());
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_starts_no_task() {
        let device = MockDevice::new();
        let (manager, factory, _) = manager(&device);
        factory.fail_connect(true);

        let err = manager
            .dispatch(read_intent(1, DataPoint::Coil, "1s"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Connect(_)));
        assert!(manager.active_polls().is_empty());
    }

    #[tokio::test]
    async fn test_write_register_publishes_echo() {
        let device = MockDevice::new();
        let (manager, _, publisher) = manager(&device);

        let outcome = manager
            .dispatch(write_intent(3, DataPoint::Register, WriteValue::Single(1)))
            .await
            .unwrap();
        assert_eq!(outcome, Dispatched::Written(vec![0x00, 0x01]));
        assert_eq!(device.holding(3), Some(1));
        assert_eq!(
            publisher.published_on("channels.1.modbus.response.3"),
            vec![vec![0x00, 0x01]]
        );
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_write_to_read_only_never_builds_session() {
        let device = MockDevice::new();
        let (manager, factory, publisher) = manager(&device);

        for dp in [
            DataPoint::HRegister,
            DataPoint::IRegister,
            DataPoint::Discrete,
            DataPoint::Fifo,
        ] {
            let err = manager
                .dispatch(write_intent(1, dp, WriteValue::Single(1)))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::UnsupportedWriteDataPoint(_)));
        }
        assert_eq!(factory.builds(), 0);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_still_closes_session() {
        let device = MockDevice::new();
        device.fail_next_writes(1);
        let (manager, factory, publisher) = manager(&device);

        let err = manager
            .dispatch(write_intent(3, DataPoint::Register, WriteValue::Single(9)))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolException(_)));
        assert_eq!(factory.builds(), 1);
        assert_eq!(device.open_connections(), 0);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_session_api_round_trip() {
        let device = MockDevice::new();
        let (manager, _, _) = manager(&device);

        let id = manager
            .configure_session(ProtocolKind::Tcp, &json!({ "address": "plc:502" }))
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(manager.open_sessions(), 1);
        assert_eq!(device.open_connections(), 1);

        let write = RegisterRequest {
            address: 40,
            quantity: 2,
            value: Some(WriteValue::Multiple(vec![0x00, 0x0A, 0x00, 0x0B])),
        };
        assert_eq!(
            manager
                .session_write(id, DataPoint::Register, &write)
                .await
                .unwrap(),
            vec![0x00, 0x02]
        );
        assert_eq!(
            manager
                .session_read(id, DataPoint::HRegister, &RegisterRequest::read(40, 2))
                .await
                .unwrap(),
            vec![0x00, 0x0A, 0x00, 0x0B]
        );

        manager.close_session(id).await.unwrap();
        assert_eq!(manager.open_sessions(), 0);
        assert_eq!(device.open_connections(), 0);

        let err = manager
            .session_read(id, DataPoint::HRegister, &RegisterRequest::read(40, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DeviceNotConfigured(1)));
        assert!(matches!(
            manager.close_session(id).await,
            Err(GatewayError::DeviceNotConfigured(1))
        ));
    }

    #[tokio::test]
    async fn test_session_ids_are_not_reused() {
        let device = MockDevice::new();
        let (manager, _, _) = manager(&device);
        let config = json!({ "address": "plc:502" });

        let first = manager
            .configure_session(ProtocolKind::Tcp, &config)
            .await
            .unwrap();
        manager.close_session(first).await.unwrap();
        let second = manager
            .configure_session(ProtocolKind::Tcp, &config)
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let device = MockDevice::new();
        device.set_coil(0, true);
        let (manager, _, _) = manager(&device);

        for address in [0, 1, 2] {
            manager
                .dispatch(read_intent(address, DataPoint::Coil, "10ms"))
                .await
                .unwrap();
        }
        manager
            .configure_session(ProtocolKind::Tcp, &json!({ "address": "plc:502" }))
            .await
            .unwrap();
        assert_eq!(device.open_connections(), 4);

        manager.shutdown().await;
        assert!(manager.active_polls().is_empty());
        assert_eq!(manager.open_sessions(), 0);
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stop_while_connecting_cancels_poll() {
        let device = MockDevice::new();
        let (manager, factory, publisher) = manager(&device);
        let manager = Arc::new(manager);
        factory.connect_delay(Duration::from_millis(100));

        let reading = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .dispatch(read_intent(100, DataPoint::HRegister, "10ms"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pending = manager.active_polls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].interval_ms, None);

        let outcome = manager.dispatch(stop_intent(100)).await.unwrap();
        assert_eq!(outcome, Dispatched::Stopped { address: 100 });
        reading.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.active_polls().is_empty());
        assert!(publisher.published_on("channels.1.modbus.response.100").is_empty());
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_read_superseded_while_connecting_closes_session() {
        let device = MockDevice::new();
        let (manager, factory, _) = manager(&device);
        let manager = Arc::new(manager);
        factory.connect_delay(Duration::from_millis(80));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .dispatch(read_intent(4, DataPoint::Coil, "10ms"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        factory.connect_delay(Duration::ZERO);
        let second = manager
            .dispatch(read_intent(4, DataPoint::Coil, "10ms"))
            .await
            .unwrap();
        assert_eq!(
            second,
            Dispatched::PollStarted {
                address: 4,
                superseded: true
            }
        );
        first.await.unwrap().unwrap();

        assert_eq!(manager.active_polls().len(), 1);
        assert_eq!(device.open_connections(), 1);
        manager.shutdown().await;
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_does_not_wait_for_stalled_read() {
        let device = MockDevice::new();
        device.stall_reads(true);
        let (manager, _, _) = manager(&device);

        manager
            .dispatch(read_intent(1, DataPoint::HRegister, "10ms"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.reads(), 0);

        let stopped = tokio::time::timeout(Duration::from_secs(2), manager.shutdown()).await;
        assert!(stopped.is_ok(), "shutdown blocked on a stalled read");
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_read() {
        let device = MockDevice::new();
        device.stall_reads(true);
        let (manager, _, _) = manager(&device);

        manager
            .dispatch(read_intent(2, DataPoint::HRegister, "10ms"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.dispatch(stop_intent(2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_parent_token_cancels_polls() {
        let device = MockDevice::new();
        let factory = Arc::new(MockFactory::new(device.clone()));
        let publisher = Arc::new(RecordingPublisher::new());
        let parent = CancellationToken::new();
        let manager = SessionManager::with_shutdown(factory, publisher, &parent);

        manager
            .dispatch(read_intent(1, DataPoint::Coil, "10ms"))
            .await
            .unwrap();
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(device.open_connections(), 0);
    }
}
