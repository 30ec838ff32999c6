//! Gateway against a live Modbus TCP server on a loopback port.

use std::collections::HashMap;
use std::future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};

use zenoh_modbus_gateway::mock::RecordingPublisher;
use zenoh_modbus_gateway::topic::{Channel, OperationIntent, StopIntent};
use zenoh_modbus_gateway::{
    DataPoint, Dispatched, GatewayError, ModbusSessionFactory, ProtocolKind, RegisterRequest,
    RoutedIntent, SessionFactory, SessionManager, WriteValue,
};

/// Registers at or above this address answer "Illegal data address".
const ADDRESS_LIMIT: u16 = 1000;

#[derive(Clone, Default)]
struct TestDevice {
    holding: Arc<Mutex<HashMap<u16, u16>>>,
    coils: Arc<Mutex<HashMap<u16, bool>>>,
}

impl TestDevice {
    fn check(address: u16, count: u16) -> Result<(), ExceptionCode> {
        if address as u32 + count as u32 > ADDRESS_LIMIT as u32 {
            Err(ExceptionCode::IllegalDataAddress)
        } else {
            Ok(())
        }
    }

    fn handle(&self, req: Request<'static>) -> Result<Response, ExceptionCode> {
        match req {
            Request::ReadHoldingRegisters(address, count) => {
                Self::check(address, count)?;
                let holding = self.holding.lock();
                Ok(Response::ReadHoldingRegisters(
                    (0..count)
                        .map(|i| holding.get(&(address + i)).copied().unwrap_or(0))
                        .collect(),
                ))
            }
            Request::WriteSingleRegister(address, value) => {
                Self::check(address, 1)?;
                self.holding.lock().insert(address, value);
                Ok(Response::WriteSingleRegister(address, value))
            }
            Request::WriteMultipleRegisters(address, values) => {
                Self::check(address, values.len() as u16)?;
                let mut holding = self.holding.lock();
                for (i, value) in values.iter().enumerate() {
                    holding.insert(address + i as u16, *value);
                }
                Ok(Response::WriteMultipleRegisters(address, values.len() as u16))
            }
            Request::ReadCoils(address, count) => {
                Self::check(address, count)?;
                let coils = self.coils.lock();
                Ok(Response::ReadCoils(
                    (0..count)
                        .map(|i| coils.get(&(address + i)).copied().unwrap_or(false))
                        .collect(),
                ))
            }
            Request::WriteSingleCoil(address, on) => {
                Self::check(address, 1)?;
                self.coils.lock().insert(address, on);
                Ok(Response::WriteSingleCoil(address, on))
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

impl tokio_modbus::server::Service for TestDevice {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(self.handle(req))
    }
}

async fn start_server(device: TestDevice) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(listener);

    tokio::spawn(async move {
        let on_connected = move |stream, socket_addr| {
            let device = device.clone();
            async move {
                accept_tcp_connection(stream, socket_addr, move |_| Ok(Some(device.clone())))
            }
        };
        let on_process_error = |err| {
            eprintln!("server error: {}", err);
        };
        let _ = server.serve(&on_connected, on_process_error).await;
    });

    addr
}

fn tcp_config(addr: SocketAddr) -> serde_json::Value {
    json!({ "address": addr.to_string(), "timeout": "2s", "sampling_frequency": "20ms" })
}

#[tokio::test]
async fn test_read_holding_register_bytes() {
    let device = TestDevice::default();
    device.holding.lock().insert(100, 0x1234);
    let addr = start_server(device).await;

    let (mut session, interval) = ModbusSessionFactory
        .build(ProtocolKind::Tcp, &tcp_config(addr))
        .await
        .unwrap();
    assert_eq!(interval, Duration::from_millis(20));

    let bytes = session
        .read(DataPoint::HRegister, &RegisterRequest::read(100, 1))
        .await
        .unwrap();
    assert_eq!(bytes, vec![0x12, 0x34]);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_writes_reach_device() {
    let device = TestDevice::default();
    let addr = start_server(device.clone()).await;

    let (mut session, _) = ModbusSessionFactory
        .build(ProtocolKind::Tcp, &tcp_config(addr))
        .await
        .unwrap();

    let single = RegisterRequest {
        address: 3,
        quantity: 1,
        value: Some(WriteValue::Single(1)),
    };
    assert_eq!(
        session.write(DataPoint::Register, &single).await.unwrap(),
        vec![0x00, 0x01]
    );

    let multiple = RegisterRequest {
        address: 10,
        quantity: 2,
        value: Some(WriteValue::Multiple(vec![0x00, 0x07, 0x01, 0x00])),
    };
    assert_eq!(
        session.write(DataPoint::Register, &multiple).await.unwrap(),
        vec![0x00, 0x02]
    );

    let coil = RegisterRequest {
        address: 5,
        quantity: 1,
        value: Some(WriteValue::Single(0xFF00)),
    };
    assert_eq!(
        session.write(DataPoint::Coil, &coil).await.unwrap(),
        vec![0xFF, 0x00]
    );
    assert_eq!(
        session
            .read(DataPoint::Coil, &RegisterRequest::read(4, 2))
            .await
            .unwrap(),
        vec![0b10]
    );

    session.close().await.unwrap();

    let holding = device.holding.lock();
    assert_eq!(holding.get(&3), Some(&1));
    assert_eq!(holding.get(&10), Some(&7));
    assert_eq!(holding.get(&11), Some(&0x0100));
    assert_eq!(device.coils.lock().get(&5), Some(&true));
}

#[tokio::test]
async fn test_exception_keeps_connection_usable() {
    let device = TestDevice::default();
    device.holding.lock().insert(1, 42);
    let addr = start_server(device).await;

    let (mut session, _) = ModbusSessionFactory
        .build(ProtocolKind::Tcp, &tcp_config(addr))
        .await
        .unwrap();

    let err = session
        .read(DataPoint::HRegister, &RegisterRequest::read(ADDRESS_LIMIT, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ProtocolException(_)), "{:?}", err);

    let bytes = session
        .read(DataPoint::HRegister, &RegisterRequest::read(1, 1))
        .await
        .unwrap();
    assert_eq!(bytes, vec![0x00, 42]);

    session.close().await.unwrap();
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = ModbusSessionFactory
        .build(ProtocolKind::Tcp, &tcp_config(addr))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Connect(_)), "{:?}", err);
}

#[tokio::test]
async fn test_manager_polls_live_device() {
    let device = TestDevice::default();
    device.holding.lock().insert(100, 7);
    let addr = start_server(device.clone()).await;

    let publisher = Arc::new(RecordingPublisher::new());
    let manager = SessionManager::new(Arc::new(ModbusSessionFactory), publisher.clone());
    let channel = Channel::new("channels", Some("1".to_string()));

    let outcome = manager
        .dispatch(RoutedIntent::Read(OperationIntent {
            channel: channel.clone(),
            protocol: ProtocolKind::Tcp,
            data_point: DataPoint::HRegister,
            request: RegisterRequest::read(100, 1),
            config: tcp_config(addr),
        }))
        .await
        .unwrap();
    assert!(matches!(outcome, Dispatched::PollStarted { address: 100, .. }));

    let topic = "channels.1.modbus.response.100";
    assert!(publisher.wait_for(topic, 1, Duration::from_secs(3)).await);
    assert_eq!(publisher.published_on(topic)[0], vec![0x00, 0x07]);

    device.holding.lock().insert(100, 8);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !publisher.published_on(topic).contains(&vec![0x00, 0x08]) {
        assert!(tokio::time::Instant::now() < deadline, "updated value never published");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let outcome = manager
        .dispatch(RoutedIntent::Stop(StopIntent {
            channel,
            address: 100,
        }))
        .await
        .unwrap();
    assert_eq!(outcome, Dispatched::Stopped { address: 100 });

    manager.shutdown().await;
}
