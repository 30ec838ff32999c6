//! Zenoh gateway for Modbus devices.
//!
//! Clients publish read, write and stop intents on the bus; the gateway
//! opens TCP or RTU sessions to the addressed devices, polls registers and
//! publishes the raw result bytes back on a response topic.
//!
//! # Topics
//!
//! ```text
//! <root>[.<channel>].modbus.read.<tcp|rtu>.<data-point>    starts a poll
//! <root>[.<channel>].modbus.write.<tcp|rtu>.<data-point>   one write
//! <root>[.<channel>].modbus.stop.<address>                 stops a poll
//! <root>[.<channel>].modbus.response.<address>             results
//! ```
//!
//! Read and write payloads are JSON envelopes:
//!
//! ```text
//! { "options": { "address": 100, "quantity": 1, "value": 1 },
//!   "config":  { "address": "10.0.0.5:502", "sampling_frequency": "500ms" } }
//! ```
//!
//! Where:
//! - `<data-point>` - `coil`, `h_register`, `i_register`, `register`, `discrete` or `fifo`
//! - `<address>` - register address, 0..=65535
//!
//! The same operations, plus sessions addressed by id, are available over
//! HTTP when `gateway.http` is configured (see [`http`]).

pub mod bus;
pub mod config;
pub mod error;
pub mod factory;
pub mod http;
pub mod manager;
pub mod mock;
pub mod options;
pub mod request;
pub mod session;
pub mod topic;
pub mod transport;

pub use bus::{BusPublisher, ZenohBusPublisher};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use factory::{ModbusSessionFactory, SessionFactory, SessionOptions};
pub use manager::{Dispatched, PollInfo, SessionManager};
pub use request::{DataPoint, ProtocolKind, RegisterRequest, WriteValue};
pub use session::{Session, WriteOp};
pub use topic::{Channel, RoutedIntent, response_topic, route, route_with_root};
pub use transport::{ModbusTransport, Transport};
