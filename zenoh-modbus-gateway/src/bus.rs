//! Zenoh bus adapter.
//!
//! Topics are dotted inside the gateway (`channels.1.modbus.read.tcp.coil`)
//! and slash-separated on Zenoh (`channels/1/modbus/read/tcp/coil`).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::{Sample, SampleKind};

use modgate_bridge_framework::Publisher;
use modgate_common::key_expr_to_topic;

use crate::error::{GatewayError, Result};
use crate::manager::SessionManager;
use crate::topic::route_with_root;

/// Publishes raw bytes on a dotted topic.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// [`BusPublisher`] writing to Zenoh through the bridge publisher.
#[derive(Clone, Debug)]
pub struct ZenohBusPublisher {
    publisher: Publisher,
}

impl ZenohBusPublisher {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl BusPublisher for ZenohBusPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.publisher
            .publish_topic(topic, payload)
            .await
            .map_err(|e| GatewayError::Publish(e.to_string()))
    }
}

/// Key expressions the gateway subscribes to under `root`.
pub fn subscription_keys(root: &str) -> Vec<String> {
    [
        "*/modbus/read/*/*",
        "modbus/read/*/*",
        "*/modbus/write/*/*",
        "modbus/write/*/*",
        "*/modbus/stop/*",
        "modbus/stop/*",
    ]
    .iter()
    .map(|suffix| format!("{}/{}", root, suffix))
    .collect()
}

/// Route and dispatch one inbound message. Failures are logged.
pub async fn handle_message(manager: &SessionManager, root: &str, topic: &str, payload: &[u8]) {
    let intent = match route_with_root(root, topic, payload) {
        Ok(intent) => intent,
        Err(e) => {
            warn!(%topic, error = %e, "Rejected bus message");
            return;
        }
    };

    if let Err(e) = manager.dispatch(intent).await {
        warn!(%topic, error = %e, "Bus request failed");
    }
}

/// Subscribe to the gateway key expressions and feed samples to the manager
/// until `shutdown` is cancelled.
pub async fn run_subscriber(
    session: Arc<zenoh::Session>,
    manager: Arc<SessionManager>,
    root: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut listeners = JoinSet::new();
    for key in subscription_keys(&root) {
        let subscriber = session
            .declare_subscriber(key.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to subscribe to {}: {}", key, e))?;
        debug!(%key, "Subscribed");
        listeners.spawn(listen(
            subscriber,
            manager.clone(),
            root.clone(),
            shutdown.clone(),
        ));
    }

    info!(root = %root, subscriptions = listeners.len(), "Listening for Modbus requests");

    while let Some(result) = listeners.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Subscriber task failed");
        }
    }

    info!("Bus subscriber stopped");
    Ok(())
}

async fn listen(
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
    manager: Arc<SessionManager>,
    root: String,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            sample = subscriber.recv_async() => {
                let sample = match sample {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!("Error receiving sample: {}", e);
                        break;
                    }
                };

                if sample.kind() == SampleKind::Delete {
                    trace!(key = %sample.key_expr(), "Ignoring delete sample");
                    continue;
                }

                let topic = match key_expr_to_topic(sample.key_expr().as_str()) {
                    Ok(topic) => topic,
                    Err(e) => {
                        warn!(key = %sample.key_expr(), error = %e, "Cannot map key expression to topic");
                        continue;
                    }
                };
                let payload = sample.payload().to_bytes().to_vec();

                let manager = manager.clone();
                let root = root.clone();
                tokio::spawn(async move {
                    handle_message(&manager, &root, &topic, &payload).await;
                });
            }
        }
    }

    if let Err(e) = subscriber.undeclare().await {
        debug!(error = %e, "Error undeclaring subscriber");
    }
}
