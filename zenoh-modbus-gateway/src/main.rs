//! Zenoh gateway for Modbus devices.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use modgate_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
use zenoh_modbus_gateway::bus::{ZenohBusPublisher, run_subscriber};
use zenoh_modbus_gateway::config::GatewayConfig;
use zenoh_modbus_gateway::factory::ModbusSessionFactory;
use zenoh_modbus_gateway::http::HttpServer;
use zenoh_modbus_gateway::manager::SessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("modgate.json5");

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let settings = config.gateway.clone();
    let instance_id = settings.resolve_instance_id();

    let mut runner = BridgeRunner::new_with_args("modbus", config, Some(&args))
        .await?
        .with_status_publishing(Some(instance_id.clone()));

    info!(instance_id = %instance_id, root = %settings.topic_root, "Gateway configured");

    let shutdown = runner.shutdown_token();
    let manager = Arc::new(SessionManager::with_shutdown(
        Arc::new(ModbusSessionFactory),
        Arc::new(ZenohBusPublisher::new(runner.publisher())),
        &shutdown,
    ));

    if settings.subscribe {
        let session = runner.session().clone();
        runner.spawn_with_error(
            "bus-subscriber".to_string(),
            run_subscriber(
                session,
                manager.clone(),
                settings.topic_root.clone(),
                shutdown.clone(),
            ),
        );
    }

    if let Some(http) = &settings.http {
        let server = HttpServer::new(
            manager.clone(),
            http.listen_addr()?,
            settings.topic_root.clone(),
            instance_id.clone(),
        );
        runner.spawn_with_error("http".to_string(), server.run(shutdown.clone()));
    }

    runner.on_shutdown(move || async move {
        manager.shutdown().await;
    });

    runner
        .run_with_metadata(Some(json!({
            "topic_root": settings.topic_root,
            "subscribe": settings.subscribe,
            "http": settings.http.as_ref().map(|h| h.listen.clone()),
        })))
        .await?;

    Ok(())
}
