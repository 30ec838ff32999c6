//! Bridge runner for lifecycle management.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use modgate_common::{LoggingConfig, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::status::StatusPublisher;

/// How long spawned workers get to observe cancellation before being dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type ShutdownHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Bridge runner that manages the lifecycle of a protocol bridge.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection
/// - Task spawning, tracked until shutdown
/// - Graceful shutdown on Ctrl+C through a shared cancellation token
/// - Status publishing (optional)
///
/// # Example
///
/// ```ignore
/// use modgate_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new("mybridge", config).await?;
///
///     let shutdown = runner.shutdown_token();
///     let publisher = runner.publisher();
///     runner.spawn(async move {
///         shutdown.cancelled().await;
///         drop(publisher);
///     });
///
///     runner.run().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    name: String,
    version: String,
    config: C,
    session: Arc<zenoh::Session>,
    publisher: Publisher,
    status_publisher: Option<StatusPublisher>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    on_shutdown: Option<ShutdownHook>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    ///
    /// This will:
    /// 1. Initialize logging based on config
    /// 2. Connect to Zenoh
    /// 3. Create the publisher
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new bridge runner with CLI args for log level override.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = effective_logging(config.logging(), args);
        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?,
        );

        tracing::info!(zid = %session.zid(), "Connected to Zenoh");

        let publisher = Publisher::new(session.clone(), config.key_prefix());

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status_publisher: None,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            on_shutdown: None,
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner publishes status messages on startup and shutdown.
    pub fn with_status_publishing(mut self, instance_id: Option<String>) -> Self {
        let mut status = StatusPublisher::new(self.publisher.clone(), &self.name, &self.version);
        if let Some(id) = instance_id {
            status = status.with_instance_id(id);
        }
        self.status_publisher = Some(status);
        self
    }

    /// Register an async hook that runs once the shutdown token is cancelled,
    /// before the tracked tasks are awaited.
    pub fn on_shutdown<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_shutdown = Some(Box::new(move || Box::pin(hook())));
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Token cancelled when the bridge begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a worker task.
    ///
    /// The task is tracked and awaited (then dropped) on shutdown.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: String, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.tasks.spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %name, error = %e, "Worker failed");
            }
        });
    }

    /// Run the bridge until Ctrl+C is received.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for Ctrl+C signal
    /// 3. Cancel the shutdown token and run the shutdown hook
    /// 4. Wait for spawned tasks, up to a grace period
    /// 5. Publish "offline" status (if enabled)
    /// 6. Close the Zenoh session
    pub async fn run(self) -> Result<()> {
        self.run_with_metadata(None).await
    }

    /// Run the bridge with custom status metadata.
    pub async fn run_with_metadata(mut self, metadata: Option<serde_json::Value>) -> Result<()> {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                }
                tracing::info!(bridge = %self.name, "Received shutdown signal");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!(bridge = %self.name, "Shutdown requested");
            }
        }

        self.shutdown.cancel();

        if let Some(hook) = self.on_shutdown.take() {
            hook().await;
        }

        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tasks.len(),
                "Workers did not stop within the grace period"
            );
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

/// Logging configuration with the CLI level override applied.
fn effective_logging(config: &LoggingConfig, args: Option<&BridgeArgs>) -> LoggingConfig {
    let mut log_config = config.clone();
    if let Some(level) = args.and_then(|a| a.log_level.as_ref()) {
        log_config.level = level.clone();
    }
    log_config
}
