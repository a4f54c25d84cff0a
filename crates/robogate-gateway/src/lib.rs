//! `robogate-gateway` – The Client-Facing Gateway
//!
//! Boots a single HTTP + WebSocket listener (default port `8080`) that:
//!
//! 1. **Accepts** browser clients over WebSocket, authenticates them and runs
//!    every instruction through the [`MessageHandler`] safety pipeline.
//!
//! 2. **Streams** each robot's telemetry to the clients subscribed to it,
//!    one [forwarding task][forwarder::spawn_forwarder] per robot.
//!
//! 3. **Broadcasts** safety events: emergency stops, watchdog trips and
//!    operation-lock expiry.
//!
//! 4. **Answers** `GET /health` and `GET /ready`, rate-limited per peer.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use robogate_gateway::{DevAuthenticator, Gateway, GatewayConfig};
//! use robogate_hal::{AdapterConfig, AdapterRegistry, SIMULATED_ADAPTER_TYPE, SimulatedAdapter};
//! use robogate_middleware::NullSink;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), robogate_types::GateError> {
//!     let registry = Arc::new(
//!         AdapterRegistry::new().with_factory(SIMULATED_ADAPTER_TYPE, SimulatedAdapter::factory),
//!     );
//!     let gateway = Gateway::start(
//!         GatewayConfig::default(),
//!         registry,
//!         Arc::new(NullSink),
//!         Arc::new(DevAuthenticator),
//!     )
//!     .await;
//!     gateway.add_robot(AdapterConfig::new("sim-1", SIMULATED_ADAPTER_TYPE)).await?;
//!     gateway.run().await
//! }
//! ```

pub mod auth;
pub mod forwarder;
pub mod handler;
pub mod rate_limit;
pub mod server;

pub use auth::{Authenticator, DevAuthenticator, StaticTokenAuthenticator};
pub use handler::{ClientSession, MessageHandler};
pub use rate_limit::HttpRateLimiter;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use robogate_hal::{AdapterConfig, AdapterRegistry};
use robogate_kernel::{EstopTally, SafetyConfig, SafetyKernel};
use robogate_middleware::{Hub, PersistenceSink};
use robogate_types::{GateError, LockInfo, Message, MessageType};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default port the gateway listens on.
pub const DEFAULT_PORT: u16 = 8080;

/// How often idle rate-limit buckets are dropped.
const RATE_LIMIT_SHRINK_INTERVAL: Duration = Duration::from_secs(60);

/// Everything the gateway needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub safety: SafetyConfig,
    pub rate_limit_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            safety: SafetyConfig::default(),
            rate_limit_per_minute: 600,
        }
    }
}

/// The assembled gateway: registry, safety kernel, hub, handler and the
/// background tasks tying them together.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<AdapterRegistry>,
    safety: Arc<SafetyKernel>,
    hub: Hub,
    handler: Arc<MessageHandler>,
    sink: Arc<dyn PersistenceSink>,
    rate_limiter: HttpRateLimiter,
    started: Instant,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Telemetry forwarder per robot, stopped by `remove_robot`.
    forwarders: Mutex<HashMap<String, Forwarder>>,
}

struct Forwarder {
    cancel: CancellationToken,
    task: JoinHandle<u64>,
}

impl Gateway {
    /// Wire the components together and start the hub, the watchdog, the
    /// lock sweeper and the rate-limit janitor.
    ///
    /// Robots are added afterwards with [`add_robot`][Self::add_robot].
    pub async fn start(
        config: GatewayConfig,
        registry: Arc<AdapterRegistry>,
        sink: Arc<dyn PersistenceSink>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let safety = Arc::new(SafetyKernel::new(Arc::clone(&registry), config.safety));
        let (hub, runner) = Hub::new();
        let handler = Arc::new(MessageHandler::new(
            Arc::clone(&registry),
            Arc::clone(&safety),
            hub.clone(),
            Arc::clone(&sink),
            authenticator,
        ));

        let mut tasks = vec![tokio::spawn(runner.run(cancel.child_token()))];

        {
            let hub = hub.clone();
            safety
                .watchdog
                .set_on_trip(Arc::new(move |robot_id: &str| {
                    hub.broadcast_to_robot(
                        robot_id,
                        Message::new(MessageType::SafetyAlert)
                            .for_robot(robot_id)
                            .with_field("alert", "watchdog_timeout"),
                    );
                }))
                .await;
        }
        {
            let hub = hub.clone();
            tasks.extend(safety.spawn_background(&cancel, move |lease: &LockInfo| {
                hub.broadcast_to_robot(&lease.robot_id, lock_expired(lease));
            }));
        }

        let gateway = Arc::new(Self {
            rate_limiter: HttpRateLimiter::per_minute(config.rate_limit_per_minute),
            config,
            registry,
            safety,
            hub,
            handler,
            sink,
            started: Instant::now(),
            cancel,
            tasks: Mutex::new(tasks),
            forwarders: Mutex::new(HashMap::new()),
        });

        let janitor = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(RATE_LIMIT_SHRINK_INTERVAL);
                loop {
                    tokio::select! {
                        _ = gateway.cancel.cancelled() => break,
                        _ = interval.tick() => gateway.rate_limiter.shrink(),
                    }
                }
            })
        };
        gateway.track(janitor);

        info!(
            sink = gateway.sink.name(),
            rate_limit_per_minute = gateway.rate_limiter.limit_per_minute(),
            "gateway started"
        );
        gateway
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Create, connect and start forwarding telemetry for one robot.
    ///
    /// # Errors
    ///
    /// Registry errors ([`GateError::UnknownAdapterType`],
    /// [`GateError::RobotAlreadyRegistered`]) or the adapter's connect
    /// failure.  A robot that fails to connect is removed again.
    pub async fn add_robot(&self, config: AdapterConfig) -> Result<(), GateError> {
        let adapter = self.registry.create(&config).await?;
        if let Err(e) = adapter.connect(&self.cancel, &config).await {
            self.registry.remove(&config.robot_id).await;
            return Err(e);
        }
        let cancel = self.cancel.child_token();
        let task = forwarder::spawn_forwarder(
            config.robot_id.clone(),
            adapter,
            self.hub.clone(),
            Arc::clone(&self.sink),
            cancel.clone(),
        );
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.insert(config.robot_id.clone(), Forwarder { cancel, task });
        }
        info!(robot_id = %config.robot_id, adapter_type = %config.adapter_type, "robot online");
        Ok(())
    }

    /// Disconnect and forget a robot, stopping its telemetry forwarder.
    /// Returns `false` when it was unknown.
    pub async fn remove_robot(&self, robot_id: &str) -> bool {
        if self.registry.remove(robot_id).await.is_none() {
            return false;
        }
        self.safety.watchdog.remove(robot_id).await;
        let forwarder = self
            .forwarders
            .lock()
            .ok()
            .and_then(|mut forwarders| forwarders.remove(robot_id));
        if let Some(Forwarder { cancel, task }) = forwarder {
            cancel.cancel();
            let _ = task.await;
        }
        info!(robot_id, "robot removed");
        true
    }

    /// Bind the configured address and serve until [`shutdown`][Self::shutdown].
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Io`] when the address cannot be bound.
    pub async fn run(self: &Arc<Self>) -> Result<(), GateError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), GateError> {
        server::serve(Arc::clone(self), listener).await
    }

    /// Stop every robot, then tear everything down: listener, client
    /// sessions, background tasks and adapters.
    pub async fn shutdown(&self) -> EstopTally {
        info!("gateway shutting down");
        let tally = self.safety.estop.activate_all().await;
        if !tally.failed_robots.is_empty() {
            warn!(failed = ?tally.failed_robots, "emergency stop failed on shutdown");
        }
        self.cancel.cancel();
        self.registry.disconnect_all().await;

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        let forwarders = match self.forwarders.lock() {
            Ok(mut forwarders) => std::mem::take(&mut *forwarders),
            Err(_) => HashMap::new(),
        };
        for (_, forwarder) in forwarders {
            let _ = forwarder.task.await;
        }
        info!(stopped = tally.stopped, failed = tally.failed, "gateway stopped");
        tally
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn safety(&self) -> &Arc<SafetyKernel> {
        &self.safety
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn handler(&self) -> Arc<MessageHandler> {
        Arc::clone(&self.handler)
    }

    pub fn rate_limiter(&self) -> &HttpRateLimiter {
        &self.rate_limiter
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Token cancelled by [`shutdown`][Self::shutdown].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

fn lock_expired(lease: &LockInfo) -> Message {
    Message::new(MessageType::LockStatus)
        .for_robot(lease.robot_id.clone())
        .with_field("locked", false)
        .with_field("reason", "expired")
        .with_field("previous_holder", lease.user_id.clone())
}
