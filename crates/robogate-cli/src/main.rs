//! `robogate` – gateway process entry point.
//!
//! 1. Resolves the configuration (TOML file + `ROBOGATE_*` environment).
//! 2. Initialises tracing from the configuration, with OTLP export when a
//!    collector endpoint is set.
//! 3. Assembles the gateway: simulated robots, persistence sink and
//!    authenticator chosen from the configuration.
//! 4. Serves HTTP + WebSocket until **Ctrl-C**, then stops every robot and
//!    exits.

mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use robogate_gateway::{Authenticator, DevAuthenticator, Gateway, StaticTokenAuthenticator};
use robogate_hal::{AdapterConfig, AdapterRegistry, SIMULATED_ADAPTER_TYPE, SimulatedAdapter};
use robogate_middleware::{HttpSink, NullSink, PersistenceSink, sink::DEFAULT_SINK_TIMEOUT};
use robogate_types::GateError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let loaded = match config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("[robogate] {e}");
            return ExitCode::FAILURE;
        }
    };
    let guard = telemetry::init(&telemetry::Settings::from_config(&loaded.config));
    for warning in &loaded.warnings {
        warn!("{warning}");
    }
    match &loaded.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file, using defaults and environment"),
    }
    info!(
        format = ?loaded.config.log_format,
        otlp = guard.exporting(),
        "telemetry initialised"
    );

    match run(loaded.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: config::Config) -> Result<(), GateError> {
    let gateway_config = cfg.gateway_config()?;
    info!(config = ?cfg, "starting gateway");

    let registry = Arc::new(
        AdapterRegistry::new().with_factory(SIMULATED_ADAPTER_TYPE, SimulatedAdapter::factory),
    );
    let gateway = Gateway::start(gateway_config, registry, sink(&cfg)?, authenticator(&cfg)).await;

    for robot_id in &cfg.sim_robots {
        if let Err(e) = gateway
            .add_robot(AdapterConfig::new(robot_id.as_str(), SIMULATED_ADAPTER_TYPE))
            .await
        {
            warn!(robot_id = %robot_id, error = %e, "failed to start simulated robot");
        }
    }

    let result = tokio::select! {
        served = gateway.run() => served,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Ctrl-C received, stopping all robots"),
                Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
            }
            Ok(())
        }
    };

    let tally = gateway.shutdown().await;
    if tally.failed > 0 {
        warn!(failed = ?tally.failed_robots, "some robots did not confirm the stop");
    }
    result
}

fn sink(cfg: &config::Config) -> Result<Arc<dyn PersistenceSink>, GateError> {
    match &cfg.sink_url {
        Some(url) => Ok(Arc::new(HttpSink::new(url.as_str(), DEFAULT_SINK_TIMEOUT)?)),
        None => {
            info!("no sink configured, telemetry and commands are not persisted");
            Ok(Arc::new(NullSink))
        }
    }
}

fn authenticator(cfg: &config::Config) -> Arc<dyn Authenticator> {
    if cfg.auth_tokens.is_empty() {
        warn!("no auth tokens configured, accepting any non-empty token");
        Arc::new(DevAuthenticator)
    } else {
        Arc::new(StaticTokenAuthenticator::new(cfg.auth_tokens.clone()))
    }
}
