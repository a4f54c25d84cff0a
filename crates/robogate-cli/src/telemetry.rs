//! Log output and span export for the gateway binary.
//!
//! Everything here is driven by [`Config`]: `log_level` seeds the filter
//! (`RUST_LOG` still wins when set), `log_format` picks compact or JSON
//! lines, and `otlp_endpoint` turns on OTLP/HTTP span export.  Exported
//! spans carry the gateway's bind address and configured robot count as
//! resource attributes so a collector can tell gateways apart.
//!
//! ```rust,no_run
//! let settings = telemetry::Settings::from_config(&cfg);
//! // Hold the guard for the entire lifetime of the process.
//! let _guard = telemetry::init(&settings);
//! ```

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LogFormat};

/// `service.name` reported to the collector and the tracer scope.
pub const SERVICE_NAME: &str = "robogate";

/// The slice of [`Config`] that shapes log output and span export.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub level: String,
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
    /// `host:port` the gateway is configured to bind.
    pub listen_addr: String,
    pub sim_robots: usize,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            level: cfg.log_level.clone(),
            format: cfg.log_format,
            otlp_endpoint: cfg.otlp_endpoint.clone(),
            listen_addr: format!("{}:{}", cfg.host, cfg.port),
            sim_robots: cfg.sim_robots.len(),
        }
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(SERVICE_NAME)
            .with_attributes([
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new("robogate.listen_addr", self.listen_addr.clone()),
                KeyValue::new("robogate.sim_robots", self.sim_robots as i64),
            ])
            .build()
    }

    /// Build the span pipeline, or `None` when no collector is configured
    /// or the exporter cannot be created.
    fn provider(&self) -> Option<SdkTracerProvider> {
        let endpoint = self.otlp_endpoint.as_deref()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| eprintln!("[robogate] OTLP exporter init failed: {e}"))
            .ok()?;
        Some(
            SdkTracerProvider::builder()
                .with_resource(self.resource())
                // Export synchronously; the batch exporter's worker would
                // outlive the runtime on shutdown.
                .with_simple_exporter(exporter)
                .build(),
        )
    }
}

/// Install the global subscriber.  Call once, before anything logs.
pub fn init(settings: &Settings) -> TracerProviderGuard {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let provider = settings.provider();
    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(SERVICE_NAME)));
    let fmt = match settings.format {
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel)
        .with(fmt)
        .init();

    TracerProviderGuard(provider)
}

/// Shuts the span pipeline down on drop, flushing pending spans.  Hold it in
/// `main` for the whole run.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[robogate] OpenTelemetry provider shutdown error: {e}");
            }
        }
    }
}
