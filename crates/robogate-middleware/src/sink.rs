//! Persistence sink: the best-effort side channel for telemetry and commands.
//!
//! The gateway never waits on persistence in the command path.  Callers
//! spawn the publish and only log failures; a sink outage must not delay or
//! fail a motion command.
//!
//! - [`NullSink`] – discards everything (no persistence configured).
//! - [`HttpSink`] – POSTs JSON to `<base>/sensor-data` and `<base>/commands`.

use std::time::Duration;

use async_trait::async_trait;
use robogate_types::{Command, GateError, SensorData};
use tracing::trace;

/// Default per-request timeout for [`HttpSink`].
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(2);

/// Destination for sensor samples and forwarded commands.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn publish_sensor_data(&self, data: &SensorData) -> Result<(), GateError>;

    async fn publish_command(&self, command: &Command) -> Result<(), GateError>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// Sink used when no persistence service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn publish_sensor_data(&self, _data: &SensorData) -> Result<(), GateError> {
        Ok(())
    }

    async fn publish_command(&self, _command: &Command) -> Result<(), GateError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// JSON-over-HTTP sink.
pub struct HttpSink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSink {
    /// Create a sink posting under `base_url` (trailing `/` ignored).
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Sink`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Sink(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: serde::Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), GateError> {
        let url = format!("{}/{path}", self.base_url);
        self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| GateError::Sink(format!("POST {url}: {e}")))?;
        trace!(url = %url, "published to sink");
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for HttpSink {
    async fn publish_sensor_data(&self, data: &SensorData) -> Result<(), GateError> {
        self.post("sensor-data", data).await
    }

    async fn publish_command(&self, command: &Command) -> Result<(), GateError> {
        self.post("commands", command).await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
