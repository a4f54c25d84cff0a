//! The Robot Adapter contract.
//!
//! The gateway never speaks a robot's native protocol.  It hands a normalised
//! [`Command`] to a [`RobotAdapter`] and drains the adapter's sensor stream.
//! Adapters translate in both directions.
//!
//! # Overview
//!
//! - [`RobotAdapter`] – the trait every robot family must implement.
//! - [`AdapterConfig`] – per-robot settings handed to the factory and to
//!   [`RobotAdapter::connect`].
//! - [`SimulatedAdapter`][crate::sim::SimulatedAdapter] – drives a fabricated
//!   robot for development and CI.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use robogate_types::{Capabilities, Command, GateError, SensorData};
use tokio_util::sync::CancellationToken;

/// Settings for one robot instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterConfig {
    pub robot_id: String,
    /// Name of the factory registered with the
    /// [`AdapterRegistry`][crate::registry::AdapterRegistry].
    pub adapter_type: String,
    /// Network address of the robot, when the adapter needs one.
    pub endpoint: Option<String>,
    /// Adapter-specific options.
    pub options: HashMap<String, String>,
}

impl AdapterConfig {
    pub fn new(robot_id: impl Into<String>, adapter_type: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            adapter_type: adapter_type.into(),
            ..Self::default()
        }
    }

    /// Builder: set the robot endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Every robot family must implement this trait.
///
/// # Contract
///
/// * `connect` – start talking to the robot.  Background work the adapter
///   spawns must stop when either `shutdown` is cancelled or
///   [`disconnect`][Self::disconnect] is called; disconnecting one adapter
///   never cancels `shutdown` itself.
///
/// * `send_command` – apply a [`Command`] that has already passed the safety
///   pipeline.  May be slow; callers never hold a lock across it.
///
/// * `sensor_stream` – the adapter's telemetry.  The stream is handed out
///   once; later calls return an empty stream.
///
/// * `emergency_stop` – halt motion immediately.  Must succeed whenever the
///   robot is reachable, independent of any other adapter state.
#[async_trait]
pub trait RobotAdapter: Send + Sync {
    /// Connect to the robot and start its sensor stream.
    async fn connect(
        &self,
        shutdown: &CancellationToken,
        config: &AdapterConfig,
    ) -> Result<(), GateError>;

    /// Stop background work and release the robot.
    async fn disconnect(&self) -> Result<(), GateError>;

    fn is_connected(&self) -> bool;

    /// Forward a safety-checked command to the robot.
    async fn send_command(&self, command: Command) -> Result<(), GateError>;

    /// Take the robot's sensor stream.
    fn sensor_stream(&self) -> BoxStream<'static, SensorData>;

    fn capabilities(&self) -> Capabilities;

    /// Halt all motion.
    async fn emergency_stop(&self) -> Result<(), GateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_config_builder() {
        let cfg = AdapterConfig::new("robot-1", "simulated").with_endpoint("10.0.0.5:9000");
        assert_eq!(cfg.robot_id, "robot-1");
        assert_eq!(cfg.adapter_type, "simulated");
        assert_eq!(cfg.endpoint.as_deref(), Some("10.0.0.5:9000"));
        assert!(cfg.options.is_empty());
    }
}
