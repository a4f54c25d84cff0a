//! Recording adapter shared by the kernel's unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use robogate_hal::{AdapterConfig, AdapterRegistry, RobotAdapter};
use robogate_types::{Capabilities, Command, GateError, SensorData};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct StubAdapter {
    pub commands: Mutex<Vec<Command>>,
    pub estops: AtomicUsize,
    pub fail_estop: AtomicBool,
}

impl StubAdapter {
    pub fn failing() -> Self {
        let stub = Self::default();
        stub.fail_estop.store(true, Ordering::SeqCst);
        stub
    }

    pub fn estop_count(&self) -> usize {
        self.estops.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl RobotAdapter for StubAdapter {
    async fn connect(&self, _: &CancellationToken, _: &AdapterConfig) -> Result<(), GateError> {
        Ok(())
    }
    async fn disconnect(&self) -> Result<(), GateError> {
        Ok(())
    }
    fn is_connected(&self) -> bool {
        true
    }
    async fn send_command(&self, command: Command) -> Result<(), GateError> {
        self.commands.lock().unwrap().push(command);
        Ok(())
    }
    fn sensor_stream(&self) -> BoxStream<'static, SensorData> {
        stream::empty().boxed()
    }
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_velocity: true,
            supports_navigation: true,
            supports_estop: true,
            sensor_topics: vec![],
            max_linear_velocity: 1.0,
            max_angular_velocity: 1.0,
        }
    }
    async fn emergency_stop(&self) -> Result<(), GateError> {
        self.estops.fetch_add(1, Ordering::SeqCst);
        if self.fail_estop.load(Ordering::SeqCst) {
            return Err(GateError::AdapterFault {
                robot_id: "stub".into(),
                details: "estop relay did not respond".into(),
            });
        }
        Ok(())
    }
}

/// Registry pre-populated with one stub per `(robot_id, stub)` pair.
pub async fn registry_with(stubs: &[(&str, Arc<StubAdapter>)]) -> Arc<AdapterRegistry> {
    let registry = Arc::new(AdapterRegistry::new());
    for (id, stub) in stubs {
        registry
            .register_instance(id, Arc::clone(stub) as Arc<dyn RobotAdapter>)
            .await
            .unwrap();
    }
    registry
}
