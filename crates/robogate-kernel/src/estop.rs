//! [`EmergencyStopManager`] – per-robot emergency-stop latch.
//!
//! Each robot is either *inactive* or *active*.  [`activate`][EmergencyStopManager::activate]
//! latches the state first and only then asks the adapter to halt, so motion
//! commands are refused even while the stop primitive is still in flight or
//! when it fails.  The latch never expires; only
//! [`release`][EmergencyStopManager::release] clears it.

use std::collections::HashSet;
use std::sync::Arc;

use robogate_hal::AdapterRegistry;
use robogate_types::GateError;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

/// Outcome of [`EmergencyStopManager::activate_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstopTally {
    pub stopped: usize,
    pub failed: usize,
    /// Robots whose stop primitive returned an error.
    pub failed_robots: Vec<String>,
}

/// Emergency-stop latch keyed by robot ID.
pub struct EmergencyStopManager {
    active: RwLock<HashSet<String>>,
    registry: Arc<AdapterRegistry>,
}

impl EmergencyStopManager {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            active: RwLock::new(HashSet::new()),
            registry,
        }
    }

    /// Latch the stop for `robot_id` and invoke the adapter's stop primitive.
    ///
    /// The latch is set even when the robot is unknown or the adapter call
    /// fails; the error is still returned so the caller can report it.
    ///
    /// # Errors
    ///
    /// - [`GateError::RobotNotFound`] – no adapter registered for `robot_id`.
    /// - Whatever [`emergency_stop`][robogate_hal::RobotAdapter::emergency_stop] returns.
    #[instrument(skip(self))]
    pub async fn activate(&self, robot_id: &str) -> Result<(), GateError> {
        if robot_id.is_empty() {
            return Err(GateError::MissingRobotId);
        }
        self.active.write().await.insert(robot_id.to_string());
        warn!(robot_id, "emergency stop activated");

        let adapter = self
            .registry
            .get(robot_id)
            .await
            .ok_or_else(|| GateError::RobotNotFound(robot_id.to_string()))?;
        adapter.emergency_stop().await.inspect_err(|e| {
            error!(robot_id, error = %e, "adapter emergency stop failed");
        })
    }

    /// Latch and stop every registered robot.
    #[instrument(skip(self))]
    pub async fn activate_all(&self) -> EstopTally {
        let adapters = self.registry.get_all_active().await;
        {
            let mut active = self.active.write().await;
            for (robot_id, _) in &adapters {
                active.insert(robot_id.clone());
            }
        }

        let mut tally = EstopTally::default();
        for (robot_id, adapter) in adapters {
            match adapter.emergency_stop().await {
                Ok(()) => tally.stopped += 1,
                Err(e) => {
                    error!(robot_id = %robot_id, error = %e, "adapter emergency stop failed");
                    tally.failed += 1;
                    tally.failed_robots.push(robot_id);
                }
            }
        }
        warn!(stopped = tally.stopped, failed = tally.failed, "emergency stop activated for all robots");
        tally
    }

    /// Clear the latch for `robot_id`.  Returns whether it was active.
    pub async fn release(&self, robot_id: &str) -> bool {
        let was_active = self.active.write().await.remove(robot_id);
        if was_active {
            info!(robot_id, "emergency stop released");
        }
        was_active
    }

    /// Clear every latch.  Returns the released robot IDs, sorted.
    pub async fn release_all(&self) -> Vec<String> {
        let mut released: Vec<String> = self.active.write().await.drain().collect();
        released.sort();
        if !released.is_empty() {
            info!(count = released.len(), "emergency stop released for all robots");
        }
        released
    }

    pub async fn is_active(&self, robot_id: &str) -> bool {
        self.active.read().await.contains(robot_id)
    }

    /// Robots currently latched, sorted.
    pub async fn active_robots(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.iter().cloned().collect();
        ids.sort();
        ids
    }
}
