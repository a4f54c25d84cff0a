//! [`SafetyKernel`] – the four safety policies behind one handle.
//!
//! The message handler asks the kernel one question before any motion
//! reaches a robot: [`authorize_motion`][SafetyKernel::authorize_motion].
//! It enforces, in order:
//!
//! 1. **Emergency stop**: a latched robot refuses all motion regardless of
//!    who holds its lock.
//! 2. **Operation lock**: the requesting user must hold the robot's lease;
//!    a free (or expired) lease is acquired on the user's behalf.
//!
//! Velocity clamping and watchdog bookkeeping are separate steps of the
//! pipeline and are reachable through the public fields.
//!
//! Each policy owns its own map and lock, so no call here ever holds two of
//! them at once.

use std::sync::Arc;
use std::time::Duration;

use robogate_hal::AdapterRegistry;
use robogate_types::{GateError, LockInfo};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::estop::EmergencyStopManager;
use crate::operation_lock::{OperationLock, SWEEP_INTERVAL};
use crate::velocity_limiter::VelocityLimiter;
use crate::watchdog::{CHECK_INTERVAL, CommandWatchdog};

/// Limits and timings for the safety policies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyConfig {
    pub max_linear_velocity: f64,
    pub max_angular_velocity: f64,
    pub lock_lease: Duration,
    pub command_timeout: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_linear_velocity: 1.0,
            max_angular_velocity: 1.5,
            lock_lease: Duration::from_secs(300),
            command_timeout: Duration::from_millis(1000),
        }
    }
}

/// Result of a successful [`SafetyKernel::authorize_motion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotionGrant {
    /// The user already held the lease.
    AlreadyHeld,
    /// The lease was free and has just been acquired for the user.
    Acquired(LockInfo),
}

/// Owns the emergency-stop latch, velocity limiter, operation lock and
/// command watchdog.
pub struct SafetyKernel {
    pub estop: EmergencyStopManager,
    pub limiter: VelocityLimiter,
    pub locks: OperationLock,
    pub watchdog: CommandWatchdog,
}

impl SafetyKernel {
    pub fn new(registry: Arc<AdapterRegistry>, config: SafetyConfig) -> Self {
        Self {
            estop: EmergencyStopManager::new(Arc::clone(&registry)),
            limiter: VelocityLimiter::new(config.max_linear_velocity, config.max_angular_velocity),
            locks: OperationLock::new(config.lock_lease),
            watchdog: CommandWatchdog::new(registry, config.command_timeout),
        }
    }

    /// Gate a motion request from `user_id` for `robot_id`.
    ///
    /// # Errors
    ///
    /// - [`GateError::MissingRobotId`] – empty robot ID.
    /// - [`GateError::EmergencyStopActive`] – the robot is latched.
    /// - [`GateError::LockHeld`] – another user holds a live lease.
    pub async fn authorize_motion(
        &self,
        robot_id: &str,
        user_id: &str,
    ) -> Result<MotionGrant, GateError> {
        if robot_id.is_empty() {
            return Err(GateError::MissingRobotId);
        }
        if self.estop.is_active(robot_id).await {
            return Err(GateError::EmergencyStopActive(robot_id.to_string()));
        }
        if self.locks.is_held_by(robot_id, user_id).await {
            return Ok(MotionGrant::AlreadyHeld);
        }
        self.locks
            .acquire(robot_id, user_id)
            .await
            .map(MotionGrant::Acquired)
    }

    /// Start the watchdog loop and the lock-expiry sweeper.
    ///
    /// Both tasks exit when `cancel` fires.  `on_lock_expired` runs for each
    /// lease removed by the sweeper.
    pub fn spawn_background<F>(self: &Arc<Self>, cancel: &CancellationToken, on_lock_expired: F) -> Vec<JoinHandle<()>>
    where
        F: Fn(&LockInfo) + Send + Sync + 'static,
    {
        let watchdog = {
            let kernel = Arc::clone(self);
            let cancel = cancel.child_token();
            tokio::spawn(async move { kernel.watchdog.run(CHECK_INTERVAL, cancel).await })
        };
        let sweeper = {
            let kernel = Arc::clone(self);
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                kernel
                    .locks
                    .run_sweeper(SWEEP_INTERVAL, cancel, on_lock_expired)
                    .await
            })
        };
        vec![watchdog, sweeper]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubAdapter, registry_with};

    async fn kernel() -> SafetyKernel {
        let registry = registry_with(&[("robot-1", Arc::new(StubAdapter::default()))]).await;
        SafetyKernel::new(registry, SafetyConfig::default())
    }

    #[tokio::test]
    async fn first_motion_acquires_lock() {
        let k = kernel().await;
        let grant = k.authorize_motion("robot-1", "alice").await.unwrap();
        assert!(matches!(grant, MotionGrant::Acquired(ref l) if l.user_id == "alice"));
        assert_eq!(
            k.authorize_motion("robot-1", "alice").await.unwrap(),
            MotionGrant::AlreadyHeld
        );
    }

    #[tokio::test]
    async fn second_user_is_refused() {
        let k = kernel().await;
        k.authorize_motion("robot-1", "alice").await.unwrap();
        let err = k.authorize_motion("robot-1", "bob").await.unwrap_err();
        assert!(matches!(err, GateError::LockHeld { holder, .. } if holder == "alice"));
    }

    #[tokio::test]
    async fn estop_overrides_lock_ownership() {
        let k = kernel().await;
        k.authorize_motion("robot-1", "alice").await.unwrap();
        k.estop.activate("robot-1").await.unwrap();

        let err = k.authorize_motion("robot-1", "alice").await.unwrap_err();
        assert!(matches!(err, GateError::EmergencyStopActive(_)));

        k.estop.release("robot-1").await;
        assert!(k.authorize_motion("robot-1", "alice").await.is_ok());
    }

    #[tokio::test]
    async fn estop_blocks_without_acquiring_lock() {
        let k = kernel().await;
        k.estop.activate("robot-1").await.unwrap();
        assert!(k.authorize_motion("robot-1", "bob").await.is_err());
        assert!(k.locks.holder("robot-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_stop_on_cancel() {
        let k = Arc::new(kernel().await);
        let cancel = CancellationToken::new();
        let handles = k.spawn_background(&cancel, |_| {});
        assert_eq!(handles.len(), 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }
    }
}
