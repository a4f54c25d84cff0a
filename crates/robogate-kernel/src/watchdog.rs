//! [`CommandWatchdog`] – stops robots whose operator went silent.
//!
//! Every forwarded motion command calls [`CommandWatchdog::record`] for its
//! robot.  A supervisor loop ([`CommandWatchdog::run`]) calls
//! [`CommandWatchdog::check`] every [`CHECK_INTERVAL`]; any robot whose last
//! command is older than the silence timeout is *tripped*:
//!
//! 1. it is removed from monitoring (until its next recorded command),
//! 2. a zero-velocity command is sent to its adapter,
//! 3. the trip callback is invoked.
//!
//! A command recorded after step 1 cancels steps 2 and 3.  A tripped robot
//! receives at most one automatic stop per silence period.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use robogate_hal::AdapterRegistry;
use robogate_types::Command;
use tokio::sync::RwLock;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// How often [`CommandWatchdog::run`] checks for silent robots.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Invoked with the robot ID after each trip.
pub type TripCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Tracks the last command time of every monitored robot.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use robogate_hal::AdapterRegistry;
/// use robogate_kernel::watchdog::CommandWatchdog;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let wd = CommandWatchdog::new(Arc::new(AdapterRegistry::new()), Duration::from_secs(1));
/// wd.record("robot-1").await;
/// assert!(wd.is_monitored("robot-1").await);
/// # }
/// ```
pub struct CommandWatchdog {
    last_command: RwLock<HashMap<String, Instant>>,
    timeout: Duration,
    registry: Arc<AdapterRegistry>,
    on_trip: RwLock<Option<TripCallback>>,
}

impl CommandWatchdog {
    pub fn new(registry: Arc<AdapterRegistry>, timeout: Duration) -> Self {
        Self {
            last_command: RwLock::new(HashMap::new()),
            timeout,
            registry,
            on_trip: RwLock::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the callback invoked after each trip.  Replaces any previous
    /// callback.
    pub async fn set_on_trip(&self, callback: TripCallback) {
        *self.on_trip.write().await = Some(callback);
    }

    /// Record a command for `robot_id`, (re)starting its silence timer.
    pub async fn record(&self, robot_id: &str) {
        self.last_command
            .write()
            .await
            .insert(robot_id.to_string(), Instant::now());
    }

    /// Stop monitoring `robot_id`.
    pub async fn remove(&self, robot_id: &str) {
        self.last_command.write().await.remove(robot_id);
    }

    pub async fn is_monitored(&self, robot_id: &str) -> bool {
        self.last_command.read().await.contains_key(robot_id)
    }

    /// Robots currently monitored, sorted.
    pub async fn monitored(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.last_command.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Trip every robot whose silence exceeds the timeout.  Returns the
    /// tripped robot IDs, sorted.
    pub async fn check(&self) -> Vec<String> {
        let mut tripped = Vec::new();
        for robot_id in self.take_expired().await {
            if self.trip(&robot_id).await {
                tripped.push(robot_id);
            }
        }
        tripped
    }

    /// Remove and return the robots whose silence exceeds the timeout, sorted.
    async fn take_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut map = self.last_command.write().await;
        let mut expired: Vec<String> = map
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
        }
        expired.sort();
        expired
    }

    /// Stop `robot_id` unless a command was recorded for it since it expired.
    #[instrument(skip(self))]
    async fn trip(&self, robot_id: &str) -> bool {
        if self.last_command.read().await.contains_key(robot_id) {
            debug!(robot_id, "command arrived after expiry, stop skipped");
            return false;
        }
        warn!(robot_id, timeout_ms = self.timeout.as_millis() as u64, "command silence timeout, stopping robot");
        match self.registry.get(robot_id).await {
            Some(adapter) => {
                if let Err(e) = adapter.send_command(Command::zero_velocity(robot_id)).await {
                    error!(robot_id, error = %e, "watchdog stop command failed");
                }
            }
            None => debug!(robot_id, "watchdog tripped for unregistered robot"),
        }
        let callback = self.on_trip.read().await.clone();
        if let Some(callback) = callback {
            callback(robot_id);
        }
        true
    }

    /// Run [`check`][Self::check] every `interval` until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        debug!("command watchdog stopped");
    }
}
