//! In-process simulated robot for development and CI without hardware.
//!
//! [`SimulatedAdapter`] implements [`RobotAdapter`] by integrating a
//! differential-drive pose from the last velocity command and fabricating
//! sensor data at fixed rates:
//!
//! | Sensor | Topic | Rate |
//! |---|---|---|
//! | Odometry | `/odom` | 20 Hz |
//! | LiDAR (360 points) | `/scan` | 10 Hz |
//! | IMU | `/imu` | 50 Hz |
//! | Battery | `/battery` | 0.2 Hz |
//!
//! Every generator is its own task sharing one mutex-protected state.  All
//! of them push into one bounded queue and drop the sample when the queue is
//! full; sensor data is resampled continuously so a lost sample is harmless.
//!
//! # Example
//!
//! ```rust,no_run
//! use robogate_hal::{AdapterConfig, RobotAdapter, SimulatedAdapter};
//! use robogate_types::Command;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let sim = SimulatedAdapter::new("sim-1");
//! let shutdown = CancellationToken::new();
//! sim.connect(&shutdown, &AdapterConfig::new("sim-1", "simulated")).await.unwrap();
//! sim.send_command(Command::velocity("sim-1", 0.5, 0.0, 0.1)).await.unwrap();
//! # }
//! ```

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use robogate_types::{Capabilities, Command, CommandType, GateError, Payload, SensorData};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::adapter::{AdapterConfig, RobotAdapter};

/// Factory name under which the simulator is registered.
pub const SIMULATED_ADAPTER_TYPE: &str = "simulated";

/// Bounded sensor queue shared by all generators.
pub const SENSOR_QUEUE_CAPACITY: usize = 100;

/// Number of beams in one synthetic LiDAR sweep.
pub const LIDAR_POINTS: usize = 360;

const MAX_LINEAR_VELOCITY: f64 = 1.5;
const MAX_ANGULAR_VELOCITY: f64 = 2.0;

// ────────────────────────────────────────────────────────────────────────────
// Shared simulation state
// ────────────────────────────────────────────────────────────────────────────

/// Pose and commanded twist of the simulated robot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimState {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub linear: f64,
    pub angular: f64,
    pub battery_percent: f64,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            linear: 0.0,
            angular: 0.0,
            battery_percent: 100.0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensor generators
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorKind {
    Odometry,
    Lidar,
    Imu,
    Battery,
}

impl SensorKind {
    const ALL: [SensorKind; 4] = [
        SensorKind::Odometry,
        SensorKind::Lidar,
        SensorKind::Imu,
        SensorKind::Battery,
    ];

    fn period(self) -> Duration {
        match self {
            SensorKind::Odometry => Duration::from_millis(50),
            SensorKind::Lidar => Duration::from_millis(100),
            SensorKind::Imu => Duration::from_millis(20),
            SensorKind::Battery => Duration::from_secs(5),
        }
    }

    fn topic(self) -> &'static str {
        match self {
            SensorKind::Odometry => "/odom",
            SensorKind::Lidar => "/scan",
            SensorKind::Imu => "/imu",
            SensorKind::Battery => "/battery",
        }
    }

    fn data_type(self) -> &'static str {
        match self {
            SensorKind::Odometry => "nav_msgs/Odometry",
            SensorKind::Lidar => "sensor_msgs/LaserScan",
            SensorKind::Imu => "sensor_msgs/Imu",
            SensorKind::Battery => "sensor_msgs/BatteryState",
        }
    }

    fn frame_id(self) -> &'static str {
        match self {
            SensorKind::Odometry => "odom",
            SensorKind::Lidar => "laser",
            SensorKind::Imu => "imu_link",
            SensorKind::Battery => "base_link",
        }
    }

    /// Advance `state` by one period and produce the sample payload.
    fn sample(self, state: &mut SimState) -> Payload {
        let dt = self.period().as_secs_f64();
        let value = match self {
            SensorKind::Odometry => {
                state.theta = normalize_angle(state.theta + state.angular * dt);
                state.x += state.linear * state.theta.cos() * dt;
                state.y += state.linear * state.theta.sin() * dt;
                json!({
                    "x": state.x,
                    "y": state.y,
                    "theta": state.theta,
                    "linear_velocity": state.linear,
                    "angular_velocity": state.angular,
                })
            }
            SensorKind::Lidar => {
                let mut rng = rand::rng();
                let increment = 2.0 * PI / LIDAR_POINTS as f64;
                let ranges: Vec<f64> = (0..LIDAR_POINTS)
                    .map(|i| {
                        let angle = -PI + i as f64 * increment;
                        let wall = 3.0 + 0.5 * (4.0 * angle + state.theta).sin();
                        (wall + rng.random_range(-0.05..0.05)).clamp(0.1, 10.0)
                    })
                    .collect();
                json!({
                    "angle_min": -PI,
                    "angle_max": PI,
                    "angle_increment": increment,
                    "range_min": 0.1,
                    "range_max": 10.0,
                    "ranges": ranges,
                })
            }
            SensorKind::Imu => {
                let mut rng = rand::rng();
                let half = state.theta / 2.0;
                json!({
                    "orientation": { "x": 0.0, "y": 0.0, "z": half.sin(), "w": half.cos() },
                    "angular_velocity": { "x": 0.0, "y": 0.0, "z": state.angular },
                    "linear_acceleration": {
                        "x": rng.random_range(-0.02..0.02),
                        "y": rng.random_range(-0.02..0.02),
                        "z": 9.81,
                    },
                })
            }
            SensorKind::Battery => {
                let drain = 0.05 + 0.1 * state.linear.abs();
                state.battery_percent = (state.battery_percent - drain).max(0.0);
                json!({
                    "percentage": state.battery_percent,
                    "voltage": 10.5 + 2.1 * state.battery_percent / 100.0,
                    "charging": false,
                })
            }
        };
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }
}

fn normalize_angle(theta: f64) -> f64 {
    let mut t = theta % (2.0 * PI);
    if t > PI {
        t -= 2.0 * PI;
    } else if t < -PI {
        t += 2.0 * PI;
    }
    t
}

async fn run_generator(
    kind: SensorKind,
    robot_id: String,
    state: Arc<Mutex<SimState>>,
    tx: mpsc::Sender<SensorData>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(kind.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let data = {
                    let mut s = state.lock().await;
                    kind.sample(&mut s)
                };
                let sample = SensorData {
                    robot_id: robot_id.clone(),
                    topic: kind.topic().to_string(),
                    data_type: kind.data_type().to_string(),
                    frame_id: kind.frame_id().to_string(),
                    timestamp: Utc::now(),
                    data,
                };
                match tx.try_send(sample) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(robot_id = %robot_id, topic = kind.topic(), "sensor queue full, sample dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    debug!(robot_id = %robot_id, topic = kind.topic(), "sensor generator stopped");
}

// ────────────────────────────────────────────────────────────────────────────
// SimulatedAdapter
// ────────────────────────────────────────────────────────────────────────────

/// A fabricated differential-drive robot.
pub struct SimulatedAdapter {
    robot_id: String,
    state: Arc<Mutex<SimState>>,
    connected: AtomicBool,
    sensor_tx: mpsc::Sender<SensorData>,
    sensor_rx: StdMutex<Option<mpsc::Receiver<SensorData>>>,
    generators: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
    last_command: Mutex<Option<Command>>,
    nav_goal: Mutex<Option<Payload>>,
}

impl SimulatedAdapter {
    /// Create a disconnected simulator for `robot_id`.
    pub fn new(robot_id: impl Into<String>) -> Self {
        let (sensor_tx, sensor_rx) = mpsc::channel(SENSOR_QUEUE_CAPACITY);
        Self {
            robot_id: robot_id.into(),
            state: Arc::new(Mutex::new(SimState::default())),
            connected: AtomicBool::new(false),
            sensor_tx,
            sensor_rx: StdMutex::new(Some(sensor_rx)),
            generators: Mutex::new(None),
            last_command: Mutex::new(None),
            nav_goal: Mutex::new(None),
        }
    }

    /// Factory suitable for
    /// [`AdapterRegistry::with_factory`][crate::registry::AdapterRegistry::with_factory].
    pub fn factory(config: &AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GateError> {
        Ok(Arc::new(Self::new(config.robot_id.clone())))
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    /// Current pose and commanded twist.
    pub async fn state(&self) -> SimState {
        *self.state.lock().await
    }

    /// The most recent command accepted by [`RobotAdapter::send_command`].
    pub async fn last_command(&self) -> Option<Command> {
        self.last_command.lock().await.clone()
    }

    /// The navigation goal currently being pursued, if any.
    pub async fn nav_goal(&self) -> Option<Payload> {
        self.nav_goal.lock().await.clone()
    }

    async fn set_twist(&self, linear: f64, angular: f64) {
        let mut s = self.state.lock().await;
        s.linear = linear.clamp(-MAX_LINEAR_VELOCITY, MAX_LINEAR_VELOCITY);
        s.angular = angular.clamp(-MAX_ANGULAR_VELOCITY, MAX_ANGULAR_VELOCITY);
    }
}

#[async_trait]
impl RobotAdapter for SimulatedAdapter {
    async fn connect(
        &self,
        shutdown: &CancellationToken,
        _config: &AdapterConfig,
    ) -> Result<(), GateError> {
        let mut generators = self.generators.lock().await;
        if generators.is_some() {
            debug!(robot_id = %self.robot_id, "simulator already connected");
            return Ok(());
        }

        let cancel = shutdown.child_token();
        let handles = SensorKind::ALL
            .iter()
            .map(|&kind| {
                tokio::spawn(run_generator(
                    kind,
                    self.robot_id.clone(),
                    Arc::clone(&self.state),
                    self.sensor_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        *generators = Some((cancel, handles));
        self.connected.store(true, Ordering::SeqCst);
        info!(robot_id = %self.robot_id, "simulated robot connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GateError> {
        let taken = self.generators.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some((cancel, handles)) = taken {
            cancel.cancel();
            for handle in handles {
                let _ = handle.await;
            }
            info!(robot_id = %self.robot_id, "simulated robot disconnected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_command(&self, command: Command) -> Result<(), GateError> {
        if !self.is_connected() {
            return Err(GateError::NotConnected(self.robot_id.clone()));
        }
        match command.kind {
            CommandType::Velocity => {
                self.set_twist(command.payload_f64("linear_x"), command.payload_f64("angular_z"))
                    .await;
            }
            CommandType::NavGoal => {
                debug!(robot_id = %self.robot_id, goal = ?command.payload, "navigation goal accepted");
                *self.nav_goal.lock().await = Some(command.payload.clone());
            }
            CommandType::NavCancel | CommandType::Stop => {
                *self.nav_goal.lock().await = None;
                self.set_twist(0.0, 0.0).await;
            }
        }
        *self.last_command.lock().await = Some(command);
        Ok(())
    }

    fn sensor_stream(&self) -> BoxStream<'static, SensorData> {
        let rx = self.sensor_rx.lock().ok().and_then(|mut slot| slot.take());
        match rx {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|sample| (sample, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_velocity: true,
            supports_navigation: true,
            supports_estop: true,
            sensor_topics: SensorKind::ALL
                .iter()
                .map(|k| k.topic().to_string())
                .collect(),
            max_linear_velocity: MAX_LINEAR_VELOCITY,
            max_angular_velocity: MAX_ANGULAR_VELOCITY,
        }
    }

    async fn emergency_stop(&self) -> Result<(), GateError> {
        *self.nav_goal.lock().await = None;
        self.set_twist(0.0, 0.0).await;
        info!(robot_id = %self.robot_id, "simulated robot emergency stop");
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
