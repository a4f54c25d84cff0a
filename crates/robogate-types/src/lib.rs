use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Open key/value payload carried by every [`Message`] and [`Command`].
///
/// New payload keys never need a schema change on either side of the wire.
pub type Payload = Map<String, Value>;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Closed set of message kinds exchanged with browser clients.
///
/// Encoded on the wire as its snake_case name (`"velocity_cmd"`, ...).
/// Unrecognised names decode to [`MessageType::Unknown`] so the handler can
/// reject them without dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Auth,
    Ping,
    Pong,
    VelocityCmd,
    Estop,
    NavGoal,
    NavCancel,
    OpLock,
    OpUnlock,
    SensorData,
    RobotStatus,
    CommandAck,
    SafetyAlert,
    ConnectionStatus,
    LockStatus,
    Error,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Auth => "auth",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::VelocityCmd => "velocity_cmd",
            MessageType::Estop => "estop",
            MessageType::NavGoal => "nav_goal",
            MessageType::NavCancel => "nav_cancel",
            MessageType::OpLock => "op_lock",
            MessageType::OpUnlock => "op_unlock",
            MessageType::SensorData => "sensor_data",
            MessageType::RobotStatus => "robot_status",
            MessageType::CommandAck => "command_ack",
            MessageType::SafetyAlert => "safety_alert",
            MessageType::ConnectionStatus => "connection_status",
            MessageType::LockStatus => "lock_status",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "auth" => MessageType::Auth,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "velocity_cmd" => MessageType::VelocityCmd,
            "estop" => MessageType::Estop,
            "nav_goal" => MessageType::NavGoal,
            "nav_cancel" => MessageType::NavCancel,
            "op_lock" => MessageType::OpLock,
            "op_unlock" => MessageType::OpUnlock,
            "sensor_data" => MessageType::SensorData,
            "robot_status" => MessageType::RobotStatus,
            "command_ack" => MessageType::CommandAck,
            "safety_alert" => MessageType::SafetyAlert,
            "connection_status" => MessageType::ConnectionStatus,
            "lock_status" => MessageType::LockStatus,
            "error" => MessageType::Error,
            _ => MessageType::Unknown,
        })
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let Ok(kind) = raw.parse::<MessageType>();
        Ok(kind)
    }
}

/// The wire envelope.  Immutable once encoded; one per inbound/outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub robot_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub payload: Payload,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Message {
    /// Create an empty message of `kind`, stamped with the current time.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            robot_id: String::new(),
            payload: Payload::new(),
            timestamp: now_millis(),
            error: None,
        }
    }

    /// Builder: target a robot.
    pub fn for_robot(mut self, robot_id: impl Into<String>) -> Self {
        self.robot_id = robot_id.into();
        self
    }

    /// Builder: replace the whole payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Builder: set a single payload key.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Build the `error` reply sent back to the originating client.
    pub fn error_reply(robot_id: &str, err: &GateError) -> Self {
        let mut msg = Message::new(MessageType::Error)
            .for_robot(robot_id)
            .with_field("code", err.code());
        if let GateError::LockHeld { holder, expires_at, .. } = err {
            msg.payload.insert("locked_by".into(), holder.clone().into());
            msg.payload
                .insert("expires_at".into(), expires_at.timestamp_millis().into());
        }
        msg.error = Some(err.to_string());
        msg
    }

    /// Numeric payload field; missing or non-numeric values read as `0.0`.
    pub fn payload_f64(&self, key: &str) -> f64 {
        self.payload.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }

    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Kind of instruction handed to a [`Command`]-consuming adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Velocity,
    NavGoal,
    NavCancel,
    Stop,
}

/// Normalised instruction sent to a robot adapter once it has passed the
/// safety pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub robot_id: String,
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl Command {
    pub fn new(robot_id: impl Into<String>, kind: CommandType, payload: Payload) -> Self {
        Self {
            robot_id: robot_id.into(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A velocity command with planar linear components and yaw rate.
    pub fn velocity(robot_id: impl Into<String>, linear_x: f64, linear_y: f64, angular_z: f64) -> Self {
        let mut payload = Payload::new();
        payload.insert("linear_x".into(), linear_x.into());
        payload.insert("linear_y".into(), linear_y.into());
        payload.insert("angular_z".into(), angular_z.into());
        Self::new(robot_id, CommandType::Velocity, payload)
    }

    /// The all-zero velocity command issued by the watchdog.
    pub fn zero_velocity(robot_id: impl Into<String>) -> Self {
        Self::velocity(robot_id, 0.0, 0.0, 0.0)
    }

    pub fn payload_f64(&self, key: &str) -> f64 {
        self.payload.get(key).and_then(Value::as_f64).unwrap_or(0.0)
    }
}

/// One sample from a robot's sensor stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub robot_id: String,
    /// e.g. `"/odom"`, `"/scan"`
    pub topic: String,
    /// e.g. `"nav_msgs/Odometry"`
    pub data_type: String,
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Payload,
}

impl SensorData {
    /// Wrap the sample in a `sensor_data` envelope for subscribed clients.
    pub fn to_message(&self) -> Message {
        let mut msg = Message::new(MessageType::SensorData)
            .for_robot(self.robot_id.clone())
            .with_field("topic", self.topic.clone())
            .with_field("data_type", self.data_type.clone())
            .with_field("frame_id", self.frame_id.clone())
            .with_field("data", Value::Object(self.data.clone()));
        msg.timestamp = self.timestamp.timestamp_millis();
        msg
    }
}

/// Exclusive-operation lease on a single robot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub robot_id: String,
    pub user_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Static description of what an adapter type can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_velocity: bool,
    pub supports_navigation: bool,
    pub supports_estop: bool,
    pub sensor_topics: Vec<String>,
    pub max_linear_velocity: f64,
    pub max_angular_velocity: f64,
}

/// Coarse classification of a [`GateError`], used to choose how loudly to
/// log it and whether it is ever shown to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unknown client input.
    ClientInput,
    /// Not authenticated, lock not held, emergency stop active.
    Authorization,
    /// Robot missing or adapter call failed.
    Adapter,
    /// Sink unavailable, encode failure, I/O.
    Infrastructure,
    /// Startup failures that end the process.
    Fatal,
}

/// Gateway-wide error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("client is not authenticated")]
    NotAuthenticated,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("robot_id is required")]
    MissingRobotId,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("emergency stop is active for robot {0}")]
    EmergencyStopActive(String),

    #[error("robot {robot_id} is locked by {holder} until {expires_at}")]
    LockHeld {
        robot_id: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("lock on robot {robot_id} is held by {holder}, not by the caller")]
    NotLockHolder { robot_id: String, holder: String },

    #[error("robot not found: {0}")]
    RobotNotFound(String),

    #[error("robot already registered: {0}")]
    RobotAlreadyRegistered(String),

    #[error("unknown adapter type: {0}")]
    UnknownAdapterType(String),

    #[error("robot {robot_id} does not support {feature}")]
    Unsupported { robot_id: String, feature: String },

    #[error("adapter for robot {0} is not connected")]
    NotConnected(String),

    #[error("adapter fault on {robot_id}: {details}")]
    AdapterFault { robot_id: String, details: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl GateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GateError::MissingRobotId
            | GateError::InvalidPayload(_)
            | GateError::UnknownMessageType(_) => ErrorClass::ClientInput,
            GateError::NotAuthenticated
            | GateError::AuthFailed(_)
            | GateError::EmergencyStopActive(_)
            | GateError::LockHeld { .. }
            | GateError::NotLockHolder { .. } => ErrorClass::Authorization,
            GateError::RobotNotFound(_)
            | GateError::RobotAlreadyRegistered(_)
            | GateError::UnknownAdapterType(_)
            | GateError::Unsupported { .. }
            | GateError::NotConnected(_)
            | GateError::AdapterFault { .. } => ErrorClass::Adapter,
            GateError::Codec(_) | GateError::Sink(_) | GateError::Io(_) => {
                ErrorClass::Infrastructure
            }
            GateError::Config(_) => ErrorClass::Fatal,
        }
    }

    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::NotAuthenticated => "not_authenticated",
            GateError::AuthFailed(_) => "auth_failed",
            GateError::MissingRobotId => "missing_robot_id",
            GateError::InvalidPayload(_) => "invalid_payload",
            GateError::UnknownMessageType(_) => "unknown_message_type",
            GateError::EmergencyStopActive(_) => "estop_active",
            GateError::LockHeld { .. } => "lock_held",
            GateError::NotLockHolder { .. } => "not_lock_holder",
            GateError::RobotNotFound(_) => "robot_not_found",
            GateError::RobotAlreadyRegistered(_) => "robot_already_registered",
            GateError::UnknownAdapterType(_) => "unknown_adapter_type",
            GateError::Unsupported { .. } => "unsupported",
            GateError::NotConnected(_) => "not_connected",
            GateError::AdapterFault { .. } => "adapter_fault",
            GateError::Codec(_) => "codec_error",
            GateError::Sink(_) => "sink_error",
            GateError::Config(_) => "config_error",
            GateError::Io(_) => "io_error",
        }
    }
}

impl From<std::io::Error> for GateError {
    fn from(e: std::io::Error) -> Self {
        GateError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_wire_names() {
        assert_eq!(MessageType::VelocityCmd.as_str(), "velocity_cmd");
        assert_eq!("op_lock".parse::<MessageType>().unwrap(), MessageType::OpLock);
        assert_eq!("teleport".parse::<MessageType>().unwrap(), MessageType::Unknown);
    }

    #[test]
    fn message_json_shape() {
        let msg = Message::new(MessageType::VelocityCmd)
            .for_robot("robot-1")
            .with_field("linear_x", 0.5);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "velocity_cmd");
        assert_eq!(json["robot_id"], "robot-1");
        assert_eq!(json["payload"]["linear_x"], 0.5);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn message_tolerates_null_and_missing_fields() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"ping","robot_id":null,"payload":null}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Ping);
        assert!(msg.robot_id.is_empty());
        assert!(msg.payload.is_empty());
        assert_eq!(msg.timestamp, 0);
    }

    #[test]
    fn unknown_type_decodes_instead_of_failing() {
        let msg: Message = serde_json::from_str(r#"{"type":"self_destruct"}"#).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
    }

    #[test]
    fn payload_f64_coerces_missing_and_wrong_types_to_zero() {
        let msg = Message::new(MessageType::VelocityCmd)
            .with_field("linear_x", 2)
            .with_field("angular_z", "fast");
        assert!((msg.payload_f64("linear_x") - 2.0).abs() < f64::EPSILON);
        assert_eq!(msg.payload_f64("angular_z"), 0.0);
        assert_eq!(msg.payload_f64("linear_y"), 0.0);
    }

    #[test]
    fn error_reply_carries_lock_holder() {
        let err = GateError::LockHeld {
            robot_id: "robot-1".into(),
            holder: "alice".into(),
            expires_at: Utc::now(),
        };
        let reply = Message::error_reply("robot-1", &err);
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.payload_str("code"), Some("lock_held"));
        assert_eq!(reply.payload_str("locked_by"), Some("alice"));
        assert!(reply.error.unwrap().contains("alice"));
    }

    #[test]
    fn sensor_data_to_message_keeps_timestamp() {
        let sample = SensorData {
            robot_id: "robot-1".into(),
            topic: "/odom".into(),
            data_type: "nav_msgs/Odometry".into(),
            frame_id: "odom".into(),
            timestamp: Utc::now(),
            data: Payload::new(),
        };
        let msg = sample.to_message();
        assert_eq!(msg.kind, MessageType::SensorData);
        assert_eq!(msg.robot_id, "robot-1");
        assert_eq!(msg.timestamp, sample.timestamp.timestamp_millis());
        assert_eq!(msg.payload_str("topic"), Some("/odom"));
    }

    #[test]
    fn zero_velocity_command_is_all_zero() {
        let cmd = Command::zero_velocity("robot-1");
        assert_eq!(cmd.kind, CommandType::Velocity);
        for key in ["linear_x", "linear_y", "angular_z"] {
            assert_eq!(cmd.payload_f64(key), 0.0);
        }
    }

    #[test]
    fn error_classes() {
        assert_eq!(GateError::NotAuthenticated.class(), ErrorClass::Authorization);
        assert_eq!(GateError::MissingRobotId.class(), ErrorClass::ClientInput);
        assert_eq!(GateError::RobotNotFound("x".into()).class(), ErrorClass::Adapter);
        assert_eq!(GateError::Sink("down".into()).class(), ErrorClass::Infrastructure);
    }

    #[test]
    fn lock_expiry_is_inclusive() {
        let now = Utc::now();
        let info = LockInfo {
            robot_id: "r".into(),
            user_id: "u".into(),
            acquired_at: now,
            expires_at: now,
        };
        assert!(info.is_expired_at(now));
    }
}
