//! [`MessageHandler`] – the safety pipeline every client instruction passes
//! through before it reaches a robot.
//!
//! The handler is a type-dispatch router: each [`MessageType`] maps to one
//! method, and anything a client is not allowed to send is rejected with an
//! `error` reply.  Rejections go to the originating client only; the
//! connection stays open.
//!
//! # Velocity pipeline
//!
//! Applied in strict order, each stage either proceeds or rejects:
//!
//! 1. client must be authenticated,
//! 2. `robot_id` must be present,
//! 3. emergency stop must not be active for the robot,
//! 4. the client's user must hold (or be able to acquire) the operation lock,
//! 5. `linear_x`, `linear_y` and `angular_z` are read, defaulting to zero,
//! 6. the velocity limiter clamps them (and a `safety_alert` tells the
//!    client when it did),
//! 7. the robot's adapter is looked up and must support velocity,
//! 8. the clamped command is sent to the adapter, unless an emergency stop
//!    landed while stages 4–7 ran,
//! 9. the command watchdog is fed,
//! 10. the command is handed to the persistence sink in the background,
//! 11. a `command_ack` reporting `clamped` is returned.
//!
//! All replies and broadcasts travel through the [`Hub`], so per-client
//! ordering is the order in which the handler produced them.

use std::sync::Arc;

use robogate_hal::{AdapterRegistry, RobotAdapter};
use robogate_kernel::{LimitResult, MotionGrant, SafetyKernel, VelocityInput};
use robogate_middleware::{ClientId, Hub, PersistenceSink};
use robogate_types::{
    Command, CommandType, ErrorClass, GateError, LockInfo, Message, MessageType, Payload,
};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;

/// Per-connection state owned by the connection's read task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub id: ClientId,
    pub authenticated: bool,
    pub user_id: Option<String>,
}

impl ClientSession {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            authenticated: false,
            user_id: None,
        }
    }

    /// The authenticated user, or [`GateError::NotAuthenticated`].
    pub fn require_user(&self) -> Result<&str, GateError> {
        match (&self.user_id, self.authenticated) {
            (Some(user), true) => Ok(user),
            _ => Err(GateError::NotAuthenticated),
        }
    }
}

/// `lock_status` payload describing a live lease.
pub(crate) fn lock_status(lease: &LockInfo) -> Message {
    Message::new(MessageType::LockStatus)
        .for_robot(lease.robot_id.clone())
        .with_field("locked", true)
        .with_field("locked_by", lease.user_id.clone())
        .with_field("expires_at", lease.expires_at.timestamp_millis())
}

/// Routes decoded client messages through the safety subsystem.
pub struct MessageHandler {
    registry: Arc<AdapterRegistry>,
    safety: Arc<SafetyKernel>,
    hub: Hub,
    sink: Arc<dyn PersistenceSink>,
    authenticator: Arc<dyn Authenticator>,
}

impl MessageHandler {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        safety: Arc<SafetyKernel>,
        hub: Hub,
        sink: Arc<dyn PersistenceSink>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry,
            safety,
            hub,
            sink,
            authenticator,
        }
    }

    /// Handle one message from `session`.  Never fails: rejections are sent
    /// back to the client as `error` messages.
    pub async fn handle(&self, session: &mut ClientSession, msg: Message) {
        let kind = msg.kind;
        let robot_id = msg.robot_id.clone();
        if let Err(e) = self.dispatch(session, msg).await {
            match e.class() {
                ErrorClass::ClientInput => {
                    debug!(client = %session.id, %kind, robot_id = %robot_id, error = %e, "request rejected")
                }
                ErrorClass::Authorization | ErrorClass::Adapter => {
                    warn!(client = %session.id, %kind, robot_id = %robot_id, error = %e, "request rejected")
                }
                ErrorClass::Infrastructure | ErrorClass::Fatal => {
                    error!(client = %session.id, %kind, robot_id = %robot_id, error = %e, "request failed")
                }
            }
            self.hub.send_to(&session.id, Message::error_reply(&robot_id, &e));
        }
    }

    async fn dispatch(&self, session: &mut ClientSession, msg: Message) -> Result<(), GateError> {
        match msg.kind {
            MessageType::Auth => self.handle_auth(session, &msg).await,
            MessageType::Ping => {
                self.reply(session, Message::new(MessageType::Pong).with_payload(msg.payload));
                Ok(())
            }
            MessageType::VelocityCmd => self.handle_velocity(session, &msg).await,
            MessageType::Estop => self.handle_estop(session, &msg).await,
            MessageType::NavGoal => {
                self.handle_navigation(session, &msg, CommandType::NavGoal).await
            }
            MessageType::NavCancel => {
                self.handle_navigation(session, &msg, CommandType::NavCancel).await
            }
            MessageType::OpLock => self.handle_op_lock(session, &msg).await,
            MessageType::OpUnlock => self.handle_op_unlock(session, &msg).await,
            MessageType::RobotStatus => self.handle_robot_status(session, &msg).await,
            other => Err(GateError::UnknownMessageType(other.as_str().to_string())),
        }
    }

    fn reply(&self, session: &ClientSession, msg: Message) {
        self.hub.send_to(&session.id, msg);
    }

    // ── auth ────────────────────────────────────────────────────────────────

    async fn handle_auth(&self, session: &mut ClientSession, msg: &Message) -> Result<(), GateError> {
        let token = msg
            .payload_str("token")
            .ok_or_else(|| GateError::InvalidPayload("auth requires a token".into()))?;
        let user_id = self.authenticator.authenticate(token).await?;

        session.authenticated = true;
        session.user_id = Some(user_id.clone());

        let mut robots: Vec<String> = msg
            .payload
            .get("robot_ids")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if !msg.robot_id.is_empty() {
            robots.push(msg.robot_id.clone());
        }
        robots.sort();
        robots.dedup();
        for robot_id in &robots {
            self.hub.subscribe(&session.id, robot_id);
        }

        info!(client = %session.id, user_id = %user_id, subscriptions = robots.len(), "client authenticated");
        self.reply(
            session,
            Message::new(MessageType::ConnectionStatus)
                .with_field("client_id", session.id.as_str())
                .with_field("authenticated", true)
                .with_field("user_id", user_id)
                .with_field("subscriptions", robots),
        );
        Ok(())
    }

    // ── motion ──────────────────────────────────────────────────────────────

    /// Stages 1–4: authentication, robot ID, emergency stop, operation lock.
    async fn authorize_motion(&self, session: &ClientSession, robot_id: &str) -> Result<(), GateError> {
        let user_id = session.require_user()?;
        if robot_id.is_empty() {
            return Err(GateError::MissingRobotId);
        }
        if let MotionGrant::Acquired(lease) = self.safety.authorize_motion(robot_id, user_id).await? {
            self.hub.broadcast_to_robot(robot_id, lock_status(&lease));
        }
        Ok(())
    }

    async fn adapter_for(&self, robot_id: &str) -> Result<Arc<dyn RobotAdapter>, GateError> {
        self.registry
            .get(robot_id)
            .await
            .ok_or_else(|| GateError::RobotNotFound(robot_id.to_string()))
    }

    /// Send an authorized command.  The emergency stop is checked again here
    /// because it may have been activated while the command was in the
    /// pipeline.
    async fn send_checked(&self, adapter: &dyn RobotAdapter, command: Command) -> Result<(), GateError> {
        if self.safety.estop.is_active(&command.robot_id).await {
            return Err(GateError::EmergencyStopActive(command.robot_id));
        }
        adapter.send_command(command).await
    }

    fn publish_command(&self, command: Command) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            if let Err(e) = sink.publish_command(&command).await {
                warn!(robot_id = %command.robot_id, sink = sink.name(), error = %e, "command publish failed");
            }
        });
    }

    async fn handle_velocity(&self, session: &ClientSession, msg: &Message) -> Result<(), GateError> {
        let robot_id = msg.robot_id.as_str();
        self.authorize_motion(session, robot_id).await?;

        let limited: LimitResult = self.safety.limiter.limit(VelocityInput {
            linear_x: msg.payload_f64("linear_x"),
            linear_y: msg.payload_f64("linear_y"),
            angular_z: msg.payload_f64("angular_z"),
        });
        if limited.clamped {
            self.reply(
                session,
                Message::new(MessageType::SafetyAlert)
                    .for_robot(robot_id)
                    .with_field("alert", "velocity_clamped")
                    .with_field("requested", json!({
                        "linear_x": msg.payload_f64("linear_x"),
                        "linear_y": msg.payload_f64("linear_y"),
                        "angular_z": msg.payload_f64("angular_z"),
                    }))
                    .with_field("max_linear_velocity", self.safety.limiter.max_linear())
                    .with_field("max_angular_velocity", self.safety.limiter.max_angular()),
            );
        }

        let adapter = self.adapter_for(robot_id).await?;
        if !adapter.capabilities().supports_velocity {
            return Err(GateError::Unsupported {
                robot_id: robot_id.to_string(),
                feature: "velocity".into(),
            });
        }

        let command = Command::velocity(robot_id, limited.linear_x, limited.linear_y, limited.angular_z);
        self.send_checked(adapter.as_ref(), command.clone()).await?;
        self.safety.watchdog.record(robot_id).await;
        self.publish_command(command);

        self.reply(
            session,
            Message::new(MessageType::CommandAck)
                .for_robot(robot_id)
                .with_field("command", MessageType::VelocityCmd.as_str())
                .with_field("success", true)
                .with_field("clamped", limited.clamped)
                .with_field("linear_x", limited.linear_x)
                .with_field("linear_y", limited.linear_y)
                .with_field("angular_z", limited.angular_z),
        );
        Ok(())
    }

    async fn handle_navigation(
        &self,
        session: &ClientSession,
        msg: &Message,
        kind: CommandType,
    ) -> Result<(), GateError> {
        let robot_id = msg.robot_id.as_str();
        self.authorize_motion(session, robot_id).await?;

        let adapter = self.adapter_for(robot_id).await?;
        if !adapter.capabilities().supports_navigation {
            return Err(GateError::Unsupported {
                robot_id: robot_id.to_string(),
                feature: "navigation".into(),
            });
        }

        let command = Command::new(robot_id, kind, msg.payload.clone());
        self.send_checked(adapter.as_ref(), command.clone()).await?;
        self.publish_command(command);

        self.reply(
            session,
            Message::new(MessageType::CommandAck)
                .for_robot(robot_id)
                .with_field("command", msg.kind.as_str())
                .with_field("success", true),
        );
        Ok(())
    }

    // ── emergency stop ──────────────────────────────────────────────────────

    async fn handle_estop(&self, session: &ClientSession, msg: &Message) -> Result<(), GateError> {
        let user_id = session.require_user()?.to_string();
        let activate = msg.payload_bool("activate").unwrap_or(true);
        let robot_id = msg.robot_id.as_str();

        if !activate {
            if robot_id.is_empty() {
                return Err(GateError::MissingRobotId);
            }
            let was_active = self.safety.estop.release(robot_id).await;
            self.hub.broadcast_to_all(
                Message::new(MessageType::SafetyAlert)
                    .for_robot(robot_id)
                    .with_field("alert", "estop_released")
                    .with_field("released_by", user_id)
                    .with_field("was_active", was_active),
            );
            self.reply(session, estop_ack(robot_id, false, true));
            return Ok(());
        }

        if robot_id.is_empty() {
            let tally = self.safety.estop.activate_all().await;
            self.hub.broadcast_to_all(
                Message::new(MessageType::SafetyAlert)
                    .with_field("alert", "estop_activated")
                    .with_field("all_robots", true)
                    .with_field("activated_by", user_id)
                    .with_field("stopped", tally.stopped)
                    .with_field("failed", tally.failed)
                    .with_field("failed_robots", tally.failed_robots.clone()),
            );
            self.reply(
                session,
                estop_ack("", true, tally.failed == 0)
                    .with_field("stopped", tally.stopped)
                    .with_field("failed", tally.failed),
            );
            return Ok(());
        }

        let result = self.safety.estop.activate(robot_id).await;
        self.hub.broadcast_to_all(
            Message::new(MessageType::SafetyAlert)
                .for_robot(robot_id)
                .with_field("alert", "estop_activated")
                .with_field("all_robots", false)
                .with_field("activated_by", user_id)
                .with_field("adapter_stopped", result.is_ok()),
        );
        result?;
        self.reply(session, estop_ack(robot_id, true, true));
        Ok(())
    }

    // ── operation lock ──────────────────────────────────────────────────────

    async fn handle_op_lock(&self, session: &ClientSession, msg: &Message) -> Result<(), GateError> {
        let user_id = session.require_user()?;
        let robot_id = msg.robot_id.as_str();
        if robot_id.is_empty() {
            return Err(GateError::MissingRobotId);
        }

        match self.safety.locks.acquire(robot_id, user_id).await {
            Ok(lease) => {
                self.reply(
                    session,
                    lock_status(&lease).with_field("granted", true),
                );
                self.hub.broadcast_to_robot(robot_id, lock_status(&lease));
                Ok(())
            }
            Err(GateError::LockHeld {
                holder, expires_at, ..
            }) => {
                debug!(client = %session.id, robot_id, holder = %holder, "operation lock denied");
                self.reply(
                    session,
                    Message::new(MessageType::LockStatus)
                        .for_robot(robot_id)
                        .with_field("granted", false)
                        .with_field("locked", true)
                        .with_field("locked_by", holder)
                        .with_field("expires_at", expires_at.timestamp_millis()),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_op_unlock(&self, session: &ClientSession, msg: &Message) -> Result<(), GateError> {
        let user_id = session.require_user()?;
        let robot_id = msg.robot_id.as_str();
        if robot_id.is_empty() {
            return Err(GateError::MissingRobotId);
        }

        self.safety.locks.release(robot_id, user_id).await?;
        let unlocked = Message::new(MessageType::LockStatus)
            .for_robot(robot_id)
            .with_field("locked", false)
            .with_field("reason", "released");
        self.reply(session, unlocked.clone().with_field("released", true));
        self.hub.broadcast_to_robot(robot_id, unlocked);
        Ok(())
    }

    // ── status ──────────────────────────────────────────────────────────────

    async fn handle_robot_status(&self, session: &ClientSession, msg: &Message) -> Result<(), GateError> {
        session.require_user()?;
        let robot_id = msg.robot_id.as_str();

        if robot_id.is_empty() {
            let robots = self.registry.robot_ids().await;
            self.reply(
                session,
                Message::new(MessageType::RobotStatus).with_field("robots", robots),
            );
            return Ok(());
        }

        let adapter = self.adapter_for(robot_id).await?;
        match msg.payload_bool("subscribe") {
            Some(true) => self.hub.subscribe(&session.id, robot_id),
            Some(false) => self.hub.unsubscribe(&session.id, robot_id),
            None => {}
        }

        let capabilities = serde_json::to_value(adapter.capabilities())
            .map_err(|e| GateError::Codec(e.to_string()))?;
        let lease = self.safety.locks.holder(robot_id).await;
        let mut payload = Payload::new();
        payload.insert("connected".into(), adapter.is_connected().into());
        payload.insert(
            "estop_active".into(),
            self.safety.estop.is_active(robot_id).await.into(),
        );
        payload.insert(
            "locked_by".into(),
            lease.as_ref().map(|l| l.user_id.clone()).into(),
        );
        payload.insert(
            "lock_expires_at".into(),
            lease.map(|l| l.expires_at.timestamp_millis()).into(),
        );
        payload.insert("capabilities".into(), capabilities);

        self.reply(
            session,
            Message::new(MessageType::RobotStatus)
                .for_robot(robot_id)
                .with_payload(payload),
        );
        Ok(())
    }
}

fn estop_ack(robot_id: &str, activate: bool, success: bool) -> Message {
    Message::new(MessageType::CommandAck)
        .for_robot(robot_id)
        .with_field("command", MessageType::Estop.as_str())
        .with_field("activate", activate)
        .with_field("success", success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DevAuthenticator;
    use robogate_hal::{AdapterConfig, SIMULATED_ADAPTER_TYPE, SimulatedAdapter};
    use robogate_kernel::SafetyConfig;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream, StreamExt};
    use robogate_middleware::ClientHandle;
    use robogate_types::{Capabilities, SensorData};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Remembers which robots had commands persisted.
    #[derive(Default)]
    struct RecordingSink {
        commands: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn robots(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistenceSink for RecordingSink {
        async fn publish_sensor_data(&self, _data: &SensorData) -> Result<(), GateError> {
            Ok(())
        }
        async fn publish_command(&self, command: &Command) -> Result<(), GateError> {
            self.commands.lock().unwrap().push(command.robot_id.clone());
            Ok(())
        }
        fn name(&self) -> &'static str {
            "recording"
        }
    }

    /// A connected robot with fixed capabilities that records what it is sent.
    struct FixedRobot {
        velocity: bool,
        navigation: bool,
        sent: Mutex<Vec<Command>>,
    }

    impl FixedRobot {
        fn new(velocity: bool, navigation: bool) -> Arc<Self> {
            Arc::new(Self {
                velocity,
                navigation,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RobotAdapter for FixedRobot {
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
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
        fn sensor_stream(&self) -> BoxStream<'static, SensorData> {
            stream::empty().boxed()
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_velocity: self.velocity,
                supports_navigation: self.navigation,
                supports_estop: true,
                sensor_topics: Vec::new(),
                max_linear_velocity: 1.0,
                max_angular_velocity: 1.0,
            }
        }
        async fn emergency_stop(&self) -> Result<(), GateError> {
            Ok(())
        }
    }

    struct Fixture {
        handler: MessageHandler,
        hub: Hub,
        registry: Arc<AdapterRegistry>,
        safety: Arc<SafetyKernel>,
        sink: Arc<RecordingSink>,
        _cancel: CancellationToken,
    }

    async fn fixture(robots: &[&str]) -> Fixture {
        let cancel = CancellationToken::new();
        let registry = Arc::new(
            AdapterRegistry::new().with_factory(SIMULATED_ADAPTER_TYPE, SimulatedAdapter::factory),
        );
        for id in robots {
            let cfg = AdapterConfig::new(*id, SIMULATED_ADAPTER_TYPE);
            let adapter = registry.create(&cfg).await.unwrap();
            adapter.connect(&cancel, &cfg).await.unwrap();
        }
        let safety = Arc::new(SafetyKernel::new(Arc::clone(&registry), SafetyConfig::default()));
        let (hub, runner) = Hub::new();
        tokio::spawn(runner.run(cancel.clone()));
        let sink = Arc::new(RecordingSink::default());
        let handler = MessageHandler::new(
            Arc::clone(&registry),
            Arc::clone(&safety),
            hub.clone(),
            Arc::clone(&sink) as Arc<dyn PersistenceSink>,
            Arc::new(DevAuthenticator),
        );
        Fixture {
            handler,
            hub,
            registry,
            safety,
            sink,
            _cancel: cancel,
        }
    }

    impl Fixture {
        fn connect(&self) -> (ClientSession, mpsc::Receiver<Arc<Message>>) {
            let (handle, rx) = ClientHandle::new();
            let session = ClientSession::new(handle.id.clone());
            self.hub.register(handle);
            (session, rx)
        }

        async fn authed(&self, user: &str) -> (ClientSession, mpsc::Receiver<Arc<Message>>) {
            let (mut session, mut rx) = self.connect();
            self.handler
                .handle(&mut session, Message::new(MessageType::Auth).with_field("token", user))
                .await;
            let status = next(&self.hub, &mut rx).await;
            assert_eq!(status.kind, MessageType::ConnectionStatus);
            (session, rx)
        }
    }

    async fn next(hub: &Hub, rx: &mut mpsc::Receiver<Arc<Message>>) -> Arc<Message> {
        hub.stats().await;
        rx.try_recv().expect("expected a queued message")
    }

    fn velocity(robot: &str, lx: f64, az: f64) -> Message {
        Message::new(MessageType::VelocityCmd)
            .for_robot(robot)
            .with_field("linear_x", lx)
            .with_field("angular_z", az)
    }

    #[tokio::test]
    async fn unauthenticated_velocity_is_rejected() {
        let f = fixture(&["robot-1"]).await;
        let (mut session, mut rx) = f.connect();
        f.handler.handle(&mut session, velocity("robot-1", 0.5, 0.0)).await;

        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.payload_str("code"), Some("not_authenticated"));
        assert!(f.safety.locks.holder("robot-1").await.is_none());
    }

    #[tokio::test]
    async fn ping_works_before_auth() {
        let f = fixture(&[]).await;
        let (mut session, mut rx) = f.connect();
        f.handler
            .handle(&mut session, Message::new(MessageType::Ping).with_field("seq", 7))
            .await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.kind, MessageType::Pong);
        assert_eq!(reply.payload_f64("seq"), 7.0);
    }

    #[tokio::test]
    async fn auth_without_token_is_invalid_payload() {
        let f = fixture(&[]).await;
        let (mut session, mut rx) = f.connect();
        f.handler.handle(&mut session, Message::new(MessageType::Auth)).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.payload_str("code"), Some("invalid_payload"));
        assert!(!session.authenticated);
    }

    #[tokio::test]
    async fn auth_subscribes_to_named_robots() {
        let f = fixture(&["robot-1", "robot-2"]).await;
        let (mut session, mut rx) = f.connect();
        let auth = Message::new(MessageType::Auth)
            .for_robot("robot-1")
            .with_field("token", "alice")
            .with_field("robot_ids", json!(["robot-2", "robot-1"]));
        f.handler.handle(&mut session, auth).await;

        let status = next(&f.hub, &mut rx).await;
        assert_eq!(status.payload_str("user_id"), Some("alice"));
        assert_eq!(status.payload["subscriptions"], json!(["robot-1", "robot-2"]));
        assert_eq!(f.hub.subscriptions(&session.id).await, ["robot-1", "robot-2"]);
    }

    #[tokio::test]
    async fn velocity_within_limits_is_forwarded_and_acked() {
        let f = fixture(&["robot-1"]).await;
        let (mut session, mut rx) = f.authed("alice").await;
        f.handler.handle(&mut session, velocity("robot-1", 0.5, 0.2)).await;

        let ack = next(&f.hub, &mut rx).await;
        assert_eq!(ack.kind, MessageType::CommandAck);
        assert_eq!(ack.payload_bool("clamped"), Some(false));
        assert!(f.safety.locks.is_held_by("robot-1", "alice").await);
        assert!(f.safety.watchdog.is_monitored("robot-1").await);
    }

    #[tokio::test]
    async fn disconnected_robot_rejects_velocity_without_side_effects() {
        let f = fixture(&["robot-1", "robot-2"]).await;
        let sim = f.registry.get("robot-1").await.unwrap();
        sim.disconnect().await.unwrap();
        let (mut session, mut rx) = f.authed("alice").await;

        f.handler.handle(&mut session, velocity("robot-1", 0.5, 0.0)).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.payload_str("code"), Some("not_connected"));
        assert!(!f.safety.watchdog.is_monitored("robot-1").await);

        // A command that does go through shows the sink is live.
        f.handler.handle(&mut session, velocity("robot-2", 0.5, 0.0)).await;
        assert_eq!(next(&f.hub, &mut rx).await.kind, MessageType::CommandAck);
        while f.sink.robots().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.sink.robots(), ["robot-2"]);
    }

    #[tokio::test]
    async fn missing_capability_is_unsupported() {
        let f = fixture(&[]).await;
        let base = FixedRobot::new(false, true);
        let arm = FixedRobot::new(true, false);
        f.registry.register_instance("base", base.clone()).await.unwrap();
        f.registry.register_instance("arm", arm.clone()).await.unwrap();
        let (mut session, mut rx) = f.authed("alice").await;

        f.handler.handle(&mut session, velocity("base", 0.2, 0.0)).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.payload_str("code"), Some("unsupported"));
        assert!(!f.safety.watchdog.is_monitored("base").await);

        let nav = Message::new(MessageType::NavGoal).for_robot("arm").with_field("x", 1.0);
        f.handler.handle(&mut session, nav).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.payload_str("code"), Some("unsupported"));

        assert!(base.sent.lock().unwrap().is_empty());
        assert!(arm.sent.lock().unwrap().is_empty());

        // The supported half still works.
        f.handler.handle(&mut session, velocity("arm", 0.2, 0.0)).await;
        assert_eq!(next(&f.hub, &mut rx).await.kind, MessageType::CommandAck);
        assert_eq!(arm.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_refused_once_estop_is_latched() {
        let f = fixture(&[]).await;
        let robot = FixedRobot::new(true, true);
        f.registry.register_instance("robot-1", robot.clone()).await.unwrap();

        let command = Command::velocity("robot-1", 0.3, 0.0, 0.0);
        f.handler.send_checked(robot.as_ref(), command.clone()).await.unwrap();
        assert_eq!(robot.sent.lock().unwrap().len(), 1);

        // Latched after the command cleared the front of the pipeline.
        f.safety.estop.activate("robot-1").await.unwrap();
        let refused = f.handler.send_checked(robot.as_ref(), command).await;
        assert!(matches!(refused, Err(GateError::EmergencyStopActive(id)) if id == "robot-1"));
        assert_eq!(robot.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn velocity_for_unknown_robot_reports_not_found() {
        let f = fixture(&[]).await;
        let (mut session, mut rx) = f.authed("alice").await;
        f.handler.handle(&mut session, velocity("ghost", 0.5, 0.0)).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.payload_str("code"), Some("robot_not_found"));
        assert!(!f.safety.watchdog.is_monitored("ghost").await);
    }

    #[tokio::test]
    async fn velocity_without_robot_id_is_rejected() {
        let f = fixture(&["robot-1"]).await;
        let (mut session, mut rx) = f.authed("alice").await;
        f.handler.handle(&mut session, velocity("", 0.5, 0.0)).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.payload_str("code"), Some("missing_robot_id"));
    }

    #[tokio::test]
    async fn estop_blocks_motion_even_for_lock_holder() {
        let f = fixture(&["robot-1"]).await;
        let (mut session, mut rx) = f.authed("alice").await;
        f.handler.handle(&mut session, velocity("robot-1", 0.5, 0.0)).await;
        next(&f.hub, &mut rx).await;

        let estop = Message::new(MessageType::Estop).for_robot("robot-1");
        f.handler.handle(&mut session, estop).await;
        let alert = next(&f.hub, &mut rx).await;
        assert_eq!(alert.kind, MessageType::SafetyAlert);
        assert_eq!(alert.payload_str("alert"), Some("estop_activated"));
        assert_eq!(next(&f.hub, &mut rx).await.kind, MessageType::CommandAck);

        f.handler.handle(&mut session, velocity("robot-1", 0.5, 0.0)).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.payload_str("code"), Some("estop_active"));

        let nav = Message::new(MessageType::NavGoal).for_robot("robot-1").with_field("x", 1.0);
        f.handler.handle(&mut session, nav).await;
        let reply = next(&f.hub, &mut rx).await;
        assert_eq!(reply.payload_str("code"), Some("estop_active"));

        let release = Message::new(MessageType::Estop)
            .for_robot("robot-1")
            .with_field("activate", false);
        f.handler.handle(&mut session, release).await;
        assert_eq!(
            next(&f.hub, &mut rx).await.payload_str("alert"),
            Some("estop_released")
        );
        next(&f.hub, &mut rx).await;
        f.handler.handle(&mut session, velocity("robot-1", 0.5, 0.0)).await;
        assert_eq!(next(&f.hub, &mut rx).await.kind, MessageType::CommandAck);
    }

    #[tokio::test]
    async fn op_unlock_by_non_holder_is_rejected() {
        let f = fixture(&["robot-1"]).await;
        let (mut alice, mut rx_a) = f.authed("alice").await;
        let (mut bob, mut rx_b) = f.authed("bob").await;

        f.handler
            .handle(&mut alice, Message::new(MessageType::OpLock).for_robot("robot-1"))
            .await;
        let granted = next(&f.hub, &mut rx_a).await;
        assert_eq!(granted.payload_bool("granted"), Some(true));

        f.handler
            .handle(&mut bob, Message::new(MessageType::OpUnlock).for_robot("robot-1"))
            .await;
        let reply = next(&f.hub, &mut rx_b).await;
        assert_eq!(reply.payload_str("code"), Some("not_lock_holder"));

        f.handler
            .handle(&mut alice, Message::new(MessageType::OpUnlock).for_robot("robot-1"))
            .await;
        let released = next(&f.hub, &mut rx_a).await;
        assert_eq!(released.payload_bool("locked"), Some(false));
        assert!(f.safety.locks.holder("robot-1").await.is_none());
    }

    #[tokio::test]
    async fn lock_status_is_broadcast_to_subscribers() {
        let f = fixture(&["robot-1"]).await;
        let (mut alice, mut rx_a) = f.authed("alice").await;
        let (mut watcher, mut rx_w) = f.connect();
        let auth = Message::new(MessageType::Auth)
            .for_robot("robot-1")
            .with_field("token", "watcher");
        f.handler.handle(&mut watcher, auth).await;
        next(&f.hub, &mut rx_w).await;

        f.handler.handle(&mut alice, velocity("robot-1", 0.1, 0.0)).await;
        let broadcast = next(&f.hub, &mut rx_w).await;
        assert_eq!(broadcast.kind, MessageType::LockStatus);
        assert_eq!(broadcast.payload_str("locked_by"), Some("alice"));
        // Alice is not subscribed; she only gets her ack.
        assert_eq!(next(&f.hub, &mut rx_a).await.kind, MessageType::CommandAck);
    }

    #[tokio::test]
    async fn robot_status_reports_state_and_subscribes() {
        let f = fixture(&["robot-1", "robot-2"]).await;
        let (mut session, mut rx) = f.authed("alice").await;

        f.handler
            .handle(&mut session, Message::new(MessageType::RobotStatus))
            .await;
        let list = next(&f.hub, &mut rx).await;
        assert_eq!(list.payload["robots"], json!(["robot-1", "robot-2"]));

        let status = Message::new(MessageType::RobotStatus)
            .for_robot("robot-2")
            .with_field("subscribe", true);
        f.handler.handle(&mut session, status).await;
        let info = next(&f.hub, &mut rx).await;
        assert_eq!(info.payload_bool("connected"), Some(true));
        assert_eq!(info.payload_bool("estop_active"), Some(false));
        assert_eq!(info.payload["locked_by"], Value::Null);
        assert_eq!(info.payload["capabilities"]["supports_velocity"], json!(true));
        assert_eq!(f.hub.subscriptions(&session.id).await, ["robot-2"]);
    }

    #[tokio::test]
    async fn server_only_types_are_rejected() {
        let f = fixture(&[]).await;
        let (mut session, mut rx) = f.authed("alice").await;
        for kind in [MessageType::CommandAck, MessageType::SensorData, MessageType::Unknown] {
            f.handler.handle(&mut session, Message::new(kind)).await;
            let reply = next(&f.hub, &mut rx).await;
            assert_eq!(reply.payload_str("code"), Some("unknown_message_type"));
        }
    }

    #[tokio::test]
    async fn navigation_goal_reaches_simulator() {
        let f = fixture(&["robot-1"]).await;
        let (mut session, mut rx) = f.authed("alice").await;
        let goal = Message::new(MessageType::NavGoal)
            .for_robot("robot-1")
            .with_field("x", 2.0)
            .with_field("y", 1.0);
        f.handler.handle(&mut session, goal).await;
        let ack = next(&f.hub, &mut rx).await;
        assert_eq!(ack.payload_str("command"), Some("nav_goal"));

        let adapter = f.registry.get("robot-1").await.unwrap();
        assert!(adapter.is_connected());
        // Navigation does not feed the watchdog.
        assert!(!f.safety.watchdog.is_monitored("robot-1").await);
    }
}
