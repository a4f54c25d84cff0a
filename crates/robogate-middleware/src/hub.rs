//! Connection hub: client registry, robot subscriptions and fan-out.
//!
//! All membership state lives inside a single [`HubRunner`] task.  Producers
//! hold a cheap [`Hub`] handle and post [`HubCommand`]s on an unbounded
//! queue; the runner applies them one at a time, in order, so no lock guards
//! the client map.
//!
//! Every client owns a bounded outbound queue ([`CLIENT_QUEUE_CAPACITY`]).
//! Delivery uses `try_send`: when one client's queue is full the message is
//! dropped for that client only and the runner moves on, so a slow browser
//! never stalls the others.
//!
//! Messages travel as `Arc<Message>`; a broadcast is built once and each
//! client's write task encodes it in that client's wire format.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use robogate_types::Message;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound queue depth per client.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Opaque per-connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The hub's end of a client's outbound queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    tx: mpsc::Sender<Arc<Message>>,
}

impl ClientHandle {
    /// Create a handle with a fresh ID and the receiving end of its queue.
    pub fn new() -> (Self, mpsc::Receiver<Arc<Message>>) {
        Self::with_id(ClientId::new())
    }

    pub fn with_id(id: ClientId) -> (Self, mpsc::Receiver<Arc<Message>>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        (Self { id, tx }, rx)
    }
}

/// Counters reported by [`Hub::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub clients: usize,
    /// Total `(client, robot)` subscription pairs.
    pub subscriptions: usize,
    /// Messages dropped on full client queues since start.
    pub dropped: u64,
}

/// Requests processed by the [`HubRunner`].
#[derive(Debug)]
pub enum HubCommand {
    Register(ClientHandle),
    Unregister(ClientId),
    Subscribe {
        client: ClientId,
        robot_id: String,
    },
    Unsubscribe {
        client: ClientId,
        robot_id: String,
    },
    SendTo {
        client: ClientId,
        message: Arc<Message>,
    },
    BroadcastRobot {
        robot_id: String,
        message: Arc<Message>,
    },
    BroadcastAll(Arc<Message>),
    Subscriptions {
        client: ClientId,
        reply: oneshot::Sender<Vec<String>>,
    },
    Stats(oneshot::Sender<HubStats>),
}

/// Cloneable producer handle for the hub.
///
/// All methods are non-blocking except the two queries, which wait for the
/// runner to answer.  Posting to a hub whose runner has stopped is a no-op.
#[derive(Debug, Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Create a hub handle and the runner that must be spawned to serve it.
    pub fn new() -> (Self, HubRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx },
            HubRunner {
                rx,
                clients: HashMap::new(),
                dropped: 0,
            },
        )
    }

    fn post(&self, cmd: HubCommand) {
        if self.tx.send(cmd).is_err() {
            debug!("hub runner stopped, command discarded");
        }
    }

    pub fn register(&self, handle: ClientHandle) {
        self.post(HubCommand::Register(handle));
    }

    pub fn unregister(&self, client: &ClientId) {
        self.post(HubCommand::Unregister(client.clone()));
    }

    pub fn subscribe(&self, client: &ClientId, robot_id: &str) {
        self.post(HubCommand::Subscribe {
            client: client.clone(),
            robot_id: robot_id.to_string(),
        });
    }

    pub fn unsubscribe(&self, client: &ClientId, robot_id: &str) {
        self.post(HubCommand::Unsubscribe {
            client: client.clone(),
            robot_id: robot_id.to_string(),
        });
    }

    /// Queue `message` for one client.
    pub fn send_to(&self, client: &ClientId, message: Message) {
        self.post(HubCommand::SendTo {
            client: client.clone(),
            message: Arc::new(message),
        });
    }

    /// Queue `message` for every client subscribed to `robot_id`.
    pub fn broadcast_to_robot(&self, robot_id: &str, message: Message) {
        self.post(HubCommand::BroadcastRobot {
            robot_id: robot_id.to_string(),
            message: Arc::new(message),
        });
    }

    /// Queue `message` for every connected client.
    pub fn broadcast_to_all(&self, message: Message) {
        self.post(HubCommand::BroadcastAll(Arc::new(message)));
    }

    /// Robots `client` is subscribed to, sorted.  Empty for unknown clients.
    pub async fn subscriptions(&self, client: &ClientId) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        self.post(HubCommand::Subscriptions {
            client: client.clone(),
            reply,
        });
        rx.await.unwrap_or_default()
    }

    /// Current counters.  Zeroed when the runner has stopped.
    pub async fn stats(&self) -> HubStats {
        let (reply, rx) = oneshot::channel();
        self.post(HubCommand::Stats(reply));
        rx.await.unwrap_or_default()
    }
}

struct ClientEntry {
    handle: ClientHandle,
    subscriptions: HashSet<String>,
}

/// The serialized event loop that owns every client.
pub struct HubRunner {
    rx: mpsc::UnboundedReceiver<HubCommand>,
    clients: HashMap<ClientId, ClientEntry>,
    dropped: u64,
}

impl HubRunner {
    /// Process commands until `cancel` fires or every [`Hub`] handle is
    /// dropped.  Dropping the runner closes every client queue.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("connection hub started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
            }
        }
        info!(clients = self.clients.len(), "connection hub stopped");
    }

    fn apply(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register(handle) => {
                debug!(client = %handle.id, "client registered");
                self.clients.insert(
                    handle.id.clone(),
                    ClientEntry {
                        handle,
                        subscriptions: HashSet::new(),
                    },
                );
            }
            HubCommand::Unregister(id) => {
                if self.clients.remove(&id).is_some() {
                    debug!(client = %id, "client unregistered");
                }
            }
            HubCommand::Subscribe { client, robot_id } => {
                if let Some(entry) = self.clients.get_mut(&client) {
                    if entry.subscriptions.insert(robot_id.clone()) {
                        debug!(client = %client, robot_id = %robot_id, "client subscribed");
                    }
                }
            }
            HubCommand::Unsubscribe { client, robot_id } => {
                if let Some(entry) = self.clients.get_mut(&client) {
                    entry.subscriptions.remove(&robot_id);
                }
            }
            HubCommand::SendTo { client, message } => {
                if self.clients.contains_key(&client) {
                    self.deliver(&client, message);
                }
            }
            HubCommand::BroadcastRobot { robot_id, message } => {
                let targets: Vec<ClientId> = self
                    .clients
                    .iter()
                    .filter(|(_, entry)| entry.subscriptions.contains(&robot_id))
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in targets {
                    self.deliver(&id, Arc::clone(&message));
                }
            }
            HubCommand::BroadcastAll(message) => {
                let targets: Vec<ClientId> = self.clients.keys().cloned().collect();
                for id in targets {
                    self.deliver(&id, Arc::clone(&message));
                }
            }
            HubCommand::Subscriptions { client, reply } => {
                let mut subs: Vec<String> = self
                    .clients
                    .get(&client)
                    .map(|entry| entry.subscriptions.iter().cloned().collect())
                    .unwrap_or_default();
                subs.sort();
                let _ = reply.send(subs);
            }
            HubCommand::Stats(reply) => {
                let _ = reply.send(HubStats {
                    clients: self.clients.len(),
                    subscriptions: self.clients.values().map(|e| e.subscriptions.len()).sum(),
                    dropped: self.dropped,
                });
            }
        }
    }

    fn deliver(&mut self, id: &ClientId, message: Arc<Message>) {
        let Some(entry) = self.clients.get(id) else {
            return;
        };
        match entry.handle.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.dropped += 1;
                warn!(client = %id, kind = %msg.kind, "client queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client = %id, "client queue closed, unregistering");
                self.clients.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robogate_types::MessageType;

    fn spawn_hub() -> (Hub, CancellationToken) {
        let (hub, runner) = Hub::new();
        let cancel = CancellationToken::new();
        tokio::spawn(runner.run(cancel.clone()));
        (hub, cancel)
    }

    fn alert(robot: &str) -> Message {
        Message::new(MessageType::SafetyAlert).for_robot(robot)
    }

    #[tokio::test]
    async fn broadcast_to_robot_reaches_only_subscribers() {
        let (hub, _cancel) = spawn_hub();
        let (a, mut rx_a) = ClientHandle::new();
        let (b, mut rx_b) = ClientHandle::new();
        let a_id = a.id.clone();
        hub.register(a);
        hub.register(b);
        hub.subscribe(&a_id, "robot-1");

        hub.broadcast_to_robot("robot-1", alert("robot-1"));
        hub.broadcast_to_robot("robot-2", alert("robot-2"));
        hub.stats().await;

        let got = rx_a.try_recv().unwrap();
        assert_eq!(got.robot_id, "robot-1");
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_all_and_send_to() {
        let (hub, _cancel) = spawn_hub();
        let (a, mut rx_a) = ClientHandle::new();
        let (b, mut rx_b) = ClientHandle::new();
        let b_id = b.id.clone();
        hub.register(a);
        hub.register(b);

        hub.broadcast_to_all(alert(""));
        hub.send_to(&b_id, Message::new(MessageType::Pong));
        hub.stats().await;

        assert_eq!(rx_a.try_recv().unwrap().kind, MessageType::SafetyAlert);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().kind, MessageType::SafetyAlert);
        assert_eq!(rx_b.try_recv().unwrap().kind, MessageType::Pong);
    }

    #[tokio::test]
    async fn slow_client_drops_without_affecting_others() {
        let (hub, _cancel) = spawn_hub();
        let (slow, _rx_slow) = ClientHandle::new();
        let (fast, mut rx_fast) = ClientHandle::new();
        hub.register(slow);
        hub.register(fast);

        let extra = 10;
        for _ in 0..CLIENT_QUEUE_CAPACITY + extra {
            hub.broadcast_to_all(alert(""));
            // Keep the fast client drained.
            while rx_fast.try_recv().is_ok() {}
            hub.stats().await;
        }
        while rx_fast.try_recv().is_ok() {}

        let stats = hub.stats().await;
        assert_eq!(stats.clients, 2);
        assert_eq!(stats.dropped, extra as u64);
    }

    #[tokio::test]
    async fn unregister_closes_queue() {
        let (hub, _cancel) = spawn_hub();
        let (a, mut rx_a) = ClientHandle::new();
        let a_id = a.id.clone();
        hub.register(a);
        hub.subscribe(&a_id, "robot-1");
        assert_eq!(hub.subscriptions(&a_id).await, ["robot-1"]);

        hub.unregister(&a_id);
        assert_eq!(hub.stats().await, HubStats::default());
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_delivery() {
        let (hub, _cancel) = spawn_hub();
        let (a, rx_a) = ClientHandle::new();
        hub.register(a);
        drop(rx_a);

        hub.broadcast_to_all(alert(""));
        assert_eq!(hub.stats().await.clients, 0);
    }

    #[tokio::test]
    async fn stats_count_subscriptions() {
        let (hub, _cancel) = spawn_hub();
        let (a, _rx_a) = ClientHandle::new();
        let (b, _rx_b) = ClientHandle::new();
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        hub.register(a);
        hub.register(b);
        hub.subscribe(&a_id, "robot-1");
        hub.subscribe(&a_id, "robot-1");
        hub.subscribe(&a_id, "robot-2");
        hub.subscribe(&b_id, "robot-1");
        hub.unsubscribe(&a_id, "robot-2");

        let stats = hub.stats().await;
        assert_eq!(stats.clients, 2);
        assert_eq!(stats.subscriptions, 2);
    }

    #[tokio::test]
    async fn cancelled_hub_answers_with_defaults() {
        let (hub, runner) = Hub::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(runner.run(cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
        let (a, _rx) = ClientHandle::new();
        let a_id = a.id.clone();
        hub.register(a);
        assert_eq!(hub.stats().await, HubStats::default());
        assert!(hub.subscriptions(&a_id).await.is_empty());
    }
}
