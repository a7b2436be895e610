// Connection registry, topic table, and user-room table.
//
// All three tables live behind one lock so that "remove a member, then
// drop the container if it is now empty" cannot interleave with a
// concurrent subscribe and lose the new subscriber. Containers are
// created lazily on first membership and deleted the moment they empty;
// an empty topic or room never persists as a dangling entry.

use std::collections::{HashMap, HashSet};

use beacon_common::protocol::ws::NotifyMessage;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics;

/// Depth of each connection's outbound queue. A consumer that falls this
/// far behind is evicted (close-on-overflow).
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

pub type ConnectionId = Uuid;
pub type UserId = i64;

/// Frames queued for one connection, already serialized. The socket task
/// owns the receiving half; the registry owns the sender.
pub type OutboundSender = mpsc::Sender<String>;
pub type OutboundReceiver = mpsc::Receiver<String>;

#[derive(Debug)]
enum RoleState {
    Signaling { subscriptions: HashSet<String> },
    Notification { user_id: UserId },
}

#[derive(Debug)]
struct ConnectionRecord {
    outbound: OutboundSender,
    role: RoleState,
}

#[derive(Debug, Default)]
struct BrokerState {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    topics: HashMap<String, HashSet<ConnectionId>>,
    rooms: HashMap<UserId, HashSet<ConnectionId>>,
}

/// The authoritative in-memory registry of live connections.
///
/// Constructed once at startup and injected wherever delivery is needed;
/// holds no ambient global state.
#[derive(Debug, Default)]
pub struct Broker {
    state: RwLock<BrokerState>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signaling connection and hand back the receiving half
    /// of its outbound queue.
    pub async fn register_signaling(&self, connection_id: ConnectionId) -> OutboundReceiver {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let mut guard = self.state.write().await;
        guard.connections.insert(
            connection_id,
            ConnectionRecord {
                outbound: sender,
                role: RoleState::Signaling { subscriptions: HashSet::new() },
            },
        );
        metrics::set_open_connections(guard.connections.len());
        receiver
    }

    /// Register a notification connection and add it to its user's room,
    /// creating the room lazily.
    pub async fn register_notification(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> OutboundReceiver {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let mut guard = self.state.write().await;
        guard.connections.insert(
            connection_id,
            ConnectionRecord { outbound: sender, role: RoleState::Notification { user_id } },
        );
        guard.rooms.entry(user_id).or_default().insert(connection_id);
        metrics::set_open_connections(guard.connections.len());
        receiver
    }

    /// Add the connection to each named topic, creating topics lazily.
    /// Duplicate subscriptions and unknown connections are no-ops.
    pub async fn subscribe(&self, connection_id: ConnectionId, topics: &[String]) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(record) = state.connections.get_mut(&connection_id) else {
            return;
        };
        let RoleState::Signaling { subscriptions } = &mut record.role else {
            return;
        };

        for topic in topics {
            subscriptions.insert(topic.clone());
            state.topics.entry(topic.clone()).or_default().insert(connection_id);
        }
    }

    /// Remove the connection from each named topic. Absent topics or
    /// absent membership are no-ops; a topic left empty is deleted.
    pub async fn unsubscribe(&self, connection_id: ConnectionId, topics: &[String]) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(record) = state.connections.get_mut(&connection_id) else {
            return;
        };
        let RoleState::Signaling { subscriptions } = &mut record.role else {
            return;
        };

        for topic in topics {
            subscriptions.remove(topic);
            remove_topic_member(&mut state.topics, topic, connection_id);
        }
    }

    /// Relay a publish envelope to every subscriber of `topic`, annotated
    /// with the subscriber count at publish time. The publisher receives
    /// its own message when subscribed. Returns the count the message was
    /// addressed to, or `None` when the topic does not exist (the publish
    /// is dropped).
    pub async fn publish(&self, topic: &str, mut envelope: Map<String, Value>) -> Option<usize> {
        let (client_count, recipients) = {
            let guard = self.state.read().await;
            let members = guard.topics.get(topic)?;
            let recipients = members
                .iter()
                .filter_map(|id| guard.connections.get(id).map(|r| (*id, r.outbound.clone())))
                .collect::<Vec<_>>();
            (members.len(), recipients)
        };

        envelope.insert("clients".to_owned(), Value::from(client_count as u64));
        let frame = Value::Object(envelope).to_string();

        for (connection_id, sender) in recipients {
            if sender.try_send(frame.clone()).is_err() {
                warn!(conn_id = %connection_id, topic, "outbound queue overflow, evicting subscriber");
                metrics::increment_forced_closes();
                self.remove(connection_id).await;
            }
        }

        Some(client_count)
    }

    /// Push a notification payload to every open connection of `user_id`.
    /// A user with no open connections is a complete no-op; there is no
    /// queuing or offline store at this layer.
    pub async fn emit(&self, user_id: UserId, payload: Value) -> usize {
        let recipients = {
            let guard = self.state.read().await;
            let Some(members) = guard.rooms.get(&user_id) else {
                return 0;
            };
            members
                .iter()
                .filter_map(|id| guard.connections.get(id).map(|r| (*id, r.outbound.clone())))
                .collect::<Vec<_>>()
        };

        let Ok(frame) = serde_json::to_string(&NotifyMessage::Notification { payload }) else {
            return 0;
        };

        let mut delivered = 0;
        for (connection_id, sender) in recipients {
            if sender.try_send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(conn_id = %connection_id, user_id, "outbound queue overflow, evicting device");
                metrics::increment_forced_closes();
                self.remove(connection_id).await;
            }
        }

        metrics::add_notifications_emitted(delivered as u64);
        delivered
    }

    /// Remove a connection from the registry and from every topic or room
    /// it belonged to, deleting containers left empty. Idempotent; returns
    /// false when the connection was already gone.
    pub async fn remove(&self, connection_id: ConnectionId) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(record) = state.connections.remove(&connection_id) else {
            return false;
        };

        match record.role {
            RoleState::Signaling { subscriptions } => {
                for topic in &subscriptions {
                    remove_topic_member(&mut state.topics, topic, connection_id);
                }
            }
            RoleState::Notification { user_id } => {
                if let Some(members) = state.rooms.get_mut(&user_id) {
                    members.remove(&connection_id);
                    if members.is_empty() {
                        state.rooms.remove(&user_id);
                    }
                }
            }
        }

        metrics::set_open_connections(state.connections.len());
        debug!(conn_id = %connection_id, "connection removed from registry");
        true
    }

    /// Drop every connection and clear all tables. Outbound queues close
    /// as their senders are dropped, which ends each socket task.
    pub async fn shutdown(&self) {
        let mut guard = self.state.write().await;
        guard.connections.clear();
        guard.topics.clear();
        guard.rooms.clear();
        metrics::set_open_connections(0);
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// `None` when the topic does not exist, distinct from an empty set,
    /// which the delete-when-empty invariant makes unrepresentable.
    pub async fn topic_subscriber_count(&self, topic: &str) -> Option<usize> {
        self.state.read().await.topics.get(topic).map(HashSet::len)
    }

    pub async fn room_size(&self, user_id: UserId) -> Option<usize> {
        self.state.read().await.rooms.get(&user_id).map(HashSet::len)
    }
}

fn remove_topic_member(
    topics: &mut HashMap<String, HashSet<ConnectionId>>,
    topic: &str,
    connection_id: ConnectionId,
) {
    if let Some(members) = topics.get_mut(topic) {
        members.remove(&connection_id);
        if members.is_empty() {
            topics.remove(topic);
        }
    }
}
