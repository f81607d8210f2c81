//! Broadcast hub - per-session topics, fan-out, connection liveness

mod event;

pub use event::{Envelope, SessionEvent};

use crate::error::{Result, SessionError};
use crate::session::{SessionCode, SessionSnapshot, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use uuid::Uuid;

/// Identifies one client connection
pub type ConnectionId = Uuid;

/// A connection asking to receive a session's events
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection: ConnectionId,
    pub user: UserId,
    pub sender: mpsc::Sender<Envelope>,
}

/// Why a connection stopped receiving events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Transport closed or errored
    Closed,
    /// The client said it was leaving
    Leaving,
    /// No heartbeat within the liveness window
    HeartbeatTimeout,
    /// The connection's event queue overflowed
    Lagged,
}

/// Notification handed to the gateway when a subscribed connection goes away
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub code: SessionCode,
    pub connection: ConnectionId,
    pub user: UserId,
    pub cause: DisconnectCause,
}

struct Topic {
    next_seq: u64,
    subscribers: HashMap<ConnectionId, (UserId, mpsc::Sender<Envelope>)>,
}

struct ConnectionEntry {
    code: SessionCode,
    user: UserId,
    last_seen: Instant,
}

/// Fans session events out to subscribed connections.
///
/// Each session code has its own topic behind its own lock, so publishing for
/// one session never waits on another. Publishes for a given code come from
/// that session's actor only, which is what makes delivery per-session FIFO.
pub struct BroadcastHub {
    topics: RwLock<HashMap<SessionCode, Arc<Mutex<Topic>>>>,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    disconnects: mpsc::UnboundedSender<Disconnect>,
    max_per_topic: usize,
}

impl BroadcastHub {
    /// Create a hub and the receiver on which disconnects are reported.
    pub fn new(max_per_topic: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Disconnect>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            topics: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            disconnects: tx,
            max_per_topic,
        });
        (hub, rx)
    }

    /// Create the topic for a session. Existing topics are kept.
    pub fn open_topic(&self, code: &SessionCode) {
        self.topics.write().entry(code.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(Topic {
                next_seq: 1,
                subscribers: HashMap::new(),
            }))
        });
    }

    /// Drop a session's topic and every subscription to it.
    pub fn close_topic(&self, code: &SessionCode) {
        let Some(topic) = self.topics.write().remove(code) else {
            return;
        };
        let removed: Vec<ConnectionId> = topic.lock().subscribers.drain().map(|(id, _)| id).collect();
        let mut connections = self.connections.lock();
        for id in removed {
            connections.remove(&id);
        }
        tracing::debug!(code = %code, "Topic closed");
    }

    fn topic(&self, code: &SessionCode) -> Option<Arc<Mutex<Topic>>> {
        self.topics.read().get(code).cloned()
    }

    /// Fail when `code` has no room for `connection`.
    ///
    /// A connection already subscribed to `code` always fits.
    pub fn check_capacity(&self, code: &SessionCode, connection: &ConnectionId) -> Result<()> {
        let topic = self
            .topic(code)
            .ok_or_else(|| SessionError::not_found(format!("session {}", code)))?;
        let topic = topic.lock();
        self.ensure_room(code, &topic, connection)
    }

    fn ensure_room(&self, code: &SessionCode, topic: &Topic, connection: &ConnectionId) -> Result<()> {
        if !topic.subscribers.contains_key(connection)
            && topic.subscribers.len() >= self.max_per_topic
        {
            return Err(SessionError::validation(format!(
                "session {} has reached its connection limit",
                code
            )));
        }
        Ok(())
    }

    /// Subscribe a connection, first delivering `snapshot` to it alone.
    ///
    /// A connection belongs to at most one topic. Subscribing elsewhere moves
    /// it, and the session it left is told the connection is gone.
    pub fn subscribe(
        &self,
        code: &SessionCode,
        subscriber: Subscriber,
        snapshot: SessionSnapshot,
    ) -> Result<()> {
        let topic = self
            .topic(code)
            .ok_or_else(|| SessionError::not_found(format!("session {}", code)))?;
        let previous = self
            .connection_code(&subscriber.connection)
            .filter(|previous| previous != code);

        {
            let mut topic = topic.lock();
            self.ensure_room(code, &topic, &subscriber.connection)?;

            let initial = Envelope {
                code: code.clone(),
                seq: topic.next_seq - 1,
                event: SessionEvent::SessionUpdate { snapshot },
            };
            subscriber.sender.try_send(initial).map_err(|_| {
                SessionError::validation("connection is not accepting events")
            })?;

            topic.subscribers.insert(
                subscriber.connection,
                (subscriber.user.clone(), subscriber.sender),
            );
        }
        self.connections.lock().insert(
            subscriber.connection,
            ConnectionEntry {
                code: code.clone(),
                user: subscriber.user.clone(),
                last_seen: Instant::now(),
            },
        );

        // one topic lock at a time: the old topic is only touched once the new one is released
        if let Some(previous) = previous {
            let left = self
                .topic(&previous)
                .and_then(|t| t.lock().subscribers.remove(&subscriber.connection));
            if let Some((user, _)) = left {
                tracing::info!(from = %previous, to = %code, user = %user, "Connection moved to another session");
                self.report(Disconnect {
                    code: previous,
                    connection: subscriber.connection,
                    user,
                    cause: DisconnectCause::Leaving,
                });
            }
        }

        tracing::debug!(code = %code, user = %subscriber.user, connection = %subscriber.connection, "Subscribed");
        Ok(())
    }

    /// Remove a connection's subscription. Returns the session and user it had.
    pub fn unsubscribe(&self, connection: &ConnectionId) -> Option<(SessionCode, UserId)> {
        let entry = self.connections.lock().remove(connection)?;
        if let Some(topic) = self.topic(&entry.code) {
            topic.lock().subscribers.remove(connection);
        }
        Some((entry.code, entry.user))
    }

    /// Remove every subscription `user` holds on `code`.
    pub fn unsubscribe_user(&self, code: &SessionCode, user: &UserId) {
        let Some(topic) = self.topic(code) else {
            return;
        };
        let removed: Vec<ConnectionId> = {
            let mut topic = topic.lock();
            let ids: Vec<ConnectionId> = topic
                .subscribers
                .iter()
                .filter(|(_, (u, _))| u == user)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                topic.subscribers.remove(id);
            }
            ids
        };
        let mut connections = self.connections.lock();
        for id in removed {
            connections.remove(&id);
        }
    }

    /// Publish an event to every subscriber of `code`. Returns its sequence number.
    ///
    /// Subscribers whose queue is full or closed are dropped and reported as
    /// disconnected.
    pub fn publish(&self, code: &SessionCode, event: SessionEvent) -> Option<u64> {
        let topic = self.topic(code)?;
        let mut dropped = Vec::new();

        let seq = {
            let mut topic = topic.lock();
            let seq = topic.next_seq;
            topic.next_seq += 1;

            let envelope = Envelope {
                code: code.clone(),
                seq,
                event,
            };
            tracing::debug!(
                code = %code,
                seq,
                event = envelope.event.name(),
                subscribers = topic.subscribers.len(),
                "Publishing"
            );

            for (id, (user, sender)) in &topic.subscribers {
                match sender.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(code = %code, connection = %id, "Dropping slow subscriber");
                        dropped.push((*id, user.clone(), DisconnectCause::Lagged));
                    }
                    Err(TrySendError::Closed(_)) => {
                        dropped.push((*id, user.clone(), DisconnectCause::Closed));
                    }
                }
            }
            for (id, _, _) in &dropped {
                topic.subscribers.remove(id);
            }
            seq
        };

        if !dropped.is_empty() {
            let mut connections = self.connections.lock();
            for (id, _, _) in &dropped {
                connections.remove(id);
            }
        }
        for (connection, user, cause) in dropped {
            self.report(Disconnect {
                code: code.clone(),
                connection,
                user,
                cause,
            });
        }

        Some(seq)
    }

    /// Record activity on a connection.
    pub fn touch(&self, connection: &ConnectionId) {
        if let Some(entry) = self.connections.lock().get_mut(connection) {
            entry.last_seen = Instant::now();
        }
    }

    /// A connection closed, errored, or announced it is leaving.
    pub fn connection_lost(&self, connection: &ConnectionId, cause: DisconnectCause) {
        if let Some((code, user)) = self.unsubscribe(connection) {
            tracing::info!(code = %code, user = %user, cause = ?cause, "Connection lost");
            self.report(Disconnect {
                code,
                connection: *connection,
                user,
                cause,
            });
        }
    }

    /// Disconnect every connection silent for longer than `timeout`.
    pub fn sweep_stale(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .connections
            .lock()
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.connection_lost(id, DisconnectCause::HeartbeatTimeout);
        }
        stale.len()
    }

    /// Whether `user` still has a subscribed connection on `code`.
    pub fn has_live_connection(&self, code: &SessionCode, user: &UserId) -> bool {
        self.topic(code)
            .map(|t| t.lock().subscribers.values().any(|(u, _)| u == user))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, code: &SessionCode) -> usize {
        self.topic(code)
            .map(|t| t.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// The session a connection is subscribed to, if any.
    pub fn connection_code(&self, connection: &ConnectionId) -> Option<SessionCode> {
        self.connections
            .lock()
            .get(connection)
            .map(|e| e.code.clone())
    }

    fn report(&self, disconnect: Disconnect) {
        if self.disconnects.send(disconnect).is_err() {
            tracing::debug!("Disconnect receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionsConfig;
    use crate::session::{SessionConfig, SessionId, SessionRecord};
    use chrono::Utc;

    fn code() -> SessionCode {
        SessionCode::parse("HUB001").unwrap()
    }

    fn snapshot() -> SessionSnapshot {
        SessionRecord::new(
            SessionId(1),
            code(),
            UserId::new("host"),
            SessionConfig::topics(vec!["gi".into()], &SessionsConfig::default()),
            Utc::now(),
        )
        .snapshot()
    }

    fn subscriber(user: &str, buffer: usize) -> (Subscriber, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Subscriber {
                connection: Uuid::new_v4(),
                user: UserId::new(user),
                sender: tx,
            },
            rx,
        )
    }

    fn chat(text: &str) -> SessionEvent {
        SessionEvent::ChatMessage {
            from: UserId::new("a"),
            role: crate::session::Role::Doctor,
            text: text.to_string(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_in_order_with_sequence() {
        let (hub, _rx) = BroadcastHub::new(8);
        hub.open_topic(&code());

        let (sub_a, mut rx_a) = subscriber("a", 16);
        let (sub_b, mut rx_b) = subscriber("b", 16);
        hub.subscribe(&code(), sub_a, snapshot()).unwrap();
        hub.subscribe(&code(), sub_b, snapshot()).unwrap();

        for i in 0..5 {
            hub.publish(&code(), chat(&i.to_string()));
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let first = rx.recv().await.unwrap();
            assert_eq!(first.event.name(), "SESSION_UPDATE");
            assert_eq!(first.seq, 0);
            for expected in 1..=5u64 {
                let env = rx.recv().await.unwrap();
                assert_eq!(env.seq, expected);
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_topic_is_none() {
        let (hub, _rx) = BroadcastHub::new(8);
        assert_eq!(hub.publish(&code(), chat("x")), None);
    }

    #[tokio::test]
    async fn test_connection_lost_reports_disconnect() {
        let (hub, mut disconnects) = BroadcastHub::new(8);
        hub.open_topic(&code());
        let (sub, _rx) = subscriber("doc", 4);
        let connection = sub.connection;
        hub.subscribe(&code(), sub, snapshot()).unwrap();
        assert!(hub.has_live_connection(&code(), &UserId::new("doc")));

        hub.connection_lost(&connection, DisconnectCause::Leaving);

        let report = disconnects.recv().await.unwrap();
        assert_eq!(report.user, UserId::new("doc"));
        assert_eq!(report.cause, DisconnectCause::Leaving);
        assert!(!hub.has_live_connection(&code(), &UserId::new("doc")));

        // second loss of the same connection is silent
        hub.connection_lost(&connection, DisconnectCause::Closed);
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let (hub, mut disconnects) = BroadcastHub::new(8);
        hub.open_topic(&code());
        let (sub, _rx) = subscriber("slow", 1);
        hub.subscribe(&code(), sub, snapshot()).unwrap();

        // snapshot filled the only slot
        hub.publish(&code(), chat("overflow"));

        let report = disconnects.recv().await.unwrap();
        assert_eq!(report.cause, DisconnectCause::Lagged);
        assert_eq!(hub.subscriber_count(&code()), 0);
    }

    #[tokio::test]
    async fn test_topic_connection_limit() {
        let (hub, _rx) = BroadcastHub::new(1);
        hub.open_topic(&code());
        let (first, _r1) = subscriber("a", 4);
        let (second, _r2) = subscriber("b", 4);
        hub.subscribe(&code(), first, snapshot()).unwrap();
        assert!(hub.subscribe(&code(), second, snapshot()).is_err());
    }

    #[tokio::test]
    async fn test_full_topic_keeps_existing_subscription() {
        let (hub, mut disconnects) = BroadcastHub::new(1);
        let other = SessionCode::parse("HUB002").unwrap();
        hub.open_topic(&code());
        hub.open_topic(&other);
        let (occupant, _r1) = subscriber("a", 4);
        hub.subscribe(&other, occupant, snapshot()).unwrap();

        let (mover, _r2) = subscriber("b", 4);
        let connection = mover.connection;
        hub.subscribe(&code(), mover.clone(), snapshot()).unwrap();
        assert!(hub.check_capacity(&other, &connection).is_err());
        assert!(hub.subscribe(&other, mover, snapshot()).is_err());

        assert_eq!(hub.connection_code(&connection), Some(code()));
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_moving_connection_reports_leaving() {
        let (hub, mut disconnects) = BroadcastHub::new(8);
        let other = SessionCode::parse("HUB002").unwrap();
        hub.open_topic(&code());
        hub.open_topic(&other);

        let (sub, _rx) = subscriber("doc", 4);
        let connection = sub.connection;
        hub.subscribe(&code(), sub.clone(), snapshot()).unwrap();
        hub.subscribe(&other, sub, snapshot()).unwrap();

        let report = disconnects.recv().await.unwrap();
        assert_eq!(report.code, code());
        assert_eq!(report.connection, connection);
        assert_eq!(report.cause, DisconnectCause::Leaving);
        assert!(!hub.has_live_connection(&code(), &UserId::new("doc")));
        assert_eq!(hub.connection_code(&connection), Some(other.clone()));

        // losing the connection now only concerns the second session
        hub.connection_lost(&connection, DisconnectCause::Closed);
        assert_eq!(disconnects.recv().await.unwrap().code, other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stale_connections() {
        let (hub, mut disconnects) = BroadcastHub::new(8);
        hub.open_topic(&code());
        let (quiet, _r1) = subscriber("quiet", 4);
        let (chatty, _r2) = subscriber("chatty", 4);
        let chatty_id = chatty.connection;
        hub.subscribe(&code(), quiet, snapshot()).unwrap();
        hub.subscribe(&code(), chatty, snapshot()).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        hub.touch(&chatty_id);
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(hub.sweep_stale(Duration::from_secs(30)), 1);
        let report = disconnects.recv().await.unwrap();
        assert_eq!(report.user, UserId::new("quiet"));
        assert_eq!(report.cause, DisconnectCause::HeartbeatTimeout);
        assert_eq!(hub.subscriber_count(&code()), 1);
    }

    #[tokio::test]
    async fn test_close_topic_drops_subscriptions() {
        let (hub, _rx) = BroadcastHub::new(8);
        hub.open_topic(&code());
        let (sub, mut rx) = subscriber("a", 4);
        let connection = sub.connection;
        hub.subscribe(&code(), sub, snapshot()).unwrap();

        hub.close_topic(&code());
        assert!(hub.connection_code(&connection).is_none());

        let _snapshot = rx.recv().await.unwrap();
        assert!(rx.recv().await.is_none(), "sender dropped with the topic");
    }
}
