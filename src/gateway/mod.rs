//! Session gateway - entry point for every session action
//!
//! The gateway owns the registry of live session actors and routes each
//! request to the actor for its session code. Sessions never share a lock;
//! work for one session is serialized inside its actor.

mod actor;
mod registry;

use actor::{Command, Services, SessionActor};
use registry::{SessionHandle, SessionRegistry};

use crate::collab::Collaborators;
use crate::config::{LivenessConfig, SessionsConfig};
use crate::error::{Result, SessionError};
use crate::hub::{BroadcastHub, ConnectionId, Disconnect, DisconnectCause, Subscriber};
use crate::scheduler::Clock;
use crate::session::{
    roles, CaseRef, Role, SessionCode, SessionConfig, SessionRecord, SessionSnapshot,
    SessionStore, UserId,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const MAILBOX_CAPACITY: usize = 64;

/// An action a participant asks the session to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Join the session (or rejoin after leaving) with a role
    Join { role: Role },
    /// Change role while already on the roster
    AssignRole { role: Role },
    /// Replace the session configuration (host, WAITING only)
    Configure { config: SessionConfig },
    /// Pick a specific case (host, WAITING only)
    SelectCase { case: CaseRef },
    /// Draw a random unused case for a new round
    NewCase,
    Start,
    SkipPhase,
    EndConsultation,
    SubmitFeedback {
        to: UserId,
        payload: serde_json::Value,
    },
    ForceComplete,
    Chat { text: String },
    Leave,
    EndSession,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::AssignRole { .. } => "assign_role",
            Self::Configure { .. } => "configure",
            Self::SelectCase { .. } => "select_case",
            Self::NewCase => "new_case",
            Self::Start => "start",
            Self::SkipPhase => "skip_phase",
            Self::EndConsultation => "end_consultation",
            Self::SubmitFeedback { .. } => "submit_feedback",
            Self::ForceComplete => "force_complete",
            Self::Chat { .. } => "chat",
            Self::Leave => "leave",
            Self::EndSession => "end_session",
        }
    }
}

/// Routes session actions to per-session actors.
pub struct SessionGateway {
    services: Services,
}

impl SessionGateway {
    /// Build a gateway and restore every live session found in `store`.
    pub async fn start(
        store: SessionStore,
        collab: Collaborators,
        limits: SessionsConfig,
    ) -> Result<Arc<Self>> {
        let (hub, disconnects) = BroadcastHub::new(limits.max_connections_per_session);
        let gateway = Arc::new(Self {
            services: Services {
                hub,
                store: Arc::new(store),
                collab,
                limits: Arc::new(limits),
                clock: Clock::new(),
                registry: SessionRegistry::default(),
            },
        });

        tokio::spawn(forward_disconnects(
            gateway.services.registry.clone(),
            disconnects,
        ));

        let restored = gateway.restore().await?;
        if restored > 0 {
            tracing::info!(count = restored, "Restored live sessions");
        }
        Ok(gateway)
    }

    /// Restored participants have no connection yet; each gets
    /// `reconnect_grace` to resubscribe before it counts as disconnected.
    async fn restore(&self) -> Result<usize> {
        let reconnect_by = tokio::time::Instant::now() + self.services.limits.reconnect_grace();
        let mut restored = 0;
        for record in self.services.store.load_live()? {
            let code = record.code.clone();
            let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
            let handle = SessionHandle {
                id: record.id,
                tx: tx.clone(),
            };
            if !self.services.registry.insert(code.clone(), handle).await {
                tracing::warn!(code = %code, id = %record.id, "Duplicate live session code, skipping");
                continue;
            }
            self.services.hub.open_topic(&code);
            SessionActor::spawn(record, rx, tx, self.services.clone(), Some(reconnect_by));
            restored += 1;
        }
        Ok(restored)
    }

    /// Create a session with `creator` on the roster as `role`.
    pub async fn create_session(
        &self,
        creator: &UserId,
        config: SessionConfig,
        role: Role,
    ) -> Result<SessionSnapshot> {
        config.validate(&self.services.limits)?;

        let id = self.services.store.allocate_id();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let code = self
            .services
            .registry
            .insert_unique(SessionHandle { id, tx: tx.clone() })
            .await;

        let now = self.services.clock.now();
        let mut record = SessionRecord::new(id, code.clone(), creator.clone(), config, now);
        let persisted = roles::try_assign_role(&mut record, creator, role, now)
            .and_then(|_| self.services.store.save(&record));
        if let Err(e) = persisted {
            self.services.registry.remove(&code, id).await;
            return Err(e);
        }

        self.services.hub.open_topic(&code);
        let snapshot = record.snapshot();
        SessionActor::spawn(record, rx, tx, self.services.clone(), None);

        tracing::info!(code = %code, id = %id, creator = %creator, "Session created");
        Ok(snapshot)
    }

    /// Perform `action` on behalf of `user`.
    pub async fn dispatch(
        &self,
        code: &SessionCode,
        user: &UserId,
        action: Action,
    ) -> Result<SessionSnapshot> {
        let user = user.clone();
        self.request(code, |reply| Command::Act {
            user,
            action,
            reply,
        })
        .await
    }

    /// Subscribe a connection to a session's events. The connection first
    /// receives a SESSION_UPDATE with the returned snapshot.
    pub async fn subscribe(
        &self,
        code: &SessionCode,
        subscriber: Subscriber,
    ) -> Result<SessionSnapshot> {
        self.request(code, |reply| Command::Subscribe { subscriber, reply })
            .await
    }

    /// Join `code` as `role` and subscribe the joining connection.
    ///
    /// Either both happen or neither: a session without room for the
    /// connection leaves the roster untouched.
    pub async fn join(
        &self,
        code: &SessionCode,
        role: Role,
        subscriber: Subscriber,
    ) -> Result<SessionSnapshot> {
        self.request(code, |reply| Command::JoinAndSubscribe {
            role,
            subscriber,
            reply,
        })
        .await
    }

    /// Current state, with any overdue deadline applied first.
    pub async fn snapshot(&self, code: &SessionCode) -> Result<SessionSnapshot> {
        self.request(code, |reply| Command::Snapshot { reply }).await
    }

    pub async fn available_roles(&self, code: &SessionCode) -> Result<Vec<Role>> {
        Ok(self.snapshot(code).await?.available_roles)
    }

    async fn request<T>(
        &self,
        code: &SessionCode,
        command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let unknown = || SessionError::not_found(format!("session {}", code));
        let handle = self.services.registry.get(code).await.ok_or_else(unknown)?;

        let (reply, response) = oneshot::channel();
        handle
            .tx
            .send(command(reply))
            .await
            .map_err(|_| unknown())?;
        response.await.map_err(|_| unknown())?
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.services.hub
    }

    pub fn limits(&self) -> &SessionsConfig {
        &self.services.limits
    }

    /// Report that a connection went away.
    pub fn connection_lost(&self, connection: &ConnectionId, cause: DisconnectCause) {
        self.services.hub.connection_lost(connection, cause);
    }

    /// Record a heartbeat or any other traffic from a connection.
    pub fn touch(&self, connection: &ConnectionId) {
        self.services.hub.touch(connection);
    }

    /// Codes of every session currently held in memory.
    pub async fn live_sessions(&self) -> Vec<SessionCode> {
        self.services.registry.codes().await
    }

    /// Periodically disconnect connections that stopped sending heartbeats.
    pub fn spawn_liveness_monitor(&self, liveness: LivenessConfig) -> JoinHandle<()> {
        let hub = Arc::clone(&self.services.hub);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(liveness.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = hub.sweep_stale(liveness.heartbeat_timeout());
                if swept > 0 {
                    tracing::info!(count = swept, "Swept silent connections");
                }
            }
        })
    }
}

/// Hand hub disconnect reports to the owning session actors.
async fn forward_disconnects(
    registry: SessionRegistry,
    mut disconnects: mpsc::UnboundedReceiver<Disconnect>,
) {
    while let Some(disconnect) = disconnects.recv().await {
        let Some(handle) = registry.get(&disconnect.code).await else {
            continue;
        };
        let command = Command::ConnectionLost {
            connection: disconnect.connection,
            user: disconnect.user,
            cause: disconnect.cause,
        };
        if handle.tx.send(command).await.is_err() {
            tracing::debug!(code = %disconnect.code, "Session gone before disconnect was delivered");
        }
    }
}
