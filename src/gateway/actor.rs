//! Per-session actor owning the authoritative record
//!
//! Actions, timer fires, and disconnects for one session all arrive on the
//! actor's mailbox and are applied one at a time. Each is run against a copy
//! of the record; the copy replaces the record only after it has been saved,
//! and its events are published only after that.

use super::registry::SessionRegistry;
use super::Action;
use crate::collab::{CaseSelection, CollaboratorError, Collaborators};
use crate::config::SessionsConfig;
use crate::error::{Result, SessionError};
use crate::hub::{BroadcastHub, ConnectionId, DisconnectCause, SessionEvent, Subscriber};
use crate::scheduler::{self, Clock, PhaseTimer};
use crate::session::{
    roles, CaseRef, Phase, Role, SessionConfig, SessionRecord, SessionSnapshot, SessionStore,
    UserId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Delay before retrying a deadline transition that could not be persisted
const TIMER_RETRY: Duration = Duration::from_secs(1);

pub(crate) enum Command {
    Act {
        user: UserId,
        action: Action,
        reply: oneshot::Sender<Result<SessionSnapshot>>,
    },
    Subscribe {
        subscriber: Subscriber,
        reply: oneshot::Sender<Result<SessionSnapshot>>,
    },
    /// Join with `role` and subscribe the joining connection, or neither
    JoinAndSubscribe {
        role: Role,
        subscriber: Subscriber,
        reply: oneshot::Sender<Result<SessionSnapshot>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<SessionSnapshot>>,
    },
    TimerFired {
        generation: u64,
    },
    ConnectionLost {
        connection: ConnectionId,
        user: UserId,
        cause: DisconnectCause,
    },
}

/// Services shared by the gateway and every actor
#[derive(Clone)]
pub(crate) struct Services {
    pub hub: Arc<BroadcastHub>,
    pub store: Arc<SessionStore>,
    pub collab: Collaborators,
    pub limits: Arc<SessionsConfig>,
    pub clock: Clock,
    pub registry: SessionRegistry,
}

/// Collaborator results fetched before the record is touched
enum Prepared {
    Nothing,
    /// `None` when the catalog had nothing left to offer
    Case(Option<CaseRef>),
}

pub(crate) struct SessionActor {
    record: SessionRecord,
    inbox: mpsc::Receiver<Command>,
    mailbox: mpsc::Sender<Command>,
    services: Services,
    timer: PhaseTimer,
    /// Restored sessions wait this long for their participants to resubscribe
    reconnect_by: Option<Instant>,
    evict_at: Option<Instant>,
}

impl SessionActor {
    pub fn spawn(
        record: SessionRecord,
        inbox: mpsc::Receiver<Command>,
        mailbox: mpsc::Sender<Command>,
        services: Services,
        reconnect_by: Option<Instant>,
    ) {
        let actor = Self {
            record,
            inbox,
            mailbox,
            services,
            timer: PhaseTimer::new(),
            reconnect_by,
            evict_at: None,
        };
        tokio::spawn(actor.run());
    }

    async fn run(mut self) {
        tracing::debug!(code = %self.record.code, id = %self.record.id, "Session actor started");

        // restored sessions may have missed deadlines while the server was down
        if let Err(e) = self.replay_overdue() {
            tracing::error!(code = %self.record.code, error = %e, "Failed to replay overdue deadlines");
        }
        self.sync_timer();

        loop {
            let command = tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => Some(command),
                    None => break,
                },
                _ = wait_until(self.reconnect_by) => None,
                _ = wait_until(self.evict_at) => break,
            };
            match command {
                Some(command) => self.handle(command).await,
                None => {
                    self.reconnect_by = None;
                    self.drop_absent();
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Act {
                user,
                action,
                reply,
            } => {
                let name = action.name();
                let result = self.act(&user, action).await;
                if let Err(e) = &result {
                    tracing::debug!(code = %self.record.code, user = %user, action = name, error = %e, "Action rejected");
                }
                let _ = reply.send(result);
            }
            Command::Subscribe { subscriber, reply } => {
                let _ = reply.send(self.subscribe(subscriber));
            }
            Command::JoinAndSubscribe {
                role,
                subscriber,
                reply,
            } => {
                let user = subscriber.user.clone();
                let result = self.join_and_subscribe(role, subscriber);
                if let Err(e) = &result {
                    tracing::debug!(code = %self.record.code, user = %user, action = "join", error = %e, "Action rejected");
                }
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let result = self.replay_overdue().map(|_| self.record.snapshot());
                let _ = reply.send(result);
            }
            Command::TimerFired { generation } => self.on_timer(generation),
            Command::ConnectionLost {
                connection,
                user,
                cause,
            } => self.on_connection_lost(connection, user, cause),
        }
    }

    async fn act(&mut self, user: &UserId, action: Action) -> Result<SessionSnapshot> {
        self.replay_overdue()?;
        let prepared = self.prepare(user, &action).await?;

        let leaving = matches!(action, Action::Leave);
        let limits = Arc::clone(&self.services.limits);
        self.commit(|record, now| apply(record, user, action, prepared, &limits, now))?;

        if leaving {
            self.services.hub.unsubscribe_user(&self.record.code, user);
        }
        Ok(self.record.snapshot())
    }

    /// Validate against current state and call out to collaborators.
    async fn prepare(&self, user: &UserId, action: &Action) -> Result<Prepared> {
        let record = &self.record;
        match action {
            Action::Start => {
                scheduler::check_start(record, user)?;
                if record.selected_case.is_some() {
                    return Ok(Prepared::Nothing);
                }
                let case = self.fetch_case(&record.config.selection()).await?;
                Ok(Prepared::Case(Some(case)))
            }
            Action::SelectCase { case } => {
                check_case_change(record, user, true)?;
                let case = self
                    .fetch_case(&CaseSelection::Specific(case.clone()))
                    .await?;
                Ok(Prepared::Case(Some(case)))
            }
            Action::NewCase => {
                check_case_change(record, user, false)?;
                match self.fetch_case(&record.config.selection()).await {
                    Ok(case) => Ok(Prepared::Case(Some(case))),
                    Err(CollaboratorError::NotFound(what)) => {
                        tracing::info!(code = %record.code, what = %what, "No case left to assign");
                        Ok(Prepared::Case(None))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Action::SubmitFeedback { to, payload } => {
                scheduler::check_feedback(record, user, to)?;
                let ack = self
                    .services
                    .collab
                    .feedback
                    .record_feedback(record.id, user, to, payload)
                    .await?;
                tracing::debug!(code = %record.code, feedback_id = %ack.feedback_id, "Feedback recorded");
                Ok(Prepared::Nothing)
            }
            _ => Ok(Prepared::Nothing),
        }
    }

    async fn fetch_case(
        &self,
        selection: &CaseSelection,
    ) -> std::result::Result<CaseRef, CollaboratorError> {
        self.services
            .collab
            .cases
            .fetch_or_assign_case(selection, &self.record.used_cases)
            .await
    }

    /// Run `mutate` on a copy of the record, persist it, swap it in, then publish.
    fn commit<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut SessionRecord, DateTime<Utc>) -> Result<Vec<SessionEvent>>,
    {
        let now = self.services.clock.now();
        let mut next = self.record.clone();
        let events = mutate(&mut next, now)?;

        if next != self.record {
            if let Err(e) = self.services.store.save(&next) {
                tracing::error!(code = %next.code, error = %e, "Failed to persist session");
                return Err(e);
            }
        }

        let ended = next.is_terminal() && !self.record.is_terminal();
        self.record = next;

        for event in events {
            self.services.hub.publish(&self.record.code, event);
        }
        self.sync_timer();

        if ended {
            self.on_ended();
        }
        Ok(())
    }

    /// Apply any deadline that passed without its timer firing.
    fn replay_overdue(&mut self) -> Result<()> {
        self.commit(|record, now| Ok(scheduler::catch_up(record, now)))
    }

    /// Make the armed timer match the current phase's deadline.
    fn sync_timer(&mut self) {
        let generation = self.record.phase_generation;
        match scheduler::phase_window(&self.record).deadline {
            Some(deadline) => {
                if self.timer.armed_generation() != Some(generation) {
                    let at = self.services.clock.instant_at(deadline);
                    self.timer.arm(
                        generation,
                        at,
                        self.mailbox.clone(),
                        Command::TimerFired { generation },
                    );
                    tracing::debug!(code = %self.record.code, generation, deadline = %deadline, "Timer armed");
                }
            }
            None => self.timer.cancel(),
        }
    }

    fn on_timer(&mut self, generation: u64) {
        self.timer.fired(generation);

        if generation != self.record.phase_generation || self.record.is_terminal() {
            tracing::debug!(
                code = %self.record.code,
                generation,
                current = self.record.phase_generation,
                "Ignoring stale timer"
            );
            return;
        }

        let result =
            self.commit(|record, now| Ok(scheduler::expire(record, generation, now).unwrap_or_default()));
        match result {
            Ok(()) => self.sync_timer(),
            Err(e) => {
                tracing::warn!(code = %self.record.code, error = %e, "Deadline transition failed, retrying");
                self.timer.arm(
                    generation,
                    Instant::now() + TIMER_RETRY,
                    self.mailbox.clone(),
                    Command::TimerFired { generation },
                );
            }
        }
    }

    fn subscribe(&mut self, subscriber: Subscriber) -> Result<SessionSnapshot> {
        self.replay_overdue()?;
        scheduler::ensure_live(&self.record)?;
        if self.record.active_participant(&subscriber.user).is_none() {
            return Err(SessionError::forbidden("join the session before subscribing"));
        }
        let snapshot = self.record.snapshot();
        self.services
            .hub
            .subscribe(&self.record.code, subscriber, snapshot.clone())?;
        Ok(snapshot)
    }

    /// Join and subscribe as one step.
    ///
    /// Room on the topic is checked before the roster changes. If the
    /// subscription still fails, a newcomer is taken back off the roster
    /// through the disconnect path.
    fn join_and_subscribe(&mut self, role: Role, subscriber: Subscriber) -> Result<SessionSnapshot> {
        self.replay_overdue()?;
        scheduler::ensure_live(&self.record)?;
        self.services
            .hub
            .check_capacity(&self.record.code, &subscriber.connection)?;

        let user = subscriber.user.clone();
        let was_active = self.record.active_participant(&user).is_some();
        self.commit(|record, now| join(record, &user, role, now))?;

        match self.subscribe(subscriber) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                if !was_active {
                    tracing::warn!(code = %self.record.code, user = %user, error = %e, "Subscription failed, undoing join");
                    if let Err(undo) = self.commit(|record, now| leave(record, &user, now, true)) {
                        tracing::error!(code = %self.record.code, user = %user, error = %undo, "Failed to undo join");
                    }
                }
                Err(e)
            }
        }
    }

    /// Treat every active participant without a connection as disconnected.
    fn drop_absent(&mut self) {
        let code = self.record.code.clone();
        let absent: Vec<UserId> = self
            .record
            .active_participants()
            .filter(|p| !self.services.hub.has_live_connection(&code, &p.user_id))
            .map(|p| p.user_id.clone())
            .collect();

        for user in absent {
            if self.record.is_terminal() {
                break;
            }
            tracing::info!(code = %code, user = %user, "Participant did not reconnect after restart");
            let result = self
                .replay_overdue()
                .and_then(|_| self.commit(|record, now| leave(record, &user, now, true)));
            if let Err(e) = result {
                tracing::error!(code = %code, user = %user, error = %e, "Failed to apply disconnect");
            }
        }
    }

    fn on_connection_lost(&mut self, connection: ConnectionId, user: UserId, cause: DisconnectCause) {
        let code = self.record.code.clone();
        if self.services.hub.has_live_connection(&code, &user) {
            tracing::debug!(code = %code, user = %user, connection = %connection, "User still connected elsewhere");
            return;
        }
        if self.record.is_terminal() || self.record.active_participant(&user).is_none() {
            return;
        }

        tracing::info!(code = %code, user = %user, cause = ?cause, "Participant disconnected");
        let result = self
            .replay_overdue()
            .and_then(|_| self.commit(|record, now| leave(record, &user, now, true)));
        if let Err(e) = result {
            tracing::error!(code = %code, user = %user, error = %e, "Failed to apply disconnect");
        }
    }

    fn on_ended(&mut self) {
        self.timer.cancel();
        self.reconnect_by = None;
        self.services.hub.close_topic(&self.record.code);
        self.evict_at = Some(Instant::now() + self.services.limits.retain_ended());
    }

    async fn shutdown(&mut self) {
        self.timer.cancel();
        self.services
            .registry
            .remove(&self.record.code, self.record.id)
            .await;
        self.services.hub.close_topic(&self.record.code);
        tracing::info!(code = %self.record.code, id = %self.record.id, "Session evicted");
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Apply an action whose guards and collaborator calls have passed.
fn apply(
    record: &mut SessionRecord,
    user: &UserId,
    action: Action,
    prepared: Prepared,
    limits: &SessionsConfig,
    now: DateTime<Utc>,
) -> Result<Vec<SessionEvent>> {
    match action {
        Action::Join { role } => join(record, user, role, now),
        Action::AssignRole { role } => {
            if record.active_participant(user).is_none() {
                return Err(SessionError::not_found(format!(
                    "{} has not joined session {}",
                    user, record.code
                )));
            }
            join(record, user, role, now)
        }
        Action::Configure { config } => configure(record, user, config, limits),
        Action::SelectCase { .. } => {
            check_case_change(record, user, true)?;
            assign_case(record, prepared)
        }
        Action::NewCase => {
            check_case_change(record, user, false)?;
            assign_case(record, prepared)
        }
        Action::Start => {
            if let Prepared::Case(Some(case)) = prepared {
                record.assign_case(case);
            }
            let mut events = scheduler::start(record, user, now)?;
            events.push(SessionEvent::session_update(record));
            Ok(events)
        }
        Action::SkipPhase => scheduler::skip(record, user, now),
        Action::EndConsultation => scheduler::end_consultation(record, user, now),
        Action::SubmitFeedback { to, .. } => scheduler::record_feedback(record, user, &to, now),
        Action::ForceComplete => scheduler::force_complete(record, user, now),
        Action::Chat { text } => chat(record, user, text, limits, now),
        Action::Leave => leave(record, user, now, false),
        Action::EndSession => scheduler::end_by_host(record, user, now),
    }
}

fn join(record: &mut SessionRecord, user: &UserId, role: Role, now: DateTime<Utc>) -> Result<Vec<SessionEvent>> {
    let assignment = roles::try_assign_role(record, user, role, now)?;

    let mut events = Vec::new();
    if assignment.role_changed() {
        events.push(SessionEvent::RoleChange {
            user_id: user.clone(),
            previous: assignment.previous_role,
            role,
        });
    }
    if assignment.joined || assignment.rejoined || assignment.role_changed() {
        tracing::info!(code = %record.code, user = %user, role = %role, "Participant joined");
        events.push(SessionEvent::participant_update(record));
    }
    Ok(events)
}

fn leave(
    record: &mut SessionRecord,
    user: &UserId,
    now: DateTime<Utc>,
    disconnected: bool,
) -> Result<Vec<SessionEvent>> {
    scheduler::ensure_live(record)?;
    let role = roles::release(record, user, now)?;

    let mut events = vec![
        SessionEvent::UserLeft {
            user_id: user.clone(),
            role,
            disconnected,
        },
        SessionEvent::participant_update(record),
    ];
    events.extend(scheduler::after_departure(record, now, disconnected));
    Ok(events)
}

fn configure(
    record: &mut SessionRecord,
    user: &UserId,
    config: SessionConfig,
    limits: &SessionsConfig,
) -> Result<Vec<SessionEvent>> {
    scheduler::ensure_live(record)?;
    if !record.is_host(user) {
        return Err(SessionError::forbidden("only the host can configure the session"));
    }
    if record.phase != Phase::Waiting {
        return Err(SessionError::invalid_transition(
            "configuration is locked once the session has started",
        ));
    }
    config.validate(limits)?;

    if config.selection() != record.config.selection() {
        record.selected_case = None;
    }
    record.config = config;
    Ok(vec![SessionEvent::session_update(record)])
}

/// SelectCase is host-only; NewCase is also open to the doctor.
fn check_case_change(record: &SessionRecord, user: &UserId, host_only: bool) -> Result<()> {
    scheduler::ensure_live(record)?;
    let allowed = record.is_host(user)
        || (!host_only && record.role_of(user) == Some(Role::Doctor));
    if !allowed {
        return Err(SessionError::forbidden(if host_only {
            "only the host can pick a case"
        } else {
            "only the host or the DOCTOR can draw a new case"
        }));
    }
    if record.phase != Phase::Waiting {
        return Err(SessionError::invalid_transition(
            "cases can only change while the session is waiting",
        ));
    }
    Ok(())
}

fn assign_case(record: &mut SessionRecord, prepared: Prepared) -> Result<Vec<SessionEvent>> {
    match prepared {
        Prepared::Case(Some(case)) => {
            tracing::info!(code = %record.code, case = %case, round = record.current_round + 1, "Case assigned");
            record.assign_case(case);
            Ok(vec![SessionEvent::session_update(record)])
        }
        Prepared::Case(None) => {
            record.selected_case = None;
            Ok(vec![
                SessionEvent::session_update(record),
                SessionEvent::TopicSelectionNeeded {
                    session_type: record.config.session_type,
                    round: record.current_round,
                },
            ])
        }
        Prepared::Nothing => Err(SessionError::invalid_transition("no case was fetched")),
    }
}

fn chat(
    record: &mut SessionRecord,
    user: &UserId,
    text: String,
    limits: &SessionsConfig,
    now: DateTime<Utc>,
) -> Result<Vec<SessionEvent>> {
    scheduler::ensure_live(record)?;
    let role = record
        .role_of(user)
        .ok_or_else(|| SessionError::forbidden("join the session before chatting"))?;

    let text = text.trim();
    if text.is_empty() {
        return Err(SessionError::validation("message is empty"));
    }
    if text.chars().count() > limits.max_chat_length {
        return Err(SessionError::validation(format!(
            "message exceeds {} characters",
            limits.max_chat_length
        )));
    }

    Ok(vec![SessionEvent::ChatMessage {
        from: user.clone(),
        role,
        text: text.to_string(),
        sent_at: now,
    }])
}
