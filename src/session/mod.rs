//! Session data model - identity, configuration, phase, roster

mod code;
pub mod roles;
mod store;

pub use code::SessionCode;
pub use roles::RoleAssignment;
pub use store::SessionStore;

use crate::collab::CaseSelection;
use crate::config::SessionsConfig;
use crate::error::{Result, SessionError};
use crate::scheduler;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque user identity resolved by the identity collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque case identifier resolved by the case collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseRef(String);

impl CaseRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    Topic,
    Recall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimingType {
    /// Consultation ends automatically when its duration elapses
    Countdown,
    /// Consultation counts up until the doctor ends it
    Stopwatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    InProgress,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Waiting,
    Reading,
    Consultation,
    Feedback,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Reading => "READING",
            Self::Consultation => "CONSULTATION",
            Self::Feedback => "FEEDBACK",
            Self::Completed => "COMPLETED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Host,
    Doctor,
    Patient,
    Observer,
}

impl Role {
    /// Roles that at most one active participant may hold.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Doctor | Self::Patient)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Host => "HOST",
            Self::Doctor => "DOCTOR",
            Self::Patient => "PATIENT",
            Self::Observer => "OBSERVER",
        };
        f.write_str(name)
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "doctor" => Ok(Self::Doctor),
            "patient" => Ok(Self::Patient),
            "observer" => Ok(Self::Observer),
            other => Err(SessionError::validation(format!("unknown role '{}'", other))),
        }
    }
}

/// Why a session reached a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    /// Every required reviewer submitted feedback
    Completed,
    FeedbackTimeout,
    ForceCompleted,
    /// Too few participants remained, or the doctor left
    ParticipantsLeft,
    EndedByHost,
    /// Everyone left before the session started
    Abandoned,
}

/// Session configuration, editable only while the session is waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_type: SessionType,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub recall_date: Option<NaiveDate>,
    pub reading_duration_secs: u32,
    pub consultation_duration_secs: u32,
    pub timing_type: TimingType,
    /// Seconds before an unfinished FEEDBACK phase completes on its own
    #[serde(default)]
    pub feedback_timeout_secs: Option<u32>,
}

impl SessionConfig {
    /// Topic session with the configured default durations.
    pub fn topics(topics: Vec<String>, defaults: &SessionsConfig) -> Self {
        Self {
            session_type: SessionType::Topic,
            topics,
            recall_date: None,
            reading_duration_secs: defaults.default_reading_secs,
            consultation_duration_secs: defaults.default_consultation_secs,
            timing_type: TimingType::Countdown,
            feedback_timeout_secs: defaults.feedback_timeout(),
        }
    }

    /// Recall session with the configured default durations.
    pub fn recall(date: NaiveDate, defaults: &SessionsConfig) -> Self {
        Self {
            session_type: SessionType::Recall,
            topics: Vec::new(),
            recall_date: Some(date),
            reading_duration_secs: defaults.default_reading_secs,
            consultation_duration_secs: defaults.default_consultation_secs,
            timing_type: TimingType::Countdown,
            feedback_timeout_secs: defaults.feedback_timeout(),
        }
    }

    pub fn with_durations(mut self, reading_secs: u32, consultation_secs: u32) -> Self {
        self.reading_duration_secs = reading_secs;
        self.consultation_duration_secs = consultation_secs;
        self
    }

    pub fn with_timing(mut self, timing: TimingType) -> Self {
        self.timing_type = timing;
        self
    }

    pub fn with_feedback_timeout(mut self, secs: Option<u32>) -> Self {
        self.feedback_timeout_secs = secs;
        self
    }

    /// Check the configuration against the server's bounds.
    pub fn validate(&self, limits: &SessionsConfig) -> Result<()> {
        match self.session_type {
            SessionType::Topic => {
                if self.topics.iter().all(|t| t.trim().is_empty()) {
                    return Err(SessionError::validation(
                        "topic sessions need at least one topic",
                    ));
                }
                if self.recall_date.is_some() {
                    return Err(SessionError::validation(
                        "topic sessions cannot carry a recall date",
                    ));
                }
            }
            SessionType::Recall => {
                if self.recall_date.is_none() {
                    return Err(SessionError::validation("recall sessions need a recall date"));
                }
                if !self.topics.is_empty() {
                    return Err(SessionError::validation(
                        "recall sessions cannot carry topics",
                    ));
                }
            }
        }

        let reading = limits.min_reading_secs..=limits.max_reading_secs;
        if !reading.contains(&self.reading_duration_secs) {
            return Err(SessionError::validation(format!(
                "reading duration must be between {} and {} seconds",
                limits.min_reading_secs, limits.max_reading_secs
            )));
        }

        let consultation = limits.min_consultation_secs..=limits.max_consultation_secs;
        if !consultation.contains(&self.consultation_duration_secs) {
            return Err(SessionError::validation(format!(
                "consultation duration must be between {} and {} seconds",
                limits.min_consultation_secs, limits.max_consultation_secs
            )));
        }

        if self.feedback_timeout_secs == Some(0) {
            return Err(SessionError::validation(
                "feedback timeout must be positive when set",
            ));
        }

        Ok(())
    }

    /// Selection handed to the case collaborator for a random pick.
    pub fn selection(&self) -> CaseSelection {
        match (self.session_type, self.recall_date) {
            (SessionType::Recall, Some(date)) => CaseSelection::Recall(date),
            _ => CaseSelection::Topics(self.topics.clone()),
        }
    }
}

/// A user's membership in one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub role: Role,
    pub is_active: bool,
    pub has_completed: bool,
    pub has_given_feedback: bool,
    /// Set when FEEDBACK begins for reviewers whose submission gates completion
    #[serde(default)]
    pub feedback_required: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn new(user_id: UserId, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            role,
            is_active: true,
            has_completed: false,
            has_given_feedback: false,
            feedback_required: false,
            joined_at: now,
            left_at: None,
        }
    }
}

/// The authoritative record of one session.
///
/// Only the session's own actor mutates a record; everything else sees
/// [`SessionSnapshot`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub code: SessionCode,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub phase: Phase,
    pub current_round: u32,
    pub phase_started_at: Option<DateTime<Utc>>,
    /// Bumped on every phase change; timer fires carry the value they were armed with
    pub phase_generation: u64,
    pub selected_case: Option<CaseRef>,
    #[serde(default)]
    pub used_cases: Vec<CaseRef>,
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// New waiting session with an empty roster.
    pub fn new(
        id: SessionId,
        code: SessionCode,
        created_by: UserId,
        config: SessionConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            code,
            created_by,
            created_at: now,
            config,
            status: SessionStatus::Created,
            phase: Phase::Waiting,
            current_round: 0,
            phase_started_at: Some(now),
            phase_generation: 0,
            selected_case: None,
            used_cases: Vec::new(),
            participants: Vec::new(),
            end_reason: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_host(&self, user: &UserId) -> bool {
        &self.created_by == user
    }

    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user)
    }

    pub fn participant_mut(&mut self, user: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user_id == user)
    }

    /// The participant record for `user` if they are currently active.
    pub fn active_participant(&self, user: &UserId) -> Option<&Participant> {
        self.participant(user).filter(|p| p.is_active)
    }

    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.is_active)
    }

    pub fn active_count(&self) -> usize {
        self.active_participants().count()
    }

    /// The active participant holding `role`, if any.
    pub fn holder_of(&self, role: Role) -> Option<&Participant> {
        self.active_participants().find(|p| p.role == role)
    }

    /// Active role of `user`, or `None` if they are not an active participant.
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        self.active_participant(user).map(|p| p.role)
    }

    /// Record a newly assigned case and start a new round.
    pub fn assign_case(&mut self, case: CaseRef) {
        if !self.used_cases.contains(&case) {
            self.used_cases.push(case.clone());
        }
        self.selected_case = Some(case);
        self.current_round += 1;
    }

    /// Full client-facing view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let window = scheduler::phase_window(self);
        SessionSnapshot {
            id: self.id,
            code: self.code.clone(),
            created_by: self.created_by.clone(),
            config: self.config.clone(),
            status: self.status,
            phase: self.phase,
            current_round: self.current_round,
            phase_started_at: self.phase_started_at,
            phase_duration_secs: window.duration_secs,
            phase_deadline: window.deadline,
            phase_generation: self.phase_generation,
            selected_case: self.selected_case.clone(),
            participants: self.participants.clone(),
            available_roles: roles::available_roles(self),
            end_reason: self.end_reason,
        }
    }
}

/// Serializable view of a session, sent on SESSION_UPDATE and as action replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub code: SessionCode,
    pub created_by: UserId,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub phase: Phase,
    pub current_round: u32,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub phase_duration_secs: Option<u32>,
    pub phase_deadline: Option<DateTime<Utc>>,
    pub phase_generation: u64,
    pub selected_case: Option<CaseRef>,
    pub participants: Vec<Participant>,
    pub available_roles: Vec<Role>,
    pub end_reason: Option<EndReason>,
}

impl SessionSnapshot {
    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user)
    }
}
