//! Broadcast event types

use crate::session::{
    EndReason, Participant, Phase, Role, SessionCode, SessionRecord, SessionSnapshot,
    SessionStatus, SessionType, TimingType, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every state change a session topic can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionEvent {
    /// Full session state
    SessionUpdate { snapshot: SessionSnapshot },

    /// Roster after a join, leave, role change, or feedback submission
    ParticipantUpdate {
        participants: Vec<Participant>,
        available_roles: Vec<Role>,
    },

    /// The session entered a new phase
    PhaseChange {
        phase: Phase,
        previous: Phase,
        generation: u64,
        round: u32,
        started_at: Option<DateTime<Utc>>,
        duration_secs: Option<u32>,
        deadline: Option<DateTime<Utc>>,
    },

    /// Anchor for a just-entered READING or CONSULTATION phase; clients
    /// count down (or up, for stopwatch consultations) from it locally
    TimerStart {
        phase: Phase,
        generation: u64,
        timing: TimingType,
        started_at: DateTime<Utc>,
        duration_secs: Option<u32>,
        deadline: Option<DateTime<Utc>>,
    },

    SessionEnded {
        reason: EndReason,
        status: SessionStatus,
        phase: Phase,
    },

    UserLeft {
        user_id: UserId,
        role: Role,
        /// False for an explicit leave, true for a detected disconnect
        disconnected: bool,
    },

    RoleChange {
        user_id: UserId,
        previous: Option<Role>,
        role: Role,
    },

    /// No case is left for the current topics or recall date
    TopicSelectionNeeded {
        session_type: SessionType,
        round: u32,
    },

    ChatMessage {
        from: UserId,
        role: Role,
        text: String,
        sent_at: DateTime<Utc>,
    },
}

impl SessionEvent {
    /// Wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "SESSION_UPDATE",
            Self::ParticipantUpdate { .. } => "PARTICIPANT_UPDATE",
            Self::PhaseChange { .. } => "PHASE_CHANGE",
            Self::TimerStart { .. } => "TIMER_START",
            Self::SessionEnded { .. } => "SESSION_ENDED",
            Self::UserLeft { .. } => "USER_LEFT",
            Self::RoleChange { .. } => "ROLE_CHANGE",
            Self::TopicSelectionNeeded { .. } => "TOPIC_SELECTION_NEEDED",
            Self::ChatMessage { .. } => "CHAT_MESSAGE",
        }
    }

    pub fn session_update(record: &SessionRecord) -> Self {
        Self::SessionUpdate {
            snapshot: record.snapshot(),
        }
    }

    pub fn participant_update(record: &SessionRecord) -> Self {
        Self::ParticipantUpdate {
            participants: record.participants.clone(),
            available_roles: crate::session::roles::available_roles(record),
        }
    }
}

/// An event as delivered to a subscriber.
///
/// `seq` increases by one for every event published on the session's topic.
/// The SESSION_UPDATE sent on subscribe carries the seq of the last event
/// already reflected in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: SessionCode,
    pub seq: u64,
    pub event: SessionEvent,
}
