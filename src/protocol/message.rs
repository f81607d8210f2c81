//! Message types for the practica protocol

use crate::error::ErrorKind;
use crate::hub::Envelope;
use crate::session::{CaseRef, Role, SessionCode, SessionConfig, SessionSnapshot, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Handshake with protocol version and credential token
    Hello {
        protocol_version: u32,
        token: String,
    },

    /// A session request; the answer carries the same id
    Request { id: u64, request: Request },

    /// Heartbeat
    Ping,

    /// The client is going away (window closed, navigated off)
    Leaving,
}

/// Session requests.
///
/// `CreateSession` and `Join` bind the connection to a session and subscribe
/// it to the session's events; the other session requests act on the bound
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    CreateSession { config: SessionConfig, role: Role },
    Join { code: SessionCode, role: Role },
    AssignRole { role: Role },
    Configure { config: SessionConfig },
    SelectCase { case: CaseRef },
    NewCase,
    Start,
    SkipPhase,
    EndConsultation,
    SubmitFeedback { to: UserId, payload: serde_json::Value },
    ForceComplete,
    Chat { text: String },
    Leave,
    EndSession,

    /// Full state of `code`, or of the bound session
    Snapshot { code: Option<SessionCode> },

    /// Roles a newcomer could take in `code`
    AvailableRoles { code: SessionCode },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "CreateSession",
            Self::Join { .. } => "Join",
            Self::AssignRole { .. } => "AssignRole",
            Self::Configure { .. } => "Configure",
            Self::SelectCase { .. } => "SelectCase",
            Self::NewCase => "NewCase",
            Self::Start => "Start",
            Self::SkipPhase => "SkipPhase",
            Self::EndConsultation => "EndConsultation",
            Self::SubmitFeedback { .. } => "SubmitFeedback",
            Self::ForceComplete => "ForceComplete",
            Self::Chat { .. } => "Chat",
            Self::Leave => "Leave",
            Self::EndSession => "EndSession",
            Self::Snapshot { .. } => "Snapshot",
            Self::AvailableRoles { .. } => "AvailableRoles",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake response once the token has been resolved
    Welcome {
        connection_id: Uuid,
        user_id: UserId,
        protocol_version: u32,
    },

    /// Successful request; the session state after it was applied
    Reply { id: u64, snapshot: SessionSnapshot },

    /// Answer to `AvailableRoles`
    Roles {
        id: u64,
        code: SessionCode,
        roles: Vec<Role>,
    },

    /// The request was refused and changed nothing
    Rejected {
        id: u64,
        kind: ErrorKind,
        message: String,
    },

    /// A session event
    Event(Envelope),

    /// The connection stopped receiving events for `code`
    Unsubscribed { code: SessionCode },

    /// Heartbeat response
    Pong,

    /// Connection-level error (bad handshake, malformed frame)
    Error { message: String },
}
