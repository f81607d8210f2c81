//! Text rendering of session state and events for the console

use crate::hub::{Envelope, SessionEvent};
use crate::session::{Participant, Role, SessionSnapshot};
use chrono::{DateTime, Local, Utc};

fn clock(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%H:%M:%S").to_string()
}

fn roles(roles: &[Role]) -> String {
    if roles.is_empty() {
        return "none".to_string();
    }
    roles.iter().map(Role::to_string).collect::<Vec<_>>().join(", ")
}

fn roster(participants: &[Participant]) -> String {
    let active: Vec<String> = participants
        .iter()
        .filter(|p| p.is_active)
        .map(|p| {
            let mark = if p.has_given_feedback { " ✓" } else { "" };
            format!("{} ({}){}", p.user_id, p.role, mark)
        })
        .collect();
    if active.is_empty() {
        "nobody".to_string()
    } else {
        active.join(", ")
    }
}

/// Multi-line summary of a session snapshot
pub fn render_snapshot(snapshot: &SessionSnapshot) -> String {
    let mut lines = vec![
        format!(
            "Session {} - {:?} / {} (round {})",
            snapshot.code, snapshot.status, snapshot.phase, snapshot.current_round
        ),
        format!("  host: {}", snapshot.created_by),
        format!("  participants: {}", roster(&snapshot.participants)),
        format!("  open roles: {}", roles(&snapshot.available_roles)),
    ];
    if let Some(case) = &snapshot.selected_case {
        lines.push(format!("  case: {}", case));
    }
    match (snapshot.phase_deadline, snapshot.phase_started_at) {
        (Some(deadline), _) => lines.push(format!("  phase ends at {}", clock(deadline))),
        (None, Some(started)) => lines.push(format!("  phase started at {}", clock(started))),
        _ => {}
    }
    if let Some(reason) = snapshot.end_reason {
        lines.push(format!("  ended: {:?}", reason));
    }
    lines.join("\n")
}

/// One-line description of an event
pub fn render_event(envelope: &Envelope) -> String {
    let body = match &envelope.event {
        SessionEvent::SessionUpdate { snapshot } => render_snapshot(snapshot),
        SessionEvent::ParticipantUpdate {
            participants,
            available_roles,
        } => format!(
            "Participants: {} | open roles: {}",
            roster(participants),
            roles(available_roles)
        ),
        SessionEvent::PhaseChange {
            phase,
            previous,
            deadline,
            ..
        } => match deadline {
            Some(deadline) => format!("{} -> {} (until {})", previous, phase, clock(*deadline)),
            None => format!("{} -> {}", previous, phase),
        },
        SessionEvent::TimerStart {
            phase,
            duration_secs,
            started_at,
            ..
        } => match duration_secs {
            Some(secs) => format!("{} timer: {}m{:02}s", phase, secs / 60, secs % 60),
            None => format!("{} stopwatch started at {}", phase, clock(*started_at)),
        },
        SessionEvent::SessionEnded { reason, status, .. } => {
            format!("Session ended ({:?}, {:?})", status, reason)
        }
        SessionEvent::UserLeft {
            user_id,
            role,
            disconnected,
        } => {
            let how = if *disconnected { "disconnected" } else { "left" };
            format!("{} ({}) {}", user_id, role, how)
        }
        SessionEvent::RoleChange {
            user_id,
            previous,
            role,
        } => match previous {
            Some(previous) => format!("{} is now {} (was {})", user_id, role, previous),
            None => format!("{} is now {}", user_id, role),
        },
        SessionEvent::TopicSelectionNeeded { .. } => {
            "No unused case left; pick another topic or date".to_string()
        }
        SessionEvent::ChatMessage {
            from, role, text, ..
        } => format!("<{} {}> {}", from, role, text),
    };
    format!("[{}#{}] {}", envelope.code, envelope.seq, body)
}
