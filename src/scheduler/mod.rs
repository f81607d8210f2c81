//! Phase scheduler - the session state machine and its deadlines
//!
//! Every function here mutates a [`SessionRecord`] in place and returns the
//! events describing the change. Callers run them on a scratch copy of the
//! record and only keep the result once it has been persisted.

mod clock;
mod timer;

pub use clock::Clock;
pub use timer::PhaseTimer;

use crate::error::{Result, SessionError};
use crate::hub::SessionEvent;
use crate::session::{roles, EndReason, Phase, Role, SessionRecord, SessionStatus, TimingType, UserId};
use chrono::{DateTime, Utc};

/// Duration and deadline of the current phase, when it has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseWindow {
    pub duration_secs: Option<u32>,
    pub deadline: Option<DateTime<Utc>>,
}

/// Configured length of the current phase. `None` for untimed phases.
pub fn phase_duration(record: &SessionRecord) -> Option<u32> {
    let config = &record.config;
    match record.phase {
        Phase::Reading => Some(config.reading_duration_secs),
        Phase::Consultation => match config.timing_type {
            TimingType::Countdown => Some(config.consultation_duration_secs),
            TimingType::Stopwatch => None,
        },
        Phase::Feedback => config.feedback_timeout_secs,
        Phase::Waiting | Phase::Completed => None,
    }
}

pub fn phase_window(record: &SessionRecord) -> PhaseWindow {
    let duration_secs = phase_duration(record);
    let deadline = match (record.phase_started_at, duration_secs) {
        (Some(started), Some(secs)) if !record.is_terminal() => {
            Some(started + chrono::Duration::seconds(i64::from(secs)))
        }
        _ => None,
    };
    PhaseWindow {
        duration_secs,
        deadline,
    }
}

/// Reject actions on a COMPLETED or CANCELLED session.
pub fn ensure_live(record: &SessionRecord) -> Result<()> {
    if record.is_terminal() {
        return Err(SessionError::invalid_transition(format!(
            "session {} has ended",
            record.code
        )));
    }
    Ok(())
}

fn ensure_phase(record: &SessionRecord, expected: Phase, action: &str) -> Result<()> {
    if record.phase != expected {
        return Err(SessionError::invalid_transition(format!(
            "{} is only allowed during {}, session is in {}",
            action, expected, record.phase
        )));
    }
    Ok(())
}

/// Whether `user` is the active host or the active doctor.
fn is_host_or_doctor(record: &SessionRecord, user: &UserId) -> bool {
    match record.role_of(user) {
        Some(Role::Doctor) => true,
        Some(_) => record.is_host(user),
        None => false,
    }
}

fn enter_phase(record: &mut SessionRecord, phase: Phase, started_at: DateTime<Utc>) -> Vec<SessionEvent> {
    let previous = record.phase;
    record.phase = phase;
    record.phase_started_at = Some(started_at);
    record.phase_generation += 1;

    if phase == Phase::Feedback {
        for p in record.participants.iter_mut() {
            p.feedback_required =
                p.is_active && matches!(p.role, Role::Patient | Role::Observer);
        }
    }

    let window = phase_window(record);
    tracing::info!(
        code = %record.code,
        from = %previous,
        to = %phase,
        generation = record.phase_generation,
        "Phase change"
    );

    let mut events = vec![SessionEvent::PhaseChange {
        phase,
        previous,
        generation: record.phase_generation,
        round: record.current_round,
        started_at: Some(started_at),
        duration_secs: window.duration_secs,
        deadline: window.deadline,
    }];
    if matches!(phase, Phase::Reading | Phase::Consultation) {
        events.push(SessionEvent::TimerStart {
            phase,
            generation: record.phase_generation,
            timing: record.config.timing_type,
            started_at,
            duration_secs: window.duration_secs,
            deadline: window.deadline,
        });
    }
    events
}

/// Guards for leaving WAITING, checked before a case is fetched.
pub fn check_start(record: &SessionRecord, user: &UserId) -> Result<()> {
    ensure_live(record)?;
    if record.phase != Phase::Waiting {
        return Err(SessionError::invalid_transition("session has already started"));
    }
    if !is_host_or_doctor(record, user) {
        return Err(SessionError::forbidden(
            "only the host or the DOCTOR can start the session",
        ));
    }
    if !roles::meets_minimum(record) {
        return Err(SessionError::invalid_transition(
            "starting needs an active DOCTOR and at least one PATIENT or OBSERVER",
        ));
    }
    Ok(())
}

/// WAITING -> READING.
pub fn start(record: &mut SessionRecord, user: &UserId, now: DateTime<Utc>) -> Result<Vec<SessionEvent>> {
    check_start(record, user)?;
    if record.selected_case.is_none() {
        return Err(SessionError::invalid_transition("no case has been selected"));
    }
    record.status = SessionStatus::InProgress;
    Ok(enter_phase(record, Phase::Reading, now))
}

/// READING -> CONSULTATION on the doctor's request.
pub fn skip(record: &mut SessionRecord, user: &UserId, now: DateTime<Utc>) -> Result<Vec<SessionEvent>> {
    ensure_live(record)?;
    if record.role_of(user) != Some(Role::Doctor) {
        return Err(SessionError::forbidden("only the DOCTOR can skip the reading phase"));
    }
    ensure_phase(record, Phase::Reading, "skip")?;
    Ok(enter_phase(record, Phase::Consultation, now))
}

/// CONSULTATION -> FEEDBACK on the doctor's request.
pub fn end_consultation(
    record: &mut SessionRecord,
    user: &UserId,
    now: DateTime<Utc>,
) -> Result<Vec<SessionEvent>> {
    ensure_live(record)?;
    if record.role_of(user) != Some(Role::Doctor) {
        return Err(SessionError::forbidden("only the DOCTOR can end the consultation"));
    }
    ensure_phase(record, Phase::Consultation, "ending the consultation")?;
    Ok(enter_feedback(record, now))
}

fn enter_feedback(record: &mut SessionRecord, started_at: DateTime<Utc>) -> Vec<SessionEvent> {
    let mut events = enter_phase(record, Phase::Feedback, started_at);
    if feedback_satisfied(record) {
        events.extend(complete(record, EndReason::Completed, started_at));
    }
    events
}

/// Every reviewer still present has submitted feedback.
pub fn feedback_satisfied(record: &SessionRecord) -> bool {
    record
        .participants
        .iter()
        .filter(|p| p.feedback_required && p.is_active)
        .all(|p| p.has_given_feedback)
}

/// Guards for a feedback submission, checked before the feedback collaborator is called.
pub fn check_feedback(record: &SessionRecord, from: &UserId, to: &UserId) -> Result<()> {
    ensure_live(record)?;
    ensure_phase(record, Phase::Feedback, "feedback")?;

    let reviewer = record
        .active_participant(from)
        .ok_or_else(|| SessionError::not_found(format!("{} is not an active participant", from)))?;
    if !matches!(reviewer.role, Role::Patient | Role::Observer) {
        return Err(SessionError::forbidden(
            "only PATIENT and OBSERVER participants give feedback",
        ));
    }
    if reviewer.has_given_feedback {
        return Err(SessionError::invalid_transition("feedback already submitted"));
    }
    if from == to || record.participant(to).is_none() {
        return Err(SessionError::not_found(format!(
            "{} is not a participant to review",
            to
        )));
    }
    Ok(())
}

/// Mark `from`'s feedback as recorded; completes the session when it was the last one.
pub fn record_feedback(
    record: &mut SessionRecord,
    from: &UserId,
    to: &UserId,
    now: DateTime<Utc>,
) -> Result<Vec<SessionEvent>> {
    check_feedback(record, from, to)?;
    if let Some(p) = record.participant_mut(from) {
        p.has_given_feedback = true;
    }

    let mut events = vec![SessionEvent::participant_update(record)];
    if feedback_satisfied(record) {
        events.extend(complete(record, EndReason::Completed, now));
    }
    Ok(events)
}

/// FEEDBACK -> COMPLETED without waiting for the remaining reviewers.
pub fn force_complete(
    record: &mut SessionRecord,
    user: &UserId,
    now: DateTime<Utc>,
) -> Result<Vec<SessionEvent>> {
    ensure_live(record)?;
    if !is_host_or_doctor(record, user) {
        return Err(SessionError::forbidden(
            "only the host or the DOCTOR can complete the session",
        ));
    }
    ensure_phase(record, Phase::Feedback, "force-complete")?;
    Ok(complete(record, EndReason::ForceCompleted, now))
}

/// Host-requested end, from any live state.
pub fn end_by_host(record: &mut SessionRecord, user: &UserId, now: DateTime<Utc>) -> Result<Vec<SessionEvent>> {
    ensure_live(record)?;
    if !record.is_host(user) {
        return Err(SessionError::forbidden("only the host can end the session"));
    }
    Ok(force_end(record, EndReason::EndedByHost, now))
}

/// Normal completion: PHASE_CHANGE to COMPLETED followed by SESSION_ENDED.
fn complete(record: &mut SessionRecord, reason: EndReason, now: DateTime<Utc>) -> Vec<SessionEvent> {
    let mut events = enter_phase(record, Phase::Completed, now);
    for p in record.participants.iter_mut().filter(|p| p.is_active) {
        p.has_completed = true;
    }
    finish(record, SessionStatus::Completed, reason, now);
    events.push(ended_event(record));
    events
}

/// Terminate without completing: CANCELLED before the session started,
/// otherwise COMPLETED with the phase cut short.
pub fn force_end(record: &mut SessionRecord, reason: EndReason, now: DateTime<Utc>) -> Vec<SessionEvent> {
    if record.is_terminal() {
        return Vec::new();
    }
    let status = if record.status == SessionStatus::Created {
        SessionStatus::Cancelled
    } else {
        record.phase = Phase::Completed;
        record.phase_started_at = Some(now);
        record.phase_generation += 1;
        SessionStatus::Completed
    };
    finish(record, status, reason, now);
    vec![ended_event(record)]
}

fn finish(record: &mut SessionRecord, status: SessionStatus, reason: EndReason, now: DateTime<Utc>) {
    record.status = status;
    record.end_reason = Some(reason);
    record.ended_at = Some(now);
    tracing::info!(code = %record.code, status = ?status, reason = ?reason, "Session ended");
}

fn ended_event(record: &SessionRecord) -> SessionEvent {
    SessionEvent::SessionEnded {
        reason: record.end_reason.unwrap_or(EndReason::Completed),
        status: record.status,
        phase: record.phase,
    }
}

/// Re-evaluate the session after a participant became inactive.
///
/// A detected disconnect applies the minimum-roster gate in every live state,
/// cancelling a session that never started. A voluntary leave only cancels a
/// waiting session once it is empty.
pub fn after_departure(
    record: &mut SessionRecord,
    now: DateTime<Utc>,
    disconnected: bool,
) -> Vec<SessionEvent> {
    match record.status {
        SessionStatus::Created if disconnected && roles::must_force_end(record) => {
            force_end(record, EndReason::ParticipantsLeft, now)
        }
        SessionStatus::Created if record.active_count() == 0 => {
            force_end(record, EndReason::Abandoned, now)
        }
        SessionStatus::InProgress if roles::must_force_end(record) => {
            force_end(record, EndReason::ParticipantsLeft, now)
        }
        SessionStatus::InProgress
            if record.phase == Phase::Feedback && feedback_satisfied(record) =>
        {
            complete(record, EndReason::Completed, now)
        }
        _ => Vec::new(),
    }
}

/// Apply the transition owed for the current phase's deadline, anchored at
/// that deadline.
fn advance_expired(record: &mut SessionRecord, deadline: DateTime<Utc>) -> Vec<SessionEvent> {
    match record.phase {
        Phase::Reading => enter_phase(record, Phase::Consultation, deadline),
        Phase::Consultation => enter_feedback(record, deadline),
        Phase::Feedback => complete(record, EndReason::FeedbackTimeout, deadline),
        Phase::Waiting | Phase::Completed => Vec::new(),
    }
}

/// Replay every deadline that has passed by `now`.
///
/// Each replayed phase starts at the previous deadline, so a session that
/// missed several deadlines (a restart, a stalled timer) ends up exactly
/// where on-time timers would have left it. Calling this again is a no-op.
pub fn catch_up(record: &mut SessionRecord, now: DateTime<Utc>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(deadline) = phase_window(record).deadline {
        if deadline > now {
            break;
        }
        let step = advance_expired(record, deadline);
        if step.is_empty() {
            break;
        }
        events.extend(step);
    }
    events
}

/// Handle a timer fire armed for `generation`.
///
/// Returns `None` when the fire is stale: the phase has changed since it was
/// armed, or the session has ended.
pub fn expire(record: &mut SessionRecord, generation: u64, now: DateTime<Utc>) -> Option<Vec<SessionEvent>> {
    if generation != record.phase_generation || record.is_terminal() {
        return None;
    }
    Some(catch_up(record, now))
}
