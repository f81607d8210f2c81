//! Role assignment - uniqueness and minimum-participant rules

use super::{Participant, Phase, Role, SessionRecord, UserId};
use crate::error::{Result, SessionError};
use chrono::{DateTime, Utc};

/// Outcome of a successful role assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    pub user_id: UserId,
    pub role: Role,
    /// Role held before this assignment, if the user was already on the roster
    pub previous_role: Option<Role>,
    /// True when the user was not on the roster before
    pub joined: bool,
    /// True when an inactive participant came back
    pub rejoined: bool,
}

impl RoleAssignment {
    /// Whether the assignment changed an existing participant's role.
    pub fn role_changed(&self) -> bool {
        matches!(self.previous_role, Some(prev) if prev != self.role)
    }
}

/// Assign `requested` to `user`, adding them to the roster if needed.
///
/// A user already on the roster keeps their participant record; their old
/// role is released and the new one taken in the same step, so the role is
/// never observable as free in between.
pub fn try_assign_role(
    record: &mut SessionRecord,
    user: &UserId,
    requested: Role,
    now: DateTime<Utc>,
) -> Result<RoleAssignment> {
    if record.is_terminal() {
        return Err(SessionError::invalid_transition(format!(
            "session {} has ended",
            record.code
        )));
    }

    if requested == Role::Host && !record.is_host(user) {
        return Err(SessionError::forbidden(
            "only the session creator can hold HOST",
        ));
    }

    if requested.is_exclusive() {
        if let Some(holder) = record.holder_of(requested) {
            if &holder.user_id != user {
                return Err(SessionError::RoleConflict {
                    code: record.code.to_string(),
                    role: requested.to_string(),
                });
            }
        }
    }

    let started = record.phase != Phase::Waiting;
    match record.participant_mut(user) {
        Some(participant) => {
            if started && participant.is_active && participant.role != requested {
                return Err(SessionError::invalid_transition(
                    "roles are locked once the session has started",
                ));
            }
            let previous_role = Some(participant.role);
            let rejoined = !participant.is_active;
            participant.role = requested;
            participant.is_active = true;
            participant.left_at = None;
            Ok(RoleAssignment {
                user_id: user.clone(),
                role: requested,
                previous_role,
                joined: false,
                rejoined,
            })
        }
        None => {
            record
                .participants
                .push(Participant::new(user.clone(), requested, now));
            Ok(RoleAssignment {
                user_id: user.clone(),
                role: requested,
                previous_role: None,
                joined: true,
                rejoined: false,
            })
        }
    }
}

/// Mark `user` inactive, releasing their role. Returns the role they held.
pub fn release(record: &mut SessionRecord, user: &UserId, now: DateTime<Utc>) -> Result<Role> {
    let participant = record
        .participant_mut(user)
        .filter(|p| p.is_active)
        .ok_or_else(|| SessionError::not_found(format!("{} is not an active participant", user)))?;
    participant.is_active = false;
    participant.left_at = Some(now);
    Ok(participant.role)
}

/// Roles a newcomer could take right now, derived from active participants only.
pub fn available_roles(record: &SessionRecord) -> Vec<Role> {
    if record.is_terminal() {
        return Vec::new();
    }
    [Role::Doctor, Role::Patient, Role::Observer]
        .into_iter()
        .filter(|role| !role.is_exclusive() || record.holder_of(*role).is_none())
        .collect()
}

/// An active DOCTOR plus at least one active PATIENT or OBSERVER.
pub fn meets_minimum(record: &SessionRecord) -> bool {
    record.holder_of(Role::Doctor).is_some()
        && record
            .active_participants()
            .any(|p| matches!(p.role, Role::Patient | Role::Observer))
}

/// Whether a running session can no longer continue with its active roster.
pub fn must_force_end(record: &SessionRecord) -> bool {
    record.active_count() < 2 || record.holder_of(Role::Doctor).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionsConfig;
    use crate::session::{SessionCode, SessionConfig, SessionId};
    use proptest::prelude::*;

    fn record() -> SessionRecord {
        SessionRecord::new(
            SessionId(7),
            SessionCode::parse("ROLE01").unwrap(),
            UserId::new("host"),
            SessionConfig::topics(vec!["neuro".into()], &SessionsConfig::default()),
            Utc::now(),
        )
    }

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    #[test]
    fn test_doctor_conflict() {
        let mut rec = record();
        let now = Utc::now();
        try_assign_role(&mut rec, &user("a"), Role::Doctor, now).unwrap();

        let err = try_assign_role(&mut rec, &user("b"), Role::Doctor, now).unwrap_err();
        assert!(matches!(err, SessionError::RoleConflict { .. }));
        assert_eq!(rec.participants.len(), 1);
    }

    #[test]
    fn test_observers_unbounded() {
        let mut rec = record();
        let now = Utc::now();
        for i in 0..5 {
            try_assign_role(&mut rec, &user(&format!("obs{}", i)), Role::Observer, now).unwrap();
        }
        assert_eq!(rec.active_count(), 5);
    }

    #[test]
    fn test_only_creator_can_be_host() {
        let mut rec = record();
        let now = Utc::now();
        assert!(try_assign_role(&mut rec, &user("host"), Role::Host, now).is_ok());
        let err = try_assign_role(&mut rec, &user("x"), Role::Host, now).unwrap_err();
        assert!(matches!(err, SessionError::Forbidden(_)));
    }

    #[test]
    fn test_role_change_releases_old_role() {
        let mut rec = record();
        let now = Utc::now();
        try_assign_role(&mut rec, &user("a"), Role::Doctor, now).unwrap();
        let change = try_assign_role(&mut rec, &user("a"), Role::Patient, now).unwrap();
        assert!(change.role_changed());
        assert_eq!(change.previous_role, Some(Role::Doctor));

        assert!(available_roles(&rec).contains(&Role::Doctor));
        assert!(!available_roles(&rec).contains(&Role::Patient));
        try_assign_role(&mut rec, &user("b"), Role::Doctor, now).unwrap();
    }

    #[test]
    fn test_available_roles_round_trip() {
        let mut rec = record();
        let now = Utc::now();
        assert!(available_roles(&rec).contains(&Role::Doctor));

        try_assign_role(&mut rec, &user("doc"), Role::Doctor, now).unwrap();
        assert!(!available_roles(&rec).contains(&Role::Doctor));

        release(&mut rec, &user("doc"), now).unwrap();
        assert!(available_roles(&rec).contains(&Role::Doctor));
    }

    #[test]
    fn test_inactive_holder_does_not_block() {
        let mut rec = record();
        let now = Utc::now();
        try_assign_role(&mut rec, &user("a"), Role::Patient, now).unwrap();
        release(&mut rec, &user("a"), now).unwrap();
        try_assign_role(&mut rec, &user("b"), Role::Patient, now).unwrap();

        let rejoin = try_assign_role(&mut rec, &user("a"), Role::Patient, now);
        assert!(matches!(rejoin, Err(SessionError::RoleConflict { .. })));
        let rejoin = try_assign_role(&mut rec, &user("a"), Role::Observer, now).unwrap();
        assert!(rejoin.rejoined);
    }

    #[test]
    fn test_roles_locked_after_start() {
        let mut rec = record();
        let now = Utc::now();
        try_assign_role(&mut rec, &user("doc"), Role::Doctor, now).unwrap();
        rec.phase = Phase::Reading;
        let err = try_assign_role(&mut rec, &user("doc"), Role::Observer, now).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition(_)));

        // newcomers can still take free roles
        try_assign_role(&mut rec, &user("late"), Role::Observer, now).unwrap();
    }

    #[test]
    fn test_minimum_gate() {
        let mut rec = record();
        let now = Utc::now();
        assert!(!meets_minimum(&rec));
        try_assign_role(&mut rec, &user("doc"), Role::Doctor, now).unwrap();
        assert!(!meets_minimum(&rec));
        try_assign_role(&mut rec, &user("host"), Role::Host, now).unwrap();
        assert!(!meets_minimum(&rec), "HOST does not count towards the gate");
        try_assign_role(&mut rec, &user("obs"), Role::Observer, now).unwrap();
        assert!(meets_minimum(&rec));
        assert!(!must_force_end(&rec));

        release(&mut rec, &user("doc"), now).unwrap();
        assert!(must_force_end(&rec));
    }

    #[test]
    fn test_release_unknown_user() {
        let mut rec = record();
        let err = release(&mut rec, &user("ghost"), Utc::now()).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    proptest! {
        #[test]
        fn prop_exclusive_roles_stay_unique(
            ops in proptest::collection::vec((0usize..6, 0usize..4, any::<bool>()), 1..60)
        ) {
            let mut rec = record();
            let now = Utc::now();
            let roles = [Role::Doctor, Role::Patient, Role::Observer, Role::Host];
            for (who, role, leave) in ops {
                let u = user(&format!("u{}", who));
                if leave {
                    let _ = release(&mut rec, &u, now);
                } else {
                    let _ = try_assign_role(&mut rec, &u, roles[role], now);
                }
                let doctors = rec.active_participants().filter(|p| p.role == Role::Doctor).count();
                let patients = rec.active_participants().filter(|p| p.role == Role::Patient).count();
                prop_assert!(doctors <= 1);
                prop_assert!(patients <= 1);
            }
        }
    }
}
