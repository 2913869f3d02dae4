//! Per-student login/logout state machine.
//!
//! A student is `LoggedIn` while exactly one of their sessions has no logout
//! time, `LoggedOut` otherwise. [`SessionLedger::apply`] evaluates the guards
//! in order (cooldown, idempotency, minimum duration) and, when all pass,
//! writes the session change and the attendance row in one transaction.
//!
//! The ledger owns the cooldown map. Callers must hold `&mut SessionLedger`
//! and `&mut Store` together for the whole call, which makes the check and
//! the write a single critical section for both.

use crate::clock::Clock;
use crate::store::{self, Store, StoreError};
use crate::types::{Action, AttendanceStatus, Student, StudentId};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);
const DEFAULT_MIN_SESSION: Duration = Duration::from_secs(30);

/// Name/class reported when nobody was recognised.
pub const UNKNOWN_NAME: &str = "Unknown Student";
pub const UNKNOWN_CLASS: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    /// Minimum monotonic interval between two accepted actions of one student.
    pub cooldown: Duration,
    /// Minimum wall-clock length of a session before logout is accepted.
    pub min_session: Duration,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            min_session: DEFAULT_MIN_SESSION,
        }
    }
}

/// How an attendance request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    PleaseWait,
    AlreadyLoggedIn,
    AlreadyLoggedOut,
    CannotLogoutYet,
    NoFaceDetected,
    UnknownIdentity,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Result of an attendance request, returned to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub verdict: Verdict,
    pub student_id: Option<StudentId>,
    pub name: String,
    pub class: String,
    /// Session state after the request (`None` when it is not known).
    pub status: Option<AttendanceStatus>,
    pub message: String,
    /// Accumulated session seconds after an accepted logout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}

impl Outcome {
    fn for_student(
        student: &Student,
        verdict: Verdict,
        status: Option<AttendanceStatus>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            verdict,
            student_id: Some(student.id),
            name: student.name.clone(),
            class: student.class.clone(),
            status,
            message: message.into(),
            duration: None,
        }
    }

    pub fn no_face() -> Self {
        Self::unrecognised(Verdict::NoFaceDetected, "No face detected")
    }

    pub fn unknown() -> Self {
        Self::unrecognised(Verdict::UnknownIdentity, "Unknown student")
    }

    fn unrecognised(verdict: Verdict, message: &str) -> Self {
        Self {
            verdict,
            student_id: None,
            name: UNKNOWN_NAME.to_string(),
            class: UNKNOWN_CLASS.to_string(),
            status: None,
            message: message.to_string(),
            duration: None,
        }
    }
}

/// Current logical state of a student, read from the open-session query.
pub fn status_of(store: &Store, student_id: StudentId) -> Result<AttendanceStatus, StoreError> {
    Ok(match store.open_session(student_id)? {
        Some(_) => AttendanceStatus::LoggedIn,
        None => AttendanceStatus::LoggedOut,
    })
}

pub struct SessionLedger {
    policy: LedgerPolicy,
    /// Monotonic time of the last accepted action per student.
    last_accepted: HashMap<StudentId, Duration>,
}

impl SessionLedger {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            policy,
            last_accepted: HashMap::new(),
        }
    }

    pub fn policy(&self) -> LedgerPolicy {
        self.policy
    }

    /// Drop cooldown state for a deleted student.
    pub fn forget(&mut self, student_id: StudentId) {
        self.last_accepted.remove(&student_id);
    }

    /// Apply `action` for `student` at the clock's current time.
    ///
    /// Guard rejections are returned as `Ok` outcomes. `Err` means the store
    /// failed; in that case nothing was written and the cooldown is untouched.
    pub fn apply(
        &mut self,
        store: &mut Store,
        clock: &dyn Clock,
        student: &Student,
        action: Action,
    ) -> Result<Outcome, StoreError> {
        let mono = clock.monotonic();
        let now = clock.wall();

        if let Some(last) = self.last_accepted.get(&student.id) {
            if mono.saturating_sub(*last) < self.policy.cooldown {
                tracing::debug!(student_id = student.id, %action, "rejected: cooldown");
                return Ok(Outcome::for_student(
                    student,
                    Verdict::PleaseWait,
                    None,
                    "Please wait before taking attendance again",
                ));
            }
        }

        let tx = store.transaction()?;
        let open = store::find_open_session(&tx, student.id)?;

        let outcome = match (action, open) {
            (Action::Login, Some(_)) => {
                tracing::debug!(student_id = student.id, "rejected: already logged in");
                return Ok(Outcome::for_student(
                    student,
                    Verdict::AlreadyLoggedIn,
                    Some(AttendanceStatus::LoggedIn),
                    "Already logged in",
                ));
            }
            (Action::Logout, None) => {
                tracing::debug!(student_id = student.id, "rejected: already logged out");
                return Ok(Outcome::for_student(
                    student,
                    Verdict::AlreadyLoggedOut,
                    Some(AttendanceStatus::LoggedOut),
                    "Already logged out",
                ));
            }
            (Action::Login, None) => {
                let session_id = store::insert_session(&tx, student.id, now)?;
                store::append_event(&tx, student, AttendanceStatus::LoggedIn, now)?;
                tracing::info!(student_id = student.id, session_id, "login recorded");
                Outcome::for_student(
                    student,
                    Verdict::Accepted,
                    Some(AttendanceStatus::LoggedIn),
                    "Logged in",
                )
            }
            (Action::Logout, Some(session)) => {
                // A session whose login time was cleared by the startup repair
                // cannot be measured; it is closed without adding time.
                let elapsed = session.login_at().map(|login| (now - login).num_seconds());
                let min_secs = i64::try_from(self.policy.min_session.as_secs()).unwrap_or(i64::MAX);
                if let Some(elapsed) = elapsed {
                    if elapsed < min_secs {
                        tracing::debug!(
                            student_id = student.id,
                            elapsed,
                            "rejected: session too short"
                        );
                        return Ok(Outcome::for_student(
                            student,
                            Verdict::CannotLogoutYet,
                            Some(AttendanceStatus::LoggedIn),
                            format!("Cannot logout within {min_secs} seconds"),
                        ));
                    }
                }
                let added = elapsed.unwrap_or(0);
                let total = session.accumulated_duration + added;
                store::close_session(&tx, session.id, now, total)?;
                store::append_event(&tx, student, AttendanceStatus::LoggedOut, now)?;
                tracing::info!(
                    student_id = student.id,
                    session_id = session.id,
                    duration = total,
                    "logout recorded"
                );
                let mut outcome = Outcome::for_student(
                    student,
                    Verdict::Accepted,
                    Some(AttendanceStatus::LoggedOut),
                    "Logged out",
                );
                outcome.duration = Some(total);
                outcome
            }
        };

        tx.commit()?;
        self.last_accepted.insert(student.id, mono);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::Embedding;
    use chrono::{NaiveDate, NaiveDateTime};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, 2)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn setup() -> (Store, SessionLedger, ManualClock, Student) {
        let mut store = Store::in_memory().unwrap();
        let student = store
            .insert_student("Asha", "10A", &Embedding::new(vec![0.0; 4]))
            .unwrap();
        (
            store,
            SessionLedger::new(LedgerPolicy::default()),
            ManualClock::new(start()),
            student,
        )
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn open_count(store: &Store, id: StudentId) -> usize {
        store
            .sessions_for(id)
            .unwrap()
            .iter()
            .filter(|s| s.is_open())
            .count()
    }

    #[test]
    fn test_login_then_logout_scenario() {
        let (mut store, mut ledger, clock, a) = setup();

        let out = ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        assert_eq!(out.verdict, Verdict::Accepted);
        assert_eq!(out.status, Some(AttendanceStatus::LoggedIn));
        assert_eq!(out.message, "Logged in");

        // Inside the cooldown window the cooldown guard answers first.
        clock.advance(secs(5));
        let out = ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        assert_eq!(out.verdict, Verdict::PleaseWait);
        assert_eq!(out.status, None);

        clock.advance(secs(7)); // t = 12
        let out = ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        assert_eq!(out.verdict, Verdict::AlreadyLoggedIn);
        assert_eq!(out.message, "Already logged in");

        clock.advance(secs(8)); // t = 20
        let out = ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
        assert_eq!(out.verdict, Verdict::CannotLogoutYet);
        assert_eq!(out.message, "Cannot logout within 30 seconds");
        assert_eq!(out.status, Some(AttendanceStatus::LoggedIn));

        clock.advance(secs(11)); // t = 31
        let out = ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
        assert_eq!(out.verdict, Verdict::Accepted);
        assert_eq!(out.status, Some(AttendanceStatus::LoggedOut));
        assert_eq!(out.duration, Some(31));

        let sessions = store.sessions_for(a.id).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].accumulated_duration, 31);
        assert_eq!(sessions[0].logout_time.as_deref(), Some("2024-09-02 09:00:31"));
    }

    #[test]
    fn test_logout_at_exactly_ten_seconds_hits_duration_guard() {
        let (mut store, mut ledger, clock, a) = setup();
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        clock.advance(secs(10));
        let out = ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
        assert_eq!(out.verdict, Verdict::CannotLogoutYet);
    }

    #[test]
    fn test_logout_when_logged_out() {
        let (mut store, mut ledger, clock, a) = setup();
        let out = ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
        assert_eq!(out.verdict, Verdict::AlreadyLoggedOut);
        assert_eq!(out.status, Some(AttendanceStatus::LoggedOut));
        assert!(store.attendance_log(None).unwrap().is_empty());
    }

    #[test]
    fn test_rejections_do_not_write() {
        let (mut store, mut ledger, clock, a) = setup();
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        clock.advance(secs(3));
        ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
        clock.advance(secs(10));
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();

        assert_eq!(store.attendance_log(None).unwrap().len(), 1);
        assert_eq!(store.sessions_for(a.id).unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_action_does_not_restart_cooldown() {
        let (mut store, mut ledger, clock, a) = setup();
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        clock.advance(secs(9));
        assert_eq!(
            ledger.apply(&mut store, &clock, &a, Action::Login).unwrap().verdict,
            Verdict::PleaseWait
        );
        clock.advance(secs(1));
        assert_eq!(
            ledger.apply(&mut store, &clock, &a, Action::Login).unwrap().verdict,
            Verdict::AlreadyLoggedIn
        );
    }

    #[test]
    fn test_cooldown_follows_monotonic_clock_not_wall() {
        let (mut store, mut ledger, clock, a) = setup();
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        // Wall clock jumps forward an hour, monotonic time does not move.
        clock.set_wall(start() + chrono::Duration::hours(1));
        let out = ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
        assert_eq!(out.verdict, Verdict::PleaseWait);
    }

    #[test]
    fn test_cooldown_is_per_student() {
        let (mut store, mut ledger, clock, a) = setup();
        let b = store
            .insert_student("Bram", "10B", &Embedding::new(vec![1.0; 4]))
            .unwrap();
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        let out = ledger.apply(&mut store, &clock, &b, Action::Login).unwrap();
        assert_eq!(out.verdict, Verdict::Accepted);
    }

    #[test]
    fn test_forget_clears_cooldown() {
        let (mut store, mut ledger, clock, a) = setup();
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        ledger.forget(a.id);
        let out = ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        assert_eq!(out.verdict, Verdict::AlreadyLoggedIn);
    }

    #[test]
    fn test_accumulated_duration_and_single_open_session() {
        let (mut store, mut ledger, clock, a) = setup();
        let lengths = [31u64, 45, 120, 3600];
        let mut total_events = 0;

        for len in lengths {
            let out = ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
            assert!(out.verdict.is_accepted());
            assert_eq!(open_count(&store, a.id), 1);
            clock.advance(secs(len));
            let out = ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
            assert!(out.verdict.is_accepted());
            assert_eq!(open_count(&store, a.id), 0);
            clock.advance(secs(10));
            total_events += 2;
        }

        let sessions = store.sessions_for(a.id).unwrap();
        let recorded: i64 = sessions.iter().map(|s| s.accumulated_duration).sum();
        assert_eq!(recorded, lengths.iter().sum::<u64>() as i64);
        assert_eq!(store.attendance_log(Some(a.id)).unwrap().len(), total_events);
    }

    #[test]
    fn test_accepted_actions_respect_guards_under_rapid_requests() {
        let (mut store, mut ledger, clock, a) = setup();
        let mut accepted: Vec<(Duration, Action)> = Vec::new();

        // One request per second for five minutes, alternating intent.
        for i in 0..300u64 {
            let action = if (i / 7) % 2 == 0 { Action::Login } else { Action::Logout };
            let out = ledger.apply(&mut store, &clock, &a, action).unwrap();
            if out.verdict.is_accepted() {
                accepted.push((clock.monotonic(), action));
            }
            assert!(open_count(&store, a.id) <= 1);
            clock.advance(secs(1));
        }

        assert!(accepted.len() >= 2);
        for pair in accepted.windows(2) {
            let gap = pair[1].0 - pair[0].0;
            assert!(gap >= secs(10), "accepted actions {gap:?} apart");
            if pair[1].1 == Action::Logout {
                assert_eq!(pair[0].1, Action::Login);
                assert!(gap >= secs(30), "logout {gap:?} after login");
            }
        }
    }

    #[test]
    fn test_attendance_rows_carry_one_timestamp() {
        let (mut store, mut ledger, clock, a) = setup();
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        clock.advance(secs(40));
        ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();

        let log = store.attendance_log(Some(a.id)).unwrap();
        assert_eq!(log[0].status, AttendanceStatus::LoggedOut);
        assert_eq!(log[0].logged_out_time.as_deref(), Some("2024-09-02 09:00:40"));
        assert_eq!(log[0].logged_in_time, None);
        assert_eq!(log[1].status, AttendanceStatus::LoggedIn);
        assert_eq!(log[1].logged_in_time.as_deref(), Some("2024-09-02 09:00:00"));
        assert_eq!(log[1].logged_out_time, None);
        assert_eq!(log[1].name, "Asha");
        assert_eq!(log[1].class, "10A");
    }

    #[test]
    fn test_custom_policy_message() {
        let (mut store, _, clock, a) = setup();
        let mut ledger = SessionLedger::new(LedgerPolicy {
            cooldown: secs(0),
            min_session: secs(60),
        });
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        clock.advance(secs(59));
        let out = ledger.apply(&mut store, &clock, &a, Action::Logout).unwrap();
        assert_eq!(out.message, "Cannot logout within 60 seconds");
    }

    #[test]
    fn test_status_of() {
        let (mut store, mut ledger, clock, a) = setup();
        assert_eq!(status_of(&store, a.id).unwrap(), AttendanceStatus::LoggedOut);
        ledger.apply(&mut store, &clock, &a, Action::Login).unwrap();
        assert_eq!(status_of(&store, a.id).unwrap(), AttendanceStatus::LoggedIn);
    }
}
