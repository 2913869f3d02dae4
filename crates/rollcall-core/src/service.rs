//! Attendance service: the operations exposed to the daemon.
//!
//! Owns the store, the ledger, the matcher, the oracle and the clock. All
//! mutating operations take `&mut self`, so whoever owns the service
//! serializes them.

use crate::clock::{Clock, SystemClock};
use crate::ledger::{self, LedgerPolicy, Outcome, SessionLedger, UNKNOWN_CLASS, UNKNOWN_NAME};
use crate::oracle::{decode_image, Adjustment, EmbeddingOracle, OracleError};
use crate::store::{
    AttendanceEvent, LoginSession, RepairReport, RosterEntry, Store, StoreError, StoreStats,
};
use crate::types::{
    Action, AttendanceStatus, Embedding, EuclideanMatcher, Matcher, Student, StudentId,
    DEFAULT_TOLERANCE, EMBEDDING_DIM,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Input(String),
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Tunables for an [`AttendanceService`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceConfig {
    pub tolerance: f64,
    pub embedding_dim: usize,
    pub adjustment: Adjustment,
    pub ledger: LedgerPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            embedding_dim: EMBEDDING_DIM,
            adjustment: Adjustment::default(),
            ledger: LedgerPolicy::default(),
        }
    }
}

/// Result of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Registration {
    Registered { student: Student },
    NoFaceDetected,
}

/// How a probe image was resolved to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Identification {
    Identified,
    NoFaceDetected,
    UnknownIdentity,
}

/// Read-only status preview for the person in front of the camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub identification: Identification,
    pub student_id: Option<StudentId>,
    pub name: String,
    pub class: String,
    pub status: Option<AttendanceStatus>,
    /// `"Logged In"` / `"Logged Out"` for display.
    pub previous_status: Option<String>,
    pub message: String,
}

impl ProbeResult {
    fn unrecognised(identification: Identification, message: &str) -> Self {
        Self {
            identification,
            student_id: None,
            name: UNKNOWN_NAME.to_string(),
            class: UNKNOWN_CLASS.to_string(),
            status: None,
            previous_status: None,
            message: message.to_string(),
        }
    }
}

enum Recognition {
    NoFace,
    Unknown,
    Student(Student),
}

pub struct AttendanceService<O> {
    store: Store,
    ledger: SessionLedger,
    matcher: Box<dyn Matcher + Send>,
    oracle: O,
    clock: Box<dyn Clock>,
    config: ServiceConfig,
}

impl<O: EmbeddingOracle> AttendanceService<O> {
    pub fn new(store: Store, oracle: O, config: ServiceConfig) -> Self {
        Self {
            store,
            ledger: SessionLedger::new(config.ledger),
            matcher: Box::new(EuclideanMatcher {
                tolerance: config.tolerance,
            }),
            oracle,
            clock: Box::new(SystemClock::new()),
            config,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + Send + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Startup repair of the one-open-session invariant.
    pub fn reconcile(&mut self) -> Result<RepairReport, ServiceError> {
        let report = self.store.reconcile(self.clock.wall())?;
        if report != RepairReport::default() {
            tracing::warn!(
                sessions_closed = report.sessions_closed,
                timestamps_cleared = report.timestamps_cleared,
                "repaired session table"
            );
        }
        Ok(report)
    }

    /// Enroll a new student from a single image.
    pub fn register(
        &mut self,
        name: &str,
        class: &str,
        image: &[u8],
    ) -> Result<Registration, ServiceError> {
        let name = name.trim();
        let class = class.trim();
        if name.is_empty() || class.is_empty() {
            return Err(ServiceError::Input("name and class are required".into()));
        }

        let Some(embedding) = self.embed(image)? else {
            tracing::info!(student_name = name, "registration rejected: no face detected");
            return Ok(Registration::NoFaceDetected);
        };

        let student = self.store.insert_student(name, class, &embedding)?;
        tracing::info!(student_id = student.id, student_name = name, class, "registered student");
        Ok(Registration::Registered { student })
    }

    /// Recognise the face in `image` and apply `action` for that student.
    pub fn submit_attendance(
        &mut self,
        image: &[u8],
        action: &str,
    ) -> Result<Outcome, ServiceError> {
        let action = Action::parse(action)
            .ok_or_else(|| ServiceError::Input(format!("unknown action `{action}`")))?;

        let student = match self.recognise(image)? {
            Recognition::NoFace => return Ok(Outcome::no_face()),
            Recognition::Unknown => return Ok(Outcome::unknown()),
            Recognition::Student(student) => student,
        };

        Ok(self
            .ledger
            .apply(&mut self.store, self.clock.as_ref(), &student, action)?)
    }

    /// Identify the face in `image` and report their status without writing.
    pub fn check_identity(&mut self, image: &[u8]) -> Result<ProbeResult, ServiceError> {
        let student = match self.recognise(image)? {
            Recognition::NoFace => {
                return Ok(ProbeResult::unrecognised(
                    Identification::NoFaceDetected,
                    "No face detected",
                ))
            }
            Recognition::Unknown => {
                return Ok(ProbeResult::unrecognised(
                    Identification::UnknownIdentity,
                    "Unknown student",
                ))
            }
            Recognition::Student(student) => student,
        };

        let status = ledger::status_of(&self.store, student.id)?;
        let (previous, verb, next) = match status {
            AttendanceStatus::LoggedIn => ("Logged In", "logged in", "logout"),
            AttendanceStatus::LoggedOut => ("Logged Out", "logged out", "login"),
        };
        let message = format!(
            "Hi {}, Previously You had {verb}, if you are willing to {next} please click on {next}.",
            student.name
        );

        Ok(ProbeResult {
            identification: Identification::Identified,
            student_id: Some(student.id),
            name: student.name,
            class: student.class,
            status: Some(status),
            previous_status: Some(previous.to_string()),
            message,
        })
    }

    /// The student whose open session was opened most recently, if any.
    pub fn current_open_session(&self) -> Result<Option<Student>, ServiceError> {
        Ok(self.store.latest_open_session()?.map(|(student, _)| student))
    }

    /// Remove a student together with their encoding, sessions and log rows.
    pub fn delete_student(&mut self, student_id: StudentId) -> Result<(), ServiceError> {
        if !self.store.delete_student(student_id)? {
            return Err(StoreError::StudentNotFound(student_id).into());
        }
        self.ledger.forget(student_id);
        tracing::info!(student_id, "deleted student");
        Ok(())
    }

    pub fn roster(&self) -> Result<Vec<RosterEntry>, ServiceError> {
        Ok(self.store.roster()?)
    }

    pub fn attendance_log(
        &self,
        student_id: Option<StudentId>,
    ) -> Result<Vec<AttendanceEvent>, ServiceError> {
        Ok(self.store.attendance_log(student_id)?)
    }

    pub fn student_sessions(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<LoginSession>, ServiceError> {
        if self.store.student(student_id)?.is_none() {
            return Err(StoreError::StudentNotFound(student_id).into());
        }
        Ok(self.store.sessions_for(student_id)?)
    }

    pub fn stats(&self) -> Result<StoreStats, ServiceError> {
        Ok(self.store.stats()?)
    }

    /// Decode, adjust and extract. `None` means no face was found.
    fn embed(&mut self, image: &[u8]) -> Result<Option<Embedding>, ServiceError> {
        if image.is_empty() {
            return Err(ServiceError::Input("image is required".into()));
        }
        let mut rgb = decode_image(image)
            .map_err(|e| ServiceError::Input(format!("unreadable image: {e}")))?;
        self.config.adjustment.apply(&mut rgb);

        let Some(embedding) = self.oracle.extract(&rgb)?.into_iter().next() else {
            return Ok(None);
        };
        if embedding.dim() != self.config.embedding_dim {
            return Err(OracleError::Dimension {
                expected: self.config.embedding_dim,
                got: embedding.dim(),
            }
            .into());
        }
        Ok(Some(embedding))
    }

    fn recognise(&mut self, image: &[u8]) -> Result<Recognition, ServiceError> {
        let Some(probe) = self.embed(image)? else {
            tracing::debug!("no face detected in probe");
            return Ok(Recognition::NoFace);
        };
        let gallery = self.store.enrolled_faces()?;
        let result = self.matcher.best_match(&probe, &gallery);
        match result.student {
            Some(student) => {
                tracing::debug!(
                    student_id = student.id,
                    distance = ?result.distance,
                    "face matched"
                );
                Ok(Recognition::Student(student))
            }
            None => {
                tracing::debug!(distance = ?result.distance, "no enrolled face within tolerance");
                Ok(Recognition::Unknown)
            }
        }
    }
}
