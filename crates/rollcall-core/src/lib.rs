//! rollcall-core: face-matched attendance tracking.
//!
//! Matches probe embeddings against enrolled students, keeps at most one open
//! login session per student and records every accepted login/logout in an
//! append-only attendance log, all backed by SQLite.

pub mod clock;
pub mod ledger;
pub mod migrations;
pub mod oracle;
pub mod service;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::{LedgerPolicy, Outcome, SessionLedger, Verdict};
pub use oracle::{Adjustment, CommandOracle, EmbeddingOracle, OracleError};
pub use service::{
    AttendanceService, Identification, ProbeResult, Registration, ServiceConfig, ServiceError,
};
pub use store::{Store, StoreError};
pub use types::{Action, AttendanceStatus, Embedding, EuclideanMatcher, Matcher, Student, StudentId};
