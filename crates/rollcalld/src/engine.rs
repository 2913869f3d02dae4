use rollcall_core::service::ServiceError;
use rollcall_core::store::{AttendanceEvent, LoginSession, RosterEntry, StoreStats};
use rollcall_core::{
    AttendanceService, EmbeddingOracle, Outcome, ProbeResult, Registration, Student, StudentId,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        name: String,
        class: String,
        image: Vec<u8>,
        reply: Reply<Registration>,
    },
    Submit {
        image: Vec<u8>,
        action: String,
        reply: Reply<Outcome>,
    },
    Check {
        image: Vec<u8>,
        reply: Reply<ProbeResult>,
    },
    CurrentSession {
        reply: Reply<Option<Student>>,
    },
    Delete {
        student_id: StudentId,
        reply: Reply<()>,
    },
    Roster {
        reply: Reply<Vec<RosterEntry>>,
    },
    Log {
        student_id: Option<StudentId>,
        reply: Reply<Vec<AttendanceEvent>>,
    },
    Sessions {
        student_id: StudentId,
        reply: Reply<Vec<LoginSession>>,
    },
    Stats {
        reply: Reply<StoreStats>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn register(
        &self,
        name: String,
        class: String,
        image: Vec<u8>,
    ) -> Result<Registration, EngineError> {
        self.call(|reply| EngineRequest::Register {
            name,
            class,
            image,
            reply,
        })
        .await
    }

    pub async fn submit_attendance(
        &self,
        image: Vec<u8>,
        action: String,
    ) -> Result<Outcome, EngineError> {
        self.call(|reply| EngineRequest::Submit {
            image,
            action,
            reply,
        })
        .await
    }

    pub async fn check_identity(&self, image: Vec<u8>) -> Result<ProbeResult, EngineError> {
        self.call(|reply| EngineRequest::Check { image, reply }).await
    }

    pub async fn current_session(&self) -> Result<Option<Student>, EngineError> {
        self.call(|reply| EngineRequest::CurrentSession { reply }).await
    }

    pub async fn delete_student(&self, student_id: StudentId) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Delete { student_id, reply }).await
    }

    pub async fn roster(&self) -> Result<Vec<RosterEntry>, EngineError> {
        self.call(|reply| EngineRequest::Roster { reply }).await
    }

    pub async fn attendance_log(
        &self,
        student_id: Option<StudentId>,
    ) -> Result<Vec<AttendanceEvent>, EngineError> {
        self.call(|reply| EngineRequest::Log { student_id, reply }).await
    }

    pub async fn student_sessions(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<LoginSession>, EngineError> {
        self.call(|reply| EngineRequest::Sessions { student_id, reply }).await
    }

    pub async fn stats(&self) -> Result<StoreStats, EngineError> {
        self.call(|reply| EngineRequest::Stats { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the service and handles one request at a time, so every
/// guard check and its write run without interleaving, and the ledger's
/// cooldown map is only ever touched from this thread.
pub fn spawn_engine<O>(mut service: AttendanceService<O>) -> Result<EngineHandle, EngineError>
where
    O: EmbeddingOracle + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register {
                        name,
                        class,
                        image,
                        reply,
                    } => {
                        let _ = reply.send(service.register(&name, &class, &image));
                    }
                    EngineRequest::Submit {
                        image,
                        action,
                        reply,
                    } => {
                        let _ = reply.send(service.submit_attendance(&image, &action));
                    }
                    EngineRequest::Check { image, reply } => {
                        let _ = reply.send(service.check_identity(&image));
                    }
                    EngineRequest::CurrentSession { reply } => {
                        let _ = reply.send(service.current_open_session());
                    }
                    EngineRequest::Delete { student_id, reply } => {
                        let _ = reply.send(service.delete_student(student_id));
                    }
                    EngineRequest::Roster { reply } => {
                        let _ = reply.send(service.roster());
                    }
                    EngineRequest::Log { student_id, reply } => {
                        let _ = reply.send(service.attendance_log(student_id));
                    }
                    EngineRequest::Sessions { student_id, reply } => {
                        let _ = reply.send(service.student_sessions(student_id));
                    }
                    EngineRequest::Stats { reply } => {
                        let _ = reply.send(service.stats());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
