use crate::engine::{EngineError, EngineHandle};
use rollcall_core::ServiceError;
use serde::Serialize;
use zbus::{fdo, interface};

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Results are returned as JSON strings.
pub struct AttendanceInterface {
    pub engine: EngineHandle,
    pub db_path: String,
    pub oracle_command: String,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Enroll a new student from a single photo.
    async fn register(&self, name: &str, class: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(student_name = name, class, bytes = image.len(), "register requested");
        let reg = self
            .engine
            .register(name.to_string(), class.to_string(), image)
            .await
            .map_err(to_fdo)?;
        to_json(&reg)
    }

    /// Identify the face in `image` and apply `action` ("login" or "logout").
    async fn submit_attendance(&self, image: Vec<u8>, action: &str) -> fdo::Result<String> {
        tracing::info!(action, bytes = image.len(), "attendance submitted");
        let outcome = self
            .engine
            .submit_attendance(image, action.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Identify the face in `image` without changing any state.
    async fn check_identity(&self, image: Vec<u8>) -> fdo::Result<String> {
        let probe = self.engine.check_identity(image).await.map_err(to_fdo)?;
        to_json(&probe)
    }

    /// Student owning the most recently opened session, or `null`.
    async fn current_session(&self) -> fdo::Result<String> {
        let student = self.engine.current_session().await.map_err(to_fdo)?;
        to_json(&student)
    }

    /// Remove a student and everything recorded for them.
    async fn delete_student(&self, student_id: i64) -> fdo::Result<bool> {
        tracing::info!(student_id, "delete requested");
        self.engine
            .delete_student(student_id)
            .await
            .map_err(to_fdo)?;
        Ok(true)
    }

    async fn roster(&self) -> fdo::Result<String> {
        let roster = self.engine.roster().await.map_err(to_fdo)?;
        to_json(&roster)
    }

    /// Attendance events, newest first. A non-positive id lists every student.
    async fn attendance_log(&self, student_id: i64) -> fdo::Result<String> {
        let filter = (student_id > 0).then_some(student_id);
        let events = self.engine.attendance_log(filter).await.map_err(to_fdo)?;
        to_json(&events)
    }

    /// A student's login sessions, newest first.
    async fn student_sessions(&self, student_id: i64) -> fdo::Result<String> {
        let sessions = self
            .engine
            .student_sessions(student_id)
            .await
            .map_err(to_fdo)?;
        to_json(&sessions)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let stats = self.engine.stats().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "db_path": self.db_path,
            "oracle": self.oracle_command,
            "students": stats.students,
            "open_sessions": stats.open_sessions,
            "attendance_events": stats.attendance_events,
            "schema_version": stats.schema_version,
        })
        .to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Service(ServiceError::Input(msg)) => fdo::Error::InvalidArgs(msg),
        other => {
            tracing::error!(error = %other, "request failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use image::{ImageFormat, RgbImage};
    use rollcall_core::{
        AttendanceService, Embedding, EmbeddingOracle, OracleError, ServiceConfig, Store,
    };
    use std::io::Cursor;

    struct SameFace;

    impl EmbeddingOracle for SameFace {
        fn extract(&mut self, _image: &RgbImage) -> Result<Vec<Embedding>, OracleError> {
            Ok(vec![Embedding::new(vec![0.5; 4])])
        }
    }

    fn png() -> Vec<u8> {
        let mut bytes = Vec::new();
        RgbImage::new(2, 2)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn iface() -> AttendanceInterface {
        let config = ServiceConfig {
            embedding_dim: 4,
            ..ServiceConfig::default()
        };
        let service = AttendanceService::new(Store::in_memory().unwrap(), SameFace, config);
        AttendanceInterface {
            engine: spawn_engine(service).unwrap(),
            db_path: ":memory:".into(),
            oracle_command: "embed".into(),
        }
    }

    #[tokio::test]
    async fn test_methods_return_json() {
        let iface = iface();
        let reg: serde_json::Value =
            serde_json::from_str(&iface.register("Ravi", "9B", png()).await.unwrap()).unwrap();
        assert_eq!(reg["result"], "registered");
        let id = reg["student"]["id"].as_i64().unwrap();

        assert_eq!(iface.current_session().await.unwrap(), "null");

        let out: serde_json::Value =
            serde_json::from_str(&iface.submit_attendance(png(), "login").await.unwrap()).unwrap();
        assert_eq!(out["message"], "Logged in");
        assert_eq!(out["student_id"], id);

        let current: serde_json::Value =
            serde_json::from_str(&iface.current_session().await.unwrap()).unwrap();
        assert_eq!(current["name"], "Ravi");

        let all: serde_json::Value =
            serde_json::from_str(&iface.attendance_log(0).await.unwrap()).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 1);
        let none: serde_json::Value =
            serde_json::from_str(&iface.attendance_log(id + 1).await.unwrap()).unwrap();
        assert!(none.as_array().unwrap().is_empty());

        let sessions: serde_json::Value =
            serde_json::from_str(&iface.student_sessions(id).await.unwrap()).unwrap();
        assert_eq!(sessions[0]["accumulated_duration"], 0);
        assert!(sessions[0]["logout_time"].is_null());

        let status: serde_json::Value =
            serde_json::from_str(&iface.status().await.unwrap()).unwrap();
        assert_eq!(status["students"], 1);
        assert_eq!(status["open_sessions"], 1);

        assert!(iface.delete_student(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_errors_map_to_fdo() {
        let iface = iface();
        let err = iface.submit_attendance(png(), "nap").await.unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));

        let err = iface.delete_student(41).await.unwrap_err();
        assert!(matches!(err, fdo::Error::Failed(_)));
    }
}
