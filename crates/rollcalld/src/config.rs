use rollcall_core::{Adjustment, LedgerPolicy, ServiceConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Extraction sidecar command line.
    pub oracle_command: String,
    /// Maximum Euclidean distance for a positive match.
    pub tolerance: f64,
    /// Seconds between two accepted actions of the same student.
    pub cooldown_secs: u64,
    /// Minimum session length in seconds before logout is accepted.
    pub min_session_secs: u64,
    /// Expected embedding length from the sidecar.
    pub embedding_dim: usize,
    /// Contrast gain applied before extraction.
    pub contrast: f32,
    /// Brightness offset applied before extraction.
    pub brightness: f32,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let defaults = ServiceConfig::default();

        Self {
            db_path,
            oracle_command: std::env::var("ROLLCALL_ORACLE_CMD")
                .unwrap_or_else(|_| "rollcall-embed".to_string()),
            tolerance: env_parse("ROLLCALL_TOLERANCE", defaults.tolerance),
            cooldown_secs: env_parse("ROLLCALL_COOLDOWN_SECS", defaults.ledger.cooldown.as_secs()),
            min_session_secs: env_parse(
                "ROLLCALL_MIN_SESSION_SECS",
                defaults.ledger.min_session.as_secs(),
            ),
            embedding_dim: env_parse("ROLLCALL_EMBEDDING_DIM", defaults.embedding_dim),
            contrast: env_parse("ROLLCALL_CONTRAST", defaults.adjustment.gain),
            brightness: env_parse("ROLLCALL_BRIGHTNESS", defaults.adjustment.bias),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// Core service settings derived from this configuration.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            tolerance: self.tolerance,
            embedding_dim: self.embedding_dim,
            adjustment: Adjustment {
                gain: self.contrast,
                bias: self.brightness,
            },
            ledger: LedgerPolicy {
                cooldown: Duration::from_secs(self.cooldown_secs),
                min_session: Duration::from_secs(self.min_session_secs),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
