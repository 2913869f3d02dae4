use anyhow::{Context, Result};
use rollcall_core::{AttendanceService, CommandOracle, Store};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();

    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database ready");

    let oracle = CommandOracle::from_command_line(&config.oracle_command)
        .context("ROLLCALL_ORACLE_CMD is empty")?;

    let mut service = AttendanceService::new(store, oracle, config.service_config());
    service.reconcile().context("startup repair failed")?;

    let engine = engine::spawn_engine(service)?;

    let iface = dbus_interface::AttendanceInterface {
        engine,
        db_path: config.db_path.display().to_string(),
        oracle_command: config.oracle_command.clone(),
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
