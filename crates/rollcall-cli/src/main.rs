use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn register(&self, name: &str, class: &str, image: &[u8]) -> zbus::Result<String>;
    async fn submit_attendance(&self, image: &[u8], action: &str) -> zbus::Result<String>;
    async fn check_identity(&self, image: &[u8]) -> zbus::Result<String>;
    async fn current_session(&self) -> zbus::Result<String>;
    async fn delete_student(&self, student_id: i64) -> zbus::Result<bool>;
    async fn roster(&self) -> zbus::Result<String>;
    async fn attendance_log(&self, student_id: i64) -> zbus::Result<String>;
    async fn student_sessions(&self, student_id: i64) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new student from a photo
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        class: String,
        /// Photo containing the student's face
        image: PathBuf,
    },
    /// Log in or log out the person in a photo
    Attend {
        /// "login" or "logout"
        action: String,
        image: PathBuf,
    },
    /// Show who is in a photo and their current status
    Check { image: PathBuf },
    /// Show the student with the most recently opened session
    Current,
    /// Delete a student and all of their records
    Delete { id: i64 },
    /// List students with their last login/logout and total time
    Roster,
    /// Show the attendance log, newest first
    Log {
        /// Only show entries for this student
        #[arg(short, long)]
        student: Option<i64>,
    },
    /// List a student's login sessions, newest first
    Sessions { id: i64 },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let session_bus = std::env::var("ROLLCALL_SESSION_BUS").is_ok_and(|v| v == "1");
    tracing::debug!(session_bus, "connecting to rollcalld");
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Register { name, class, image } => {
            let bytes = read_image(&image)?;
            let reply = parse(&proxy.register(&name, &class, &bytes).await?)?;
            match reply["result"].as_str() {
                Some("registered") => {
                    let student = &reply["student"];
                    println!(
                        "Registered {} ({}) with id {}",
                        text(&student["name"]),
                        text(&student["class"]),
                        student["id"]
                    );
                }
                _ => println!("No face detected"),
            }
        }
        Commands::Attend { action, image } => {
            let bytes = read_image(&image)?;
            let reply = parse(&proxy.submit_attendance(&bytes, &action).await?)?;
            println!(
                "{}: {} ({})",
                text(&reply["message"]),
                text(&reply["name"]),
                text(&reply["class"])
            );
            if let Some(secs) = reply["duration"].as_i64() {
                println!("Session length: {}", format_duration(secs));
            }
        }
        Commands::Check { image } => {
            let bytes = read_image(&image)?;
            let reply = parse(&proxy.check_identity(&bytes).await?)?;
            println!("{}", text(&reply["message"]));
        }
        Commands::Current => {
            let reply = parse(&proxy.current_session().await?)?;
            if reply.is_null() {
                println!("No active session");
            } else {
                println!(
                    "{} ({}) id {}",
                    text(&reply["name"]),
                    text(&reply["class"]),
                    reply["id"]
                );
            }
        }
        Commands::Delete { id } => {
            proxy.delete_student(id).await?;
            println!("Deleted student {id}");
        }
        Commands::Roster => {
            let reply = parse(&proxy.roster().await?)?;
            let rows = reply.as_array().map(Vec::as_slice).unwrap_or_default();
            if rows.is_empty() {
                println!("No students registered");
            }
            for row in rows {
                println!(
                    "{:>4}  {:<20} {:<8} in: {:<20} out: {:<20} total: {}",
                    row["id"],
                    text(&row["name"]),
                    text(&row["class"]),
                    display_time(row["last_login"].as_str()),
                    display_time(row["last_logout"].as_str()),
                    format_duration(row["total_duration"].as_i64().unwrap_or(0)),
                );
            }
        }
        Commands::Log { student } => {
            let reply = parse(&proxy.attendance_log(student.unwrap_or(0)).await?)?;
            let rows = reply.as_array().map(Vec::as_slice).unwrap_or_default();
            if rows.is_empty() {
                println!("No attendance recorded");
            }
            for row in rows {
                println!(
                    "{:<20} {:<8} {:<11} in: {:<20} out: {}",
                    text(&row["name"]),
                    text(&row["class"]),
                    text(&row["status"]),
                    display_time(row["logged_in_time"].as_str()),
                    display_time(row["logged_out_time"].as_str()),
                );
            }
        }
        Commands::Sessions { id } => {
            let reply = parse(&proxy.student_sessions(id).await?)?;
            let rows = reply.as_array().map(Vec::as_slice).unwrap_or_default();
            if rows.is_empty() {
                println!("No sessions for student {id}");
            }
            for row in rows {
                println!(
                    "in: {:<20} out: {:<20} duration: {}",
                    display_time(row["login_time"].as_str()),
                    display_time(row["logout_time"].as_str()),
                    format_duration(row["accumulated_duration"].as_i64().unwrap_or(0)),
                );
            }
        }
        Commands::Status => {
            let reply = parse(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn parse(reply: &str) -> Result<Value> {
    serde_json::from_str(reply).context("daemon returned malformed JSON")
}

fn text(value: &Value) -> &str {
    value.as_str().unwrap_or("")
}

/// Render a stored timestamp as `MM/DD/YYYY HH:MM AM`.
fn display_time(stored: Option<&str>) -> String {
    match stored {
        None | Some("") => "N/A".to_string(),
        Some(s) => ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(|t| t.format("%m/%d/%Y %I:%M %p").to_string())
            .unwrap_or_else(|| "Invalid Date".to_string()),
    }
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_time() {
        assert_eq!(display_time(Some("2024-03-05 14:07:09")), "03/05/2024 02:07 PM");
        assert_eq!(display_time(Some("2024-03-05 00:30:00.250")), "03/05/2024 12:30 AM");
        assert_eq!(display_time(None), "N/A");
        assert_eq!(display_time(Some("")), "N/A");
        assert_eq!(display_time(Some("yesterday")), "Invalid Date");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(31), "00:00:31");
        assert_eq!(format_duration(3725), "01:02:05");
        assert_eq!(format_duration(-4), "00:00:00");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["rollcall", "attend", "logout", "face.jpg"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Attend { ref action, .. } if action == "logout"
        ));

        let cli = Cli::try_parse_from(["rollcall", "log", "--student", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Log { student: Some(3) }));

        let cli = Cli::try_parse_from([
            "rollcall", "register", "--name", "Asha", "--class", "10A", "asha.png",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Register { .. }));
    }
}
