//! CLI output formatting (JSON, YAML, table).
//!
//! All CLI output supports structured formats for machine consumption.

use crate::core::error::{ErrorCategory, ExitCode, HeartlineError};
use crate::storage::queue::QueuedRecord;
use chrono::{TimeZone, Utc};
use comfy_table::{Cell, Table};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-readable JSON format.
    Json,
    /// YAML output format.
    Yaml,
}

/// Structured CLI response.
#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

/// Structured error output.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub category: String,
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&HeartlineError> for ErrorOutput {
    fn from(err: &HeartlineError) -> Self {
        Self {
            category: err.category.to_string(),
            code: err.code.clone(),
            message: err.message.clone(),
            recoverable: err.recoverable,
            hint: err.recovery_hint.clone(),
        }
    }
}

impl<T: Serialize> CliResponse<T> {
    /// Creates a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Creates an error response.
    pub fn error(err: &HeartlineError) -> CliResponse<()> {
        CliResponse {
            success: false,
            data: None,
            error: Some(ErrorOutput::from(err)),
        }
    }
}

/// Outputs data in the specified format.
///
/// # Errors
/// Returns an error if `data` cannot be serialized.
pub fn output<T: Serialize>(data: T, format: OutputFormat) -> std::io::Result<()> {
    match format {
        OutputFormat::Json => {
            let response = CliResponse::success(data);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Table => {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        OutputFormat::Yaml => {
            let response = CliResponse::success(data);
            if let Ok(yaml) = serde_yaml::to_string(&response) {
                print!("{yaml}");
            }
        }
    }
    Ok(())
}

/// Outputs an error in the specified format.
pub fn output_error(err: &HeartlineError, format: OutputFormat) -> ExitCode {
    match format {
        OutputFormat::Json => {
            let response = CliResponse::<()>::error(err);
            if let Ok(json) = serde_json::to_string_pretty(&response) {
                eprintln!("{json}");
            }
        }
        OutputFormat::Yaml => {
            let response = CliResponse::<()>::error(err);
            if let Ok(yaml) = serde_yaml::to_string(&response) {
                eprint!("{yaml}");
            }
        }
        OutputFormat::Table => {
            eprintln!("Error: {err}");
            if let Some(hint) = &err.recovery_hint {
                eprintln!("Hint: {hint}");
            }
        }
    }
    error_to_exit_code(err)
}

/// Maps errors to process exit codes.
fn error_to_exit_code(err: &HeartlineError) -> ExitCode {
    match (err.category, err.code.as_str()) {
        (ErrorCategory::Config, _) => ExitCode::ConfigInvalid,
        (_, c) if c.contains("auth") || c.contains("api_key") => ExitCode::Auth,
        _ => ExitCode::Error,
    }
}

/// Helper to create a table with headers.
#[must_use]
pub fn create_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_header(headers.iter().map(|h| Cell::new(*h)));
    table
}

/// Trait for types that can be displayed as a table row.
pub trait TableRow {
    fn to_row(&self) -> Vec<String>;
}

/// Headers matching [`QueuedRecord::to_row`].
pub const QUEUED_HEADERS: [&str; 5] = ["SEQ", "TIME", "CATEGORY", "PROJECT", "ENTITY"];

impl TableRow for QueuedRecord {
    fn to_row(&self) -> Vec<String> {
        let h = &self.heartbeat;
        #[allow(clippy::cast_possible_truncation)]
        let time = Utc
            .timestamp_opt(h.time.trunc() as i64, 0)
            .single()
            .map_or_else(|| format!("{:.3}", h.time), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
        vec![
            self.seq.to_string(),
            time,
            h.category.to_string(),
            h.project.clone().unwrap_or_default(),
            h.entity.clone(),
        ]
    }
}

/// Renders `rows` as a table under `headers`.
#[must_use]
pub fn render_table<R: TableRow>(headers: &[&str], rows: &[R]) -> Table {
    let mut table = create_table(headers);
    for row in rows {
        table.add_row(row.to_row());
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heartbeat::Heartbeat;

    #[derive(Serialize)]
    struct TestData {
        name: String,
        value: i32,
    }

    #[test]
    fn cli_response_success_serialization() {
        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };
        let response = CliResponse::success(data);
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"name\":\"test\""));
    }

    #[test]
    fn cli_response_error_serialization() {
        let err =
            HeartlineError::user("invalid", "Invalid input", "cli:test").with_hint("Try again");
        let response = CliResponse::<()>::error(&err);
        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"code\":\"invalid\""));
    }

    #[test]
    fn config_errors_exit_with_config_code() {
        let err = HeartlineError::config("config_invalid", "bad yaml", "config:load");
        assert_eq!(error_to_exit_code(&err), ExitCode::ConfigInvalid);
        let err = HeartlineError::user("missing_api_key", "no key", "cli:heartbeat");
        assert_eq!(error_to_exit_code(&err), ExitCode::Auth);
        let err = HeartlineError::transport("api_key_refused", "401", "cli:heartbeat");
        assert_eq!(error_to_exit_code(&err), ExitCode::Auth);
        let err = HeartlineError::store("queue_locked", "locked", "storage:queue");
        assert_eq!(error_to_exit_code(&err), ExitCode::Error);
    }

    #[test]
    fn queued_record_row() {
        let mut heartbeat = Heartbeat::new("/src/a.rs", 0.5);
        heartbeat.project = Some("rocket".to_string());
        let record = QueuedRecord {
            key: heartbeat.key(),
            heartbeat,
            seq: 7,
        };
        let row = record.to_row();
        assert_eq!(row[0], "7");
        assert_eq!(row[1], "1970-01-01 00:00:00");
        assert_eq!(row[3], "rocket");
        assert_eq!(row[4], "/src/a.rs");
    }
}
