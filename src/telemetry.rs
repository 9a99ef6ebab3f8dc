//! Logging setup for the `heartline` binary.
//!
//! Editors spawn the binary on every keystroke burst and read its stdout, so
//! logs go to an append-only file by default. `--log-to-stdout` sends them to
//! stderr instead. Library code only emits `tracing` events.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "HEARTLINE_LOG";

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub verbose: bool,
    /// Log to stderr instead of `file`.
    pub to_stderr: bool,
    pub file: PathBuf,
}

impl LogSettings {
    fn default_directive(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "warn"
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }
}

/// Installs the global subscriber.
///
/// Falls back to stderr when the log file cannot be opened. Calling this
/// twice is harmless; the second call does nothing.
pub fn init(settings: &LogSettings) {
    let filter = settings.filter();

    if !settings.to_stderr {
        if let Some(parent) = settings.file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.file)
        {
            Ok(file) => {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(
                        fmt::layer()
                            .with_target(false)
                            .with_ansi(false)
                            .with_writer(Mutex::new(file)),
                    )
                    .try_init();
                return;
            }
            Err(err) => {
                eprintln!(
                    "heartline: cannot open log file {}: {err}",
                    settings.file.display()
                );
            }
        }
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_default_level() {
        let mut settings = LogSettings {
            verbose: false,
            to_stderr: true,
            file: PathBuf::from("unused.log"),
        };
        assert_eq!(settings.default_directive(), "warn");
        settings.verbose = true;
        assert_eq!(settings.default_directive(), "debug");
    }
}
