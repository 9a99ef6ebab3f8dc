//! CLI commands and argument parsing.
//!
//! Built on [`clap`](https://docs.rs/clap). Editor plugins invoke the
//! binary once per heartbeat, so commands are short-lived and never prompt.
//!
//! # Commands
//!
//! - `heartbeat` - send one heartbeat (plus optional extras from stdin)
//! - `sync` - flush the offline queue
//! - `offline count` / `offline list` - inspect the offline queue
//! - `version`
//!
//! # Output Formats
//!
//! Commands support `-f`/`--format`:
//!
//! - `table` - Human-readable (default)
//! - `json` - Machine-readable JSON
//! - `yaml` - YAML
//!
//! # Example
//!
//! ```bash,no_run
//! heartline heartbeat --entity src/main.rs --write
//! heartline offline count
//! heartline sync --force -f json
//! ```
//!
//! # Modules
//!
//! - [`commands`] - Command definitions
//! - [`output`] - Output formatting and table rendering

pub mod commands;
pub mod output;
