//! Heartline CLI entrypoint.

use chrono::Utc;
use clap::Parser;
use heartline::adapters::classify::HeuristicClassifier;
use heartline::adapters::credentials::ApiKeyResolver;
use heartline::adapters::transport::{HttpTransport, HttpTransportConfig};
use heartline::cli::commands::{
    Cli, Commands, HeartbeatArgs, OfflineCommands, OfflineListArgs, SyncArgs,
};
use heartline::cli::output::{output, output_error, render_table, OutputFormat, QUEUED_HEADERS};
use heartline::core::config::{Config, DataDir};
use heartline::core::credentials::CredentialStage;
use heartline::core::error::{ExitCode, HeartlineError};
use heartline::core::heartbeat::Heartbeat;
use heartline::core::normalize::NormalizationStage;
use heartline::core::pipeline::{DeliveryStatus, Pipeline, Sink, TransportSink};
use heartline::core::redact::RedactionStage;
use heartline::core::submit::{LiveSubmitter, OfflineStore, Submission};
use heartline::core::sync::{SyncCoordinator, SyncMode, SyncOutcome, SyncReport};
use heartline::storage::legacy::LegacyQueueMigrator;
use heartline::storage::queue::{SharedQueue, SqliteQueue};
use heartline::telemetry::{self, LogSettings};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

fn output_version(format: OutputFormat) {
    let version = env!("CARGO_PKG_VERSION");
    match format {
        OutputFormat::Table => {
            println!("heartline {version}");
        }
        _ => {
            let data = serde_json::json!({ "name": "heartline", "version": version });
            if let Err(err) = output(data, format) {
                eprintln!("Failed to render version: {err}");
            }
        }
    }
}

fn main() {
    let exit_code = match Cli::try_parse() {
        Ok(cli) => run(cli),
        Err(err) => {
            // Help and version go to stdout, usage errors to stderr.
            let _ = err.print();
            if err.use_stderr() {
                ExitCode::Error
            } else {
                ExitCode::Success
            }
        }
    };
    process::exit(i32::from(exit_code));
}

/// Values shared by every command.
struct Session {
    data_dir: DataDir,
    config_path: PathBuf,
    format: OutputFormat,
}

fn run(cli: Cli) -> ExitCode {
    let data_dir = DataDir::default_dir();
    telemetry::init(&LogSettings {
        verbose: cli.verbose,
        to_stderr: cli.log_to_stdout,
        file: data_dir.log_path(),
    });

    let session = Session {
        config_path: cli.config.unwrap_or_else(|| data_dir.config_path()),
        data_dir,
        format: cli.format,
    };

    match cli.command {
        Some(Commands::Version) => {
            output_version(session.format);
            ExitCode::Success
        }
        Some(Commands::Heartbeat(args)) => handle_heartbeat(&session, args),
        Some(Commands::Sync(args)) => handle_sync(&session, &args),
        Some(Commands::Offline(cmd)) => handle_offline(&session, cmd),
        None => {
            println!("heartline {}", env!("CARGO_PKG_VERSION"));
            println!("Use --help for usage information.");
            ExitCode::Success
        }
    }
}

fn load_config(
    session: &Session,
    key: Option<&str>,
    api_url: Option<&str>,
) -> Result<Config, ExitCode> {
    let mut config = match Config::load(&session.config_path) {
        Ok(config) => config,
        Err(err) => return Err(output_error(&err.into(), session.format)),
    };
    config.apply_env();
    if let Some(key) = key {
        config.api.key = Some(key.to_string());
    }
    if let Some(url) = api_url {
        config.api.url = url.to_string();
    }
    Ok(config)
}

fn open_queue(session: &Session, config: &Config) -> Result<SharedQueue, HeartlineError> {
    let path = config.queue_path(&session.data_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            HeartlineError::system("data_dir_unwritable", e.to_string(), "cli:open_queue")
                .with_context("path", parent.display().to_string())
        })?;
    }
    let queue = SqliteQueue::open(&path, config.lock_timeout())?;
    Ok(Arc::new(queue))
}

fn user_agent(plugin: Option<&str>) -> String {
    let base = format!(
        "heartline/{} ({}-{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    match plugin {
        Some(plugin) if !plugin.trim().is_empty() => format!("{base} {plugin}"),
        _ => base,
    }
}

fn credentials(config: &Config) -> Result<ApiKeyResolver, HeartlineError> {
    let credentials = config.credentials()?;
    if !credentials.has_default() {
        tracing::warn!("no default api key configured");
    }
    Ok(credentials)
}

fn build_sink(config: &Config, credentials: ApiKeyResolver, user_agent: String) -> Arc<dyn Sink> {
    let transport = HttpTransport::new(
        HttpTransportConfig {
            api_url: config.api.url.clone(),
            timeout: config.request_timeout(),
            user_agent,
            policy: config.status_policy(),
        },
        credentials,
    );
    Arc::new(TransportSink::new(Arc::new(transport)))
}

fn coordinator(
    session: &Session,
    config: &Config,
    queue: SharedQueue,
    sink: Arc<dyn Sink>,
) -> SyncCoordinator {
    SyncCoordinator::new(queue, sink)
        .with_rate_limiter(config.rate_limiter())
        .with_sync_max(config.offline.sync_max)
        .with_migrator(LegacyQueueMigrator::new(
            config.legacy_queue_path(&session.data_dir),
            session.data_dir.migration_lock_path(),
        ))
        .with_pass_lock(config.sync_lock_path(&session.data_dir))
        .disabled(config.offline.disabled)
}

fn now_secs() -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let micros = Utc::now().timestamp_micros() as f64;
    micros / 1_000_000.0
}

fn heartbeat_from_args(args: &HeartbeatArgs, ua: &str) -> Result<Heartbeat, HeartlineError> {
    let mut heartbeat = Heartbeat::new(args.entity.clone(), args.time.unwrap_or_else(now_secs));
    heartbeat.entity_type = args
        .entity_type
        .parse()
        .map_err(|e: String| HeartlineError::user("invalid_entity_type", e, "cli:heartbeat"))?;
    heartbeat.category = args.category.parse().map_err(|e: String| {
        HeartlineError::user("invalid_category", e, "cli:heartbeat")
            .with_hint("Use a category such as coding, debugging or 'code reviewing'")
    })?;
    heartbeat.project.clone_from(&args.project);
    heartbeat.branch.clone_from(&args.branch);
    heartbeat.language.clone_from(&args.language);
    heartbeat.is_write = args.write;
    heartbeat.line_number = args.lineno;
    heartbeat.cursor_position = args.cursorpos;
    heartbeat.lines = args.lines_in_file;
    heartbeat.user_agent = Some(ua.to_string());
    Ok(heartbeat)
}

/// Reads extra heartbeats from stdin. Bad input is logged and ignored so
/// the primary heartbeat is still sent.
fn read_extra_heartbeats(ua: &str) -> Vec<Heartbeat> {
    let mut input = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut input) {
        tracing::warn!(error = %err, "failed to read extra heartbeats from stdin");
        return Vec::new();
    }
    if input.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<Heartbeat>>(&input) {
        Ok(mut extras) => {
            for extra in &mut extras {
                if extra.user_agent.is_none() {
                    extra.user_agent = Some(ua.to_string());
                }
            }
            extras
        }
        Err(err) => {
            tracing::warn!(error = %err, "ignoring malformed extra heartbeats");
            Vec::new()
        }
    }
}

#[derive(Serialize)]
struct SubmissionView {
    sent: usize,
    rejected: usize,
    skipped: usize,
    queued: usize,
}

impl From<&Submission> for SubmissionView {
    fn from(s: &Submission) -> Self {
        Self {
            sent: s.count(DeliveryStatus::Sent),
            rejected: s.count(DeliveryStatus::Rejected),
            skipped: s.count(DeliveryStatus::Skipped),
            queued: s.queued,
        }
    }
}

fn handle_heartbeat(session: &Session, args: HeartbeatArgs) -> ExitCode {
    let format = session.format;
    let config = match load_config(session, args.key.as_deref(), args.api_url.as_deref()) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let sanitize = match config.sanitize_config() {
        Ok(sanitize) => sanitize,
        Err(err) => return output_error(&err.into(), format),
    };

    let ua = user_agent(args.plugin.as_deref());
    let mut heartbeats = match heartbeat_from_args(&args, &ua) {
        Ok(heartbeat) => vec![heartbeat],
        Err(err) => return output_error(&err, format),
    };
    if args.extra_heartbeats {
        heartbeats.extend(read_extra_heartbeats(&ua));
    }

    let credentials = match credentials(&config) {
        Ok(credentials) => credentials,
        Err(err) => return output_error(&err, format),
    };
    let sink = build_sink(&config, credentials.clone(), ua);

    let queue = if config.offline.disabled {
        None
    } else {
        Some(open_queue(session, &config))
    };
    let store = match &queue {
        None => OfflineStore::Disabled,
        Some(Ok(queue)) => OfflineStore::Enabled(queue.clone()),
        Some(Err(err)) => OfflineStore::Unavailable(err.clone()),
    };

    let pipeline = Pipeline::live(
        sink.clone(),
        NormalizationStage::new(Arc::new(HeuristicClassifier)),
        CredentialStage::new(credentials),
        RedactionStage::new(sanitize),
    );
    let submission = match LiveSubmitter::new(pipeline, store).submit(heartbeats) {
        Ok(submission) => submission,
        Err(err) => return output_error(&err, format),
    };

    let exit_code = submission.exit_code();
    if exit_code == ExitCode::Success {
        if let Some(Ok(queue)) = queue {
            match coordinator(session, &config, queue, sink).run(SyncMode::RateLimited) {
                Ok(SyncOutcome::Completed(report)) if report.attempted > 0 => {
                    tracing::debug!(sent = report.sent, still_queued = report.still_queued, "flushed offline queue");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "offline sync after heartbeat failed"),
            }
        }
    }

    if format != OutputFormat::Table {
        if let Err(err) = output(SubmissionView::from(&submission), format) {
            eprintln!("Failed to render result: {err}");
        }
    }
    if submission.auth_refused() {
        let err = HeartlineError::transport(
            "api_key_refused",
            "The API refused the configured key; heartbeats were saved offline",
            "cli:heartbeat",
        )
        .with_hint("Check api.key in the config file or HEARTLINE_API_KEY");
        return output_error(&err, format);
    }
    exit_code
}

#[derive(Serialize)]
struct SyncView {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<SyncReport>,
}

fn handle_sync(session: &Session, args: &SyncArgs) -> ExitCode {
    let format = session.format;
    let mut config = match load_config(session, args.key.as_deref(), args.api_url.as_deref()) {
        Ok(config) => config,
        Err(code) => return code,
    };
    if let Some(sync_max) = args.sync_max {
        config.offline.sync_max = sync_max;
    }

    let queue = match open_queue(session, &config) {
        Ok(queue) => queue,
        Err(err) => return output_error(&err, format),
    };
    let sink = match credentials(&config) {
        Ok(credentials) => build_sink(&config, credentials, user_agent(None)),
        Err(err) => return output_error(&err, format),
    };

    let mode = if args.force {
        SyncMode::Forced
    } else {
        SyncMode::RateLimited
    };
    let outcome = match coordinator(session, &config, queue, sink).run(mode) {
        Ok(outcome) => outcome,
        Err(err) => return output_error(&err, format),
    };

    let view = match outcome {
        SyncOutcome::Disabled => SyncView {
            status: "disabled",
            report: None,
        },
        SyncOutcome::RateLimited => SyncView {
            status: "rate_limited",
            report: None,
        },
        SyncOutcome::Busy => SyncView {
            status: "busy",
            report: None,
        },
        SyncOutcome::Completed(report) => SyncView {
            status: "completed",
            report: Some(report),
        },
    };

    match format {
        OutputFormat::Table => match &view.report {
            Some(r) => println!(
                "Sent {} heartbeat(s), rejected {}, {} still queued.",
                r.sent, r.rejected, r.still_queued
            ),
            None => match view.status {
                "disabled" => println!("Offline sync is disabled."),
                "busy" => println!("Skipped: another sync is running."),
                _ => println!("Skipped: last sync was too recent (use --force)."),
            },
        },
        _ => {
            if let Err(err) = output(&view, format) {
                eprintln!("Failed to render sync result: {err}");
            }
        }
    }
    ExitCode::Success
}

#[derive(Serialize)]
struct QueuedView<'a> {
    seq: u64,
    key: &'a str,
    heartbeat: Heartbeat,
}

fn handle_offline(session: &Session, cmd: OfflineCommands) -> ExitCode {
    let format = session.format;
    let config = match load_config(session, None, None) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let queue = match open_queue(session, &config) {
        Ok(queue) => queue,
        Err(err) => return output_error(&err, format),
    };

    match cmd {
        OfflineCommands::Count => match queue.count() {
            Ok(count) => {
                match format {
                    OutputFormat::Table => println!("{count}"),
                    _ => {
                        if let Err(err) = output(serde_json::json!({ "count": count }), format) {
                            eprintln!("Failed to render count: {err}");
                        }
                    }
                }
                ExitCode::Success
            }
            Err(err) => output_error(&err.into(), format),
        },
        OfflineCommands::List(OfflineListArgs { limit }) => match queue.dequeue_batch(limit) {
            Ok(records) => {
                match format {
                    OutputFormat::Table => {
                        if records.is_empty() {
                            println!("No queued heartbeats.");
                        } else {
                            println!("{}", render_table(&QUEUED_HEADERS, &records));
                        }
                    }
                    _ => {
                        let views: Vec<QueuedView<'_>> = records
                            .iter()
                            .map(|r| QueuedView {
                                seq: r.seq,
                                key: r.key.as_str(),
                                heartbeat: r.heartbeat.without_api_key(),
                            })
                            .collect();
                        if let Err(err) = output(&views, format) {
                            eprintln!("Failed to render queue: {err}");
                        }
                    }
                }
                ExitCode::Success
            }
            Err(err) => output_error(&err.into(), format),
        },
    }
}
