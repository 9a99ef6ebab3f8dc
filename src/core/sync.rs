//! Redelivery of queued heartbeats.
//!
//! A sync pass migrates any legacy queue, then drains the offline queue
//! through the resync pipeline in bounded chunks. Records are removed only
//! after the remote has answered for them; anything else stays queued for
//! the next pass.
//!
//! Reading the queue does not claim records, so a pass holds an exclusive
//! lock file for its whole length. A process that finds it taken skips its
//! pass.

use crate::adapters::transport::MAX_BULK_SIZE;
use crate::core::error::{HeartlineError, Result};
use crate::core::heartbeat::IdempotencyKey;
use crate::core::pipeline::{DeliveryStatus, Pipeline, PipelineContext, RunKind, Sink};
use crate::core::rate_limit::RateLimiter;
use crate::storage::legacy::{LegacyQueueMigrator, MigrationOutcome};
use crate::storage::lock;
use crate::storage::queue::{QueuedRecord, SharedQueue};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Whether the rate limiter is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    RateLimited,
    Forced,
}

/// Counters for one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Queued records handed to the pipeline.
    pub attempted: usize,
    pub sent: usize,
    pub rejected: usize,
    /// Records left in the queue after the pass.
    pub still_queued: usize,
    /// Records moved in from the legacy queue.
    pub migrated: usize,
    /// The pass ended because a whole chunk failed to send.
    pub stopped_early: bool,
}

/// Result of [`SyncCoordinator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Offline sync is turned off in configuration.
    Disabled,
    /// The last pass was too recent.
    RateLimited,
    /// Another process is running a pass over the same queue.
    Busy,
    Completed(SyncReport),
}

/// Drives resync passes over the offline queue.
pub struct SyncCoordinator {
    queue: SharedQueue,
    pipeline: Pipeline,
    limiter: RateLimiter,
    migrator: Option<LegacyQueueMigrator>,
    pass_lock: Option<PathBuf>,
    sync_max: usize,
    chunk_size: usize,
    disabled: bool,
}

impl SyncCoordinator {
    /// Creates a coordinator that resyncs `queue` into `sink` with no rate
    /// limit and no legacy migration.
    #[must_use]
    pub fn new(queue: SharedQueue, sink: Arc<dyn Sink>) -> Self {
        Self {
            queue,
            pipeline: Pipeline::resync(sink),
            limiter: RateLimiter::unlimited(),
            migrator: None,
            pass_lock: None,
            sync_max: 1000,
            chunk_size: MAX_BULK_SIZE,
            disabled: false,
        }
    }

    #[must_use]
    pub const fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    #[must_use]
    pub fn with_migrator(mut self, migrator: LegacyQueueMigrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    /// Serializes passes across processes through the lock file at `path`.
    #[must_use]
    pub fn with_pass_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.pass_lock = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_sync_max(mut self, sync_max: usize) -> Self {
        self.sync_max = sync_max;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub const fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Runs one sync pass.
    ///
    /// # Errors
    /// Returns an error if the queue store fails or the resync pipeline
    /// aborts. Records not yet confirmed stay queued in either case.
    pub fn run(&self, mode: SyncMode) -> Result<SyncOutcome> {
        if self.disabled || self.sync_max == 0 {
            tracing::debug!("offline sync disabled");
            return Ok(SyncOutcome::Disabled);
        }

        if mode == SyncMode::RateLimited {
            let last = self.queue.last_sync_at()?;
            if !self.limiter.allowed(last, Utc::now()) {
                tracing::debug!(
                    last_sync_at = ?last,
                    interval_secs = self.limiter.min_interval().as_secs(),
                    "sync skipped by rate limit"
                );
                return Ok(SyncOutcome::RateLimited);
            }
        }

        let _pass = match &self.pass_lock {
            Some(path) => match lock::try_exclusive(path) {
                Ok(Some(file)) => Some(file),
                Ok(None) => {
                    tracing::debug!(lock = %path.display(), "sync pass already running elsewhere");
                    return Ok(SyncOutcome::Busy);
                }
                Err(err) => {
                    return Err(HeartlineError::store(
                        "sync_lock_failed",
                        err.to_string(),
                        "sync:run",
                    )
                    .with_context("path", path.display().to_string()));
                }
            },
            None => None,
        };

        let migrated = self.migrate_legacy();
        let mut report = self.drain()?;
        report.migrated = migrated;
        self.queue.set_last_sync_at(Utc::now())?;

        tracing::info!(
            attempted = report.attempted,
            sent = report.sent,
            rejected = report.rejected,
            still_queued = report.still_queued,
            "sync pass complete"
        );
        Ok(SyncOutcome::Completed(report))
    }

    fn migrate_legacy(&self) -> usize {
        let Some(migrator) = &self.migrator else {
            return 0;
        };
        match migrator.migrate(self.queue.as_ref()) {
            Ok(MigrationOutcome::Migrated { enqueued, .. }) => enqueued,
            Ok(MigrationOutcome::Absent | MigrationOutcome::Busy) => 0,
            Err(err) => {
                let err = HeartlineError::from(err);
                tracing::warn!(
                    legacy = %migrator.legacy_path().display(),
                    code = %err.code,
                    error = %err,
                    "legacy queue migration failed, keeping legacy file"
                );
                0
            }
        }
    }

    fn drain(&self) -> Result<SyncReport> {
        let ctx = PipelineContext::new(RunKind::Resync);
        let mut report = SyncReport::default();
        // Records already handed over this pass that are still queued.
        let mut left_behind: HashSet<IdempotencyKey> = HashSet::new();

        while report.attempted < self.sync_max {
            let want = (self.sync_max - report.attempted).min(self.chunk_size);
            let records: Vec<QueuedRecord> = self
                .queue
                .dequeue_batch(left_behind.len() + want)?
                .into_iter()
                .filter(|r| !left_behind.contains(&r.key))
                .take(want)
                .collect();
            if records.is_empty() {
                break;
            }

            let heartbeats = records.iter().map(|r| r.heartbeat.clone()).collect();
            let outcomes = self.pipeline.run(&ctx, heartbeats).map_err(|err| {
                HeartlineError::system("resync_aborted", err.to_string(), "sync:drain")
                    .recoverable(true)
            })?;

            let mut settled = Vec::new();
            let mut failed = 0;
            for (record, outcome) in records.iter().zip(&outcomes) {
                match outcome.status {
                    DeliveryStatus::Sent => {
                        report.sent += 1;
                        settled.push(record.key.clone());
                    }
                    DeliveryStatus::Rejected => {
                        report.rejected += 1;
                        tracing::warn!(
                            parent: ctx.span(),
                            key = %record.key,
                            error = ?outcome.error,
                            "queued heartbeat rejected, dropping"
                        );
                        settled.push(record.key.clone());
                    }
                    DeliveryStatus::TransportFailed => {
                        failed += 1;
                        left_behind.insert(record.key.clone());
                    }
                    DeliveryStatus::Skipped => {
                        left_behind.insert(record.key.clone());
                    }
                }
            }
            report.attempted += records.len();
            self.queue.remove(&settled)?;

            if failed == records.len() {
                tracing::debug!(parent: ctx.span(), failed, "whole chunk failed, ending pass");
                report.stopped_early = true;
                break;
            }
        }

        report.still_queued = self.queue.count()?;
        Ok(report)
    }
}
