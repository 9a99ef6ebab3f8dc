//! Live submission of freshly captured heartbeats.
//!
//! Heartbeats go through the live pipeline once. Whatever could not be
//! delivered is saved to the offline queue in its normalized, redacted form
//! so a later resync sends exactly what the live path would have sent.

use crate::core::error::{ExitCode, HeartlineError, Result};
use crate::core::heartbeat::Heartbeat;
use crate::core::pipeline::{DeliveryStatus, Outcome, Pipeline, PipelineContext, RunKind};
use crate::storage::queue::SharedQueue;

/// Where undelivered heartbeats go.
pub enum OfflineStore {
    Enabled(SharedQueue),
    /// Offline queueing is turned off; failures are dropped.
    Disabled,
    /// The queue could not be opened; failures are lost.
    Unavailable(HeartlineError),
}

/// Result of one live submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub outcomes: Vec<Outcome>,
    /// Heartbeats saved to the offline queue.
    pub queued: usize,
}

impl Submission {
    #[must_use]
    pub fn count(&self, status: DeliveryStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Whether a failure was caused by the remote refusing the credential.
    #[must_use]
    pub fn auth_refused(&self) -> bool {
        self.outcomes.iter().any(|o| {
            o.status == DeliveryStatus::TransportFailed
                && matches!(
                    o.error.as_ref().and_then(|e| e.status_code),
                    Some(401 | 403)
                )
        })
    }

    /// Process exit code for this submission.
    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        if self.auth_refused() {
            ExitCode::Auth
        } else if self.queued > 0 {
            ExitCode::Queued
        } else if self.count(DeliveryStatus::Rejected) > 0
            || self.count(DeliveryStatus::TransportFailed) > 0
        {
            ExitCode::Error
        } else {
            ExitCode::Success
        }
    }
}

/// Runs the live pipeline and queues what failed.
pub struct LiveSubmitter {
    pipeline: Pipeline,
    store: OfflineStore,
}

impl LiveSubmitter {
    #[must_use]
    pub fn new(pipeline: Pipeline, store: OfflineStore) -> Self {
        Self { pipeline, store }
    }

    /// Submits `heartbeats`.
    ///
    /// # Errors
    /// Returns an error if the pipeline aborts, or if heartbeats that failed
    /// delivery could not be saved offline.
    pub fn submit(&self, heartbeats: Vec<Heartbeat>) -> Result<Submission> {
        let ctx = PipelineContext::new(RunKind::Live);
        let submitted = heartbeats.len();
        let outcomes = self.pipeline.run(&ctx, heartbeats).map_err(|err| {
            tracing::error!(parent: ctx.span(), lost = submitted, error = %err, "live pipeline aborted");
            HeartlineError::system("pipeline_aborted", err.to_string(), "submit:live")
        })?;

        let failed: Vec<Heartbeat> = outcomes
            .iter()
            .filter(|o| o.status == DeliveryStatus::TransportFailed)
            .map(|o| o.heartbeat.clone())
            .collect();

        let queued = if failed.is_empty() {
            0
        } else {
            self.save_offline(&ctx, &failed)?
        };

        tracing::debug!(
            parent: ctx.span(),
            submitted,
            sent = outcomes.iter().filter(|o| o.status == DeliveryStatus::Sent).count(),
            queued,
            "live submission done"
        );
        Ok(Submission { outcomes, queued })
    }

    fn save_offline(&self, ctx: &PipelineContext, failed: &[Heartbeat]) -> Result<usize> {
        match &self.store {
            OfflineStore::Enabled(queue) => match queue.enqueue_all(failed) {
                Ok(new) => {
                    tracing::debug!(parent: ctx.span(), failed = failed.len(), new, "saved heartbeats offline");
                    Ok(failed.len())
                }
                Err(err) => {
                    tracing::error!(
                        parent: ctx.span(),
                        lost = failed.len(),
                        error = %err,
                        "failed to save undelivered heartbeats offline"
                    );
                    Err(err.into())
                }
            },
            OfflineStore::Disabled => {
                tracing::warn!(parent: ctx.span(), dropped = failed.len(), "offline queue disabled, dropping undelivered heartbeats");
                Ok(0)
            }
            OfflineStore::Unavailable(err) => {
                tracing::error!(
                    parent: ctx.span(),
                    lost = failed.len(),
                    error = %err,
                    "offline queue unavailable, undelivered heartbeats lost"
                );
                Err(err.clone())
            }
        }
    }
}
