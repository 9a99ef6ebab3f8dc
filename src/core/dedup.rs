//! Intra-batch deduplication by idempotency key.

use crate::core::heartbeat::Heartbeat;
use crate::core::pipeline::{Next, Outcome, Partition, PipelineContext, PipelineError, Stage};
use std::collections::HashSet;

/// Forwards the first heartbeat of every key; later ones are settled as
/// [`Skipped`](crate::core::pipeline::DeliveryStatus::Skipped) without a
/// delivery attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeduplicationStage;

impl Stage for DeduplicationStage {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn process(
        &self,
        ctx: &PipelineContext,
        heartbeats: Vec<Heartbeat>,
        next: Next<'_>,
    ) -> Result<Vec<Outcome>, PipelineError> {
        let mut seen = HashSet::with_capacity(heartbeats.len());
        let mut partition = Partition::with_capacity(heartbeats.len());
        let mut skipped = 0usize;

        for heartbeat in heartbeats {
            if seen.insert(heartbeat.key()) {
                partition.forward(heartbeat);
            } else {
                skipped += 1;
                partition.settle(Outcome::skipped(heartbeat));
            }
        }

        if skipped > 0 {
            tracing::debug!(parent: ctx.span(), skipped, "collapsed duplicate heartbeats");
        }

        partition.run_next(self.name(), ctx, next)
    }
}
