//! Heartbeat processing pipeline.
//!
//! A pipeline is an ordered list of [`Stage`]s wrapped around a terminal
//! [`Sink`]. Each stage sees the pending batch plus a [`Next`] continuation
//! for the rest of the pipeline. It may mutate heartbeats, settle some of
//! them itself (without calling `next`), or abort the whole batch.
//!
//! ```text
//! live:    normalize ─▶ credentials ─▶ redact ─▶ dedup ─▶ sink
//! resync:                                         dedup ─▶ sink
//! ```
//!
//! Invariant: `run` returns exactly one [`Outcome`] per submitted heartbeat,
//! in submission order.

use crate::adapters::transport::Transport;
use crate::core::credentials::CredentialStage;
use crate::core::dedup::DeduplicationStage;
use crate::core::heartbeat::Heartbeat;
use crate::core::normalize::NormalizationStage;
use crate::core::redact::RedactionStage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Delivery status of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Accepted by the remote.
    Sent,
    /// Permanently refused; retrying will not help.
    Rejected,
    /// Not delivered; retry later.
    TransportFailed,
    /// Not attempted: another heartbeat in the batch has the same key.
    Skipped,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Rejected => write!(f, "rejected"),
            Self::TransportFailed => write!(f, "transport_failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a heartbeat was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    /// Missing or malformed required field, detected locally.
    Validation,
    /// Network failure, timeout, or retryable HTTP status.
    Transport,
    /// Remote refused the heartbeat permanently.
    Rejected,
    /// Collapsed into an earlier heartbeat with the same key.
    Duplicate,
}

/// Error detail attached to an [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl DeliveryError {
    #[must_use]
    pub fn new(kind: DeliveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// Per-heartbeat result of a pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub heartbeat: Heartbeat,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeliveryError>,
}

impl Outcome {
    #[must_use]
    pub const fn sent(heartbeat: Heartbeat) -> Self {
        Self {
            heartbeat,
            status: DeliveryStatus::Sent,
            error: None,
        }
    }

    #[must_use]
    pub const fn rejected(heartbeat: Heartbeat, error: DeliveryError) -> Self {
        Self {
            heartbeat,
            status: DeliveryStatus::Rejected,
            error: Some(error),
        }
    }

    #[must_use]
    pub const fn transport_failed(heartbeat: Heartbeat, error: DeliveryError) -> Self {
        Self {
            heartbeat,
            status: DeliveryStatus::TransportFailed,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn skipped(heartbeat: Heartbeat) -> Self {
        Self {
            heartbeat,
            status: DeliveryStatus::Skipped,
            error: Some(DeliveryError::new(
                DeliveryErrorKind::Duplicate,
                "skipped, already represented in this batch",
            )),
        }
    }

    /// Builds one transport failure per heartbeat, for whole-call failures.
    #[must_use]
    pub fn all_transport_failed(heartbeats: Vec<Heartbeat>, error: &DeliveryError) -> Vec<Self> {
        heartbeats
            .into_iter()
            .map(|h| Self::transport_failed(h, error.clone()))
            .collect()
    }
}

/// Which path is running the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Live,
    Resync,
}

impl RunKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Resync => "resync",
        }
    }
}

/// Per-invocation context handed to every stage.
///
/// Stages log through [`PipelineContext::span`] instead of a process-wide
/// handle so each stage can be exercised in isolation.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    run: RunKind,
    span: tracing::Span,
}

impl PipelineContext {
    #[must_use]
    pub fn new(run: RunKind) -> Self {
        let span = tracing::debug_span!("pipeline", run = run.as_str());
        Self { run, span }
    }

    #[must_use]
    pub const fn run(&self) -> RunKind {
        self.run
    }

    #[must_use]
    pub const fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// Errors that abort a whole pipeline invocation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stage '{stage}' aborted the batch: {message}")]
    Aborted {
        stage: &'static str,
        message: String,
    },
    #[error("stage '{stage}' returned {actual} outcomes for {expected} heartbeats")]
    Cardinality {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Terminal element of a pipeline.
pub trait Sink: Send + Sync {
    /// Delivers the batch, returning one outcome per heartbeat in order.
    fn deliver(&self, ctx: &PipelineContext, heartbeats: Vec<Heartbeat>) -> Vec<Outcome>;
}

/// One transformation step of a pipeline.
pub trait Stage: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Processes the batch and hands what remains to `next`.
    ///
    /// # Errors
    /// Returns an error to abort the whole invocation.
    fn process(
        &self,
        ctx: &PipelineContext,
        heartbeats: Vec<Heartbeat>,
        next: Next<'_>,
    ) -> Result<Vec<Outcome>, PipelineError>;
}

/// Continuation representing the remainder of a pipeline.
pub struct Next<'a> {
    stages: &'a [Box<dyn Stage>],
    sink: &'a dyn Sink,
}

impl Next<'_> {
    /// Runs the rest of the pipeline over `heartbeats`.
    ///
    /// # Errors
    /// Propagates aborts from downstream stages, and reports a
    /// [`PipelineError::Cardinality`] if a downstream element broke the
    /// one-outcome-per-heartbeat contract.
    pub fn run(
        self,
        ctx: &PipelineContext,
        heartbeats: Vec<Heartbeat>,
    ) -> Result<Vec<Outcome>, PipelineError> {
        if heartbeats.is_empty() {
            return Ok(Vec::new());
        }
        let expected = heartbeats.len();
        let (stage_name, outcomes) = match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    sink: self.sink,
                };
                (stage.name(), stage.process(ctx, heartbeats, next)?)
            }
            None => ("sink", self.sink.deliver(ctx, heartbeats)),
        };
        if outcomes.len() != expected {
            return Err(PipelineError::Cardinality {
                stage: stage_name,
                expected,
                actual: outcomes.len(),
            });
        }
        Ok(outcomes)
    }
}

/// A composed pipeline.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    sink: Arc<dyn Sink>,
}

impl Pipeline {
    /// Starts an empty pipeline ending in `sink`.
    #[must_use]
    pub fn builder(sink: Arc<dyn Sink>) -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            sink,
        }
    }

    /// The composition used for freshly captured heartbeats.
    #[must_use]
    pub fn live(
        sink: Arc<dyn Sink>,
        normalize: NormalizationStage,
        credentials: CredentialStage,
        redact: RedactionStage,
    ) -> Self {
        Self::builder(sink)
            .with_stage(normalize)
            .with_stage(credentials)
            .with_stage(redact)
            .with_stage(DeduplicationStage)
            .build()
    }

    /// The composition used to redeliver queued heartbeats. Queued
    /// heartbeats were normalized, keyed and redacted before they were
    /// enqueued.
    #[must_use]
    pub fn resync(sink: Arc<dyn Sink>) -> Self {
        Self::builder(sink).with_stage(DeduplicationStage).build()
    }

    /// Names of the stages in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs `heartbeats` through the pipeline.
    ///
    /// # Errors
    /// Returns an error when a stage aborts the batch; in that case no
    /// heartbeat of the batch counts as delivered.
    pub fn run(
        &self,
        ctx: &PipelineContext,
        heartbeats: Vec<Heartbeat>,
    ) -> Result<Vec<Outcome>, PipelineError> {
        let _entered = ctx.span().enter();
        tracing::debug!(count = heartbeats.len(), "running heartbeat pipeline");
        Next {
            stages: &self.stages,
            sink: self.sink.as_ref(),
        }
        .run(ctx, heartbeats)
    }
}

/// Builder for [`Pipeline`]. Stages run in the order they are added.
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    sink: Arc<dyn Sink>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            sink: self.sink,
        }
    }
}

/// Settles heartbeats one by one and forwards the rest.
///
/// Stages that drop heartbeats record, per input position, either a
/// synthesized outcome or "forwarded". After `next` returns, forwarded
/// outcomes are slotted back into their original positions.
#[derive(Debug, Default)]
pub struct Partition {
    slots: Vec<Option<Outcome>>,
    forwarded: Vec<Heartbeat>,
}

impl Partition {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            forwarded: Vec::with_capacity(capacity),
        }
    }

    pub fn forward(&mut self, heartbeat: Heartbeat) {
        self.slots.push(None);
        self.forwarded.push(heartbeat);
    }

    pub fn settle(&mut self, outcome: Outcome) {
        self.slots.push(Some(outcome));
    }

    /// Runs `next` over the forwarded heartbeats and merges the outcomes.
    ///
    /// # Errors
    /// Propagates downstream errors.
    pub fn run_next(
        self,
        stage: &'static str,
        ctx: &PipelineContext,
        next: Next<'_>,
    ) -> Result<Vec<Outcome>, PipelineError> {
        let expected = self.forwarded.len();
        let downstream = next.run(ctx, self.forwarded)?;
        if downstream.len() != expected {
            return Err(PipelineError::Cardinality {
                stage,
                expected,
                actual: downstream.len(),
            });
        }
        let mut downstream = downstream.into_iter();
        self.slots
            .into_iter()
            .map(|slot| {
                slot.or_else(|| downstream.next()).ok_or(PipelineError::Cardinality {
                    stage,
                    expected,
                    actual: 0,
                })
            })
            .collect()
    }
}

/// Sink that validates heartbeats and hands valid ones to a [`Transport`].
pub struct TransportSink {
    transport: Arc<dyn Transport>,
}

impl TransportSink {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

/// Returns a validation message if `heartbeat` lacks a required field.
fn validate(heartbeat: &Heartbeat) -> Option<String> {
    if heartbeat.entity.trim().is_empty() {
        return Some("entity is empty".to_string());
    }
    if !heartbeat.time.is_finite() || heartbeat.time <= 0.0 {
        return Some(format!("invalid time {}", heartbeat.time));
    }
    None
}

impl Sink for TransportSink {
    fn deliver(&self, ctx: &PipelineContext, heartbeats: Vec<Heartbeat>) -> Vec<Outcome> {
        let mut partition = Partition::with_capacity(heartbeats.len());
        for heartbeat in heartbeats {
            match validate(&heartbeat) {
                Some(message) => {
                    tracing::warn!(parent: ctx.span(), entity = %heartbeat.entity, %message, "heartbeat failed validation");
                    partition.settle(Outcome::rejected(
                        heartbeat,
                        DeliveryError::new(DeliveryErrorKind::Validation, message),
                    ));
                }
                None => partition.forward(heartbeat),
            }
        }

        let Partition {
            slots,
            forwarded,
        } = partition;
        let expected = forwarded.len();
        let mut sent = if forwarded.is_empty() {
            Vec::new()
        } else {
            let mut outcomes = self.transport.send(&forwarded);
            if outcomes.len() != expected {
                tracing::warn!(
                    parent: ctx.span(),
                    expected,
                    actual = outcomes.len(),
                    "transport returned wrong number of outcomes"
                );
                let missing = DeliveryError::new(
                    DeliveryErrorKind::Transport,
                    "no outcome reported by transport",
                );
                outcomes.truncate(expected);
                let reported = outcomes.len();
                outcomes.extend(
                    forwarded[reported..]
                        .iter()
                        .cloned()
                        .map(|h| Outcome::transport_failed(h, missing.clone())),
                );
            }
            outcomes
        }
        .into_iter();

        slots
            .into_iter()
            .filter_map(|slot| slot.or_else(|| sent.next()))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink that records batches and answers with a fixed status per entity.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub batches: Mutex<Vec<Vec<Heartbeat>>>,
        pub fail_entities: Vec<String>,
        pub reject_entities: Vec<String>,
    }

    impl Sink for RecordingSink {
        fn deliver(&self, _ctx: &PipelineContext, heartbeats: Vec<Heartbeat>) -> Vec<Outcome> {
            self.batches.lock().expect("lock").push(heartbeats.clone());
            heartbeats
                .into_iter()
                .map(|h| {
                    if self.fail_entities.contains(&h.entity) {
                        Outcome::transport_failed(
                            h,
                            DeliveryError::new(DeliveryErrorKind::Transport, "offline"),
                        )
                    } else if self.reject_entities.contains(&h.entity) {
                        Outcome::rejected(
                            h,
                            DeliveryError::new(DeliveryErrorKind::Rejected, "bad").with_status(400),
                        )
                    } else {
                        Outcome::sent(h)
                    }
                })
                .collect()
        }
    }

    struct Abort;

    impl Stage for Abort {
        fn name(&self) -> &'static str {
            "abort"
        }

        fn process(
            &self,
            _ctx: &PipelineContext,
            _heartbeats: Vec<Heartbeat>,
            _next: Next<'_>,
        ) -> Result<Vec<Outcome>, PipelineError> {
            Err(PipelineError::Aborted {
                stage: "abort",
                message: "nope".to_string(),
            })
        }
    }

    struct DropEven;

    impl Stage for DropEven {
        fn name(&self) -> &'static str {
            "drop_even"
        }

        fn process(
            &self,
            ctx: &PipelineContext,
            heartbeats: Vec<Heartbeat>,
            next: Next<'_>,
        ) -> Result<Vec<Outcome>, PipelineError> {
            let mut partition = Partition::with_capacity(heartbeats.len());
            for (i, h) in heartbeats.into_iter().enumerate() {
                if i % 2 == 0 {
                    partition.settle(Outcome::skipped(h));
                } else {
                    partition.forward(h);
                }
            }
            partition.run_next(self.name(), ctx, next)
        }
    }

    fn batch(n: usize) -> Vec<Heartbeat> {
        (0..n)
            .map(|i| Heartbeat::new(format!("/src/{i}.rs"), 1_700_000_000.0 + i as f64))
            .collect()
    }

    #[test]
    fn empty_batch_does_not_reach_sink() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::resync(sink.clone());
        let outcomes = pipeline
            .run(&PipelineContext::new(RunKind::Resync), Vec::new())
            .unwrap();
        assert!(outcomes.is_empty());
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn dropped_heartbeats_keep_their_position() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::builder(sink.clone()).with_stage(DropEven).build();
        let outcomes = pipeline
            .run(&PipelineContext::new(RunKind::Live), batch(5))
            .unwrap();

        let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                DeliveryStatus::Skipped,
                DeliveryStatus::Sent,
                DeliveryStatus::Skipped,
                DeliveryStatus::Sent,
                DeliveryStatus::Skipped,
            ]
        );
        let entities: Vec<_> = outcomes.iter().map(|o| o.heartbeat.entity.clone()).collect();
        assert_eq!(entities, batch(5).into_iter().map(|h| h.entity).collect::<Vec<_>>());
        assert_eq!(sink.batches.lock().unwrap()[0].len(), 2);
    }

    #[test]
    fn abort_stops_before_sink() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::builder(sink.clone()).with_stage(Abort).build();
        let err = pipeline
            .run(&PipelineContext::new(RunKind::Live), batch(2))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Aborted { stage: "abort", .. }));
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn canonical_compositions_are_ordered() {
        let sink: Arc<dyn Sink> = Arc::new(RecordingSink::default());
        let live = Pipeline::live(
            sink.clone(),
            NormalizationStage::default(),
            CredentialStage::default(),
            RedactionStage::default(),
        );
        assert_eq!(
            live.stage_names(),
            vec!["normalize", "credentials", "redact", "dedup"]
        );
        assert_eq!(Pipeline::resync(sink).stage_names(), vec!["dedup"]);
    }

    struct ShortTransport;

    impl Transport for ShortTransport {
        fn send(&self, heartbeats: &[Heartbeat]) -> Vec<Outcome> {
            heartbeats.iter().take(1).cloned().map(Outcome::sent).collect()
        }
    }

    #[test]
    fn transport_sink_validates_and_pads_missing_outcomes() {
        let sink = TransportSink::new(Arc::new(ShortTransport));
        let mut hb = batch(3);
        hb[0].entity = "  ".to_string();
        let outcomes = sink.deliver(&PipelineContext::new(RunKind::Live), hb);

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].status, DeliveryStatus::Rejected);
        assert_eq!(
            outcomes[0].error.as_ref().map(|e| e.kind),
            Some(DeliveryErrorKind::Validation)
        );
        assert_eq!(outcomes[1].status, DeliveryStatus::Sent);
        assert_eq!(outcomes[2].status, DeliveryStatus::TransportFailed);
        assert_eq!(outcomes[2].heartbeat.entity, "/src/2.rs");
    }
}
