//! Core domain: heartbeats, the processing pipeline and the sync logic.
//!
//! # Architecture
//!
//! ```text
//! live:    normalize ─▶ credentials ─▶ redact ─▶ dedup ─▶ sink ──(failed)──▶ offline queue
//! resync:  offline queue ─▶ dedup ─▶ sink ──(sent/rejected)──▶ remove
//! ```
//!
//! Every heartbeat carries an [`IdempotencyKey`](heartbeat::IdempotencyKey)
//! derived from its identifying fields. The key is what the queue stores
//! records under and what deduplication compares, so a heartbeat is
//! delivered at most once per batch and queued at most once overall.
//!
//! # Modules
//!
//! - [`heartbeat`] - The heartbeat record and its key
//! - [`pipeline`] - Stage/sink traits, outcomes and the pipeline runner
//! - [`normalize`] - Entity path normalization and classification
//! - [`credentials`] - Per-heartbeat API key routing
//! - [`redact`] - Pattern-based hiding of sensitive fields
//! - [`dedup`] - Collapsing of same-key heartbeats in a batch
//! - [`rate_limit`] - Minimum interval between resync passes
//! - [`submit`] - Live submission with offline fallback
//! - [`sync`] - Resync passes over the offline queue
//! - [`config`] - Configuration file and data directory
//! - [`error`] - Structured error types

pub mod config;
pub mod credentials;
pub mod dedup;
pub mod error;
pub mod heartbeat;
pub mod normalize;
pub mod pipeline;
pub mod rate_limit;
pub mod redact;
pub mod submit;
pub mod sync;
