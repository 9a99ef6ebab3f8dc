//! Heartline - a telemetry client for developer-activity heartbeats.
//!
//! This crate provides the library behind the `heartline` binary: the
//! heartbeat pipeline, the durable offline queue and the resync machinery.

pub mod adapters;
pub mod cli;
pub mod core;
pub mod storage;
pub mod telemetry;
