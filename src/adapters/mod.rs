//! Collaborators at the edge of the pipeline.
//!
//! The pipeline itself never touches the network or the filesystem layout
//! of a project. Those concerns live behind the traits in this module so
//! they can be swapped in tests.
//!
//! - [`transport`] - Delivery of heartbeats to the ingestion API
//! - [`credentials`] - API key selection per heartbeat
//! - [`classify`] - Language and project detection

pub mod classify;
pub mod credentials;
pub mod transport;
