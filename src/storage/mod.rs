//! Persistence for undelivered heartbeats.
//!
//! ```text
//! live pipeline ──(transport failed)──▶ OfflineQueue ──▶ resync pipeline
//!                                            ▲
//!                  legacy JSON-lines file ───┘ (one-time migration)
//! ```
//!
//! # Modules
//!
//! - [`queue`] - Offline queue trait, SQLite and in-memory implementations
//! - [`legacy`] - Migration of the legacy queue file
//! - [`lock`] - Advisory file locks shared by migration and sync passes

pub mod legacy;
pub mod lock;
pub mod queue;
