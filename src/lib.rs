//! flowlens: design flow analysis orchestrator.
//!
//! Turns a selection of design frames into a single cache-aware,
//! cancellable remote analysis call, gated by a local credit ledger and
//! unlocked through a short-lived cross-process auth handshake.

pub mod analysis;
pub mod bridge;
pub mod config;
pub mod credits;
pub mod error;
pub mod export;
pub mod selection;
pub mod server;
pub mod session;
