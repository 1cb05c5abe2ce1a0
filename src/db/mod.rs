//! Database module for the postback relay.
//!
//! Provides SQLite storage for profiles, conversions, the delivery log, the
//! durable retry queue and monitoring snapshots.

mod latency_digest;
mod models;
mod store;

pub use latency_digest::*;
pub use models::*;
pub use store::*;
