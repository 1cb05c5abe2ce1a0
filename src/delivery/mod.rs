//! Outbound delivery: HTTP transport, retry policy and the dispatcher.

mod dispatcher;
mod http;
mod retry;

pub use dispatcher::*;
pub use retry::*;

use std::time::Duration;
use thiserror::Error;

/// Transport failures. Every variant is worth retrying.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
}
