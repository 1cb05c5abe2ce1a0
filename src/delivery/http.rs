//! HTTP transport for built postbacks.

use super::DeliveryError;
use crate::db::HttpMethod;
use crate::postback::BuiltRequest;

use std::time::{Duration, Instant};

/// Longest response body kept in the delivery log.
pub const MAX_RESPONSE_BODY: usize = 1024;

/// What the tracker answered.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerResponse {
    pub status: u16,
    /// Truncated to [`MAX_RESPONSE_BODY`] characters.
    pub body: String,
}

/// Build the shared client with a hard per-request timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, DeliveryError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DeliveryError::Network(e.to_string()))
}

/// Send one postback.
///
/// Returns the elapsed time along with the result, so failures still carry
/// a latency sample.
pub async fn send_postback(
    client: &reqwest::Client,
    request: &BuiltRequest,
    timeout: Duration,
) -> (Duration, Result<TrackerResponse, DeliveryError>) {
    let start = Instant::now();
    let result = send(client, request, timeout).await;
    (start.elapsed(), result)
}

async fn send(
    client: &reqwest::Client,
    request: &BuiltRequest,
    timeout: Duration,
) -> Result<TrackerResponse, DeliveryError> {
    let mut builder = match request.method {
        HttpMethod::Get => client.get(&request.url),
        HttpMethod::Post => client.post(&request.url).form(&request.form),
    };
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            DeliveryError::Timeout(timeout)
        } else {
            DeliveryError::Network(e.to_string())
        }
    };

    let response = builder.send().await.map_err(map_err)?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(map_err)?;

    Ok(TrackerResponse {
        status,
        body: truncate_body(&body),
    })
}

fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_RESPONSE_BODY).collect()
}
