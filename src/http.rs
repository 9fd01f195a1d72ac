//! JSON-over-HTTP calls shared by the embedding and model providers.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and client-side timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use clause_matrix_core::error::CapabilityError;

/// Build a client with the provider's per-request timeout.
pub fn client(timeout_secs: u64) -> Result<reqwest::Client, CapabilityError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| CapabilityError::Call(format!("failed to build HTTP client: {}", e)))
}

/// Backoff before retry number `attempt` (1-based).
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// POST `body` to `url` and return the decoded JSON response.
///
/// `service` names the provider in error messages.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value, CapabilityError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff(attempt)).await;
        }

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        CapabilityError::Malformed(format!("{} returned invalid JSON: {}", service, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = CapabilityError::Call(format!("{} API error {}: {}", service, status, body_text));

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::debug!(service, %status, attempt, "retryable provider error");
                    last_err = Some(err);
                    continue;
                }

                return Err(err);
            }
            Err(e) => {
                tracing::debug!(service, error = %e, attempt, "provider request failed");
                last_err = Some(CapabilityError::Call(format!(
                    "{} connection error ({}): {}",
                    service, url, e
                )));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        CapabilityError::Call(format!("{} call failed after retries", service))
    }))
}
