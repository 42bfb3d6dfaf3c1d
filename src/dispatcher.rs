//! Best-effort delivery of outbound webhook callbacks.
//!
//! Deliveries run detached from the job lifecycle: a callback failure is
//! logged and never changes a job or batch state.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

/// Retry schedule for callback delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: base * 2^(attempt-1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }
}

/// Posts terminal-state notifications to caller-supplied URLs.
#[derive(Clone)]
pub struct CallbackDispatcher {
    client: Client,
    policy: RetryPolicy,
}

impl CallbackDispatcher {
    pub fn new(policy: RetryPolicy) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self { client, policy }
    }

    /// Fire-and-forget delivery. The spawned task owns the retry loop; the
    /// caller never waits on it.
    pub fn notify(&self, url: String, payload: Value) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.deliver(&url, &payload).await;
        });
    }

    /// Delivers the payload, retrying with exponential backoff. Returns
    /// whether any attempt got a success status back.
    pub async fn deliver(&self, url: &str, payload: &Value) -> bool {
        for attempt in 1..=self.policy.max_attempts {
            match self.client.post(url).json(payload).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url, attempt, "callback delivered");
                    return true;
                }
                Ok(response) => {
                    warn!(
                        url,
                        attempt,
                        status = %response.status(),
                        "callback rejected by receiver"
                    );
                }
                Err(err) => {
                    warn!(url, attempt, error = %err, "callback request failed");
                }
            }
            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
            }
        }
        warn!(
            url,
            attempts = self.policy.max_attempts,
            "giving up on callback delivery"
        );
        false
    }
}

impl Default for CallbackDispatcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 5,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn delivers_payload_on_first_attempt() {
        let server = MockServer::start().await;
        let payload = json!({"job_id": "j-1", "status": "succeeded"});
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(&payload))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = CallbackDispatcher::new(fast_policy(3));
        let delivered = dispatcher
            .deliver(&format!("{}/hook", server.uri()), &payload)
            .await;
        assert!(delivered);
    }

    #[tokio::test]
    async fn retries_until_receiver_accepts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = CallbackDispatcher::new(fast_policy(3));
        let delivered = dispatcher.deliver(&server.uri(), &json!({})).await;
        assert!(delivered);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let dispatcher = CallbackDispatcher::new(fast_policy(2));
        let delivered = dispatcher.deliver(&server.uri(), &json!({})).await;
        assert!(!delivered);
    }
}
