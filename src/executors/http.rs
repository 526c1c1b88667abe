//! `http-request` action type (§4.1).
//!
//! Performs a single HTTP call with configurable method, URL, headers,
//! and body. Timeout applies to the full response. Status code and body
//! are recorded on the outcome; truncation follows the same 1 MiB
//! tail-preserving rule as terminal-command output. Unlike the teacher's
//! executor, this one does not evaluate assertions or run extractions —
//! the Failure Classifier, not the action itself, decides whether a
//! response counts as a pass.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::instrument;

use crate::classifier::RawActionResult;
use crate::protocol::{Action, ActionBody};

use super::{ActionExecutor, ExecutionEnvironment};

const STREAM_CAP_BYTES: usize = 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct HttpRequestExecutor {
    client: Client,
}

impl Default for HttpRequestExecutor {
    fn default() -> Self {
        Self {
            client: Client::builder()
                .build()
                .expect("reqwest client with default settings always builds"),
        }
    }
}

#[async_trait]
impl ActionExecutor for HttpRequestExecutor {
    fn can_handle(&self, action: &Action) -> bool {
        matches!(action.body, ActionBody::HttpRequest { .. })
    }

    #[instrument(skip(self, _env), fields(action_id = %action.id))]
    async fn execute(&self, action: &Action, _env: &ExecutionEnvironment) -> RawActionResult {
        let ActionBody::HttpRequest { url, method, body, headers } = &action.body else {
            unreachable!("can_handle guarantees HttpRequest");
        };

        let method = match method.to_uppercase().parse::<reqwest::Method>() {
            Ok(m) => m,
            Err(_) => {
                return RawActionResult {
                    spawn_error: true,
                    ..Default::default()
                }
            }
        };

        let timeout = Duration::from_secs(action.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let mut request = self.client.request(method, url).timeout(timeout);

        if let Some(headers) = headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                let truncated = truncate_tail(&text, STREAM_CAP_BYTES);
                RawActionResult {
                    http_status: Some(status),
                    stdout: truncated,
                    ..Default::default()
                }
            }
            Err(err) if err.is_timeout() => RawActionResult {
                timed_out: true,
                ..Default::default()
            },
            Err(_) => RawActionResult {
                spawn_error: true,
                ..Default::default()
            },
        }
    }
}

fn truncate_tail(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        text.to_string()
    } else {
        text[text.len() - cap..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(url: &str, method: &str) -> Action {
        Action {
            id: "http-1".into(),
            name: "http-1".into(),
            body: ActionBody::HttpRequest {
                url: url.to_string(),
                method: method.to_string(),
                body: None,
                headers: None,
            },
            expected_exit_code: 0,
            timeout: Some(2),
            strict_warnings: false,
        }
    }

    fn env() -> ExecutionEnvironment {
        ExecutionEnvironment {
            workspace_root: std::env::temp_dir(),
            default_timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn unknown_method_sets_spawn_error() {
        let executor = HttpRequestExecutor::default();
        let result = executor.execute(&action("http://127.0.0.1:1/", "FROB"), &env()).await;
        assert!(result.spawn_error);
    }

    #[tokio::test]
    async fn connection_refused_sets_spawn_error_not_panic() {
        let executor = HttpRequestExecutor::default();
        // Port 1 is reserved and should refuse immediately on any CI host.
        let result = executor.execute(&action("http://127.0.0.1:1/", "GET"), &env()).await;
        assert!(result.spawn_error || result.timed_out);
    }

    #[test]
    fn truncate_tail_keeps_only_the_end() {
        let text = "a".repeat(10) + "TAIL";
        let truncated = truncate_tail(&text, 4);
        assert_eq!(truncated, "TAIL");
    }
}
