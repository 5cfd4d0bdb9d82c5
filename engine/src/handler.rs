use crate::guard::RateGuard;
use async_trait::async_trait;
use common::interface::{Completion, StageFailure, StageHandler};
use errors::Error;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize)]
struct StageRequest<'a> {
    payload_ref: &'a str,
    correlation_id: &'a str,
}

#[derive(Deserialize)]
struct StageResponse {
    /// Artifact reference the next stage should pick up; absent when the
    /// stage is terminal for this item.
    artifact_ref: Option<String>,
}

/// Stage handler that delegates processing to an external stage service over
/// HTTP. When the stage calls the rate-limited enrichment API, the shared
/// `RateGuard` wraps every request; throttle responses are recorded on the
/// guard and surfaced to the worker as transient failures so the broker's
/// redelivery path retries them.
pub struct HttpStageHandler {
    client: reqwest::Client,
    endpoint: String,
    guard: Option<Arc<RateGuard>>,
}

impl HttpStageHandler {
    pub fn new(endpoint: impl Into<String>, guard: Option<Arc<RateGuard>>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::worker(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            guard,
        })
    }
}

#[async_trait]
impl StageHandler for HttpStageHandler {
    async fn handle(
        &self,
        payload_ref: &str,
        correlation_id: &str,
    ) -> Result<Completion, StageFailure> {
        let _permit = match &self.guard {
            Some(guard) => Some(guard.acquire().await),
            None => None,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&StageRequest {
                payload_ref,
                correlation_id,
            })
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                // Timeouts and connection errors are worth a redelivery.
                return Err(StageFailure::transient(format!(
                    "request to {} failed: {e}",
                    self.endpoint
                )));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            if let Some(guard) = &self.guard {
                guard.note_throttle().await;
            }
            return Err(StageFailure::transient("throttled by upstream (429)"));
        }
        if status.is_server_error() {
            return Err(StageFailure::transient(format!("upstream {status}")));
        }
        if status.is_client_error() {
            // The payload itself is the problem; retrying will not help.
            return Err(StageFailure::permanent(format!("upstream {status}")));
        }

        if let Some(guard) = &self.guard {
            guard.note_success().await;
        }

        match response.json::<StageResponse>().await {
            Ok(body) => {
                debug!("{correlation_id}: stage service accepted {payload_ref}");
                Ok(match body.artifact_ref {
                    Some(r) => Completion::forward(r),
                    None => Completion::done(),
                })
            }
            Err(e) => Err(StageFailure::permanent(format!(
                "undecodable stage response: {e}"
            ))),
        }
    }
}

/// Handler for stages without an external service: the payload reference
/// flows to the next stage unchanged. Keeps a pipeline runnable while a
/// stage service is not yet deployed.
pub struct PassthroughHandler;

#[async_trait]
impl StageHandler for PassthroughHandler {
    async fn handle(
        &self,
        payload_ref: &str,
        correlation_id: &str,
    ) -> Result<Completion, StageFailure> {
        debug!("{correlation_id}: passing {payload_ref} through");
        Ok(Completion::forward(payload_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_handler_builds_with_configured_client() {
        assert!(HttpStageHandler::new("http://localhost:9100/stage", None).is_ok());
    }

    #[tokio::test]
    async fn test_passthrough_forwards_ref() {
        let completion = PassthroughHandler
            .handle("blob/item.json", "corr-1")
            .await
            .unwrap();
        assert_eq!(completion.next_payload_ref.as_deref(), Some("blob/item.json"));
    }
}
