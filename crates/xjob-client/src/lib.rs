//! # xjob-client
//!
//! Thin HTTP client for the xjob control API, one method per endpoint.
//! Non-2xx responses surface as `ClientError::Api` with the status and the
//! server's message.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use xjob_shared::job::record::JobRecord;
use xjob_shared::job::CreateJobRequest;

/// Client operation result type
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the control API client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether retrying the request could help
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClientError::Http(err) => err.is_timeout() || err.is_connect(),
            ClientError::Api { status, .. } => *status >= 500,
            ClientError::Serialization(_) => false,
        }
    }
}

/// Client for one control API endpoint
#[derive(Debug, Clone)]
pub struct XjobClient {
    base_url: String,
    http: reqwest::Client,
}

impl XjobClient {
    /// Create a client against `http://host:port` (no trailing slash).
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            base_url: format!("{}/v1.0/xcute", endpoint.trim_end_matches('/')),
            http: reqwest::Client::new(),
        }
    }

    async fn check(response: reqwest::Response) -> ClientResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<Value>().await {
            Ok(body) => body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message")
                .to_string(),
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Create a job; the server answers `202` with the full record.
    pub async fn job_create(&self, request: &CreateJobRequest) -> ClientResult<JobRecord> {
        let response = self
            .http
            .post(format!("{}/jobs", self.base_url))
            .json(request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Paginated job listing.
    pub async fn job_list(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> ClientResult<Vec<JobRecord>> {
        let mut request = self.http.get(format!("{}/jobs", self.base_url));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        if let Some(marker) = marker {
            request = request.query(&[("marker", marker)]);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    /// All waiting jobs, queue order.
    pub async fn job_waiting(&self) -> ClientResult<Vec<JobRecord>> {
        let response = self
            .http
            .get(format!("{}/jobs/waiting", self.base_url))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// One job record.
    pub async fn job_show(&self, job_id: &str) -> ClientResult<JobRecord> {
        let response = self
            .http
            .get(format!("{}/jobs/{job_id}", self.base_url))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn job_pause(&self, job_id: &str) -> ClientResult<()> {
        let response = self
            .http
            .post(format!("{}/jobs/{job_id}/pause", self.base_url))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn job_resume(&self, job_id: &str) -> ClientResult<()> {
        let response = self
            .http
            .post(format!("{}/jobs/{job_id}/resume", self.base_url))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn job_delete(&self, job_id: &str) -> ClientResult<()> {
        let response = self
            .http
            .delete(format!("{}/jobs/{job_id}", self.base_url))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Advisory locks currently held: lock key -> job id.
    pub async fn locks(&self) -> ClientResult<BTreeMap<String, String>> {
        let response = self
            .http
            .get(format!("{}/jobs/locks", self.base_url))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Jobs assigned to one orchestrator.
    pub async fn orchestrator_jobs(&self, orchestrator_id: &str) -> ClientResult<Vec<JobRecord>> {
        let response = self
            .http
            .get(format!(
                "{}/orchestrator/{orchestrator_id}/jobs",
                self.base_url
            ))
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let client = XjobClient::new("http://127.0.0.1:8000/");
        assert_eq!(client.base_url, "http://127.0.0.1:8000/v1.0/xcute");
    }

    #[test]
    fn test_api_error_recoverability() {
        let err = ClientError::Api {
            status: 503,
            message: "busy".to_string(),
        };
        assert!(err.is_recoverable());

        let err = ClientError::Api {
            status: 404,
            message: "gone".to_string(),
        };
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_connect_error_is_http_error() {
        let client = XjobClient::new("http://127.0.0.1:1");
        let result = client.job_waiting().await;
        assert!(matches!(result, Err(ClientError::Http(_))));
    }
}
