//! Typed client for the in-pod sidecar HTTP API.
//!
//! Wire protocol: JSON over HTTP/1.1, file uploads as multipart form
//! data. Connection-level failures are retryable; any HTTP 5xx from
//! `/execute` is terminal for that call.

use crate::models::PodHandle;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("sidecar {op} to {url} failed")]
    Transport {
        op: &'static str,
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("sidecar {op} returned {status}: {body}")]
    Status {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("sidecar {op} timed out after {after:?}")]
    Deadline { op: &'static str, after: Duration },

    #[error("sidecar {op} response undecodable")]
    Decode {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl SidecarError {
    /// Connection refused / unreachable is retryable; HTTP status
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SidecarError::Transport { .. } | SidecarError::Deadline { .. }
        )
    }
}

pub type SidecarResult<T> = std::result::Result<T, SidecarError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub language: String,
    /// Arbitrary JSON from the public request, forwarded unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    /// Names of files already staged into the working directory.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<String>,
    pub capture_state: bool,
    /// Seconds the sidecar allows the program to run.
    pub timeout: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub execution_time_ms: u64,
    /// Base64 interpreter state, present when capture was requested and
    /// the language supports it.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub state_errors: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SidecarFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Deserialize)]
struct FileListing {
    #[serde(default)]
    files: Vec<SidecarFile>,
}

/// Transport capability the runner, lifecycle manager and pool depend on.
#[allow(async_fn_in_trait)]
pub trait SidecarTransport: Send + Sync {
    async fn execute(&self, pod: &PodHandle, req: &ExecuteRequest) -> SidecarResult<ExecuteResponse>;
    async fn upload_file(
        &self,
        pod: &PodHandle,
        filename: &str,
        content: Vec<u8>,
    ) -> SidecarResult<()>;
    async fn list_files(&self, pod: &PodHandle) -> SidecarResult<Vec<SidecarFile>>;
    async fn fetch_file(&self, pod: &PodHandle, name: &str) -> SidecarResult<Vec<u8>>;
    async fn delete_file(&self, pod: &PodHandle, name: &str) -> SidecarResult<()>;
    async fn ready(&self, pod: &PodHandle) -> SidecarResult<bool>;
    async fn health(&self, pod: &PodHandle) -> SidecarResult<bool>;
    /// Cooperative cancellation of a running execution, best-effort.
    async fn cancel(&self, pod: &PodHandle, execution_id: &str) -> SidecarResult<()>;
}

#[derive(Clone)]
pub struct SidecarClient {
    http: reqwest::Client,
    probe_timeout: Duration,
    request_timeout: Duration,
    /// Slack added on top of the sidecar-enforced execution timeout so
    /// the sidecar's own timeout response wins the race.
    execute_grace: Duration,
}

impl SidecarClient {
    pub fn new(
        connect_timeout: Duration,
        probe_timeout: Duration,
        request_timeout: Duration,
        execute_grace: Duration,
    ) -> SidecarResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| SidecarError::Transport {
                op: "build",
                url: String::new(),
                source: Box::new(e),
            })?;
        Ok(Self {
            http,
            probe_timeout,
            request_timeout,
            execute_grace,
        })
    }

    fn map_transport(op: &'static str, url: &str, timeout: Duration, e: reqwest::Error) -> SidecarError {
        if e.is_timeout() {
            SidecarError::Deadline { op, after: timeout }
        } else {
            SidecarError::Transport {
                op,
                url: url.to_string(),
                source: Box::new(e),
            }
        }
    }

    async fn check_status(
        op: &'static str,
        response: reqwest::Response,
    ) -> SidecarResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SidecarError::Status {
            op,
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }

    async fn probe(&self, pod: &PodHandle, op: &'static str, path: &str) -> SidecarResult<bool> {
        let url = format!("{}{path}", pod.sidecar_url());
        let response = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Self::map_transport(op, &url, self.probe_timeout, e))?;
        Ok(response.status().is_success())
    }
}

impl SidecarTransport for SidecarClient {
    async fn execute(&self, pod: &PodHandle, req: &ExecuteRequest) -> SidecarResult<ExecuteResponse> {
        let url = format!("{}/execute", pod.sidecar_url());
        let deadline = Duration::from_secs(req.timeout) + self.execute_grace;
        trace!(msg = "sidecar execute", url = %url, timeout = req.timeout);
        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .json(req)
            .send()
            .await
            .map_err(|e| Self::map_transport("execute", &url, deadline, e))?;
        Self::check_status("execute", response)
            .await?
            .json()
            .await
            .map_err(|e| SidecarError::Decode {
                op: "execute",
                source: e,
            })
    }

    async fn upload_file(
        &self,
        pod: &PodHandle,
        filename: &str,
        content: Vec<u8>,
    ) -> SidecarResult<()> {
        let url = format!("{}/files", pod.sidecar_url());
        let part = reqwest::multipart::Part::bytes(content).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .text("filename", filename.to_string())
            .part("content", part);
        let response = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::map_transport("upload", &url, self.request_timeout, e))?;
        Self::check_status("upload", response).await?;
        Ok(())
    }

    async fn list_files(&self, pod: &PodHandle) -> SidecarResult<Vec<SidecarFile>> {
        let url = format!("{}/files", pod.sidecar_url());
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Self::map_transport("list-files", &url, self.request_timeout, e))?;
        let listing: FileListing = Self::check_status("list-files", response)
            .await?
            .json()
            .await
            .map_err(|e| SidecarError::Decode {
                op: "list-files",
                source: e,
            })?;
        Ok(listing.files)
    }

    async fn fetch_file(&self, pod: &PodHandle, name: &str) -> SidecarResult<Vec<u8>> {
        let url = format!("{}/files/{name}", pod.sidecar_url());
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Self::map_transport("fetch-file", &url, self.request_timeout, e))?;
        let bytes = Self::check_status("fetch-file", response)
            .await?
            .bytes()
            .await
            .map_err(|e| SidecarError::Decode {
                op: "fetch-file",
                source: e,
            })?;
        Ok(bytes.to_vec())
    }

    async fn delete_file(&self, pod: &PodHandle, name: &str) -> SidecarResult<()> {
        let url = format!("{}/files/{name}", pod.sidecar_url());
        let response = self
            .http
            .delete(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Self::map_transport("delete-file", &url, self.request_timeout, e))?;
        Self::check_status("delete-file", response).await?;
        Ok(())
    }

    async fn ready(&self, pod: &PodHandle) -> SidecarResult<bool> {
        self.probe(pod, "ready", "/ready").await
    }

    async fn health(&self, pod: &PodHandle) -> SidecarResult<bool> {
        self.probe(pod, "health", "/health").await
    }

    async fn cancel(&self, pod: &PodHandle, execution_id: &str) -> SidecarResult<()> {
        let url = format!("{}/execute/{execution_id}", pod.sidecar_url());
        let response = self
            .http
            .delete(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Self::map_transport("cancel", &url, self.probe_timeout, e))?;
        Self::check_status("cancel", response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_request_wire_shape() {
        let req = ExecuteRequest {
            code: "x = 1".to_string(),
            language: "py".to_string(),
            args: None,
            files: vec!["data.csv".to_string()],
            initial_state: Some("aGVsbG8=".to_string()),
            capture_state: true,
            timeout: 30,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["language"], "py");
        assert_eq!(json["capture_state"], true);
        assert_eq!(json["files"][0], "data.csv");
        assert!(json.get("args").is_none());
    }

    #[test]
    fn execute_response_defaults_optional_fields() {
        let raw = r#"{"exit_code":0,"stdout":"hi\n","stderr":"","execution_time_ms":12}"#;
        let resp: ExecuteResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.exit_code, 0);
        assert!(resp.state.is_none());
        assert!(resp.state_errors.is_none());
    }

    #[test]
    fn transport_failures_are_retryable_status_is_not() {
        let status = SidecarError::Status {
            op: "execute",
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert!(!status.is_retryable());
        let deadline = SidecarError::Deadline {
            op: "ready",
            after: Duration::from_secs(2),
        };
        assert!(deadline.is_retryable());
    }
}
