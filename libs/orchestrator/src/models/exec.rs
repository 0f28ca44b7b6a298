//! Public request and response shapes for the execution runner.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Reference to a session file to stage before execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestFile {
    pub id: String,
    pub session_id: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecRequest {
    pub code: String,
    pub lang: String,
    /// Arbitrary JSON, passed through to the sidecar unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Assistant/agent identifier for cross-session file sharing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Continue an existing session; a new one is created when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub files: Vec<RequestFile>,
}

const ENTITY_ID_MAX_LEN: usize = 40;

impl ExecRequest {
    pub fn validate(&self) -> Result<()> {
        if self.code.is_empty() {
            return Err(Error::InvalidArgument("code is empty".to_string()));
        }
        if self.lang.is_empty() {
            return Err(Error::InvalidArgument("lang is empty".to_string()));
        }
        if let Some(entity_id) = &self.entity_id {
            let valid_chars = entity_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if entity_id.is_empty() || entity_id.len() > ENTITY_ID_MAX_LEN || !valid_chars {
                return Err(Error::InvalidArgument(format!(
                    "entity_id must be 1-{ENTITY_ID_MAX_LEN} characters of [A-Za-z0-9_-]"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub session_id: String,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Whether interpreter state was captured for this execution.
    #[serde(default)]
    pub has_state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_hash: Option<String>,
}
