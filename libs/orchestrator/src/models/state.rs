//! Interpreter-state metadata. The blob itself is opaque to the
//! orchestrator; only size and fingerprint are inspected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which tier answered a state lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateSource {
    /// KV-resident, TTL-bound.
    Hot,
    /// Object-store resident, no TTL.
    Archive,
}

serde_plain::derive_display_from_serialize!(StateSource);

/// Metadata about stored state, returned without transferring the blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateInfo {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<StateSource>,
}

impl StateInfo {
    pub fn missing() -> Self {
        Self {
            exists: false,
            session_id: None,
            size: None,
            hash: None,
            created_at: None,
            expires_at: None,
            source: None,
        }
    }
}

/// Result of a state save: size and fingerprint of the decoded bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpload {
    pub size: u64,
    pub hash: String,
}
