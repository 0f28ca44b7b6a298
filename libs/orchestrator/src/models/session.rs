//! Session records: durable identity binding executions, files and
//! interpreter state across invocations.

use crate::error::{Error, Result};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Idle,
    Terminated,
    Error,
}

serde_plain::derive_display_from_serialize!(SessionStatus);
serde_plain::derive_fromstr_from_deserialize!(SessionStatus);

/// A file known to the session, stored in the object store and staged
/// into the pod working directory on execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub path: String,
}

pub const DEFAULT_WORKING_DIRECTORY: &str = "/mnt/data";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub working_directory: String,
    /// Pod currently bound to this session, persisted before any sidecar
    /// call so a restart can account for in-flight bindings.
    pub pod_name: Option<String>,
    /// Keyed by file id.
    pub files: HashMap<String, FileInfo>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Cross-session grouping identifier (an assistant or agent).
    pub entity_id: Option<String>,
}

impl Session {
    pub fn new(session_id: String, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            expires_at: now + ttl,
            working_directory: DEFAULT_WORKING_DIRECTORY.to_string(),
            pod_name: None,
            files: HashMap::new(),
            metadata: serde_json::Map::new(),
            entity_id: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Flatten into KV hash fields.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let serialize = |what: &str, v: serde_json::Result<String>| {
            v.map_err(|e| Error::Internal(format!("failed to serialize session {what}"), Some(Box::new(e))))
        };
        let mut fields = vec![
            ("status".to_string(), self.status.to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("last_activity".to_string(), self.last_activity.to_rfc3339()),
            ("expires_at".to_string(), self.expires_at.to_rfc3339()),
            (
                "working_directory".to_string(),
                self.working_directory.clone(),
            ),
            (
                "files".to_string(),
                serialize("files", serde_json::to_string(&self.files))?,
            ),
            (
                "metadata".to_string(),
                serialize("metadata", serde_json::to_string(&self.metadata))?,
            ),
        ];
        if let Some(entity_id) = &self.entity_id {
            fields.push(("entity_id".to_string(), entity_id.clone()));
        }
        if let Some(pod_name) = &self.pod_name {
            fields.push(("pod_name".to_string(), pod_name.clone()));
        }
        Ok(fields)
    }

    /// Rebuild from KV hash fields. An empty map means the key is gone.
    pub fn from_fields(session_id: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| Error::Internal(format!("session field {name} missing"), None))
        };
        let time = |name: &str| -> Result<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(get(name)?)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    Error::Internal(format!("session field {name} unparseable"), Some(Box::new(e)))
                })
        };
        Ok(Self {
            session_id: session_id.to_string(),
            status: get("status")?
                .parse()
                .map_err(|_| Error::Internal("session status unparseable".to_string(), None))?,
            created_at: time("created_at")?,
            last_activity: time("last_activity")?,
            expires_at: time("expires_at")?,
            working_directory: get("working_directory")?.clone(),
            files: serde_json::from_str(get("files")?).map_err(|e| {
                Error::Internal("session files unparseable".to_string(), Some(Box::new(e)))
            })?,
            metadata: serde_json::from_str(get("metadata")?).map_err(|e| {
                Error::Internal("session metadata unparseable".to_string(), Some(Box::new(e)))
            })?,
            entity_id: fields.get("entity_id").cloned(),
            pod_name: fields.get("pod_name").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_roundtrip() {
        let mut session = Session::new("sess-1".to_string(), chrono::Duration::hours(1));
        session.entity_id = Some("asst_42".to_string());
        session.metadata.insert(
            "owner".to_string(),
            serde_json::Value::String("alice".to_string()),
        );
        session.files.insert(
            "f1".to_string(),
            FileInfo {
                file_id: "f1".to_string(),
                filename: "data.csv".to_string(),
                size: 128,
                content_type: "text/csv".to_string(),
                created_at: Utc::now(),
                path: "/mnt/data/data.csv".to_string(),
            },
        );

        let fields: HashMap<String, String> = session.to_fields().unwrap().into_iter().collect();
        let parsed = Session::from_fields("sess-1", &fields).unwrap();

        assert_eq!(parsed.session_id, "sess-1");
        assert_eq!(parsed.status, SessionStatus::Active);
        assert_eq!(parsed.entity_id.as_deref(), Some("asst_42"));
        assert_eq!(parsed.metadata["owner"], "alice");
        assert_eq!(parsed.files["f1"].filename, "data.csv");
        assert_eq!(parsed.working_directory, DEFAULT_WORKING_DIRECTORY);
    }

    #[test]
    fn status_string_forms() {
        assert_eq!(SessionStatus::Active.to_string(), "active");
        assert_eq!(
            "terminated".parse::<SessionStatus>().unwrap(),
            SessionStatus::Terminated
        );
    }

    #[test]
    fn expiry_check() {
        let mut session = Session::new("s".to_string(), chrono::Duration::hours(1));
        assert!(!session.is_expired());
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(session.is_expired());
    }
}
