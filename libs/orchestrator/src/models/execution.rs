//! Execution records, one per call, immutable after completion.

use crate::error::{Error, Result};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

serde_plain::derive_display_from_serialize!(ExecutionStatus);
serde_plain::derive_fromstr_from_deserialize!(ExecutionStatus);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Stdout,
    Stderr,
    Image,
    File,
    Error,
}

serde_plain::derive_display_from_serialize!(OutputType);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    #[serde(rename = "type")]
    pub output_type: OutputType,
    /// Text content, or the object-store key for file outputs.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionOutput {
    pub fn text(output_type: OutputType, content: impl Into<String>) -> Self {
        Self {
            output_type,
            content: content.into(),
            mime_type: None,
            size: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub session_id: String,
    pub code: String,
    pub language: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outputs: Vec<ExecutionOutput>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub memory_peak_mb: Option<f64>,
}

impl Execution {
    pub fn new(execution_id: String, session_id: String, code: String, language: String) -> Self {
        Self {
            execution_id,
            session_id,
            code,
            language,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            outputs: Vec::new(),
            exit_code: None,
            error_message: None,
            execution_time_ms: None,
            memory_peak_mb: None,
        }
    }

    pub fn stdout(&self) -> String {
        self.collect_output(OutputType::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.collect_output(OutputType::Stderr)
    }

    fn collect_output(&self, output_type: OutputType) -> String {
        self.outputs
            .iter()
            .filter(|o| o.output_type == output_type)
            .map(|o| o.content.as_str())
            .collect()
    }

    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let mut fields = vec![
            ("session_id".to_string(), self.session_id.clone()),
            ("code".to_string(), self.code.clone()),
            ("language".to_string(), self.language.clone()),
            ("status".to_string(), self.status.to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            (
                "outputs".to_string(),
                serde_json::to_string(&self.outputs).map_err(|e| {
                    Error::Internal(
                        "failed to serialize execution outputs".to_string(),
                        Some(Box::new(e)),
                    )
                })?,
            ),
        ];
        let mut optional = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                fields.push((name.to_string(), value));
            }
        };
        optional("started_at", self.started_at.map(|t| t.to_rfc3339()));
        optional("completed_at", self.completed_at.map(|t| t.to_rfc3339()));
        optional("exit_code", self.exit_code.map(|c| c.to_string()));
        optional("error_message", self.error_message.clone());
        optional(
            "execution_time_ms",
            self.execution_time_ms.map(|t| t.to_string()),
        );
        optional("memory_peak_mb", self.memory_peak_mb.map(|m| m.to_string()));
        Ok(fields)
    }

    pub fn from_fields(execution_id: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| Error::Internal(format!("execution field {name} missing"), None))
        };
        let time = |raw: &str| -> Result<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    Error::Internal("execution timestamp unparseable".to_string(), Some(Box::new(e)))
                })
        };
        Ok(Self {
            execution_id: execution_id.to_string(),
            session_id: get("session_id")?.clone(),
            code: get("code")?.clone(),
            language: get("language")?.clone(),
            status: get("status")?
                .parse()
                .map_err(|_| Error::Internal("execution status unparseable".to_string(), None))?,
            created_at: time(get("created_at")?)?,
            started_at: fields.get("started_at").map(|t| time(t)).transpose()?,
            completed_at: fields.get("completed_at").map(|t| time(t)).transpose()?,
            outputs: serde_json::from_str(get("outputs")?).map_err(|e| {
                Error::Internal("execution outputs unparseable".to_string(), Some(Box::new(e)))
            })?,
            exit_code: fields.get("exit_code").and_then(|c| c.parse().ok()),
            error_message: fields.get("error_message").cloned(),
            execution_time_ms: fields.get("execution_time_ms").and_then(|t| t.parse().ok()),
            memory_peak_mb: fields.get("memory_peak_mb").and_then(|m| m.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_roundtrip() {
        let mut execution = Execution::new(
            "exec-1".to_string(),
            "sess-1".to_string(),
            "print('hi')".to_string(),
            "py".to_string(),
        );
        execution.status = ExecutionStatus::Completed;
        execution.started_at = Some(Utc::now());
        execution.completed_at = Some(Utc::now());
        execution.exit_code = Some(0);
        execution.execution_time_ms = Some(42);
        execution
            .outputs
            .push(ExecutionOutput::text(OutputType::Stdout, "hi\n"));

        let fields: HashMap<String, String> = execution.to_fields().unwrap().into_iter().collect();
        let parsed = Execution::from_fields("exec-1", &fields).unwrap();

        assert_eq!(parsed.status, ExecutionStatus::Completed);
        assert_eq!(parsed.exit_code, Some(0));
        assert_eq!(parsed.stdout(), "hi\n");
        assert_eq!(parsed.stderr(), "");
        assert_eq!(parsed.execution_time_ms, Some(42));
    }

    #[test]
    fn output_json_uses_type_tag() {
        let output = ExecutionOutput::text(OutputType::Stderr, "boom");
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["type"], "stderr");
        assert_eq!(json["content"], "boom");
    }
}
