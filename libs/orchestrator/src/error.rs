//! Error taxonomy of the orchestrator core.
//!
//! Execution failures (non-zero exit, sidecar-reported error, timeout)
//! are expected outcomes carried in-band on the execution record; this
//! type covers orchestrator failures that surface to callers as an
//! error envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

type Source = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("{0} unavailable")]
    Unavailable(String, #[source] Option<Source>),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal: {0}")]
    Internal(String, #[source] Option<Source>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    ResourceExhausted,
    DeadlineExceeded,
    Unavailable,
    FailedPrecondition,
    Internal,
}

serde_plain::derive_display_from_serialize!(ErrorCode);

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Error::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Error::Unavailable(..) => ErrorCode::Unavailable,
            Error::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Error::Internal(..) => ErrorCode::Internal,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code(),
            message: self.to_string(),
            details: None,
        }
    }
}

/// Wire shape for orchestrator failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<coderun_kv::Error> for Error {
    fn from(e: coderun_kv::Error) -> Self {
        match e {
            coderun_kv::Error::NotFound(what) => Error::NotFound(what),
            coderun_kv::Error::Timeout(op) => Error::DeadlineExceeded(format!("kv {op}")),
            coderun_kv::Error::InvalidConfig(msg) => Error::InvalidArgument(msg),
            other => Error::Unavailable("kv store".to_string(), Some(Box::new(other))),
        }
    }
}

impl From<coderun_store::Error> for Error {
    fn from(e: coderun_store::Error) -> Self {
        match e {
            coderun_store::Error::InvalidConfig(msg) => Error::InvalidArgument(msg),
            other => Error::Unavailable("object store".to_string(), Some(Box::new(other))),
        }
    }
}

impl From<coderun_k8s_util::error::Error> for Error {
    fn from(e: coderun_k8s_util::error::Error) -> Self {
        match e {
            coderun_k8s_util::error::Error::DeadlineExceeded(what) => Error::DeadlineExceeded(what),
            other => Error::Unavailable("cluster api".to_string(), Some(Box::new(other))),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_code_and_message() {
        let err = Error::ResourceExhausted("state blob exceeds 16 MiB cap".to_string());
        let envelope = err.envelope();
        assert_eq!(envelope.code, ErrorCode::ResourceExhausted);
        assert!(envelope.message.contains("state blob"));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["code"], "resource_exhausted");
    }

    #[test]
    fn kv_errors_map_to_taxonomy() {
        let err: Error = coderun_kv::Error::NotFound("session".to_string()).into();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err: Error = coderun_kv::Error::Timeout("GET".to_string()).into();
        assert_eq!(err.code(), ErrorCode::DeadlineExceeded);
    }
}
