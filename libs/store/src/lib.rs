//! Object store client for the coderun orchestrator.
//!
//! Opaque blob storage over any S3-compatible endpoint: user files, cold
//! interpreter state and harvested execution outputs. Presigned URLs let
//! clients move large payloads without passing through the orchestrator.

pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use client::{BlobStore, ObjectInfo, ObjectStore, StoreConfig};
pub use error::{Error, Result};

/// Key for a user file scoped to a session.
pub fn file_key(session_id: &str, file_id: &str) -> String {
    format!("files/{session_id}/{file_id}")
}

/// Key for a cold-tier interpreter state blob.
pub fn state_archive_key(session_id: &str) -> String {
    format!("archive/state/{session_id}")
}

/// Key for a file produced by an execution.
pub fn output_key(execution_id: &str, index: usize, filename: &str) -> String {
    format!("outputs/{execution_id}/{index}-{filename}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(file_key("s1", "f1"), "files/s1/f1");
        assert_eq!(state_archive_key("s1"), "archive/state/s1");
        assert_eq!(output_key("e1", 0, "plot.png"), "outputs/e1/0-plot.png");
    }
}
