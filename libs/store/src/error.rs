use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("object store {op} failed for {key}")]
    Request {
        op: &'static str,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("bucket {bucket}: {reason}")]
    Bucket {
        bucket: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid object store configuration: {0}")]
    InvalidConfig(String),

    #[error("presigning failed for {key}: {reason}")]
    Presign { key: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
