use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: connect failed: {1}")]
    ConnectFailed(String, #[source] redis::RedisError),

    #[error("{0}: timed out")]
    Timeout(String),

    #[error("{0}: authentication failed: {1}")]
    AuthFailed(String, #[source] redis::RedisError),

    #[error("{0}: topology unknown: {1}")]
    TopologyUnknown(String, #[source] redis::RedisError),

    #[error("{0}: not found")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}: {1}")]
    Unexpected(String, #[source] redis::RedisError),
}

impl Error {
    /// Retries apply only to transport-level failures; every other class
    /// surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectFailed(..) | Error::Timeout(..))
    }

    pub(crate) fn from_redis(op: &str, e: redis::RedisError) -> Self {
        use redis::ErrorKind;
        if e.is_timeout() {
            return Error::Timeout(op.to_string());
        }
        match e.kind() {
            ErrorKind::IoError => Error::ConnectFailed(op.to_string(), e),
            ErrorKind::AuthenticationFailed => Error::AuthFailed(op.to_string(), e),
            ErrorKind::ClusterDown
            | ErrorKind::ClusterConnectionNotFound
            | ErrorKind::Moved
            | ErrorKind::Ask
            | ErrorKind::TryAgain
            | ErrorKind::MasterDown
            | ErrorKind::MasterNameNotFoundBySentinel
            | ErrorKind::NoValidReplicasFoundBySentinel => {
                Error::TopologyUnknown(op.to_string(), e)
            }
            _ => Error::Unexpected(op.to_string(), e),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
