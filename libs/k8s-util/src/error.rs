use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("failed to infer cluster configuration: {0}")]
    ConfigError(#[source] Box<kube::config::InferConfigError>),

    #[error("{0}: {1}")]
    WatchError(String, #[source] Box<kube::runtime::wait::Error>),

    #[error("{0}")]
    MissingData(String),

    #[error("{0}: deadline exceeded")]
    DeadlineExceeded(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
