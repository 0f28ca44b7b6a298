use crate::error::{Error, Result};

use kube::{Client, Config};
use tracing::info;

/// Build a cluster client from inferred configuration: in-cluster service
/// account when running inside a pod, kubeconfig otherwise.
pub async fn new_client() -> Result<Client> {
    let config = Config::infer()
        .await
        .map_err(|e| Error::ConfigError(Box::new(e)))?;
    info!(
        msg = "cluster configuration loaded",
        namespace = %config.default_namespace,
    );
    Client::try_from(config)
        .map_err(|e| Error::KubeError("failed to build cluster client".to_string(), Box::new(e)))
}
