//! Typed facade over the cluster object API for pods and jobs.

use crate::error::{Error, Result};
use crate::pod_ext::PodExt;
use crate::types::short_type_name;

use std::time::Duration;

use futures::Stream;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::client::Client;
use kube::runtime::wait::await_condition;
use kube::runtime::watcher;
use tracing::{debug, trace};

#[derive(Clone)]
pub struct ControlPlane {
    client: Client,
    namespace: String,
}

impl ControlPlane {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn wrap<K>(op: &str, name: &str, e: kube::Error) -> Error {
        Error::KubeError(
            format!(
                "failed to {op} {} {name}",
                short_type_name::<K>().unwrap_or("resource")
            ),
            Box::new(e),
        )
    }

    pub async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        trace!(msg = "creating pod", pod.name = name);
        self.pods()
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Self::wrap::<Pod>("create", name, e))
    }

    /// Delete a pod with a bounded grace period. A pod that is already
    /// gone is not an error.
    pub async fn delete_pod(&self, name: &str, grace: Duration) -> Result<()> {
        trace!(msg = "deleting pod", pod.name = name, grace = ?grace);
        let params = DeleteParams::default().grace_period(grace.as_secs() as u32);
        match self.pods().delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(msg = "pod already deleted", pod.name = name);
                Ok(())
            }
            Err(e) => Err(Self::wrap::<Pod>("delete", name, e)),
        }
    }

    pub async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        match self.pods().get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Self::wrap::<Pod>("get", name, e)),
        }
    }

    pub async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| Self::wrap::<Pod>("list", label_selector, e))?;
        Ok(list.items)
    }

    /// Event stream for pods matching the given label selector.
    pub fn watch_pods(
        &self,
        label_selector: &str,
    ) -> impl Stream<Item = std::result::Result<watcher::Event<Pod>, watcher::Error>> + use<> {
        watcher(
            self.pods(),
            watcher::Config::default().labels(label_selector),
        )
    }

    /// Block until the named pod is running with an assigned IP, or the
    /// deadline elapses.
    pub async fn await_pod_running(&self, name: &str, deadline: Duration) -> Result<Pod> {
        let running = |obj: Option<&Pod>| {
            obj.is_some_and(|pod| pod.is_running() && pod.pod_ip().is_some())
        };
        let wait = await_condition(self.pods(), name, running);
        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(Some(pod))) => Ok(pod),
            Ok(Ok(None)) => Err(Error::MissingData(format!(
                "pod {name} vanished while waiting for it to run"
            ))),
            Ok(Err(e)) => Err(Error::WatchError(
                format!("failed waiting for pod {name}"),
                Box::new(e),
            )),
            Err(_) => Err(Error::DeadlineExceeded(format!(
                "pod {name} not running within {deadline:?}"
            ))),
        }
    }

    pub async fn create_job(&self, job: &Job) -> Result<Job> {
        let name = job.metadata.name.as_deref().unwrap_or_default();
        trace!(msg = "creating job", job.name = name);
        self.jobs()
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| Self::wrap::<Job>("create", name, e))
    }

    /// Delete a job and its pods. A job that is already gone is not an
    /// error.
    pub async fn delete_job(&self, name: &str) -> Result<()> {
        trace!(msg = "deleting job", job.name = name);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.jobs().delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Self::wrap::<Job>("delete", name, e)),
        }
    }

    pub async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        match self.jobs().get(name).await {
            Ok(job) => Ok(Some(job)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Self::wrap::<Job>("get", name, e)),
        }
    }

    /// Find the pod spawned for a job via the `job-name` label the
    /// cluster applies to job pods.
    pub async fn find_job_pod(&self, job_name: &str) -> Result<Option<Pod>> {
        let pods = self.list_pods(&format!("job-name={job_name}")).await?;
        Ok(pods.into_iter().next())
    }
}
