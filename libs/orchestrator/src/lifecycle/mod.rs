//! Pod lifecycle management: creation, readiness, teardown and the
//! one-shot job fallback for languages without a warm pool.

pub mod manifest;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::models::{PodHandle, PodStatus};
use crate::sidecar::SidecarTransport;
use manifest::{ExecutorManifests, LABEL_LANGUAGE, executor_pod_name};

use coderun_k8s_util::control::ControlPlane;
use coderun_k8s_util::pod_ext::PodExt;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

/// Pod management capability the pool and runner depend on.
#[allow(async_fn_in_trait)]
pub trait PodController: Send + Sync {
    /// Create a pod for the language and block until its sidecar passes
    /// readiness; the returned handle is `warm`.
    async fn create_warm_pod(&self, language: &str) -> Result<PodHandle>;
    /// One-shot job path for languages with no configured pool. Returns
    /// the job name alongside the warm pod handle.
    async fn create_job_pod(&self, language: &str) -> Result<(String, PodHandle)>;
    async fn delete_pod(&self, handle: &PodHandle) -> Result<()>;
    async fn delete_job(&self, job_name: &str) -> Result<()>;
    async fn probe_health(&self, handle: &PodHandle) -> bool;
    /// Pods carrying this orchestrator's labels, per the cluster API.
    async fn list_executor_pods(&self) -> Result<Vec<PodHandle>>;
}

pub struct K8sPodController<S> {
    config: Arc<OrchestratorConfig>,
    control: ControlPlane,
    sidecar: S,
}

impl<S: SidecarTransport> K8sPodController<S> {
    pub fn new(config: Arc<OrchestratorConfig>, control: ControlPlane, sidecar: S) -> Self {
        Self {
            config,
            control,
            sidecar,
        }
    }

    fn handle_from_pod(&self, pod: &Pod, language: &str) -> Result<PodHandle> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Internal("pod has no name".to_string(), None))?;
        let uid = pod
            .uid()
            .ok_or_else(|| Error::Internal(format!("pod {name} has no uid"), None))?
            .to_string();
        Ok(PodHandle {
            namespace: self.config.namespace.clone(),
            uid,
            language: language.to_string(),
            session_id: None,
            status: match pod.phase() {
                Some("Running") => PodStatus::Warm,
                Some("Pending") => PodStatus::Pending,
                Some("Succeeded") => PodStatus::Succeeded,
                Some("Failed") => PodStatus::Failed,
                _ => PodStatus::Unknown,
            },
            pod_ip: pod.pod_ip().map(String::from),
            sidecar_port: self.config.pod.sidecar_port,
            created_at: pod.created_at().unwrap_or_else(Utc::now),
            labels: pod
                .metadata
                .labels
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
            name,
        })
    }

    /// Poll the sidecar readiness endpoint until it passes or the
    /// deadline elapses; the pod is torn down on timeout.
    async fn wait_sidecar_ready(&self, handle: &PodHandle, deadline: Instant) -> Result<()> {
        loop {
            if self.sidecar.ready(handle).await.unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    msg = "sidecar never became ready, deleting pod",
                    pod.name = %handle.name,
                );
                let _ = self
                    .control
                    .delete_pod(&handle.name, self.config.pod.termination_grace)
                    .await;
                return Err(Error::DeadlineExceeded(format!(
                    "sidecar on pod {} not ready within {:?}",
                    handle.name, self.config.pool.creation_timeout
                )));
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn check_pod_ceiling(&self) -> Result<()> {
        let existing = self
            .control
            .list_pods(&self.config.executor_selector())
            .await?;
        if existing.len() >= self.config.pool.total_pod_ceiling {
            return Err(Error::ResourceExhausted(format!(
                "total pod ceiling of {} reached",
                self.config.pool.total_pod_ceiling
            )));
        }
        Ok(())
    }
}

impl<S: SidecarTransport> PodController for K8sPodController<S> {
    async fn create_warm_pod(&self, language: &str) -> Result<PodHandle> {
        let lang = self.config.language(language)?;
        self.check_pod_ceiling().await?;
        let name = executor_pod_name(&self.config.app_name, language);
        let deadline = Instant::now() + self.config.pool.creation_timeout;

        debug!(msg = "creating executor pod", pod.name = %name, language);
        let pod = self.config.create_executor_pod(lang, &name);
        self.control.create_pod(&pod).await?;

        let running = match self
            .control
            .await_pod_running(&name, self.config.pool.creation_timeout)
            .await
        {
            Ok(pod) => pod,
            Err(e) => {
                let _ = self
                    .control
                    .delete_pod(&name, self.config.pod.termination_grace)
                    .await;
                return Err(e.into());
            }
        };

        let mut handle = self.handle_from_pod(&running, language)?;
        self.wait_sidecar_ready(&handle, deadline).await?;
        handle.status = PodStatus::Warm;
        info!(msg = "executor pod warm", pod.name = %handle.name, language);
        Ok(handle)
    }

    async fn create_job_pod(&self, language: &str) -> Result<(String, PodHandle)> {
        let lang = self.config.language(language)?;
        self.check_pod_ceiling().await?;
        let job_name = executor_pod_name(&self.config.app_name, language);
        let deadline = Instant::now() + self.config.pool.creation_timeout;

        debug!(msg = "creating executor job", job.name = %job_name, language);
        let job = self.config.create_executor_job(lang, &job_name);
        self.control.create_job(&job).await?;

        // The job controller names the pod; find it by the job-name label.
        let pod = loop {
            if let Some(pod) = self.control.find_job_pod(&job_name).await? {
                break pod;
            }
            if Instant::now() >= deadline {
                let _ = self.control.delete_job(&job_name).await;
                return Err(Error::DeadlineExceeded(format!(
                    "job {job_name} produced no pod within {:?}",
                    self.config.pool.creation_timeout
                )));
            }
            sleep(Duration::from_millis(500)).await;
        };
        let pod_name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Internal("job pod has no name".to_string(), None))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let running = match self.control.await_pod_running(&pod_name, remaining).await {
            Ok(pod) => pod,
            Err(e) => {
                let _ = self.control.delete_job(&job_name).await;
                return Err(e.into());
            }
        };

        let mut handle = self.handle_from_pod(&running, language)?;
        if let Err(e) = self.wait_sidecar_ready(&handle, deadline).await {
            let _ = self.control.delete_job(&job_name).await;
            return Err(e);
        }
        handle.status = PodStatus::Warm;
        info!(msg = "job pod warm", job.name = %job_name, pod.name = %handle.name);
        Ok((job_name, handle))
    }

    async fn delete_pod(&self, handle: &PodHandle) -> Result<()> {
        self.control
            .delete_pod(&handle.name, self.config.pod.termination_grace)
            .await?;
        Ok(())
    }

    async fn delete_job(&self, job_name: &str) -> Result<()> {
        self.control.delete_job(job_name).await?;
        Ok(())
    }

    async fn probe_health(&self, handle: &PodHandle) -> bool {
        self.sidecar.health(handle).await.unwrap_or(false)
    }

    async fn list_executor_pods(&self) -> Result<Vec<PodHandle>> {
        let pods = self
            .control
            .list_pods(&self.config.executor_selector())
            .await?;
        let mut handles = Vec::with_capacity(pods.len());
        for pod in &pods {
            let language = pod.label(LABEL_LANGUAGE).unwrap_or("unknown").to_string();
            match self.handle_from_pod(pod, &language) {
                Ok(handle) => handles.push(handle),
                Err(e) => debug!(msg = "skipping unidentifiable pod", %e),
            }
        }
        Ok(handles)
    }
}
