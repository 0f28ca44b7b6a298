//! Application context: every component constructed once at startup and
//! passed explicitly, with background maintenance loops spawned off it.

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::files::FileService;
use crate::lifecycle::K8sPodController;
use crate::lifecycle::manifest::ExecutorManifests;
use crate::metrics::Metrics;
use crate::pool::WarmPool;
use crate::runner::ExecutionRunner;
use crate::session::{SessionService, SessionStore};
use crate::sidecar::SidecarClient;
use crate::state::StateService;

use coderun_k8s_util::control::ControlPlane;
use coderun_k8s_util::pod_ext::PodExt;
use coderun_kv::{KvClient, KvConfig};
use coderun_store::{ObjectStore, StoreConfig};

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher;
use opentelemetry::metrics::Meter;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type Controller = K8sPodController<SidecarClient>;
type Sessions = SessionService<KvClient>;
type Files = FileService<Sessions, ObjectStore>;
type State = StateService<KvClient, ObjectStore>;
type Pool = WarmPool<Controller, KvClient>;
pub type Runner =
    ExecutionRunner<Sessions, Files, State, Controller, KvClient, SidecarClient>;

pub struct AppContext {
    pub config: Arc<OrchestratorConfig>,
    pub kv: Arc<KvClient>,
    pub store: Arc<ObjectStore>,
    pub control: ControlPlane,
    pub sessions: Arc<Sessions>,
    pub files: Arc<Files>,
    pub state: Arc<State>,
    pub controller: Arc<Controller>,
    pub pool: Arc<Pool>,
    pub runner: Arc<Runner>,
    pub metrics: Arc<Metrics>,
}

impl AppContext {
    /// Explicit startup ordering: config validation, KV connection,
    /// bucket check, cluster client, then the service graph.
    pub async fn initialize(
        config: OrchestratorConfig,
        kv_config: &KvConfig,
        store_config: &StoreConfig,
        meter: &Meter,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let kv = Arc::new(KvClient::connect(kv_config).await?);
        let store = Arc::new(ObjectStore::connect(store_config).await?);
        store.ensure_bucket().await?;

        let client = coderun_k8s_util::client::new_client().await?;
        let control = ControlPlane::new(client, config.namespace.clone());

        let sidecar = SidecarClient::new(
            config.pod.connect_timeout,
            config.pod.probe_timeout,
            config.pod.request_timeout,
            config.pod.execute_grace,
        )
        .map_err(|e| Error::Internal("failed to build sidecar client".to_string(), Some(Box::new(e))))?;

        let controller = Arc::new(K8sPodController::new(
            config.clone(),
            control.clone(),
            sidecar.clone(),
        ));
        let pool = Arc::new(WarmPool::new(config.clone(), controller.clone(), kv.clone()));
        let sessions = Arc::new(SessionService::new(kv.clone(), config.session.clone()));
        let state = Arc::new(StateService::new(
            kv.clone(),
            store.clone(),
            config.state.clone(),
            config.session.ttl,
        ));
        let files = Arc::new(FileService::new(
            sessions.clone(),
            store.clone(),
            config.files.clone(),
        ));
        let metrics = Arc::new(Metrics::new(meter));
        let runner = Arc::new(ExecutionRunner::new(
            config.clone(),
            sessions.clone(),
            files.clone(),
            state.clone(),
            pool.clone(),
            controller.clone(),
            Arc::new(sidecar),
            kv.clone(),
            metrics.clone(),
        ));

        info!(
            msg = "application context initialized",
            namespace = %config.namespace,
            languages = config.languages.len(),
        );
        Ok(Self {
            config,
            kv,
            store,
            control,
            sessions,
            files,
            state,
            controller,
            pool,
            runner,
            metrics,
        })
    }

    /// Reconcile leftovers from a previous run, then start the
    /// maintenance loops: pool replenishment and health sweeps, the pod
    /// watch, session expiry sweeps, state archival and pool metrics.
    pub async fn start_background(&self, shutdown: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        self.pool.reconcile().await?;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            self.pool.clone().run_replenisher(shutdown.clone()),
        ));
        handles.push(tokio::spawn(
            self.pool.clone().run_health_sweeper(shutdown.clone()),
        ));

        // Liveness of pool entries follows the cluster: a pod deleted
        // out from under us drops out of the registry.
        let control = self.control.clone();
        let pool = self.pool.clone();
        let selector = self.config.executor_selector();
        let watch_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let stream = control.watch_pods(&selector);
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = watch_shutdown.cancelled() => break,
                    event = stream.next() => match event {
                        Some(Ok(watcher::Event::Delete(pod))) => {
                            if let Some(uid) = pod.uid() {
                                pool.evict(uid).await;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(msg = "pod watch error", %e);
                            sleep(std::time::Duration::from_secs(5)).await;
                        }
                        None => break,
                    },
                }
            }
        }));

        let sessions = self.sessions.clone();
        let metrics = self.metrics.clone();
        let sweep_interval = self.config.session.sweep_interval;
        let sweep_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep_shutdown.cancelled() => break,
                    _ = sleep(sweep_interval) => match sessions.sweep_expired().await {
                        Ok(count) => metrics.sessions_swept_add(count as u64),
                        Err(e) => warn!(msg = "session sweep failed", %e),
                    },
                }
            }
        }));

        let state = self.state.clone();
        let archive_interval = self.config.state.archive_interval;
        let archive_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = archive_shutdown.cancelled() => break,
                    _ = sleep(archive_interval) => {
                        if let Err(e) = state.archive_once().await {
                            warn!(msg = "state archival failed", %e);
                        }
                    }
                }
            }
        }));

        let pool = self.pool.clone();
        let metrics = self.metrics.clone();
        let observe_interval = self.config.pool.replenish_interval.max(std::time::Duration::from_secs(5));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(observe_interval) => {
                        for stats in pool.stats().await {
                            metrics.pool_observed(&stats.language, stats.total, stats.available);
                        }
                    }
                }
            }
        }));

        Ok(handles)
    }
}
