//! Shared fakes for pool and runner tests.

use crate::config::{LanguageConfig, OrchestratorConfig, PodResources};
use crate::error::{Error, Result};
use crate::lifecycle::PodController;
use crate::models::{PodHandle, PodStatus};
use crate::sidecar::{
    ExecuteRequest, ExecuteResponse, SidecarError, SidecarFile, SidecarResult, SidecarTransport,
};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

pub(crate) struct FakeController {
    counter: AtomicU64,
    pub fail_creates: AtomicBool,
    pub healthy: AtomicBool,
    pub created: StdMutex<Vec<String>>,
    pub deleted: StdMutex<Vec<String>>,
    pub deleted_jobs: StdMutex<Vec<String>>,
    pub cluster_pods: StdMutex<Vec<PodHandle>>,
}

impl FakeController {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            fail_creates: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            created: StdMutex::new(Vec::new()),
            deleted: StdMutex::new(Vec::new()),
            deleted_jobs: StdMutex::new(Vec::new()),
            cluster_pods: StdMutex::new(Vec::new()),
        }
    }

    pub fn handle(&self, language: &str) -> PodHandle {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        PodHandle {
            name: format!("coderun-{language}-{n:08}"),
            namespace: "default".to_string(),
            uid: format!("uid-{n}"),
            language: language.to_string(),
            session_id: None,
            status: PodStatus::Warm,
            pod_ip: Some("10.0.0.1".to_string()),
            sidecar_port: 8080,
            created_at: Utc::now() + chrono::Duration::milliseconds(n as i64),
            labels: BTreeMap::new(),
        }
    }
}

impl PodController for FakeController {
    async fn create_warm_pod(&self, language: &str) -> Result<PodHandle> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("cluster api".to_string(), None));
        }
        let handle = self.handle(language);
        self.created.lock().unwrap().push(handle.uid.clone());
        Ok(handle)
    }

    async fn create_job_pod(&self, language: &str) -> Result<(String, PodHandle)> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("cluster api".to_string(), None));
        }
        let handle = self.handle(language);
        self.created.lock().unwrap().push(handle.uid.clone());
        Ok((format!("job-{}", handle.name), handle))
    }

    async fn delete_pod(&self, handle: &PodHandle) -> Result<()> {
        self.deleted.lock().unwrap().push(handle.uid.clone());
        Ok(())
    }

    async fn delete_job(&self, job_name: &str) -> Result<()> {
        self.deleted_jobs.lock().unwrap().push(job_name.to_string());
        Ok(())
    }

    async fn probe_health(&self, _handle: &PodHandle) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn list_executor_pods(&self) -> Result<Vec<PodHandle>> {
        Ok(self.cluster_pods.lock().unwrap().clone())
    }
}

/// Scripted sidecar behaviour for one execute call.
pub(crate) enum ScriptedExecute {
    Respond(ExecuteResponse),
    Unreachable,
    Deadline,
    Status(u16),
    /// Never resolves; lets cancellation tests race the token.
    Hang,
}

#[derive(Default)]
pub(crate) struct FakeSidecar {
    pub script: StdMutex<VecDeque<ScriptedExecute>>,
    pub executed: StdMutex<Vec<ExecuteRequest>>,
    pub uploads: StdMutex<Vec<(String, Vec<u8>)>>,
    pub pre_files: StdMutex<Vec<SidecarFile>>,
    pub post_files: StdMutex<Vec<SidecarFile>>,
    list_calls: AtomicU64,
    pub file_contents: StdMutex<HashMap<String, Vec<u8>>>,
    pub deleted_files: StdMutex<Vec<String>>,
    pub cancelled: StdMutex<Vec<String>>,
    pub ready_response: AtomicBool,
}

impl FakeSidecar {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.ready_response.store(true, Ordering::SeqCst);
        fake
    }

    pub fn respond_with(self, response: ExecuteResponse) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedExecute::Respond(response));
        self
    }

    pub fn script_step(&self, step: ScriptedExecute) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn ok_response(stdout: &str) -> ExecuteResponse {
        ExecuteResponse {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            execution_time_ms: 12,
            state: None,
            state_errors: None,
        }
    }
}

impl SidecarTransport for FakeSidecar {
    async fn execute(
        &self,
        _pod: &PodHandle,
        req: &ExecuteRequest,
    ) -> SidecarResult<ExecuteResponse> {
        self.executed.lock().unwrap().push(req.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(ScriptedExecute::Respond(resp)) => Ok(resp),
            Some(ScriptedExecute::Unreachable) => Err(SidecarError::Transport {
                op: "execute",
                url: "http://10.0.0.1:8080/execute".to_string(),
                source: Box::new(std::io::Error::other("connection refused")),
            }),
            Some(ScriptedExecute::Deadline) => Err(SidecarError::Deadline {
                op: "execute",
                after: Duration::from_secs(2),
            }),
            Some(ScriptedExecute::Status(status)) => Err(SidecarError::Status {
                op: "execute",
                status,
                body: "sidecar failure".to_string(),
            }),
            Some(ScriptedExecute::Hang) => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(Self::ok_response("")),
        }
    }

    async fn upload_file(
        &self,
        _pod: &PodHandle,
        filename: &str,
        content: Vec<u8>,
    ) -> SidecarResult<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((filename.to_string(), content));
        Ok(())
    }

    async fn list_files(&self, _pod: &PodHandle) -> SidecarResult<Vec<SidecarFile>> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            Ok(self.pre_files.lock().unwrap().clone())
        } else {
            Ok(self.post_files.lock().unwrap().clone())
        }
    }

    async fn fetch_file(&self, _pod: &PodHandle, name: &str) -> SidecarResult<Vec<u8>> {
        self.file_contents
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(SidecarError::Status {
                op: "fetch-file",
                status: 404,
                body: format!("no such file {name}"),
            })
    }

    async fn delete_file(&self, _pod: &PodHandle, name: &str) -> SidecarResult<()> {
        self.deleted_files.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn ready(&self, _pod: &PodHandle) -> SidecarResult<bool> {
        Ok(self.ready_response.load(Ordering::SeqCst))
    }

    async fn health(&self, _pod: &PodHandle) -> SidecarResult<bool> {
        Ok(true)
    }

    async fn cancel(&self, _pod: &PodHandle, execution_id: &str) -> SidecarResult<()> {
        self.cancelled.lock().unwrap().push(execution_id.to_string());
        Ok(())
    }
}

pub(crate) fn test_language(language: &str, pool_size: usize, stateful: bool) -> LanguageConfig {
    LanguageConfig {
        language: language.to_string(),
        image: format!("{language}-runtime:latest"),
        pool_size,
        stateful,
        timeout: Duration::from_secs(30),
        network_isolated: false,
        resources: PodResources::main_defaults(),
    }
}

pub(crate) fn test_config(pool_size: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.pool.acquire_timeout = Duration::from_millis(100);
    config.pool.reuse_max_executions = 3;
    config
        .languages
        .insert("py".to_string(), test_language("py", pool_size, true));
    config
}
