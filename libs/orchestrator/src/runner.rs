//! Execution runner: end-to-end dispatch of one code execution.
//!
//! acquire → stage files → execute on the sidecar → harvest outputs →
//! release → persist state and the execution record. Execution failures
//! (non-zero exit, sidecar-reported error, timeout) are expected
//! outcomes carried on the execution record; orchestrator failures
//! surface as errors.

use crate::config::{LanguageConfig, OrchestratorConfig};
use crate::error::{Error, Result};
use crate::files::FileStore;
use crate::lifecycle::PodController;
use crate::metrics::Metrics;
use crate::models::{
    ExecRequest, ExecResponse, Execution, ExecutionOutput, ExecutionStatus, FileRef, OutputType,
    PodHandle, PodSource, Session, StateUpload,
};
use crate::pool::{Acquired, WarmPool};
use crate::session::SessionStore;
use crate::sidecar::{ExecuteRequest, ExecuteResponse, SidecarError, SidecarTransport};
use crate::state::StateStore;

use coderun_kv::{KvCommands, Pipeline};
use coderun_store::output_key;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Exit code reported for executions the sidecar killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const EXECUTE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

fn exec_key(execution_id: &str) -> String {
    format!("exec:{execution_id}")
}

fn exec_index_key(session_id: &str) -> String {
    format!("exec:session:{session_id}")
}

/// Result of one dispatched execution.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub execution: Execution,
    pub session: Session,
    pub pod_name: String,
    pub pod_source: PodSource,
    pub new_state: Option<StateUpload>,
    pub state_errors: Vec<String>,
    pub produced_files: Vec<FileRef>,
}

impl ExecutionOutcome {
    pub fn into_response(self) -> ExecResponse {
        ExecResponse {
            session_id: self.session.session_id.clone(),
            stdout: self.execution.stdout(),
            stderr: self.execution.stderr(),
            files: self.produced_files,
            has_state: self.new_state.is_some(),
            state_size: self.new_state.as_ref().map(|s| s.size),
            state_hash: self.new_state.map(|s| s.hash),
        }
    }
}

enum CallOutcome {
    Response(ExecuteResponse),
    Cancelled,
    TimedOut,
    Failed(u16, String),
    Transport(SidecarError),
}

struct RunningExecution {
    cancel: CancellationToken,
    pod: PodHandle,
}

pub struct ExecutionRunner<S, F, ST, C, K, X> {
    config: Arc<OrchestratorConfig>,
    sessions: Arc<S>,
    files: Arc<F>,
    state: Arc<ST>,
    pool: Arc<WarmPool<C, K>>,
    controller: Arc<C>,
    sidecar: Arc<X>,
    kv: Arc<K>,
    metrics: Arc<Metrics>,
    running: Mutex<HashMap<String, RunningExecution>>,
}

impl<S, F, ST, C, K, X> ExecutionRunner<S, F, ST, C, K, X>
where
    S: SessionStore,
    F: FileStore,
    ST: StateStore,
    C: PodController,
    K: KvCommands,
    X: SidecarTransport,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        sessions: Arc<S>,
        files: Arc<F>,
        state: Arc<ST>,
        pool: Arc<WarmPool<C, K>>,
        controller: Arc<C>,
        sidecar: Arc<X>,
        kv: Arc<K>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            sessions,
            files,
            state,
            pool,
            controller,
            sidecar,
            kv,
            metrics,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch one execution. `initial_state` overrides any persisted
    /// state; `capture_state` asks the sidecar for a fresh snapshot of
    /// stateful languages.
    #[instrument(skip_all, fields(language = %request.lang))]
    pub async fn execute(
        &self,
        request: &ExecRequest,
        initial_state: Option<String>,
        capture_state: bool,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        request.validate()?;
        let lang = self.config.language(&request.lang)?.clone();
        let wall_clock = std::time::Instant::now();

        let mut session = self.resolve_session(request).await?;

        let (mut pod, pod_source, job_name) = match self
            .pool
            .acquire(&request.lang, &session.session_id)
            .await?
        {
            Acquired::Pool(handle) => (handle, PodSource::Pool, None),
            Acquired::UseJob => {
                let (job, handle) = self.controller.create_job_pod(&request.lang).await?;
                (handle, PodSource::Job, Some(job))
            }
        };
        pod.session_id = Some(session.session_id.clone());

        // The binding lands in the KV store before any sidecar call.
        session.pod_name = Some(pod.name.clone());
        session = match self.sessions.update(&session).await {
            Ok(session) => session,
            Err(e) => {
                self.release(&pod, pod_source, job_name.as_deref(), false).await;
                return Err(e);
            }
        };

        let result = self
            .execute_on_pod(request, &lang, &session, &pod, initial_state, capture_state, cancel)
            .await;

        let (mut execution, new_state, state_errors, produced_files, pod_ok) = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.release(&pod, pod_source, job_name.as_deref(), false).await;
                return Err(e);
            }
        };

        if pod_ok && pod_source == PodSource::Pool {
            self.scrub_pod(&pod).await;
        }
        self.release(&pod, pod_source, job_name.as_deref(), pod_ok).await;

        // Refresh the session: output indexing may have touched it, and
        // the pod binding is over.
        let mut session = self
            .sessions
            .get(&session.session_id)
            .await?
            .unwrap_or(session);
        session.pod_name = None;
        session.last_activity = Utc::now();
        let session = self.sessions.update(&session).await?;

        if execution.completed_at.is_none() {
            execution.completed_at = Some(Utc::now());
        }
        if let Err(e) = self.persist_execution(&session, &execution).await {
            warn!(msg = "failed to persist execution record", %e);
        }

        self.metrics.execution_recorded(
            &request.lang,
            &execution.status.to_string(),
            &pod_source.to_string(),
            wall_clock.elapsed().as_secs_f64(),
        );
        info!(
            msg = "execution finished",
            execution.id = %execution.execution_id,
            session.id = %session.session_id,
            status = %execution.status,
            pod_source = %pod_source,
        );

        Ok(ExecutionOutcome {
            execution,
            session,
            pod_name: pod.name.clone(),
            pod_source,
            new_state,
            state_errors,
            produced_files,
        })
    }

    /// Step 1: resolve or create the session.
    async fn resolve_session(&self, request: &ExecRequest) -> Result<Session> {
        if let Some(session_id) = &request.session_id {
            if self.sessions.get(session_id).await?.is_some() {
                return self.sessions.touch(session_id).await;
            }
            // Unknown id: adopt it so the client keeps its handle.
            return self
                .sessions
                .create(
                    Some(session_id.clone()),
                    request.session_metadata(),
                    request.entity_id.clone(),
                )
                .await;
        }
        self.sessions
            .create(None, request.session_metadata(), request.entity_id.clone())
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_on_pod(
        &self,
        request: &ExecRequest,
        lang: &LanguageConfig,
        session: &Session,
        pod: &PodHandle,
        initial_state: Option<String>,
        capture_state: bool,
        cancel: CancellationToken,
    ) -> Result<(Execution, Option<StateUpload>, Vec<String>, Vec<FileRef>, bool)> {
        let mut execution = Execution::new(
            Uuid::new_v4().to_string(),
            session.session_id.clone(),
            request.code.clone(),
            request.lang.clone(),
        );

        // Step 3: stage input files through the sidecar.
        let mut staged = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let source_session = if file.session_id.is_empty() {
                session.session_id.as_str()
            } else {
                file.session_id.as_str()
            };
            let bytes = self
                .files
                .get_file_content(source_session, &file.id)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("file {} in session {source_session}", file.id))
                })?;
            self.sidecar
                .upload_file(pod, &file.name, bytes)
                .await
                .map_err(|e| Error::Unavailable("sidecar file upload".to_string(), Some(Box::new(e))))?;
            staged.push(file.name.clone());
        }

        // Step 4: interpreter state, explicit beats persisted.
        let resolved_state = match initial_state {
            Some(state) => Some(state),
            None if lang.stateful => self
                .state
                .load(&session.session_id)
                .await?
                .map(|bytes| BASE64.encode(bytes)),
            None => None,
        };

        // Snapshot the working directory to diff produced files later.
        let pre_existing: HashSet<String> = match self.sidecar.list_files(pod).await {
            Ok(files) => files.into_iter().map(|f| f.name).collect(),
            Err(e) => {
                debug!(msg = "baseline file listing failed", %e);
                staged.iter().cloned().collect()
            }
        };

        let exec_request = ExecuteRequest {
            code: request.code.clone(),
            language: request.lang.clone(),
            args: request.args.clone(),
            files: staged,
            initial_state: resolved_state,
            capture_state: capture_state && lang.stateful,
            timeout: lang.timeout.as_secs(),
        };

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.running.lock().await.insert(
            execution.execution_id.clone(),
            RunningExecution {
                cancel: cancel.clone(),
                pod: pod.clone(),
            },
        );

        let call = tokio::select! {
            _ = cancel.cancelled() => CallOutcome::Cancelled,
            outcome = self.call_sidecar(pod, &exec_request) => outcome,
        };
        self.running.lock().await.remove(&execution.execution_id);
        execution.completed_at = Some(Utc::now());

        match call {
            CallOutcome::Response(response) => {
                execution.exit_code = Some(response.exit_code);
                execution.execution_time_ms = Some(response.execution_time_ms);
                if !response.stdout.is_empty() {
                    execution
                        .outputs
                        .push(ExecutionOutput::text(OutputType::Stdout, &response.stdout));
                }
                if !response.stderr.is_empty() {
                    execution
                        .outputs
                        .push(ExecutionOutput::text(OutputType::Stderr, &response.stderr));
                }
                let mut state_errors = response.state_errors.clone().unwrap_or_default();

                if response.exit_code == TIMEOUT_EXIT_CODE {
                    execution.status = ExecutionStatus::Timeout;
                    execution.error_message = Some("execution timed out".to_string());
                    return Ok((execution, None, state_errors, Vec::new(), false));
                }
                execution.status = if response.exit_code == 0 {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };

                // Step 6: persist captured state. A cap rejection is a
                // state error, not an execution failure.
                let mut new_state = None;
                if exec_request.capture_state {
                    if let Some(state_b64) = &response.state {
                        let ttl = (session.expires_at - Utc::now())
                            .to_std()
                            .unwrap_or(self.config.session.ttl);
                        match self.state.save(&session.session_id, state_b64, ttl).await {
                            Ok(upload) => {
                                self.metrics.state_saved(upload.size);
                                new_state = Some(upload);
                            }
                            Err(Error::ResourceExhausted(msg)) => {
                                warn!(msg = "state snapshot rejected", reason = %msg);
                                state_errors.push(msg);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }

                // Step 7: harvest files the program produced.
                let produced = self
                    .harvest_outputs(pod, &session.session_id, &mut execution, &pre_existing)
                    .await;
                Ok((execution, new_state, state_errors, produced, true))
            }
            CallOutcome::Cancelled => {
                let _ = self.sidecar.cancel(pod, &execution.execution_id).await;
                execution.status = ExecutionStatus::Cancelled;
                execution.error_message = Some("execution cancelled".to_string());
                Ok((execution, None, Vec::new(), Vec::new(), false))
            }
            CallOutcome::TimedOut => {
                execution.status = ExecutionStatus::Timeout;
                execution.exit_code = Some(TIMEOUT_EXIT_CODE);
                execution.error_message = Some("execution timed out".to_string());
                Ok((execution, None, Vec::new(), Vec::new(), false))
            }
            CallOutcome::Failed(status, body) => {
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(format!("sidecar returned {status}: {body}"));
                execution
                    .outputs
                    .push(ExecutionOutput::text(OutputType::Error, &body));
                Ok((execution, None, Vec::new(), Vec::new(), false))
            }
            CallOutcome::Transport(e) => Err(Error::Unavailable(
                format!("sidecar on pod {}", pod.name),
                Some(Box::new(e)),
            )),
        }
    }

    /// Step 5: one execute call, retried once against the same pod after
    /// a connection-level failure, provided the pod is still reachable.
    /// Never retried after a response or deadline.
    async fn call_sidecar(&self, pod: &PodHandle, request: &ExecuteRequest) -> CallOutcome {
        let classify = |result: std::result::Result<ExecuteResponse, SidecarError>| match result {
            Ok(response) => CallOutcome::Response(response),
            Err(SidecarError::Deadline { .. }) => CallOutcome::TimedOut,
            Err(SidecarError::Status { status, body, .. }) => CallOutcome::Failed(status, body),
            Err(e) => CallOutcome::Transport(e),
        };
        match self.sidecar.execute(pod, request).await {
            Err(e) if matches!(e, SidecarError::Transport { .. }) => {
                sleep(EXECUTE_RETRY_BACKOFF).await;
                if self.sidecar.ready(pod).await.unwrap_or(false) {
                    debug!(msg = "retrying execute after transport failure", pod.name = %pod.name);
                    classify(self.sidecar.execute(pod, request).await)
                } else {
                    CallOutcome::Transport(e)
                }
            }
            other => classify(other),
        }
    }

    async fn harvest_outputs(
        &self,
        pod: &PodHandle,
        session_id: &str,
        execution: &mut Execution,
        pre_existing: &HashSet<String>,
    ) -> Vec<FileRef> {
        let listing = match self.sidecar.list_files(pod).await {
            Ok(files) => files,
            Err(e) => {
                warn!(msg = "output listing failed", %e);
                return Vec::new();
            }
        };
        let mut produced = Vec::new();
        let new_files = listing
            .into_iter()
            .filter(|f| !pre_existing.contains(&f.name) && !f.name.starts_with('.'));
        for (index, file) in new_files.enumerate() {
            let bytes = match self.sidecar.fetch_file(pod, &file.name).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(msg = "failed to fetch produced file", file = %file.name, %e);
                    continue;
                }
            };
            let size = bytes.len() as u64;
            match self
                .files
                .store_execution_output(session_id, &execution.execution_id, index, &file.name, bytes)
                .await
            {
                Ok(file_id) => {
                    execution.outputs.push(ExecutionOutput {
                        output_type: OutputType::File,
                        content: output_key(&execution.execution_id, index, &file.name),
                        mime_type: None,
                        size: Some(size),
                        timestamp: Utc::now(),
                    });
                    produced.push(FileRef {
                        id: file_id,
                        name: file.name.clone(),
                        path: Some(format!("/mnt/data/{}", file.name)),
                    });
                }
                Err(e) => warn!(msg = "failed to store produced file", file = %file.name, %e),
            }
        }
        produced
    }

    /// Clear the working directory before a pod returns to the pool so
    /// nothing leaks into the next session.
    async fn scrub_pod(&self, pod: &PodHandle) {
        let listing = match self.sidecar.list_files(pod).await {
            Ok(files) => files,
            Err(_) => return,
        };
        for file in listing {
            if file.name.starts_with('.') {
                continue;
            }
            if let Err(e) = self.sidecar.delete_file(pod, &file.name).await {
                debug!(msg = "pod scrub failed", file = %file.name, %e);
                return;
            }
        }
    }

    /// Step 8: return the pod to the pool or tear down the job.
    async fn release(&self, pod: &PodHandle, source: PodSource, job_name: Option<&str>, ok: bool) {
        match source {
            PodSource::Pool => {
                if let Err(e) = self.pool.release(&pod.uid, ok).await {
                    warn!(msg = "pool release failed", pod.uid = %pod.uid, %e);
                }
            }
            PodSource::Job => {
                if let Some(job_name) = job_name {
                    if let Err(e) = self.controller.delete_job(job_name).await {
                        warn!(msg = "job teardown failed", job.name = job_name, %e);
                    }
                }
            }
        }
    }

    /// Step 9: persist the record under `exec:{id}`, index it for the
    /// session and trim history beyond the configured cap.
    async fn persist_execution(&self, session: &Session, execution: &Execution) -> Result<()> {
        let ttl = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or(self.config.session.ttl);
        let key = exec_key(&execution.execution_id);
        let index = exec_index_key(&session.session_id);
        let mut pipe = Pipeline::new();
        pipe.hset_all(&key, execution.to_fields()?)
            .expire(&key, ttl)
            .sadd(&index, &execution.execution_id)
            .expire(&index, ttl);
        self.kv.pipeline(pipe).await?;

        let ids = self.kv.smembers(&index).await?;
        if ids.len() <= self.config.session.history_limit {
            return Ok(());
        }
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let fields = self.kv.hgetall(&exec_key(&id)).await?;
            match fields.get("created_at").map(String::clone) {
                Some(created) => records.push((created, id)),
                // Record hash already expired; just unindex it.
                None => records.push((String::new(), id)),
            }
        }
        records.sort();
        let excess = records.len() - self.config.session.history_limit;
        let mut pipe = Pipeline::new();
        for (_, id) in records.into_iter().take(excess) {
            pipe.del(&exec_key(&id)).srem(&index, &id);
        }
        self.kv.pipeline(pipe).await?;
        Ok(())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        let fields = self.kv.hgetall(&exec_key(execution_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Execution::from_fields(execution_id, &fields).map(Some)
    }

    pub async fn list_executions(&self, session_id: &str, limit: usize) -> Result<Vec<Execution>> {
        let ids = self.kv.smembers(&exec_index_key(session_id)).await?;
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(execution) = self.get_execution(&id).await? {
                executions.push(execution);
            }
        }
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(limit);
        Ok(executions)
    }

    /// Cooperative cancellation of a running execution. Returns whether
    /// anything was running under the id.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool> {
        let entry = self.running.lock().await.remove(execution_id);
        match entry {
            Some(running) => {
                running.cancel.cancel();
                let _ = self.sidecar.cancel(&running.pod, execution_id).await;
                info!(msg = "execution cancelled", execution.id = execution_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl ExecRequest {
    /// Session metadata recorded at creation: requesting user, if known.
    fn session_metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut metadata = serde_json::Map::new();
        if let Some(user_id) = &self.user_id {
            metadata.insert(
                "user_id".to_string(),
                serde_json::Value::String(user_id.clone()),
            );
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::files::FileService;
    use crate::models::RequestFile;
    use crate::session::SessionService;
    use crate::state::{StateService, StateStore as _};
    use crate::testutil::{FakeController, FakeSidecar, ScriptedExecute, test_config};

    use coderun_kv::memory::MemoryKv;
    use coderun_store::memory::MemoryBlobStore;
    use coderun_store::{BlobStore as _, file_key};

    type TestSessions = SessionService<MemoryKv>;
    type TestFiles = FileService<TestSessions, MemoryBlobStore>;
    type TestState = StateService<MemoryKv, MemoryBlobStore>;
    type TestRunner =
        ExecutionRunner<TestSessions, TestFiles, TestState, FakeController, MemoryKv, FakeSidecar>;

    struct Fixture {
        runner: Arc<TestRunner>,
        kv: Arc<MemoryKv>,
        blobs: Arc<MemoryBlobStore>,
        controller: Arc<FakeController>,
        sidecar: Arc<FakeSidecar>,
        sessions: Arc<TestSessions>,
        state: Arc<TestState>,
        pool: Arc<WarmPool<FakeController, MemoryKv>>,
    }

    fn fixture(pool_size: usize, sidecar: FakeSidecar) -> Fixture {
        let config = Arc::new(test_config(pool_size));
        let kv = Arc::new(MemoryKv::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let sessions = Arc::new(SessionService::new(kv.clone(), SessionSettings::default()));
        let state = Arc::new(StateService::new(
            kv.clone(),
            blobs.clone(),
            config.state.clone(),
            config.session.ttl,
        ));
        let files = Arc::new(FileService::new(
            sessions.clone(),
            blobs.clone(),
            config.files.clone(),
        ));
        let controller = Arc::new(FakeController::new());
        let sidecar = Arc::new(sidecar);
        let pool = Arc::new(WarmPool::new(config.clone(), controller.clone(), kv.clone()));
        let metrics = Arc::new(Metrics::new(&opentelemetry::global::meter("coderun-test")));
        let runner = Arc::new(ExecutionRunner::new(
            config,
            sessions.clone(),
            files,
            state.clone(),
            pool.clone(),
            controller.clone(),
            sidecar.clone(),
            kv.clone(),
            metrics,
        ));
        Fixture {
            runner,
            kv,
            blobs,
            controller,
            sidecar,
            sessions,
            state,
            pool,
        }
    }

    fn request(code: &str) -> ExecRequest {
        ExecRequest {
            code: code.to_string(),
            lang: "py".to_string(),
            ..Default::default()
        }
    }

    fn response_with_state(stdout: &str, state: &[u8]) -> ExecuteResponse {
        ExecuteResponse {
            state: Some(BASE64.encode(state)),
            ..FakeSidecar::ok_response(stdout)
        }
    }

    #[tokio::test]
    async fn stateless_request_creates_session_and_captures_state() {
        let sidecar =
            FakeSidecar::new().respond_with(response_with_state("hi\n", b"interpreter-state"));
        let fx = fixture(2, sidecar);
        fx.pool.replenish_once().await;

        let outcome = fx
            .runner
            .execute(&request("print('hi')"), None, true, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.pod_source, PodSource::Pool);
        assert_eq!(outcome.execution.status, ExecutionStatus::Completed);
        assert_eq!(outcome.execution.exit_code, Some(0));
        assert!(
            outcome.session.last_activity >= outcome.execution.started_at.unwrap(),
            "last activity must not precede execution start"
        );

        let upload = outcome.new_state.clone().unwrap();
        let stored = fx
            .state
            .load(&outcome.session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, b"interpreter-state");
        assert!(upload.size > 0);

        let session = fx
            .sessions
            .get(&outcome.session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(session.pod_name.is_none());

        let response = outcome.into_response();
        assert_eq!(response.stdout, "hi\n");
        assert!(response.has_state);
        assert!(response.state_size.unwrap() > 0);
    }

    #[tokio::test]
    async fn continuation_passes_persisted_state_to_the_sidecar() {
        let sidecar = FakeSidecar::new().respond_with(FakeSidecar::ok_response("42\n"));
        let fx = fixture(2, sidecar);
        fx.pool.replenish_once().await;

        let session = fx
            .sessions
            .create(Some("sess-A".to_string()), Default::default(), None)
            .await
            .unwrap();
        let blob = b"x = 41";
        fx.state
            .save(
                &session.session_id,
                &BASE64.encode(blob),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();

        let mut req = request("print(x+1)");
        req.session_id = Some("sess-A".to_string());
        let outcome = fx
            .runner
            .execute(&req, None, true, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.session.session_id, "sess-A");

        let sent = fx.sidecar.executed.lock().unwrap();
        assert_eq!(sent[0].initial_state.as_deref(), Some(BASE64.encode(blob).as_str()));
    }

    #[tokio::test]
    async fn pool_size_zero_takes_the_job_path() {
        let sidecar = FakeSidecar::new().respond_with(FakeSidecar::ok_response("done\n"));
        let fx = fixture(0, sidecar);

        let outcome = fx
            .runner
            .execute(&request("main()"), None, false, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.pod_source, PodSource::Job);
        assert_eq!(outcome.execution.status, ExecutionStatus::Completed);
        // One-shot jobs are always torn down.
        assert_eq!(fx.controller.deleted_jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deadline_becomes_timeout_and_destroys_the_pod() {
        let sidecar = FakeSidecar::new();
        sidecar.script_step(ScriptedExecute::Deadline);
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let outcome = fx
            .runner
            .execute(&request("while True: pass"), None, true, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.execution.status, ExecutionStatus::Timeout);
        assert_eq!(outcome.execution.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert_eq!(fx.controller.deleted.lock().unwrap().len(), 1);
        assert_eq!(fx.pool.stats().await[0].total, 0);
    }

    #[tokio::test]
    async fn sidecar_timeout_exit_code_destroys_the_pod() {
        let response = ExecuteResponse {
            exit_code: TIMEOUT_EXIT_CODE,
            ..FakeSidecar::ok_response("")
        };
        let sidecar = FakeSidecar::new().respond_with(response);
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let outcome = fx
            .runner
            .execute(&request("spin()"), None, false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.execution.status, ExecutionStatus::Timeout);
        assert_eq!(fx.controller.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sidecar_5xx_is_a_completed_call_with_failure() {
        let sidecar = FakeSidecar::new();
        sidecar.script_step(ScriptedExecute::Status(502));
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let outcome = fx
            .runner
            .execute(&request("x"), None, false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.execution.status, ExecutionStatus::Failed);
        assert!(outcome.execution.error_message.as_ref().unwrap().contains("502"));
        assert_eq!(fx.controller.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_retries_once_against_the_same_pod() {
        let sidecar = FakeSidecar::new();
        sidecar.script_step(ScriptedExecute::Unreachable);
        sidecar.script_step(ScriptedExecute::Respond(FakeSidecar::ok_response("ok\n")));
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let outcome = fx
            .runner
            .execute(&request("x"), None, false, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.execution.status, ExecutionStatus::Completed);
        assert_eq!(fx.sidecar.executed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn repeated_transport_failure_is_unavailable() {
        let sidecar = FakeSidecar::new();
        sidecar.script_step(ScriptedExecute::Unreachable);
        sidecar.script_step(ScriptedExecute::Unreachable);
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let err = fx
            .runner
            .execute(&request("x"), None, false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(..)));
        assert_eq!(fx.controller.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn produced_files_are_harvested_and_stored() {
        let sidecar = FakeSidecar::new().respond_with(FakeSidecar::ok_response(""));
        sidecar.post_files.lock().unwrap().push(crate::sidecar::SidecarFile {
            name: "plot.png".to_string(),
            size: 16,
        });
        sidecar
            .file_contents
            .lock()
            .unwrap()
            .insert("plot.png".to_string(), vec![9u8; 16]);
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let outcome = fx
            .runner
            .execute(&request("plot()"), None, false, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.produced_files.len(), 1);
        assert_eq!(outcome.produced_files[0].name, "plot.png");
        let stored = fx
            .blobs
            .get(&output_key(&outcome.execution.execution_id, 0, "plot.png"))
            .await
            .unwrap();
        assert_eq!(stored, Some(vec![9u8; 16]));
        assert!(
            outcome
                .execution
                .outputs
                .iter()
                .any(|o| o.output_type == OutputType::File)
        );
        // The session indexes the produced file.
        let session = fx
            .sessions
            .get(&outcome.session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.files.len(), 1);
    }

    #[tokio::test]
    async fn request_files_are_staged_through_the_sidecar() {
        let sidecar = FakeSidecar::new().respond_with(FakeSidecar::ok_response(""));
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let session = fx
            .sessions
            .create(Some("sess-F".to_string()), Default::default(), None)
            .await
            .unwrap();
        fx.blobs
            .put(
                &file_key(&session.session_id, "f1"),
                b"a,b\n".to_vec(),
                None,
            )
            .await
            .unwrap();

        let mut req = request("read()");
        req.session_id = Some(session.session_id.clone());
        req.files = vec![RequestFile {
            id: "f1".to_string(),
            session_id: session.session_id.clone(),
            name: "data.csv".to_string(),
        }];
        fx.runner
            .execute(&req, None, false, CancellationToken::new())
            .await
            .unwrap();

        let uploads = fx.sidecar.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "data.csv");
        assert_eq!(uploads[0].1, b"a,b\n");
    }

    #[tokio::test]
    async fn missing_request_file_is_not_found() {
        let sidecar = FakeSidecar::new();
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let mut req = request("read()");
        req.files = vec![RequestFile {
            id: "ghost".to_string(),
            session_id: String::new(),
            name: "data.csv".to_string(),
        }];
        let err = fx
            .runner
            .execute(&req, None, false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn unsupported_language_is_invalid_argument() {
        let fx = fixture(1, FakeSidecar::new());
        let mut req = request("x");
        req.lang = "cobol".to_string();
        let err = fx
            .runner
            .execute(&req, None, false, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cancelled_token_records_a_cancelled_execution() {
        let sidecar = FakeSidecar::new();
        sidecar.script_step(ScriptedExecute::Hang);
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let token = CancellationToken::new();
        token.cancel();
        let outcome = fx
            .runner
            .execute(&request("sleep(999)"), None, false, token)
            .await
            .unwrap();
        assert_eq!(outcome.execution.status, ExecutionStatus::Cancelled);
        assert_eq!(fx.sidecar.cancelled.lock().unwrap().len(), 1);
        // Cancelled executions never recycle the pod.
        assert_eq!(fx.controller.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn execution_records_persist_and_list() {
        let sidecar = FakeSidecar::new().respond_with(FakeSidecar::ok_response("one\n"));
        let fx = fixture(1, sidecar);
        fx.pool.replenish_once().await;

        let outcome = fx
            .runner
            .execute(&request("print('one')"), None, false, CancellationToken::new())
            .await
            .unwrap();

        let fetched = fx
            .runner
            .get_execution(&outcome.execution.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Completed);
        assert_eq!(fetched.stdout(), "one\n");

        let listed = fx
            .runner
            .list_executions(&outcome.session.session_id, 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(
            fx.kv
                .exists(&exec_key(&outcome.execution.execution_id))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn cancel_execution_without_running_call_returns_false() {
        let fx = fixture(1, FakeSidecar::new());
        assert!(!fx.runner.cancel_execution("nope").await.unwrap());
    }
}
