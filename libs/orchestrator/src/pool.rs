//! Warm pod pool: per-language pre-created pods that eliminate
//! cold-start latency for hot languages.
//!
//! All transitions for one language serialise behind that language's
//! mutex; languages never contend with each other. The in-process
//! registry is authoritative while the process lives; the cluster API is
//! the source of truth on restart, reconciled by listing pods with the
//! orchestrator's labels. A KV mirror of pod UIDs per language survives
//! restarts for observability and recovery tooling.

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::lifecycle::PodController;
use crate::models::{PodHandle, PodStatus, PooledPod};

use coderun_kv::{KvCommands, Pipeline};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIRROR_KEY_PREFIX: &str = "pool:lang:";
const HEALTH_FAILURE_LIMIT: u8 = 2;
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CREATE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const CREATE_BACKOFF_MAX: Duration = Duration::from_secs(60);

fn mirror_key(language: &str) -> String {
    format!("{MIRROR_KEY_PREFIX}{language}")
}

/// Outcome of a pool acquisition attempt.
#[derive(Debug)]
pub enum Acquired {
    /// A warm pod was bound; `pod-source = "pool"`.
    Pool(PodHandle),
    /// No pool is configured for the language; use the one-shot job path.
    UseJob,
}

#[derive(Default)]
struct LanguagePool {
    entries: Vec<PooledPod>,
    /// Consecutive creation failures, driving the replenish backoff.
    failure_streak: u32,
    next_create_after: Option<Instant>,
}

impl LanguagePool {
    /// Oldest available entry wins, so long-lived pods cycle out first.
    fn take_oldest_available(&mut self, session_id: &str) -> Option<PodHandle> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_available())
            .min_by_key(|(_, e)| e.handle.created_at)
            .map(|(i, _)| i)?;
        let entry = &mut self.entries[index];
        entry.acquired = true;
        entry.acquired_at = Some(Utc::now());
        entry.handle.status = PodStatus::Specializing;
        entry.handle.session_id = Some(session_id.to_string());
        Some(entry.handle.clone())
    }

    fn record_create_failure(&mut self) -> Duration {
        self.failure_streak += 1;
        let exponent = self.failure_streak.min(6);
        let backoff = CREATE_BACKOFF_BASE
            .saturating_mul(1 << exponent)
            .min(CREATE_BACKOFF_MAX);
        self.next_create_after = Some(Instant::now() + backoff);
        backoff
    }

    fn record_create_success(&mut self) {
        self.failure_streak = 0;
        self.next_create_after = None;
    }

    fn creation_gated(&self) -> bool {
        self.next_create_after
            .is_some_and(|after| Instant::now() < after)
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct PoolStats {
    pub language: String,
    pub target: usize,
    pub total: usize,
    pub available: usize,
}

pub struct WarmPool<C, K> {
    config: Arc<OrchestratorConfig>,
    controller: Arc<C>,
    kv: Arc<K>,
    languages: HashMap<String, Mutex<LanguagePool>>,
}

impl<C: PodController, K: KvCommands> WarmPool<C, K> {
    pub fn new(config: Arc<OrchestratorConfig>, controller: Arc<C>, kv: Arc<K>) -> Self {
        let languages = config
            .languages
            .values()
            .filter(|l| l.uses_pool())
            .map(|l| (l.language.clone(), Mutex::new(LanguagePool::default())))
            .collect();
        Self {
            config,
            controller,
            kv,
            languages,
        }
    }

    /// Acquire a warm pod for the language, transitioning it to
    /// `specializing` and binding the session. Waits briefly for a pod to
    /// free up, then falls back to a synchronous creation.
    pub async fn acquire(&self, language: &str, session_id: &str) -> Result<Acquired> {
        let lang = self.config.language(language)?;
        if !lang.uses_pool() {
            return Ok(Acquired::UseJob);
        }
        let pool = self
            .languages
            .get(language)
            .ok_or_else(|| Error::Internal(format!("no pool registered for {language}"), None))?;

        let deadline = Instant::now() + self.config.pool.acquire_timeout;
        loop {
            if let Some(handle) = pool.lock().await.take_oldest_available(session_id) {
                debug!(msg = "acquired warm pod", pod.name = %handle.name, language);
                return Ok(Acquired::Pool(handle));
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(ACQUIRE_POLL_INTERVAL).await;
        }

        // Deadline passed with nothing available; create one on the spot.
        debug!(msg = "pool exhausted, creating pod synchronously", language);
        let mut handle = self
            .controller
            .create_warm_pod(language)
            .await
            .map_err(|e| Error::Unavailable(format!("warm pod pool for {language}"), Some(Box::new(e))))?;
        handle.status = PodStatus::Specializing;
        handle.session_id = Some(session_id.to_string());
        {
            let mut guard = pool.lock().await;
            let mut entry = PooledPod::new(handle.clone());
            entry.acquired = true;
            entry.acquired_at = Some(Utc::now());
            guard.entries.push(entry);
        }
        self.mirror_add(language, &handle.uid).await;
        Ok(Acquired::Pool(handle))
    }

    /// Report an execution's outcome for a pooled pod. Healthy pods
    /// within their reuse budget return to `warm`; everything else is
    /// deleted. Unknown UIDs are a no-op, making release idempotent.
    pub async fn release(&self, uid: &str, success: bool) -> Result<()> {
        for (language, pool) in &self.languages {
            let to_delete = {
                let mut guard = pool.lock().await;
                let Some(index) = guard.entries.iter().position(|e| e.handle.uid == uid) else {
                    continue;
                };
                let entry = &mut guard.entries[index];
                if !entry.acquired {
                    // Already released.
                    return Ok(());
                }
                entry.executions += 1;
                let age = Utc::now() - entry.handle.created_at;
                let over_budget = entry.executions >= self.config.pool.reuse_max_executions
                    || age
                        >= chrono::Duration::from_std(self.config.pool.reuse_max_age)
                            .unwrap_or(chrono::Duration::MAX);
                if success && !over_budget {
                    entry.acquired = false;
                    entry.acquired_at = None;
                    entry.handle.status = PodStatus::Warm;
                    entry.handle.session_id = None;
                    debug!(msg = "pod returned to pool", pod.uid = uid, %language);
                    return Ok(());
                }
                guard.entries.swap_remove(index)
            };
            debug!(
                msg = "retiring pod",
                pod.uid = uid,
                %language,
                success,
            );
            self.mirror_remove(language, uid).await;
            self.controller.delete_pod(&to_delete.handle).await?;
            return Ok(());
        }
        Ok(())
    }

    /// Drop a registry entry without touching the cluster, for pods
    /// observed deleted out from under us.
    pub async fn evict(&self, uid: &str) {
        for (language, pool) in &self.languages {
            let removed = {
                let mut guard = pool.lock().await;
                match guard.entries.iter().position(|e| e.handle.uid == uid) {
                    Some(index) => {
                        guard.entries.swap_remove(index);
                        true
                    }
                    None => false,
                }
            };
            if removed {
                info!(msg = "evicted vanished pod", pod.uid = uid, %language);
                self.mirror_remove(language, uid).await;
                return;
            }
        }
    }

    /// One replenishment pass: create pods until each language meets its
    /// target, bounded by the per-sweep rate limit and per-language
    /// failure backoff.
    pub async fn replenish_once(&self) {
        for (language, pool) in &self.languages {
            let target = match self.config.languages.get(language) {
                Some(lang) => lang.pool_size,
                None => continue,
            };
            let (current, gated) = {
                let guard = pool.lock().await;
                (guard.entries.len(), guard.creation_gated())
            };
            if gated || current >= target {
                continue;
            }
            let needed = (target - current).min(self.config.pool.max_creations_per_sweep);
            for _ in 0..needed {
                match self.controller.create_warm_pod(language).await {
                    Ok(handle) => {
                        let uid = handle.uid.clone();
                        {
                            let mut guard = pool.lock().await;
                            guard.record_create_success();
                            guard.entries.push(PooledPod::new(handle));
                        }
                        self.mirror_add(language, &uid).await;
                    }
                    Err(e) => {
                        let backoff = pool.lock().await.record_create_failure();
                        warn!(
                            msg = "pod creation failed, backing off",
                            %language,
                            backoff = ?backoff,
                            %e,
                        );
                        break;
                    }
                }
            }
        }
    }

    /// One health pass over idle entries. Two consecutive probe failures
    /// retire an entry; replenishment restores the target afterwards.
    pub async fn health_sweep_once(&self) {
        for (language, pool) in &self.languages {
            let idle: Vec<PodHandle> = {
                let guard = pool.lock().await;
                guard
                    .entries
                    .iter()
                    .filter(|e| !e.acquired)
                    .map(|e| e.handle.clone())
                    .collect()
            };
            for handle in idle {
                let healthy = self.controller.probe_health(&handle).await;
                let to_delete = {
                    let mut guard = pool.lock().await;
                    let Some(entry) = guard
                        .entries
                        .iter_mut()
                        .find(|e| e.handle.uid == handle.uid && !e.acquired)
                    else {
                        continue;
                    };
                    if healthy {
                        entry.health_check_failures = 0;
                        continue;
                    }
                    entry.health_check_failures += 1;
                    if entry.health_check_failures < HEALTH_FAILURE_LIMIT {
                        debug!(
                            msg = "health probe failed",
                            pod.name = %handle.name,
                            failures = entry.health_check_failures,
                        );
                        continue;
                    }
                    let index = guard
                        .entries
                        .iter()
                        .position(|e| e.handle.uid == handle.uid)
                        .expect("entry located above");
                    guard.entries.swap_remove(index)
                };
                warn!(
                    msg = "retiring unhealthy pod",
                    pod.name = %to_delete.handle.name,
                    %language,
                );
                self.mirror_remove(language, &to_delete.handle.uid).await;
                if let Err(e) = self.controller.delete_pod(&to_delete.handle).await {
                    warn!(msg = "failed to delete unhealthy pod", %e);
                }
            }
        }
    }

    /// Startup reconciliation: the registry is empty, so every executor
    /// pod the cluster still knows about is stale. Delete them and reset
    /// the KV mirror; the replenisher rebuilds the pool from scratch.
    pub async fn reconcile(&self) -> Result<()> {
        let stale = self.controller.list_executor_pods().await?;
        for handle in &stale {
            info!(
                msg = "deleting stale executor pod from previous run",
                pod.name = %handle.name,
            );
            if let Err(e) = self.controller.delete_pod(handle).await {
                warn!(msg = "failed to delete stale pod", pod.name = %handle.name, %e);
            }
        }
        let mut pipe = Pipeline::new();
        for language in self.languages.keys() {
            pipe.del(&mirror_key(language));
        }
        if let Err(e) = self.kv.pipeline(pipe).await {
            warn!(msg = "failed to reset pool mirror", %e);
        }
        Ok(())
    }

    pub async fn stats(&self) -> Vec<PoolStats> {
        let mut stats = Vec::with_capacity(self.languages.len());
        for (language, pool) in &self.languages {
            let guard = pool.lock().await;
            stats.push(PoolStats {
                language: language.clone(),
                target: self
                    .config
                    .languages
                    .get(language)
                    .map(|l| l.pool_size)
                    .unwrap_or(0),
                total: guard.entries.len(),
                available: guard.entries.iter().filter(|e| e.is_available()).count(),
            });
        }
        stats
    }

    /// Periodic replenishment until shutdown.
    pub async fn run_replenisher(self: Arc<Self>, shutdown: CancellationToken) {
        info!(msg = "pool replenisher started", interval = ?self.config.pool.replenish_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.pool.replenish_interval) => self.replenish_once().await,
            }
        }
    }

    /// Periodic health sweep until shutdown.
    pub async fn run_health_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        info!(msg = "pool health sweeper started", interval = ?self.config.pool.health_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.pool.health_interval) => self.health_sweep_once().await,
            }
        }
    }

    async fn mirror_add(&self, language: &str, uid: &str) {
        if let Err(e) = self.kv.sadd(&mirror_key(language), uid).await {
            warn!(msg = "pool mirror add failed", language, %e);
        }
    }

    async fn mirror_remove(&self, language: &str, uid: &str) {
        if let Err(e) = self.kv.srem(&mirror_key(language), uid).await {
            warn!(msg = "pool mirror remove failed", language, %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeController, test_config};

    use coderun_kv::memory::MemoryKv;

    use std::sync::atomic::Ordering;

    fn pool_with(
        pool_size: usize,
    ) -> (Arc<WarmPool<FakeController, MemoryKv>>, Arc<FakeController>) {
        let controller = Arc::new(FakeController::new());
        let pool = Arc::new(WarmPool::new(
            Arc::new(test_config(pool_size)),
            controller.clone(),
            Arc::new(MemoryKv::new()),
        ));
        (pool, controller)
    }

    #[tokio::test]
    async fn replenish_fills_to_target() {
        let (pool, controller) = pool_with(2);
        pool.replenish_once().await;
        assert_eq!(controller.created.lock().unwrap().len(), 2);
        let stats = pool.stats().await;
        assert_eq!(stats[0].total, 2);
        assert_eq!(stats[0].available, 2);
        // A second pass is a no-op at target.
        pool.replenish_once().await;
        assert_eq!(controller.created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn acquire_returns_oldest_and_marks_specializing() {
        let (pool, _) = pool_with(2);
        pool.replenish_once().await;
        let first = match pool.acquire("py", "sess-1").await.unwrap() {
            Acquired::Pool(handle) => handle,
            other => panic!("expected pool acquisition, got {other:?}"),
        };
        assert_eq!(first.uid, "uid-0");
        assert_eq!(first.status, PodStatus::Specializing);
        assert_eq!(first.session_id.as_deref(), Some("sess-1"));
        let stats = pool.stats().await;
        assert_eq!(stats[0].available, 1);
    }

    #[tokio::test]
    async fn pool_size_zero_signals_job_path() {
        let (pool, _) = pool_with(0);
        match pool.acquire("py", "sess-1").await.unwrap() {
            Acquired::UseJob => {}
            other => panic!("expected job fallback, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_pool_creates_synchronously() {
        let (pool, controller) = pool_with(2);
        // No replenish has run; the pool is empty.
        let acquired = pool.acquire("py", "sess-1").await.unwrap();
        assert!(matches!(acquired, Acquired::Pool(_)));
        assert_eq!(controller.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_with_failing_creation_is_unavailable() {
        let (pool, controller) = pool_with(2);
        controller.fail_creates.store(true, Ordering::SeqCst);
        let err = pool.acquire("py", "sess-1").await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(..)));
    }

    #[tokio::test]
    async fn release_success_returns_pod_to_warm() {
        let (pool, controller) = pool_with(2);
        pool.replenish_once().await;
        let handle = match pool.acquire("py", "sess-1").await.unwrap() {
            Acquired::Pool(handle) => handle,
            other => panic!("unexpected {other:?}"),
        };
        pool.release(&handle.uid, true).await.unwrap();
        assert!(controller.deleted.lock().unwrap().is_empty());
        let stats = pool.stats().await;
        assert_eq!(stats[0].available, 2);
    }

    #[tokio::test]
    async fn release_failure_deletes_pod() {
        let (pool, controller) = pool_with(2);
        pool.replenish_once().await;
        let handle = match pool.acquire("py", "sess-1").await.unwrap() {
            Acquired::Pool(handle) => handle,
            other => panic!("unexpected {other:?}"),
        };
        pool.release(&handle.uid, false).await.unwrap();
        assert_eq!(*controller.deleted.lock().unwrap(), vec![handle.uid.clone()]);
        assert_eq!(pool.stats().await[0].total, 1);
    }

    #[tokio::test]
    async fn release_twice_is_a_noop() {
        let (pool, controller) = pool_with(2);
        pool.replenish_once().await;
        let handle = match pool.acquire("py", "sess-1").await.unwrap() {
            Acquired::Pool(handle) => handle,
            other => panic!("unexpected {other:?}"),
        };
        pool.release(&handle.uid, false).await.unwrap();
        pool.release(&handle.uid, false).await.unwrap();
        assert_eq!(controller.deleted.lock().unwrap().len(), 1);
        pool.release("uid-never-existed", true).await.unwrap();
    }

    #[tokio::test]
    async fn reuse_budget_retires_pod() {
        let (pool, controller) = pool_with(1);
        pool.replenish_once().await;
        // Budget is 3 executions; the third release retires the pod.
        for round in 0..3 {
            let handle = match pool.acquire("py", "sess-1").await.unwrap() {
                Acquired::Pool(handle) => handle,
                other => panic!("unexpected {other:?}"),
            };
            pool.release(&handle.uid, true).await.unwrap();
            let deleted = controller.deleted.lock().unwrap().len();
            if round < 2 {
                assert_eq!(deleted, 0);
            } else {
                assert_eq!(deleted, 1);
            }
        }
    }

    #[tokio::test]
    async fn health_sweep_retires_after_two_consecutive_failures() {
        let (pool, controller) = pool_with(1);
        pool.replenish_once().await;
        controller.healthy.store(false, Ordering::SeqCst);

        pool.health_sweep_once().await;
        assert_eq!(pool.stats().await[0].total, 1);
        assert!(controller.deleted.lock().unwrap().is_empty());

        pool.health_sweep_once().await;
        assert_eq!(pool.stats().await[0].total, 0);
        assert_eq!(controller.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovered_health_resets_strikes() {
        let (pool, controller) = pool_with(1);
        pool.replenish_once().await;
        controller.healthy.store(false, Ordering::SeqCst);
        pool.health_sweep_once().await;
        controller.healthy.store(true, Ordering::SeqCst);
        pool.health_sweep_once().await;
        controller.healthy.store(false, Ordering::SeqCst);
        pool.health_sweep_once().await;
        // Strikes reset between failures; the pod survives.
        assert_eq!(pool.stats().await[0].total, 1);
    }

    #[tokio::test]
    async fn creation_failures_back_off() {
        let (pool, controller) = pool_with(2);
        controller.fail_creates.store(true, Ordering::SeqCst);
        pool.replenish_once().await;
        controller.fail_creates.store(false, Ordering::SeqCst);
        // Still inside the backoff window; nothing is created.
        pool.replenish_once().await;
        assert!(controller.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_deletes_stale_cluster_pods() {
        let (pool, controller) = pool_with(2);
        let stale = controller.handle("py");
        controller.cluster_pods.lock().unwrap().push(stale.clone());
        pool.reconcile().await.unwrap();
        assert_eq!(*controller.deleted.lock().unwrap(), vec![stale.uid]);
    }

    #[tokio::test]
    async fn evict_removes_entry_without_cluster_delete() {
        let (pool, controller) = pool_with(1);
        pool.replenish_once().await;
        assert_eq!(pool.stats().await[0].total, 1);
        pool.evict("uid-0").await;
        assert_eq!(pool.stats().await[0].total, 0);
        assert!(controller.deleted.lock().unwrap().is_empty());
    }
}
