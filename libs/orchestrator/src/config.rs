//! Orchestrator configuration.
//!
//! Assembled from environment variables the way deployment templating
//! renders them: empty strings mean unset, per-language knobs arrive as
//! compact `lang=value` lists.

use crate::error::{Error, Result};

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// An executor binary copied into the main container serves code
    /// execution over HTTP. No elevated capabilities; compatible with
    /// sandboxed runtimes.
    #[default]
    Agent,
    /// The sidecar enters the main container's mount namespace to spawn
    /// code. Requires elevated capabilities; incompatible with sandboxed
    /// runtimes.
    Nsenter,
}

serde_plain::derive_display_from_serialize!(ExecutionMode);
serde_plain::derive_fromstr_from_deserialize!(ExecutionMode);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TolerationSpec {
    pub key: String,
    pub operator: String,
    pub value: Option<String>,
    pub effect: String,
}

#[derive(Clone, Debug, Default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub runtime_class: String,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<TolerationSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodResources {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl PodResources {
    pub fn main_defaults() -> Self {
        Self {
            cpu_request: "100m".to_string(),
            cpu_limit: "1".to_string(),
            memory_request: "128Mi".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }

    pub fn sidecar_defaults() -> Self {
        Self {
            cpu_request: "100m".to_string(),
            cpu_limit: "500m".to_string(),
            memory_request: "256Mi".to_string(),
            memory_limit: "512Mi".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LanguageConfig {
    pub language: String,
    pub image: String,
    /// Zero means no warm pool; executions fall back to one-shot jobs.
    pub pool_size: usize,
    /// Stateful languages persist an interpreter snapshot between calls.
    pub stateful: bool,
    pub timeout: Duration,
    pub network_isolated: bool,
    pub resources: PodResources,
}

impl LanguageConfig {
    pub fn uses_pool(&self) -> bool {
        self.pool_size > 0
    }
}

#[derive(Clone, Debug)]
pub struct PodSettings {
    pub sidecar_image: String,
    pub sidecar_port: u16,
    pub executor_port: u16,
    pub run_as_user: i64,
    pub seccomp_profile: String,
    pub image_pull_policy: String,
    pub image_pull_secrets: Vec<String>,
    pub execution_mode: ExecutionMode,
    pub sandbox: SandboxConfig,
    pub sidecar_resources: PodResources,
    pub termination_grace: Duration,
    pub job_ttl_seconds: i32,
    pub job_active_deadline_seconds: i64,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub execute_grace: Duration,
    pub connect_timeout: Duration,
}

impl Default for PodSettings {
    fn default() -> Self {
        Self {
            sidecar_image: "coderun/sidecar-agent:latest".to_string(),
            sidecar_port: 8080,
            executor_port: 9090,
            run_as_user: 65532,
            seccomp_profile: "RuntimeDefault".to_string(),
            image_pull_policy: "Always".to_string(),
            image_pull_secrets: Vec::new(),
            execution_mode: ExecutionMode::Agent,
            sandbox: SandboxConfig {
                enabled: false,
                runtime_class: "gvisor".to_string(),
                node_selector: BTreeMap::new(),
                tolerations: Vec::new(),
            },
            sidecar_resources: PodResources::sidecar_defaults(),
            termination_grace: Duration::from_secs(10),
            job_ttl_seconds: 60,
            job_active_deadline_seconds: 300,
            probe_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            execute_grace: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub replenish_interval: Duration,
    pub health_interval: Duration,
    pub acquire_timeout: Duration,
    pub creation_timeout: Duration,
    /// Creations allowed per language per replenish sweep.
    pub max_creations_per_sweep: usize,
    /// A pod is retired after this many executions...
    pub reuse_max_executions: u32,
    /// ...or once it has been alive this long, whichever comes first.
    pub reuse_max_age: Duration,
    pub total_pod_ceiling: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            replenish_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(3),
            creation_timeout: Duration::from_secs(90),
            max_creations_per_sweep: 2,
            reuse_max_executions: 20,
            reuse_max_age: Duration::from_secs(30 * 60),
            total_pod_ceiling: 50,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub ttl: Duration,
    /// Execution records retained per session.
    pub history_limit: usize,
    pub sweep_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            history_limit: 20,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StateSettings {
    pub max_state_bytes: usize,
    /// Hot entries this close to expiry are copied to the cold tier.
    pub archive_margin: Duration,
    pub archive_interval: Duration,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            max_state_bytes: 16 * 1024 * 1024,
            archive_margin: Duration::from_secs(10 * 60),
            archive_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileSettings {
    pub presign_ttl: Duration,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            presign_ttl: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Application name, used in pod names and labels.
    pub app_name: String,
    /// Cluster namespace executions run in.
    pub namespace: String,
    pub languages: HashMap<String, LanguageConfig>,
    pub pod: PodSettings,
    pub pool: PoolSettings,
    pub session: SessionSettings,
    pub state: StateSettings,
    pub files: FileSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            app_name: "coderun".to_string(),
            namespace: "default".to_string(),
            languages: HashMap::new(),
            pod: PodSettings::default(),
            pool: PoolSettings::default(),
            session: SessionSettings::default(),
            state: StateSettings::default(),
            files: FileSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn language(&self, language: &str) -> Result<&LanguageConfig> {
        self.languages
            .get(language)
            .ok_or_else(|| Error::InvalidArgument(format!("unsupported language: {language}")))
    }

    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let pod_defaults = PodSettings::default();
        let pool_defaults = PoolSettings::default();
        let state_defaults = StateSettings::default();
        let session_defaults = SessionSettings::default();

        let images = env_assignments("LANGUAGE_IMAGES");
        let pool_sizes: HashMap<String, String> = env_assignments("POOL_SIZES");
        let timeouts: HashMap<String, String> = env_assignments("EXECUTION_TIMEOUTS");
        let stateful = env_list("STATEFUL_LANGUAGES");
        let isolated = env_list("NETWORK_ISOLATED_LANGUAGES");

        let mut languages = HashMap::new();
        for (language, image) in images {
            let pool_size = match pool_sizes.get(&language) {
                Some(raw) => raw.parse().map_err(|_| {
                    Error::InvalidArgument(format!("invalid pool size for {language}: {raw}"))
                })?,
                None => 0,
            };
            let timeout = match timeouts.get(&language) {
                Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                    Error::InvalidArgument(format!("invalid timeout for {language}: {raw}"))
                })?),
                None => Duration::from_secs(30),
            };
            languages.insert(
                language.clone(),
                LanguageConfig {
                    stateful: stateful.contains(&language),
                    network_isolated: isolated.contains(&language),
                    language,
                    image,
                    pool_size,
                    timeout,
                    resources: PodResources::main_defaults(),
                },
            );
        }

        let sandbox_enabled = env_bool("SANDBOX_ENABLED");
        let config = Self {
            app_name: env_opt("APP_NAME").unwrap_or(defaults.app_name),
            namespace: env_opt("NAMESPACE")
                .or_else(|| env_opt("POD_NAMESPACE"))
                .unwrap_or(defaults.namespace),
            languages,
            pod: PodSettings {
                sidecar_image: env_opt("SIDECAR_IMAGE").unwrap_or(pod_defaults.sidecar_image),
                sidecar_port: env_parse("SIDECAR_PORT")?.unwrap_or(pod_defaults.sidecar_port),
                executor_port: env_parse("EXECUTOR_PORT")?.unwrap_or(pod_defaults.executor_port),
                run_as_user: env_parse("RUN_AS_USER")?.unwrap_or(pod_defaults.run_as_user),
                seccomp_profile: env_opt("SECCOMP_PROFILE").unwrap_or(pod_defaults.seccomp_profile),
                image_pull_policy: env_opt("IMAGE_PULL_POLICY")
                    .unwrap_or(pod_defaults.image_pull_policy),
                image_pull_secrets: env_list("IMAGE_PULL_SECRETS").into_iter().collect(),
                execution_mode: match env_opt("EXECUTION_MODE") {
                    Some(raw) => raw.parse().map_err(|_| {
                        Error::InvalidArgument(format!("unknown EXECUTION_MODE: {raw}"))
                    })?,
                    None => ExecutionMode::Agent,
                },
                sandbox: SandboxConfig {
                    enabled: sandbox_enabled,
                    runtime_class: env_opt("SANDBOX_RUNTIME_CLASS")
                        .unwrap_or(pod_defaults.sandbox.runtime_class),
                    node_selector: env_assignments("SANDBOX_NODE_SELECTOR").into_iter().collect(),
                    tolerations: parse_tolerations(&env_opt("CUSTOM_TOLERATIONS").unwrap_or_default()),
                },
                sidecar_resources: PodResources::sidecar_defaults(),
                termination_grace: env_parse("TERMINATION_GRACE_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pod_defaults.termination_grace),
                job_ttl_seconds: env_parse("JOB_TTL_SECONDS")?.unwrap_or(pod_defaults.job_ttl_seconds),
                job_active_deadline_seconds: env_parse("JOB_ACTIVE_DEADLINE_SECS")?
                    .unwrap_or(pod_defaults.job_active_deadline_seconds),
                probe_timeout: env_parse("SIDECAR_PROBE_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pod_defaults.probe_timeout),
                request_timeout: env_parse("SIDECAR_REQUEST_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pod_defaults.request_timeout),
                execute_grace: env_parse("SIDECAR_EXECUTE_GRACE_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pod_defaults.execute_grace),
                connect_timeout: env_parse("SIDECAR_CONNECT_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pod_defaults.connect_timeout),
            },
            pool: PoolSettings {
                replenish_interval: env_parse("POOL_REPLENISH_INTERVAL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pool_defaults.replenish_interval),
                health_interval: env_parse("POOL_HEALTH_INTERVAL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pool_defaults.health_interval),
                acquire_timeout: env_parse("POOL_ACQUIRE_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pool_defaults.acquire_timeout),
                creation_timeout: env_parse("POD_CREATION_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pool_defaults.creation_timeout),
                max_creations_per_sweep: env_parse("POOL_MAX_CREATIONS_PER_SWEEP")?
                    .unwrap_or(pool_defaults.max_creations_per_sweep),
                reuse_max_executions: env_parse("POD_REUSE_MAX_EXECUTIONS")?
                    .unwrap_or(pool_defaults.reuse_max_executions),
                reuse_max_age: env_parse("POD_REUSE_MAX_AGE_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(pool_defaults.reuse_max_age),
                total_pod_ceiling: env_parse("TOTAL_POD_CEILING")?
                    .unwrap_or(pool_defaults.total_pod_ceiling),
            },
            session: SessionSettings {
                ttl: env_parse("SESSION_TTL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(session_defaults.ttl),
                history_limit: env_parse("EXECUTION_HISTORY_LIMIT")?
                    .unwrap_or(session_defaults.history_limit),
                sweep_interval: env_parse("SESSION_SWEEP_INTERVAL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(session_defaults.sweep_interval),
            },
            state: StateSettings {
                max_state_bytes: env_parse("MAX_STATE_BYTES")?
                    .unwrap_or(state_defaults.max_state_bytes),
                archive_margin: env_parse("STATE_ARCHIVE_MARGIN_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(state_defaults.archive_margin),
                archive_interval: env_parse("STATE_ARCHIVE_INTERVAL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(state_defaults.archive_interval),
            },
            files: FileSettings {
                presign_ttl: env_parse("PRESIGN_TTL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(FileSettings::default().presign_ttl),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks. Hard misconfiguration fails startup; softer
    /// concerns are logged as warnings.
    pub fn validate(&self) -> Result<()> {
        if self.state.max_state_bytes == 0 {
            return Err(Error::InvalidArgument(
                "MAX_STATE_BYTES must be greater than zero".to_string(),
            ));
        }
        if self.pod.sandbox.enabled && self.pod.execution_mode == ExecutionMode::Nsenter {
            warn!(
                msg = "sandbox runtime enabled with nsenter execution mode; \
                       nsenter capabilities are incompatible with sandboxed kernels",
                runtime_class = %self.pod.sandbox.runtime_class,
            );
        }
        if self.languages.is_empty() {
            warn!(msg = "no languages configured; every request will be rejected");
        }
        let pooled: usize = self.languages.values().map(|l| l.pool_size).sum();
        if pooled > self.pool.total_pod_ceiling {
            warn!(
                msg = "sum of pool sizes exceeds total pod ceiling",
                pooled,
                ceiling = self.pool.total_pod_ceiling,
            );
        }
        Ok(())
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_opt(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidArgument(format!("invalid value for {name}: {raw}"))),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_opt(name).as_deref(),
        Some("1") | Some("true") | Some("True") | Some("TRUE") | Some("yes")
    )
}

fn env_list(name: &str) -> std::collections::HashSet<String> {
    env_opt(name)
        .map(|raw| parse_list(&raw))
        .unwrap_or_default()
}

fn env_assignments(name: &str) -> HashMap<String, String> {
    env_opt(name)
        .map(|raw| parse_assignments(&raw))
        .unwrap_or_default()
}

/// Parse `a,b,c` into a set, skipping empty entries.
pub fn parse_list(raw: &str) -> std::collections::HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `key=value,key2=value2`, skipping malformed entries.
pub fn parse_assignments(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key.to_string(), value.to_string()))
            }
        })
        .collect()
}

/// Parse `key=value:Effect` toleration entries; entries without a key are
/// dropped.
pub fn parse_tolerations(raw: &str) -> Vec<TolerationSpec> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (pair, effect) = match entry.rsplit_once(':') {
                Some((pair, effect)) => (pair, effect.to_string()),
                None => (entry, "NoSchedule".to_string()),
            };
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
                None => (pair.trim(), None),
            };
            if key.is_empty() {
                return None;
            }
            Some(TolerationSpec {
                key: key.to_string(),
                operator: if value.is_some() { "Equal" } else { "Exists" }.to_string(),
                value,
                effect,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_parse_and_skip_malformed() {
        let parsed = parse_assignments("py=python:3.12-slim, go=golang:1.22 ,bad,=x,y=");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["py"], "python:3.12-slim");
        assert_eq!(parsed["go"], "golang:1.22");
    }

    #[test]
    fn list_parse_skips_empty() {
        let parsed = parse_list("py, ,go,");
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains("py"));
    }

    #[test]
    fn tolerations_parse_forms() {
        let parsed = parse_tolerations("pool=sandbox:NoSchedule,dedicated:NoExecute");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].key, "pool");
        assert_eq!(parsed[0].operator, "Equal");
        assert_eq!(parsed[0].value.as_deref(), Some("sandbox"));
        assert_eq!(parsed[0].effect, "NoSchedule");
        assert_eq!(parsed[1].operator, "Exists");
        assert_eq!(parsed[1].effect, "NoExecute");
    }

    #[test]
    fn zero_state_cap_is_rejected() {
        let config = OrchestratorConfig {
            state: StateSettings {
                max_state_bytes: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_language_lookup_fails() {
        let config = OrchestratorConfig::default();
        assert!(config.language("cobol").is_err());
    }

    #[test]
    fn execution_mode_parses() {
        assert_eq!("agent".parse::<ExecutionMode>().unwrap(), ExecutionMode::Agent);
        assert_eq!(
            "nsenter".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Nsenter
        );
    }
}
