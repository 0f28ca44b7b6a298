//! Pod and job manifest construction for executor pods.
//!
//! Two execution modes are supported. In agent mode an init container
//! copies a small executor binary from the sidecar image into the shared
//! volume and the main container runs it; every container drops all
//! capabilities and runs as non-root. In legacy nsenter mode the sidecar
//! holds the three capabilities required to enter the main container's
//! mount namespace, which rules out sandboxed runtimes.

use crate::config::{ExecutionMode, LanguageConfig, OrchestratorConfig, PodResources};
use crate::models::session::DEFAULT_WORKING_DIRECTORY;

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction,
    LocalObjectReference, Pod, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SeccompProfile, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use rand::Rng;

pub const LABEL_APP: &str = "app";
pub const LABEL_ROLE: &str = "coderun.dev/role";
pub const LABEL_LANGUAGE: &str = "coderun.dev/language";
pub const ROLE_EXECUTOR: &str = "executor";

const SHARED_VOLUME_NAME: &str = "shared-data";
const SHARED_VOLUME_SIZE: &str = "1Gi";
const EXECUTOR_BINARY_SOURCE: &str = "/opt/executor-agent";
const EXECUTOR_BINARY_TARGET: &str = "/mnt/data/.executor-agent";
const NSENTER_CAPABILITIES: [&str; 3] = ["SYS_PTRACE", "SYS_ADMIN", "SYS_CHROOT"];
const SANDBOX_RUNTIME_LABEL: &str = "sandbox.gke.io/runtime";

/// Generate an RFC 1123 compatible executor pod name.
pub fn executor_pod_name(app_name: &str, language: &str) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{app_name}-{language}-{suffix}")
}

pub trait ExecutorManifests {
    fn executor_labels(&self, language: &str) -> BTreeMap<String, String>;
    /// Label selector matching every pod this orchestrator owns.
    fn executor_selector(&self) -> String;
    fn create_executor_pod(&self, language: &LanguageConfig, name: &str) -> Pod;
    fn create_executor_job(&self, language: &LanguageConfig, name: &str) -> Job;
}

trait ExecutorManifestsPrivate {
    fn generate_pod_spec(&self, language: &LanguageConfig) -> PodSpec;
    fn generate_main_container(&self, language: &LanguageConfig) -> Container;
    fn generate_sidecar_container(&self, language: &LanguageConfig) -> Container;
    fn generate_init_containers(&self) -> Option<Vec<Container>>;
    fn generate_main_security_context(&self) -> SecurityContext;
    fn generate_sidecar_security_context(&self) -> SecurityContext;
    fn generate_tolerations(&self) -> Option<Vec<Toleration>>;
    fn generate_node_selector(&self) -> Option<BTreeMap<String, String>>;
    fn generate_pull_secrets(&self) -> Option<Vec<LocalObjectReference>>;
}

fn quantities(resources: &PodResources) -> ResourceRequirements {
    let map = |cpu: &str, memory: &str| {
        let mut m = BTreeMap::new();
        m.insert("cpu".to_string(), Quantity(cpu.to_string()));
        m.insert("memory".to_string(), Quantity(memory.to_string()));
        m
    };
    ResourceRequirements {
        limits: Some(map(&resources.cpu_limit, &resources.memory_limit)),
        requests: Some(map(&resources.cpu_request, &resources.memory_request)),
        ..Default::default()
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn shared_mount() -> VolumeMount {
    VolumeMount {
        name: SHARED_VOLUME_NAME.to_string(),
        mount_path: DEFAULT_WORKING_DIRECTORY.to_string(),
        ..Default::default()
    }
}

impl ExecutorManifests for OrchestratorConfig {
    fn executor_labels(&self, language: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), self.app_name.clone()),
            (LABEL_ROLE.to_string(), ROLE_EXECUTOR.to_string()),
            (LABEL_LANGUAGE.to_string(), language.to_string()),
        ])
    }

    fn executor_selector(&self) -> String {
        format!("{LABEL_APP}={},{LABEL_ROLE}={ROLE_EXECUTOR}", self.app_name)
    }

    fn create_executor_pod(&self, language: &LanguageConfig, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.executor_labels(&language.language)),
                ..Default::default()
            },
            spec: Some(self.generate_pod_spec(language)),
            ..Default::default()
        }
    }

    fn create_executor_job(&self, language: &LanguageConfig, name: &str) -> Job {
        let labels = self.executor_labels(&language.language);
        Job {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(self.generate_pod_spec(language)),
                },
                // One-shot: never retry a failed execution pod.
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(self.pod.job_ttl_seconds),
                active_deadline_seconds: Some(self.pod.job_active_deadline_seconds),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl ExecutorManifestsPrivate for OrchestratorConfig {
    fn generate_pod_spec(&self, language: &LanguageConfig) -> PodSpec {
        let agent_mode = self.pod.execution_mode == ExecutionMode::Agent;
        PodSpec {
            init_containers: self.generate_init_containers(),
            containers: vec![
                self.generate_main_container(language),
                self.generate_sidecar_container(language),
            ],
            volumes: Some(vec![Volume {
                name: SHARED_VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    size_limit: Some(Quantity(SHARED_VOLUME_SIZE.to_string())),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(self.pod.termination_grace.as_secs() as i64),
            // nsenter needs visibility into the main container's processes.
            share_process_namespace: Some(!agent_mode),
            runtime_class_name: self
                .pod
                .sandbox
                .enabled
                .then(|| self.pod.sandbox.runtime_class.clone()),
            node_selector: self.generate_node_selector(),
            tolerations: self.generate_tolerations(),
            image_pull_secrets: self.generate_pull_secrets(),
            security_context: Some(PodSecurityContext {
                fs_group: Some(self.pod.run_as_user),
                seccomp_profile: Some(SeccompProfile {
                    type_: self.pod.seccomp_profile.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn generate_main_container(&self, language: &LanguageConfig) -> Container {
        let agent_mode = self.pod.execution_mode == ExecutionMode::Agent;
        Container {
            name: "main".to_string(),
            image: Some(language.image.clone()),
            image_pull_policy: Some(self.pod.image_pull_policy.clone()),
            volume_mounts: Some(vec![shared_mount()]),
            security_context: Some(self.generate_main_security_context()),
            resources: Some(quantities(&language.resources)),
            env: Some(vec![
                env("PYTHONUNBUFFERED", "1"),
                env("HOME", DEFAULT_WORKING_DIRECTORY),
            ]),
            // The executor binary lands in the shared volume during init.
            args: agent_mode.then(|| vec![EXECUTOR_BINARY_TARGET.to_string()]),
            ..Default::default()
        }
    }

    fn generate_sidecar_container(&self, language: &LanguageConfig) -> Container {
        let http_probe = |path: &str, period: i32, failures: i32| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(self.pod.sidecar_port as i32),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(period),
            timeout_seconds: Some(5),
            failure_threshold: Some(failures),
            ..Default::default()
        };
        Container {
            name: "sidecar".to_string(),
            image: Some(self.pod.sidecar_image.clone()),
            image_pull_policy: Some(self.pod.image_pull_policy.clone()),
            ports: Some(vec![ContainerPort {
                container_port: self.pod.sidecar_port as i32,
                name: Some("http".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![shared_mount()]),
            security_context: Some(self.generate_sidecar_security_context()),
            resources: Some(quantities(&self.pod.sidecar_resources)),
            env: Some(vec![
                env("LANGUAGE", language.language.clone()),
                env("WORKING_DIR", DEFAULT_WORKING_DIRECTORY),
                env("SIDECAR_PORT", self.pod.sidecar_port.to_string()),
                env("NETWORK_ISOLATED", language.network_isolated.to_string()),
                env("EXECUTION_MODE", self.pod.execution_mode.to_string()),
                env("EXECUTOR_PORT", self.pod.executor_port.to_string()),
            ]),
            readiness_probe: Some(http_probe("/ready", 3, 5)),
            liveness_probe: Some(http_probe("/health", 10, 3)),
            ..Default::default()
        }
    }

    fn generate_init_containers(&self) -> Option<Vec<Container>> {
        if self.pod.execution_mode != ExecutionMode::Agent {
            return None;
        }
        Some(vec![Container {
            name: "agent-init".to_string(),
            image: Some(self.pod.sidecar_image.clone()),
            image_pull_policy: Some(self.pod.image_pull_policy.clone()),
            command: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!(
                    "cp {EXECUTOR_BINARY_SOURCE} {EXECUTOR_BINARY_TARGET} && \
                     chmod 755 {EXECUTOR_BINARY_TARGET}"
                ),
            ]),
            volume_mounts: Some(vec![shared_mount()]),
            security_context: Some(self.generate_main_security_context()),
            resources: Some(quantities(&PodResources {
                cpu_request: "50m".to_string(),
                cpu_limit: "100m".to_string(),
                memory_request: "32Mi".to_string(),
                memory_limit: "64Mi".to_string(),
            })),
            ..Default::default()
        }])
    }

    fn generate_main_security_context(&self) -> SecurityContext {
        SecurityContext {
            run_as_user: Some(self.pod.run_as_user),
            run_as_group: Some(self.pod.run_as_user),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn generate_sidecar_security_context(&self) -> SecurityContext {
        if self.pod.execution_mode == ExecutionMode::Agent {
            return self.generate_main_security_context();
        }
        // nsenter: SYS_PTRACE to reach /proc/<pid>/ns, SYS_ADMIN for
        // setns(), SYS_CHROOT for mount namespace entry. File
        // capabilities on the nsenter binary require privilege
        // escalation to take effect.
        SecurityContext {
            run_as_user: Some(self.pod.run_as_user),
            run_as_group: Some(self.pod.run_as_user),
            run_as_non_root: Some(true),
            allow_privilege_escalation: Some(true),
            capabilities: Some(Capabilities {
                add: Some(NSENTER_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
                drop: Some(vec!["ALL".to_string()]),
            }),
            ..Default::default()
        }
    }

    fn generate_tolerations(&self) -> Option<Vec<Toleration>> {
        let mut tolerations = Vec::new();
        if self.pod.sandbox.enabled {
            tolerations.push(Toleration {
                key: Some(SANDBOX_RUNTIME_LABEL.to_string()),
                operator: Some("Equal".to_string()),
                value: Some(self.pod.sandbox.runtime_class.clone()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            });
        }
        for spec in &self.pod.sandbox.tolerations {
            tolerations.push(Toleration {
                key: Some(spec.key.clone()),
                operator: Some(spec.operator.clone()),
                value: spec.value.clone(),
                effect: Some(spec.effect.clone()),
                ..Default::default()
            });
        }
        if tolerations.is_empty() {
            None
        } else {
            Some(tolerations)
        }
    }

    fn generate_node_selector(&self) -> Option<BTreeMap<String, String>> {
        let mut selector = BTreeMap::new();
        if self.pod.sandbox.enabled {
            selector.insert(
                SANDBOX_RUNTIME_LABEL.to_string(),
                self.pod.sandbox.runtime_class.clone(),
            );
        }
        selector.extend(
            self.pod
                .sandbox
                .node_selector
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if selector.is_empty() { None } else { Some(selector) }
    }

    fn generate_pull_secrets(&self) -> Option<Vec<LocalObjectReference>> {
        if self.pod.image_pull_secrets.is_empty() {
            return None;
        }
        Some(
            self.pod
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference {
                    name: name.clone(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, LanguageConfig, OrchestratorConfig, PodResources};

    use std::time::Duration;

    fn language() -> LanguageConfig {
        LanguageConfig {
            language: "py".to_string(),
            image: "python:3.12-slim".to_string(),
            pool_size: 2,
            stateful: true,
            timeout: Duration::from_secs(30),
            network_isolated: false,
            resources: PodResources::main_defaults(),
        }
    }

    fn config(mode: ExecutionMode, sandbox: bool) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.pod.execution_mode = mode;
        config.pod.sandbox.enabled = sandbox;
        config
    }

    fn container<'a>(pod: &'a Pod, name: &str) -> &'a Container {
        pod.spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == name)
            .unwrap()
    }

    #[test]
    fn agent_mode_drops_all_capabilities_everywhere() {
        let config = config(ExecutionMode::Agent, false);
        let pod = config.create_executor_pod(&language(), "coderun-py-abc12345");

        for name in ["main", "sidecar"] {
            let sc = container(&pod, name).security_context.as_ref().unwrap();
            assert_eq!(sc.allow_privilege_escalation, Some(false));
            let caps = sc.capabilities.as_ref().unwrap();
            assert_eq!(caps.drop.as_ref().unwrap(), &vec!["ALL".to_string()]);
            assert!(caps.add.is_none());
        }
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.share_process_namespace, Some(false));
        let init = spec.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "agent-init");
        assert_eq!(
            container(&pod, "main").args.as_ref().unwrap(),
            &vec!["/mnt/data/.executor-agent".to_string()]
        );
    }

    #[test]
    fn nsenter_mode_elevates_only_the_sidecar() {
        let config = config(ExecutionMode::Nsenter, false);
        let pod = config.create_executor_pod(&language(), "coderun-py-abc12345");

        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.share_process_namespace, Some(true));
        assert!(spec.init_containers.is_none());
        assert!(container(&pod, "main").args.is_none());

        let sidecar_sc = container(&pod, "sidecar").security_context.as_ref().unwrap();
        assert_eq!(sidecar_sc.allow_privilege_escalation, Some(true));
        let added = sidecar_sc
            .capabilities
            .as_ref()
            .unwrap()
            .add
            .as_ref()
            .unwrap();
        assert!(added.contains(&"SYS_ADMIN".to_string()));
        assert!(added.contains(&"SYS_PTRACE".to_string()));
        assert!(added.contains(&"SYS_CHROOT".to_string()));

        let main_sc = container(&pod, "main").security_context.as_ref().unwrap();
        assert_eq!(main_sc.allow_privilege_escalation, Some(false));
    }

    #[test]
    fn sandbox_sets_runtime_class_selector_and_toleration() {
        let config = config(ExecutionMode::Agent, true);
        let pod = config.create_executor_pod(&language(), "coderun-py-abc12345");
        let spec = pod.spec.as_ref().unwrap();

        assert_eq!(spec.runtime_class_name.as_deref(), Some("gvisor"));
        let selector = spec.node_selector.as_ref().unwrap();
        assert_eq!(selector["sandbox.gke.io/runtime"], "gvisor");
        let tolerations = spec.tolerations.as_ref().unwrap();
        assert!(
            tolerations
                .iter()
                .any(|t| t.key.as_deref() == Some("sandbox.gke.io/runtime"))
        );
    }

    #[test]
    fn no_sandbox_means_no_runtime_class() {
        let config = config(ExecutionMode::Agent, false);
        let pod = config.create_executor_pod(&language(), "coderun-py-abc12345");
        let spec = pod.spec.as_ref().unwrap();
        assert!(spec.runtime_class_name.is_none());
        assert!(spec.node_selector.is_none());
        assert!(spec.tolerations.is_none());
    }

    #[test]
    fn labels_identify_language_and_role() {
        let config = config(ExecutionMode::Agent, false);
        let pod = config.create_executor_pod(&language(), "coderun-py-abc12345");
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_LANGUAGE], "py");
        assert_eq!(labels[LABEL_ROLE], ROLE_EXECUTOR);
        assert_eq!(labels[LABEL_APP], "coderun");
        assert_eq!(config.executor_selector(), "app=coderun,coderun.dev/role=executor");
    }

    #[test]
    fn job_wraps_pod_spec_with_one_shot_settings() {
        let config = config(ExecutionMode::Agent, false);
        let job = config.create_executor_job(&language(), "coderun-py-job1");
        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(60));
        assert_eq!(spec.active_deadline_seconds, Some(300));
        let template = spec.template.spec.as_ref().unwrap();
        assert_eq!(template.containers.len(), 2);
    }

    #[test]
    fn pull_secrets_propagate() {
        let mut config = config(ExecutionMode::Agent, false);
        config.pod.image_pull_secrets = vec!["registry-cred".to_string()];
        let pod = config.create_executor_pod(&language(), "coderun-py-abc12345");
        let secrets = pod
            .spec
            .as_ref()
            .unwrap()
            .image_pull_secrets
            .as_ref()
            .unwrap();
        assert_eq!(secrets[0].name, "registry-cred");
    }

    #[test]
    fn generated_names_are_rfc1123() {
        let name = executor_pod_name("coderun", "py");
        assert!(name.starts_with("coderun-py-"));
        let suffix = name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }
}
