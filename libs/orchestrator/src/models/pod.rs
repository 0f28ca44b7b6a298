//! Pod handles and pool entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodStatus {
    #[default]
    Pending,
    /// Sidecar ready, no session bound.
    Warm,
    /// Being bound to a session.
    Specializing,
    /// Running code.
    Executing,
    Succeeded,
    Failed,
    Unknown,
}

serde_plain::derive_display_from_serialize!(PodStatus);
serde_plain::derive_fromstr_from_deserialize!(PodStatus);

/// Where an execution's pod came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodSource {
    Pool,
    Job,
}

serde_plain::derive_display_from_serialize!(PodSource);

/// Handle to an execution pod, carrying everything needed to reach its
/// sidecar and manage its lifecycle. Immutable apart from `status` and
/// `session_id`, which only the lifecycle manager and pool mutate.
#[derive(Clone, Debug)]
pub struct PodHandle {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub language: String,
    pub session_id: Option<String>,
    pub status: PodStatus,
    pub pod_ip: Option<String>,
    pub sidecar_port: u16,
    pub created_at: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

impl PodHandle {
    /// Base URL of the in-pod sidecar API. Falls back to the pod DNS name
    /// when no IP has been assigned yet.
    pub fn sidecar_url(&self) -> String {
        match &self.pod_ip {
            Some(ip) => format!("http://{ip}:{}", self.sidecar_port),
            None => format!("http://{}.{}:{}", self.name, self.namespace, self.sidecar_port),
        }
    }
}

/// A pod in the warm pool.
#[derive(Clone, Debug)]
pub struct PooledPod {
    pub handle: PodHandle,
    pub acquired: bool,
    pub acquired_at: Option<DateTime<Utc>>,
    /// Executions served since creation, counted against the reuse budget.
    pub executions: u32,
    pub health_check_failures: u8,
}

impl PooledPod {
    pub fn new(handle: PodHandle) -> Self {
        Self {
            handle,
            acquired: false,
            acquired_at: None,
            executions: 0,
            health_check_failures: 0,
        }
    }

    pub fn is_available(&self) -> bool {
        !self.acquired && self.handle.status == PodStatus::Warm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(status: PodStatus, ip: Option<&str>) -> PodHandle {
        PodHandle {
            name: "coderun-py-ab12cd34".to_string(),
            namespace: "coderun".to_string(),
            uid: "uid-1".to_string(),
            language: "py".to_string(),
            session_id: None,
            status,
            pod_ip: ip.map(String::from),
            sidecar_port: 8080,
            created_at: Utc::now(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn sidecar_url_prefers_ip() {
        let with_ip = handle(PodStatus::Warm, Some("10.1.2.3"));
        assert_eq!(with_ip.sidecar_url(), "http://10.1.2.3:8080");
        let without_ip = handle(PodStatus::Pending, None);
        assert_eq!(
            without_ip.sidecar_url(),
            "http://coderun-py-ab12cd34.coderun:8080"
        );
    }

    #[test]
    fn availability_requires_warm_and_unacquired() {
        let mut pooled = PooledPod::new(handle(PodStatus::Warm, Some("10.0.0.1")));
        assert!(pooled.is_available());
        pooled.acquired = true;
        assert!(!pooled.is_available());
        pooled.acquired = false;
        pooled.handle.status = PodStatus::Executing;
        assert!(!pooled.is_available());
    }

    #[test]
    fn status_string_forms() {
        assert_eq!(PodStatus::Specializing.to_string(), "specializing");
        assert_eq!(PodSource::Pool.to_string(), "pool");
        assert_eq!(PodSource::Job.to_string(), "job");
    }
}
