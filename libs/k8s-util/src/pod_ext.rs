use k8s_openapi::api::core::v1::Pod;
use chrono::{DateTime, Utc};

/// Extension trait answering common questions about pods.
pub trait PodExt {
    fn uid(&self) -> Option<&str>;
    fn pod_ip(&self) -> Option<&str>;
    fn phase(&self) -> Option<&str>;
    fn is_running(&self) -> bool;
    fn is_finished(&self) -> bool;
    fn created_at(&self) -> Option<DateTime<Utc>>;
    fn label(&self, name: &str) -> Option<&str>;
}

impl PodExt for Pod {
    fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    fn pod_ip(&self) -> Option<&str> {
        self.status.as_ref()?.pod_ip.as_deref()
    }

    fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }

    fn is_running(&self) -> bool {
        self.phase() == Some("Running")
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase(), Some("Succeeded") | Some("Failed"))
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .creation_timestamp
            .as_ref()
            .map(|t| DateTime::from_timestamp_nanos(t.0.as_nanosecond() as i64))
    }

    fn label(&self, name: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(name))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    fn pod_with_phase(phase: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some("abc-123".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_pod_reports_ip() {
        let pod = pod_with_phase("Running", Some("10.0.0.9"));
        assert!(pod.is_running());
        assert!(!pod.is_finished());
        assert_eq!(pod.pod_ip(), Some("10.0.0.9"));
        assert_eq!(pod.uid(), Some("abc-123"));
    }

    #[test]
    fn finished_phases() {
        assert!(pod_with_phase("Succeeded", None).is_finished());
        assert!(pod_with_phase("Failed", None).is_finished());
        assert!(!pod_with_phase("Pending", None).is_finished());
    }
}
