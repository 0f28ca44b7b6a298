//! Connection settings for the KV facade.
//!
//! Values arrive from environment variables rendered by config templating
//! (Helm, ConfigMaps), which routinely injects empty strings for unset
//! fields. Every optional field therefore treats `""` as absent.

use crate::error::{Error, Result};

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvMode {
    #[default]
    Standalone,
    Cluster,
    Sentinel,
}

serde_plain::derive_display_from_serialize!(KvMode);
serde_plain::derive_fromstr_from_deserialize!(KvMode);

/// TLS settings, independent of the deployment mode.
///
/// Certificate-chain verification is always on while `insecure` is false.
/// Hostname verification defaults off: managed services and cluster
/// topology discovery hand out node IPs that rarely match the certificate
/// SAN entries.
#[derive(Clone, Debug, Default)]
pub struct KvTlsConfig {
    pub enabled: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_cert_file: Option<String>,
    pub insecure: bool,
    pub check_hostname: bool,
}

#[derive(Clone, Debug)]
pub struct KvConfig {
    pub mode: KvMode,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub url: Option<String>,
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: usize,

    /// Seed endpoints for cluster mode, `host:port` comma-separated.
    pub cluster_nodes: Option<String>,

    /// Supervisor endpoints for sentinel mode, `host:port` comma-separated.
    pub sentinel_nodes: Option<String>,
    pub sentinel_master: String,
    pub sentinel_password: Option<String>,

    /// Prefix prepended to every key. Must carry its own separator
    /// (e.g. `"prod:"`).
    pub key_prefix: String,

    pub tls: KvTlsConfig,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            mode: KvMode::Standalone,
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            url: None,
            response_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            cluster_nodes: None,
            sentinel_nodes: None,
            sentinel_master: "mymaster".to_string(),
            sentinel_password: None,
            key_prefix: String::new(),
            tls: KvTlsConfig::default(),
        }
    }
}

impl KvConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let mode = match env_opt("REDIS_MODE") {
            Some(raw) => raw
                .parse::<KvMode>()
                .map_err(|_| Error::InvalidConfig(format!("unknown REDIS_MODE: {raw}")))?,
            None => KvMode::Standalone,
        };
        Ok(Self {
            mode,
            host: env_opt("REDIS_HOST")
                .map(|h| sanitize_host(&h))
                .unwrap_or(defaults.host),
            port: env_parse("REDIS_PORT")?.unwrap_or(defaults.port),
            password: env_opt("REDIS_PASSWORD"),
            db: env_parse("REDIS_DB")?.unwrap_or(defaults.db),
            url: env_opt("REDIS_URL"),
            response_timeout: env_parse("REDIS_SOCKET_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.response_timeout),
            connect_timeout: env_parse("REDIS_SOCKET_CONNECT_TIMEOUT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            max_retries: env_parse("REDIS_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            cluster_nodes: env_opt("REDIS_CLUSTER_NODES"),
            sentinel_nodes: env_opt("REDIS_SENTINEL_NODES"),
            sentinel_master: env_opt("REDIS_SENTINEL_MASTER").unwrap_or(defaults.sentinel_master),
            sentinel_password: env_opt("REDIS_SENTINEL_PASSWORD"),
            key_prefix: env_opt("REDIS_KEY_PREFIX").unwrap_or_default(),
            tls: KvTlsConfig {
                enabled: env_bool("REDIS_TLS_ENABLED"),
                cert_file: env_opt("REDIS_TLS_CERT_FILE"),
                key_file: env_opt("REDIS_TLS_KEY_FILE"),
                ca_cert_file: env_opt("REDIS_TLS_CA_CERT_FILE"),
                insecure: env_bool("REDIS_TLS_INSECURE"),
                check_hostname: env_bool("REDIS_TLS_CHECK_HOSTNAME"),
            },
        })
    }

    /// Connection URL for standalone mode. Honours an explicit `url` and
    /// flips between `redis://` and `rediss://` on the TLS flag.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let scheme = if self.tls.enabled { "rediss" } else { "redis" };
        let auth = match &self.password {
            Some(p) => format!(":{p}@"),
            None => String::new(),
        };
        let insecure = if self.tls.enabled && self.tls.insecure {
            "#insecure"
        } else {
            ""
        };
        format!(
            "{scheme}://{auth}{}:{}/{}{insecure}",
            self.host, self.port, self.db
        )
    }

    /// Seed endpoints for cluster mode, falling back to `host:port`.
    pub fn cluster_endpoints(&self) -> Vec<(String, u16)> {
        match &self.cluster_nodes {
            Some(raw) => parse_nodes(raw, self.port),
            None => vec![(self.host.clone(), self.port)],
        }
    }

    /// Supervisor endpoints for sentinel mode, falling back to `host:26379`.
    pub fn sentinel_endpoints(&self) -> Vec<(String, u16)> {
        match &self.sentinel_nodes {
            Some(raw) => parse_nodes(raw, 26379),
            None => vec![(self.host.clone(), 26379)],
        }
    }
}

/// Read an env var, treating missing and empty/whitespace values the same.
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
            .map_err(|_| Error::InvalidConfig(format!("invalid value for {name}: {raw}"))),
        None => Ok(None),
    }
}

fn env_bool(name: &str) -> bool {
    matches!(
        env_opt(name).as_deref(),
        Some("1") | Some("true") | Some("True") | Some("TRUE") | Some("yes")
    )
}

/// Strip an accidental URL scheme from a host value. Operators sometimes
/// set `REDIS_HOST=rediss://hostname` instead of the bare hostname.
pub fn sanitize_host(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    for scheme in ["rediss://", "redis://"] {
        if lower.starts_with(scheme) {
            return raw[scheme.len()..].trim_end_matches('/').to_string();
        }
    }
    raw.to_string()
}

/// Parse a comma-separated `host:port` list. Entries without a port use
/// `default_port`; empty entries are skipped.
pub fn parse_nodes(raw: &str, default_port: u16) -> Vec<(String, u16)> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            match entry.rsplit_once(':') {
                Some((host, port)) => match port.trim().parse::<u16>() {
                    Ok(port) => Some((host.trim().to_string(), port)),
                    Err(_) => None,
                },
                None => Some((entry.to_string(), default_port)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nodes_host_port_pairs() {
        let nodes = parse_nodes("node1:6379,node2:6380,node3:6379", 6379);
        assert_eq!(
            nodes,
            vec![
                ("node1".to_string(), 6379),
                ("node2".to_string(), 6380),
                ("node3".to_string(), 6379),
            ]
        );
    }

    #[test]
    fn parse_nodes_defaults_missing_port() {
        let nodes = parse_nodes("node1,node2:7000", 6380);
        assert_eq!(
            nodes,
            vec![("node1".to_string(), 6380), ("node2".to_string(), 7000)]
        );
    }

    #[test]
    fn parse_nodes_skips_empty_entries() {
        let nodes = parse_nodes(" , node1:6379 ,,", 6379);
        assert_eq!(nodes, vec![("node1".to_string(), 6379)]);
    }

    #[test]
    fn sanitize_host_strips_schemes() {
        assert_eq!(sanitize_host("rediss://cache.internal/"), "cache.internal");
        assert_eq!(sanitize_host("redis://10.0.0.5"), "10.0.0.5");
        assert_eq!(sanitize_host("cache.internal"), "cache.internal");
    }

    #[test]
    fn connection_url_flips_scheme_on_tls() {
        let mut cfg = KvConfig {
            host: "cache".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.connection_url(), "redis://cache:6379/0");
        cfg.tls.enabled = true;
        assert_eq!(cfg.connection_url(), "rediss://cache:6379/0");
    }

    #[test]
    fn connection_url_includes_password() {
        let cfg = KvConfig {
            host: "cache".to_string(),
            password: Some("hunter2".to_string()),
            db: 3,
            ..Default::default()
        };
        assert_eq!(cfg.connection_url(), "redis://:hunter2@cache:6379/3");
    }

    #[test]
    fn connection_url_prefers_explicit_url() {
        let cfg = KvConfig {
            url: Some("redis://elsewhere:7000/1".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.connection_url(), "redis://elsewhere:7000/1");
    }

    #[test]
    fn cluster_endpoints_fall_back_to_host() {
        let cfg = KvConfig {
            host: "cache".to_string(),
            port: 7000,
            ..Default::default()
        };
        assert_eq!(cfg.cluster_endpoints(), vec![("cache".to_string(), 7000)]);
    }

    #[test]
    fn sentinel_endpoints_fall_back_to_sentinel_port() {
        let cfg = KvConfig {
            host: "cache".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.sentinel_endpoints(), vec![("cache".to_string(), 26379)]);
    }

    #[test]
    fn mode_parses_from_string() {
        assert_eq!("cluster".parse::<KvMode>().unwrap(), KvMode::Cluster);
        assert_eq!("sentinel".parse::<KvMode>().unwrap(), KvMode::Sentinel);
        assert!("replicated".parse::<KvMode>().is_err());
    }
}
