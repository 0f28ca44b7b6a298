//! KV client over standalone, cluster and sentinel backends.
//!
//! Commands take un-prefixed keys; the configured namespace prefix is
//! applied transparently on every access. Retries are limited to
//! transport-level failures (connect, timeout) with exponential backoff.

use crate::config::{KvConfig, KvMode, KvTlsConfig};
use crate::error::{Error, Result};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{ClientTlsConfig, FromRedisValue, RedisConnectionInfo, TlsCertificates, TlsMode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Command surface of the KV facade.
///
/// Implemented by [`KvClient`] and, behind the `test-util` feature, by an
/// in-memory fake so services can be exercised without a server.
#[allow(async_fn_in_trait)]
pub trait KvCommands: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    /// Remaining TTL in seconds; -1 when no expiry, -2 when the key is gone.
    async fn ttl(&self, key: &str) -> Result<i64>;
    /// Ordered multi-command batch without cross-key transactional
    /// semantics. Safe across hash slots on sharded deployments.
    async fn pipeline(&self, pipe: Pipeline) -> Result<()>;
}

#[derive(Clone, Debug)]
pub(crate) enum PipelineOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    HSetAll {
        key: String,
        fields: Vec<(String, String)>,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

impl PipelineOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            PipelineOp::Set { .. } => "SET",
            PipelineOp::Del { .. } => "DEL",
            PipelineOp::HSetAll { .. } => "HSET",
            PipelineOp::SAdd { .. } => "SADD",
            PipelineOp::SRem { .. } => "SREM",
            PipelineOp::Expire { .. } => "EXPIRE",
        }
    }
}

/// Ordered command batch for [`KvCommands::pipeline`].
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    pub(crate) ops: Vec<PipelineOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &[u8]) -> &mut Self {
        self.ops.push(PipelineOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl: None,
        });
        self
    }

    pub fn set_ex(&mut self, key: &str, value: &[u8], ttl: Duration) -> &mut Self {
        self.ops.push(PipelineOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl: Some(ttl),
        });
        self
    }

    pub fn del(&mut self, key: &str) -> &mut Self {
        self.ops.push(PipelineOp::Del {
            key: key.to_string(),
        });
        self
    }

    pub fn hset_all(&mut self, key: &str, fields: Vec<(String, String)>) -> &mut Self {
        self.ops.push(PipelineOp::HSetAll {
            key: key.to_string(),
            fields,
        });
        self
    }

    pub fn sadd(&mut self, key: &str, member: &str) -> &mut Self {
        self.ops.push(PipelineOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn srem(&mut self, key: &str, member: &str) -> &mut Self {
        self.ops.push(PipelineOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        self
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.ops.push(PipelineOp::Expire {
            key: key.to_string(),
            ttl,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

struct SentinelConn {
    client: SentinelClient,
    conn: Option<MultiplexedConnection>,
}

enum Backend {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
    Sentinel(Arc<Mutex<SentinelConn>>),
}

pub struct KvClient {
    backend: Backend,
    prefix: Arc<str>,
    response_timeout: Duration,
    max_retries: usize,
}

impl KvClient {
    /// Connect eagerly according to the configured deployment mode.
    pub async fn connect(cfg: &KvConfig) -> Result<Self> {
        let backend = match cfg.mode {
            KvMode::Standalone => Self::connect_standalone(cfg).await?,
            KvMode::Cluster => Self::connect_cluster(cfg).await?,
            KvMode::Sentinel => Self::connect_sentinel(cfg).await?,
        };
        info!(
            msg = "kv client connected",
            mode = %cfg.mode,
            tls = cfg.tls.enabled,
            key_prefix = %cfg.key_prefix,
        );
        Ok(Self {
            backend,
            prefix: Arc::from(cfg.key_prefix.as_str()),
            response_timeout: cfg.response_timeout,
            max_retries: cfg.max_retries,
        })
    }

    async fn connect_standalone(cfg: &KvConfig) -> Result<Backend> {
        let url = cfg.connection_url();
        let client = match load_tls(&cfg.tls)? {
            Some(certs) => redis::Client::build_with_tls(url, certs)
                .map_err(|e| Error::from_redis("connect", e))?,
            None => redis::Client::open(url).map_err(|e| Error::from_redis("connect", e))?,
        };
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::from_redis("connect", e))?;
        Ok(Backend::Standalone(manager))
    }

    async fn connect_cluster(cfg: &KvConfig) -> Result<Backend> {
        let scheme = if cfg.tls.enabled { "rediss" } else { "redis" };
        let insecure = if cfg.tls.enabled && cfg.tls.insecure {
            "#insecure"
        } else {
            ""
        };
        let nodes: Vec<String> = cfg
            .cluster_endpoints()
            .into_iter()
            .map(|(host, port)| format!("{scheme}://{host}:{port}{insecure}"))
            .collect();
        debug!(msg = "kv cluster seed nodes", nodes = ?nodes);
        let mut builder = ClusterClient::builder(nodes)
            .connection_timeout(cfg.connect_timeout)
            .response_timeout(cfg.response_timeout);
        if let Some(password) = &cfg.password {
            builder = builder.password(password.clone());
        }
        if let Some(certs) = load_tls(&cfg.tls)? {
            builder = builder.certs(certs);
        }
        let client = builder
            .build()
            .map_err(|e| Error::from_redis("connect", e))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| Error::from_redis("connect", e))?;
        Ok(Backend::Cluster(conn))
    }

    async fn connect_sentinel(cfg: &KvConfig) -> Result<Backend> {
        let scheme = if cfg.tls.enabled { "rediss" } else { "redis" };
        let auth = match &cfg.sentinel_password {
            Some(p) => format!(":{p}@"),
            None => String::new(),
        };
        let nodes: Vec<String> = cfg
            .sentinel_endpoints()
            .into_iter()
            .map(|(host, port)| format!("{scheme}://{auth}{host}:{port}"))
            .collect();
        let node_info = SentinelNodeConnectionInfo {
            tls_mode: cfg.tls.enabled.then(|| {
                if cfg.tls.insecure {
                    TlsMode::Insecure
                } else {
                    TlsMode::Secure
                }
            }),
            redis_connection_info: Some(RedisConnectionInfo {
                db: cfg.db,
                password: cfg.password.clone(),
                ..Default::default()
            }),
        };
        let mut client = SentinelClient::build(
            nodes,
            cfg.sentinel_master.clone(),
            Some(node_info),
            SentinelServerType::Master,
        )
        .map_err(|e| Error::from_redis("connect", e))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| Error::from_redis("connect", e))?;
        Ok(Backend::Sentinel(Arc::new(Mutex::new(SentinelConn {
            client,
            conn: Some(conn),
        }))))
    }

    fn namespaced(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{key}", self.prefix)
        }
    }

    async fn query_raw(&self, cmd: &redis::Cmd) -> redis::RedisResult<redis::Value> {
        match &self.backend {
            Backend::Standalone(manager) => {
                let mut conn = manager.clone();
                cmd.query_async::<redis::Value>(&mut conn).await
            }
            Backend::Cluster(conn) => {
                let mut conn = conn.clone();
                cmd.query_async::<redis::Value>(&mut conn).await
            }
            Backend::Sentinel(cell) => {
                let mut conn = sentinel_conn(cell).await?;
                let result = cmd.query_async::<redis::Value>(&mut conn).await;
                if let Err(e) = &result {
                    if !e.is_timeout() {
                        // Primary may have moved; rediscover on next attempt.
                        cell.lock().await.conn = None;
                    }
                }
                result
            }
        }
    }

    async fn query_once(&self, op: &'static str, cmd: &redis::Cmd) -> Result<redis::Value> {
        match tokio::time::timeout(self.response_timeout, self.query_raw(cmd)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::from_redis(op, e)),
            Err(_) => Err(Error::Timeout(op.to_string())),
        }
    }

    async fn query<T: FromRedisValue>(&self, op: &'static str, cmd: &redis::Cmd) -> Result<T> {
        let value = (|| self.query_once(op, cmd))
            .retry(
                ExponentialBuilder::default()
                    .with_jitter()
                    .with_max_times(self.max_retries),
            )
            .when(Error::is_retryable)
            .notify(|err: &Error, dur: Duration| {
                warn!(msg = "retrying kv command", op, delay = ?dur, %err);
            })
            .await?;
        redis::from_redis_value(&value).map_err(|e| Error::Unexpected(op.to_string(), e))
    }

    fn op_cmd(&self, op: &PipelineOp) -> redis::Cmd {
        match op {
            PipelineOp::Set { key, value, ttl } => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(self.namespaced(key)).arg(value.as_slice());
                if let Some(ttl) = ttl {
                    cmd.arg("EX").arg(ttl.as_secs().max(1));
                }
                cmd
            }
            PipelineOp::Del { key } => {
                let mut cmd = redis::cmd("DEL");
                cmd.arg(self.namespaced(key));
                cmd
            }
            PipelineOp::HSetAll { key, fields } => {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(self.namespaced(key));
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
                cmd
            }
            PipelineOp::SAdd { key, member } => {
                let mut cmd = redis::cmd("SADD");
                cmd.arg(self.namespaced(key)).arg(member);
                cmd
            }
            PipelineOp::SRem { key, member } => {
                let mut cmd = redis::cmd("SREM");
                cmd.arg(self.namespaced(key)).arg(member);
                cmd
            }
            PipelineOp::Expire { key, ttl } => {
                let mut cmd = redis::cmd("EXPIRE");
                cmd.arg(self.namespaced(key)).arg(ttl.as_secs().max(1));
                cmd
            }
        }
    }

    async fn pipeline_single_trip(&self, pipe: &Pipeline) -> Result<()> {
        let mut batch = redis::pipe();
        for op in &pipe.ops {
            batch.add_command(self.op_cmd(op)).ignore();
        }
        let run = || async {
            let fut = async {
                match &self.backend {
                    Backend::Standalone(manager) => {
                        let mut conn = manager.clone();
                        batch.query_async::<()>(&mut conn).await
                    }
                    Backend::Sentinel(cell) => {
                        let mut conn = sentinel_conn(cell).await?;
                        let result = batch.query_async::<()>(&mut conn).await;
                        if result.is_err() {
                            cell.lock().await.conn = None;
                        }
                        result
                    }
                    Backend::Cluster(_) => unreachable!("cluster pipelines run per command"),
                }
            };
            match tokio::time::timeout(self.response_timeout, fut).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::from_redis("PIPELINE", e)),
                Err(_) => Err(Error::Timeout("PIPELINE".to_string())),
            }
        };
        run.retry(
            ExponentialBuilder::default()
                .with_jitter()
                .with_max_times(self.max_retries),
        )
        .when(Error::is_retryable)
        .await
    }
}

async fn sentinel_conn(cell: &Mutex<SentinelConn>) -> redis::RedisResult<MultiplexedConnection> {
    let mut guard = cell.lock().await;
    if let Some(conn) = &guard.conn {
        return Ok(conn.clone());
    }
    let conn = guard.client.get_async_connection().await?;
    guard.conn = Some(conn.clone());
    Ok(conn)
}

fn load_tls(tls: &KvTlsConfig) -> Result<Option<TlsCertificates>> {
    if !tls.enabled {
        return Ok(None);
    }
    let read = |path: &String| {
        std::fs::read(path)
            .map_err(|e| Error::InvalidConfig(format!("cannot read TLS material {path}: {e}")))
    };
    let root_cert = tls.ca_cert_file.as_ref().map(read).transpose()?;
    let client_tls = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => Some(ClientTlsConfig {
            client_cert: read(cert)?,
            client_key: read(key)?,
        }),
        (None, None) => None,
        _ => {
            return Err(Error::InvalidConfig(
                "TLS client cert and key must be set together".to_string(),
            ));
        }
    };
    if root_cert.is_none() && client_tls.is_none() {
        // System roots apply; nothing custom to load.
        return Ok(None);
    }
    Ok(Some(TlsCertificates {
        client_tls,
        root_cert,
    }))
}

impl KvCommands for KvClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.namespaced(key));
        self.query("GET", &cmd).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key)).arg(value);
        self.query("SET", &cmd).await
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key))
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        self.query("SET", &cmd).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.namespaced(key));
        let removed: i64 = self.query("DEL", &cmd).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(self.namespaced(key));
        self.query("EXISTS", &cmd).await
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.namespaced(key));
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: i64 = self.query("HSET", &cmd).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(self.namespaced(key));
        self.query("HGETALL", &cmd).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(self.namespaced(key)).arg(member);
        let _: i64 = self.query("SADD", &cmd).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(self.namespaced(key));
        self.query("SMEMBERS", &cmd).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(self.namespaced(key)).arg(member);
        let _: i64 = self.query("SREM", &cmd).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(self.namespaced(key));
        self.query("INCR", &cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(self.namespaced(key)).arg(ttl.as_secs().max(1));
        self.query("EXPIRE", &cmd).await
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut cmd = redis::cmd("TTL");
        cmd.arg(self.namespaced(key));
        self.query("TTL", &cmd).await
    }

    async fn pipeline(&self, pipe: Pipeline) -> Result<()> {
        if pipe.is_empty() {
            return Ok(());
        }
        match &self.backend {
            // Hash-slotted backends reject multi-key round trips that span
            // slots, so the batch degrades to ordered per-command sends.
            Backend::Cluster(_) => {
                for op in &pipe.ops {
                    let cmd = self.op_cmd(op);
                    let _: redis::Value = self.query(op.name(), &cmd).await?;
                }
                Ok(())
            }
            _ => self.pipeline_single_trip(&pipe).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_preserves_order() {
        let mut pipe = Pipeline::new();
        pipe.set("a", b"1")
            .hset_all("b", vec![("f".to_string(), "v".to_string())])
            .sadd("c", "m")
            .expire("b", Duration::from_secs(60))
            .del("a");
        assert_eq!(pipe.len(), 5);
        let names: Vec<&str> = pipe.ops.iter().map(|op| op.name()).collect();
        assert_eq!(names, vec!["SET", "HSET", "SADD", "EXPIRE", "DEL"]);
    }

    #[test]
    fn pipeline_set_ex_carries_ttl() {
        let mut pipe = Pipeline::new();
        pipe.set_ex("k", b"v", Duration::from_secs(30));
        match &pipe.ops[0] {
            PipelineOp::Set { ttl, .. } => assert_eq!(*ttl, Some(Duration::from_secs(30))),
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn retryable_classes() {
        let timeout = Error::Timeout("GET".to_string());
        assert!(timeout.is_retryable());
        let missing = Error::NotFound("session".to_string());
        assert!(!missing.is_retryable());
        let config = Error::InvalidConfig("bad".to_string());
        assert!(!config.is_retryable());
    }

    #[test]
    fn tls_disabled_loads_nothing() {
        let tls = KvTlsConfig::default();
        assert!(load_tls(&tls).unwrap().is_none());
    }

    #[test]
    fn tls_cert_without_key_is_rejected() {
        let tls = KvTlsConfig {
            enabled: true,
            cert_file: Some("/etc/kv/tls.crt".to_string()),
            ..Default::default()
        };
        assert!(load_tls(&tls).is_err());
    }
}
