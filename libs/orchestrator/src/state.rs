//! Interpreter-state persistence: hot KV tier with TTL, cold object
//! tier without, keyed by session id.
//!
//! The blob is opaque. The service decodes the base64 transport form,
//! enforces the size cap, fingerprints the bytes and never looks inside.

use crate::config::StateSettings;
use crate::error::{Error, Result};
use crate::models::{StateInfo, StateSource, StateUpload};

use coderun_kv::{KvCommands, Pipeline};
use coderun_store::{BlobStore, state_archive_key};

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

fn state_key(session_id: &str) -> String {
    format!("state:{session_id}")
}

fn state_info_key(session_id: &str) -> String {
    format!("state:info:{session_id}")
}

fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// State persistence capability the runner depends on.
#[allow(async_fn_in_trait)]
pub trait StateStore: Send + Sync {
    /// Decode, cap-check, fingerprint and write to the hot tier with the
    /// given TTL. Nothing is written when the cap rejects the blob.
    async fn save(&self, session_id: &str, state_b64: &str, ttl: Duration) -> Result<StateUpload>;
    /// Raw bytes from the hot tier, falling back to the cold tier with
    /// best-effort re-promotion.
    async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>>;
    /// Metadata only; the blob is not transferred.
    async fn info(&self, session_id: &str) -> Result<StateInfo>;
    async fn delete(&self, session_id: &str) -> Result<bool>;
}

pub struct StateService<K, B> {
    kv: Arc<K>,
    blobs: Arc<B>,
    settings: StateSettings,
    /// TTL applied when promoting a cold blob back into the hot tier.
    promote_ttl: Duration,
}

impl<K: KvCommands, B: BlobStore> StateService<K, B> {
    pub fn new(kv: Arc<K>, blobs: Arc<B>, settings: StateSettings, promote_ttl: Duration) -> Self {
        Self {
            kv,
            blobs,
            settings,
            promote_ttl,
        }
    }

    fn info_fields(size: u64, hash: &str, created_at: DateTime<Utc>) -> Vec<(String, String)> {
        vec![
            ("size".to_string(), size.to_string()),
            ("hash".to_string(), hash.to_string()),
            ("created_at".to_string(), created_at.to_rfc3339()),
        ]
    }

    async fn write_hot(&self, session_id: &str, bytes: &[u8], hash: &str, ttl: Duration) -> Result<()> {
        let key = state_key(session_id);
        let info_key = state_info_key(session_id);
        let mut pipe = Pipeline::new();
        pipe.set_ex(&key, bytes, ttl)
            .hset_all(&info_key, Self::info_fields(bytes.len() as u64, hash, Utc::now()))
            .expire(&info_key, ttl);
        self.kv.pipeline(pipe).await?;
        Ok(())
    }

    /// Copy hot entries nearing expiry into the cold tier and let their
    /// hot TTL lapse; the next access re-promotes them. Candidates come
    /// from the active-session index, which covers every live hot entry.
    pub async fn archive_once(&self) -> Result<usize> {
        let session_ids = self.kv.smembers("sessions:index").await?;
        let margin = self.settings.archive_margin.as_secs() as i64;
        let mut archived = 0;
        for session_id in session_ids {
            let ttl = self.kv.ttl(&state_key(&session_id)).await?;
            if ttl < 0 || ttl > margin {
                continue;
            }
            let Some(bytes) = self.kv.get(&state_key(&session_id)).await? else {
                continue;
            };
            self.blobs
                .put(
                    &state_archive_key(&session_id),
                    bytes,
                    Some("application/octet-stream"),
                )
                .await?;
            archived += 1;
            debug!(msg = "state archived", session.id = %session_id, ttl);
        }
        if archived > 0 {
            info!(msg = "state archive pass complete", archived);
        }
        Ok(archived)
    }
}

impl<K: KvCommands, B: BlobStore> StateStore for StateService<K, B> {
    async fn save(&self, session_id: &str, state_b64: &str, ttl: Duration) -> Result<StateUpload> {
        let bytes = BASE64
            .decode(state_b64)
            .map_err(|e| Error::InvalidArgument(format!("state is not valid base64: {e}")))?;
        if bytes.len() > self.settings.max_state_bytes {
            return Err(Error::ResourceExhausted(format!(
                "state of {} bytes exceeds the {} byte cap",
                bytes.len(),
                self.settings.max_state_bytes
            )));
        }
        let hash = fingerprint(&bytes);
        self.write_hot(session_id, &bytes, &hash, ttl).await?;
        debug!(
            msg = "state saved",
            session.id = session_id,
            size = bytes.len(),
        );
        Ok(StateUpload {
            size: bytes.len() as u64,
            hash,
        })
    }

    async fn load(&self, session_id: &str) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.kv.get(&state_key(session_id)).await? {
            return Ok(Some(bytes));
        }
        let Some(bytes) = self.blobs.get(&state_archive_key(session_id)).await? else {
            return Ok(None);
        };
        // Promote back into the hot tier; a failure only costs the next
        // call another cold read.
        let hash = fingerprint(&bytes);
        if let Err(e) = self
            .write_hot(session_id, &bytes, &hash, self.promote_ttl)
            .await
        {
            warn!(msg = "state promotion failed", session.id = session_id, %e);
        } else {
            debug!(msg = "state promoted from archive", session.id = session_id);
        }
        Ok(Some(bytes))
    }

    async fn info(&self, session_id: &str) -> Result<StateInfo> {
        let fields = self.kv.hgetall(&state_info_key(session_id)).await?;
        let size = fields.get("size").and_then(|s| s.parse().ok());
        let hash = fields.get("hash").cloned();
        let created_at = fields
            .get("created_at")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        let hot_ttl = self.kv.ttl(&state_key(session_id)).await?;
        if hot_ttl >= 0 {
            return Ok(StateInfo {
                exists: true,
                session_id: Some(session_id.to_string()),
                size,
                hash,
                created_at,
                expires_at: Some(Utc::now() + chrono::Duration::seconds(hot_ttl)),
                source: Some(StateSource::Hot),
            });
        }
        if let Some(object) = self.blobs.head(&state_archive_key(session_id)).await? {
            return Ok(StateInfo {
                exists: true,
                session_id: Some(session_id.to_string()),
                size: size.or(Some(object.size)),
                hash,
                created_at,
                expires_at: None,
                source: Some(StateSource::Archive),
            });
        }
        Ok(StateInfo::missing())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let had_hot = self.kv.exists(&state_key(session_id)).await?;
        let mut pipe = Pipeline::new();
        pipe.del(&state_key(session_id)).del(&state_info_key(session_id));
        self.kv.pipeline(pipe).await?;
        let had_cold = self.blobs.delete(&state_archive_key(session_id)).await?;
        Ok(had_hot || had_cold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use coderun_kv::memory::MemoryKv;
    use coderun_store::memory::MemoryBlobStore;

    const TTL: Duration = Duration::from_secs(3600);

    fn service(cap: usize) -> StateService<MemoryKv, MemoryBlobStore> {
        StateService::new(
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryBlobStore::new()),
            StateSettings {
                max_state_bytes: cap,
                ..Default::default()
            },
            TTL,
        )
    }

    #[tokio::test]
    async fn save_then_load_returns_original_bytes() {
        let service = service(1024);
        let blob = b"pickled interpreter state";
        let encoded = BASE64.encode(blob);
        let upload = service.save("sess-1", &encoded, TTL).await.unwrap();
        assert_eq!(upload.size, blob.len() as u64);
        assert_eq!(upload.hash, fingerprint(blob));

        let loaded = service.load("sess-1").await.unwrap().unwrap();
        assert_eq!(loaded, blob);
    }

    #[tokio::test]
    async fn blob_at_cap_accepted_one_over_rejected() {
        let service = service(64);
        let exact = BASE64.encode(vec![7u8; 64]);
        assert!(service.save("sess-at", &exact, TTL).await.is_ok());

        let over = BASE64.encode(vec![7u8; 65]);
        let err = service.save("sess-over", &over, TTL).await.unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
        // Nothing was written for the rejected upload.
        assert!(service.load("sess-over").await.unwrap().is_none());
        assert!(!service.info("sess-over").await.unwrap().exists);
    }

    #[tokio::test]
    async fn invalid_base64_is_invalid_argument() {
        let service = service(1024);
        let err = service.save("sess-1", "not base64!!!", TTL).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn load_miss_returns_none() {
        let service = service(1024);
        assert!(service.load("sess-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cold_tier_hit_promotes_to_hot() {
        let kv = Arc::new(MemoryKv::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let service = StateService::new(
            kv.clone(),
            blobs.clone(),
            StateSettings::default(),
            TTL,
        );
        let blob = b"archived state".to_vec();
        blobs
            .put(&state_archive_key("sess-cold"), blob.clone(), None)
            .await
            .unwrap();

        let loaded = service.load("sess-cold").await.unwrap().unwrap();
        assert_eq!(loaded, blob);
        // The hot tier now answers directly.
        assert!(kv.exists("state:sess-cold").await.unwrap());
        let info = service.info("sess-cold").await.unwrap();
        assert_eq!(info.source, Some(StateSource::Hot));
    }

    #[tokio::test]
    async fn info_reports_archive_source_after_hot_expiry() {
        let kv = Arc::new(MemoryKv::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let service = StateService::new(
            kv.clone(),
            blobs.clone(),
            StateSettings::default(),
            TTL,
        );
        let encoded = BASE64.encode(b"state");
        service.save("sess-1", &encoded, TTL).await.unwrap();
        blobs
            .put(&state_archive_key("sess-1"), b"state".to_vec(), None)
            .await
            .unwrap();
        kv.force_expire("state:sess-1");

        let info = service.info("sess-1").await.unwrap();
        assert!(info.exists);
        assert_eq!(info.source, Some(StateSource::Archive));
    }

    #[tokio::test]
    async fn archive_pass_copies_entries_near_expiry() {
        let kv = Arc::new(MemoryKv::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let settings = StateSettings {
            archive_margin: Duration::from_secs(600),
            ..Default::default()
        };
        let service = StateService::new(kv.clone(), blobs.clone(), settings, TTL);

        kv.sadd("sessions:index", "sess-soon").await.unwrap();
        kv.sadd("sessions:index", "sess-later").await.unwrap();
        let encoded = BASE64.encode(b"blob");
        // One entry inside the archive margin, one far from it.
        service
            .save("sess-soon", &encoded, Duration::from_secs(60))
            .await
            .unwrap();
        service
            .save("sess-later", &encoded, Duration::from_secs(7200))
            .await
            .unwrap();

        let archived = service.archive_once().await.unwrap();
        assert_eq!(archived, 1);
        assert!(
            blobs
                .get(&state_archive_key("sess-soon"))
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            blobs
                .get(&state_archive_key("sess-later"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_clears_both_tiers() {
        let service = service(1024);
        let encoded = BASE64.encode(b"state");
        service.save("sess-1", &encoded, TTL).await.unwrap();
        assert!(service.delete("sess-1").await.unwrap());
        assert!(!service.delete("sess-1").await.unwrap());
        assert!(service.load("sess-1").await.unwrap().is_none());
    }
}
