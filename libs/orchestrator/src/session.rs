//! Session service: CRUD over the KV store with TTL, entity-scoped
//! indexing and expiry sweeping.
//!
//! Key shapes (all namespace-prefixed by the KV facade):
//! - `session:{id}` — hash of session fields
//! - `sessions:index` — set of active session ids
//! - `sessions:entity:{entity-id}` — set of session ids per entity
//!
//! Multi-key writes go through the facade's ordered, non-transactional
//! pipeline so sharded deployments never reject them.

use crate::config::SessionSettings;
use crate::error::{Error, Result};
use crate::models::{Session, SessionStatus};

use coderun_kv::{KvCommands, Pipeline};

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SESSIONS_INDEX_KEY: &str = "sessions:index";

fn session_key(id: &str) -> String {
    format!("session:{id}")
}

fn entity_key(entity_id: &str) -> String {
    format!("sessions:entity:{entity_id}")
}

/// Session persistence capability the runner depends on.
#[allow(async_fn_in_trait)]
pub trait SessionStore: Send + Sync {
    /// Create a session. A caller-supplied id that already exists fails
    /// with `AlreadyExists`.
    async fn create(
        &self,
        session_id: Option<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
        entity_id: Option<String>,
    ) -> Result<Session>;
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;
    /// Persist updated fields, refreshing TTLs. Last-activity never moves
    /// backwards: concurrent writers race monotonically.
    async fn update(&self, session: &Session) -> Result<Session>;
    /// Bump last-activity and slide the expiry window.
    async fn touch(&self, session_id: &str) -> Result<Session>;
    async fn delete(&self, session_id: &str) -> Result<bool>;
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Session>>;
    async fn list_by_entity(&self, entity_id: &str, limit: usize) -> Result<Vec<Session>>;
    /// Remove expired sessions and stale index entries; returns how many
    /// sessions were swept.
    async fn sweep_expired(&self) -> Result<usize>;
}

pub struct SessionService<K> {
    kv: Arc<K>,
    settings: SessionSettings,
}

impl<K: KvCommands> SessionService<K> {
    pub fn new(kv: Arc<K>, settings: SessionSettings) -> Self {
        Self { kv, settings }
    }

    fn ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.settings.ttl).unwrap_or(chrono::Duration::hours(1))
    }

    /// Write the record and refresh expiry on the hash and both index
    /// keys in one pipeline.
    async fn write(&self, session: &Session) -> Result<()> {
        let remaining = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(1));
        let key = session_key(&session.session_id);
        let mut pipe = Pipeline::new();
        pipe.hset_all(&key, session.to_fields()?)
            .expire(&key, remaining)
            .sadd(SESSIONS_INDEX_KEY, &session.session_id)
            .expire(SESSIONS_INDEX_KEY, remaining);
        if let Some(entity_id) = &session.entity_id {
            let entity = entity_key(entity_id);
            pipe.sadd(&entity, &session.session_id).expire(&entity, remaining);
        }
        self.kv.pipeline(pipe).await?;
        Ok(())
    }

    async fn fetch(&self, session_id: &str) -> Result<Option<Session>> {
        let fields = self.kv.hgetall(&session_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Session::from_fields(session_id, &fields).map(Some)
    }
}

impl<K: KvCommands> SessionStore for SessionService<K> {
    async fn create(
        &self,
        session_id: Option<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
        entity_id: Option<String>,
    ) -> Result<Session> {
        let session_id = match session_id {
            Some(id) => {
                if self.kv.exists(&session_key(&id)).await? {
                    return Err(Error::AlreadyExists(format!("session {id}")));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        let mut session = Session::new(session_id, self.ttl());
        session.metadata = metadata;
        session.entity_id = entity_id;
        self.write(&session).await?;
        info!(
            msg = "session created",
            session.id = %session.session_id,
            entity.id = session.entity_id.as_deref().unwrap_or(""),
        );
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        self.fetch(session_id).await
    }

    async fn update(&self, session: &Session) -> Result<Session> {
        let stored = self
            .fetch(&session.session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {}", session.session_id)))?;
        let mut merged = session.clone();
        // Two executions finishing at the same moment race on
        // last-activity; the larger timestamp wins.
        merged.last_activity = merged.last_activity.max(stored.last_activity);
        self.write(&merged).await?;
        Ok(merged)
    }

    async fn touch(&self, session_id: &str) -> Result<Session> {
        let mut session = self
            .fetch(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let now = Utc::now();
        session.last_activity = session.last_activity.max(now);
        session.expires_at = now + self.ttl();
        session.status = SessionStatus::Active;
        self.write(&session).await?;
        Ok(session)
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let Some(session) = self.fetch(session_id).await? else {
            return Ok(false);
        };
        let mut pipe = Pipeline::new();
        pipe.del(&session_key(session_id))
            .srem(SESSIONS_INDEX_KEY, session_id);
        if let Some(entity_id) = &session.entity_id {
            pipe.srem(&entity_key(entity_id), session_id);
        }
        self.kv.pipeline(pipe).await?;
        debug!(msg = "session deleted", session.id = session_id);
        Ok(true)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Session>> {
        let mut ids = self.kv.smembers(SESSIONS_INDEX_KEY).await?;
        ids.sort();
        let mut sessions = Vec::new();
        for id in ids.into_iter().skip(offset) {
            if sessions.len() >= limit {
                break;
            }
            if let Some(session) = self.fetch(&id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn list_by_entity(&self, entity_id: &str, limit: usize) -> Result<Vec<Session>> {
        let mut ids = self.kv.smembers(&entity_key(entity_id)).await?;
        ids.sort();
        let mut sessions = Vec::new();
        for id in ids.into_iter().take(limit) {
            if let Some(session) = self.fetch(&id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let ids = self.kv.smembers(SESSIONS_INDEX_KEY).await?;
        let mut swept = 0;
        for id in ids {
            match self.fetch(&id).await? {
                Some(session) if session.is_expired() => {
                    if self.delete(&id).await? {
                        swept += 1;
                    }
                }
                Some(_) => {}
                None => {
                    // The hash TTL lapsed before the sweep; drop the
                    // dangling index entry.
                    if let Err(e) = self.kv.srem(SESSIONS_INDEX_KEY, &id).await {
                        warn!(msg = "failed to drop stale index entry", session.id = %id, %e);
                    }
                }
            }
        }
        if swept > 0 {
            info!(msg = "expired sessions swept", count = swept);
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use coderun_kv::memory::MemoryKv;

    fn service() -> SessionService<MemoryKv> {
        SessionService::new(Arc::new(MemoryKv::new()), SessionSettings::default())
    }

    fn metadata(key: &str, value: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        map
    }

    #[tokio::test]
    async fn create_then_get_preserves_metadata() {
        let service = service();
        let created = service
            .create(None, metadata("owner", "alice"), None)
            .await
            .unwrap();
        let fetched = service.get(&created.session_id).await.unwrap().unwrap();
        assert_eq!(fetched.metadata["owner"], "alice");
        assert_eq!(fetched.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn duplicate_explicit_id_is_rejected() {
        let service = service();
        service
            .create(Some("sess-dup".to_string()), Default::default(), None)
            .await
            .unwrap();
        let err = service
            .create(Some("sess-dup".to_string()), Default::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_twice_second_returns_false() {
        let service = service();
        let session = service.create(None, Default::default(), None).await.unwrap();
        assert!(service.delete(&session.session_id).await.unwrap());
        assert!(!service.delete(&session.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn index_invariants_hold() {
        let kv = Arc::new(MemoryKv::new());
        let service = SessionService::new(kv.clone(), SessionSettings::default());
        let session = service
            .create(None, Default::default(), Some("asst_1".to_string()))
            .await
            .unwrap();

        let index = kv.smembers("sessions:index").await.unwrap();
        assert!(index.contains(&session.session_id));
        let by_entity = kv.smembers("sessions:entity:asst_1").await.unwrap();
        assert!(by_entity.contains(&session.session_id));

        service.delete(&session.session_id).await.unwrap();
        assert!(kv.smembers("sessions:index").await.unwrap().is_empty());
        assert!(kv.smembers("sessions:entity:asst_1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_by_entity_scopes_results() {
        let service = service();
        for entity in ["asst_a", "asst_a", "asst_b"] {
            service
                .create(None, Default::default(), Some(entity.to_string()))
                .await
                .unwrap();
        }
        assert_eq!(service.list_by_entity("asst_a", 10).await.unwrap().len(), 2);
        assert_eq!(service.list_by_entity("asst_b", 10).await.unwrap().len(), 1);
        assert_eq!(service.list(10, 0).await.unwrap().len(), 3);
        assert_eq!(service.list(2, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn last_activity_never_moves_backwards() {
        let service = service();
        let session = service.create(None, Default::default(), None).await.unwrap();
        let touched = service.touch(&session.session_id).await.unwrap();

        let mut stale = touched.clone();
        stale.last_activity = touched.last_activity - chrono::Duration::seconds(30);
        let merged = service.update(&stale).await.unwrap();
        assert_eq!(merged.last_activity, touched.last_activity);

        let newer = touched.last_activity + chrono::Duration::seconds(30);
        stale.last_activity = newer;
        let merged = service.update(&stale).await.unwrap();
        assert_eq!(merged.last_activity, newer);
    }

    #[tokio::test]
    async fn update_missing_session_is_not_found() {
        let service = service();
        let ghost = Session::new("ghost".to_string(), chrono::Duration::hours(1));
        let err = service.update(&ghost).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions() {
        let service = service();
        let mut session = service.create(None, Default::default(), None).await.unwrap();
        let keeper = service.create(None, Default::default(), None).await.unwrap();

        session.expires_at = Utc::now() - chrono::Duration::seconds(5);
        // Write directly; update() would slide nothing but keep expiry.
        service.write(&session).await.unwrap();

        let swept = service.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert!(service.get(&session.session_id).await.unwrap().is_none());
        assert!(service.get(&keeper.session_id).await.unwrap().is_some());
    }
}
