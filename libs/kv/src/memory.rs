//! In-memory [`KvCommands`] implementation for tests.
//!
//! Mirrors the server's observable behaviour closely enough for service
//! tests: lazy expiry, type-per-key values, ordered pipeline application.

use crate::client::{KvCommands, Pipeline, PipelineOp};
use crate::error::Result;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
enum MemValue {
    Str(Vec<u8>),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Counter(i64),
}

#[derive(Clone, Debug)]
struct Entry {
    value: MemValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a key's TTL into the past, as if the server expired it.
    pub fn force_expire(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() - Duration::from_secs(1));
        }
    }

    pub fn key_count(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|e| e.live()).count()
    }

    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|e| !e.live()) {
            entries.remove(key);
        }
        f(entries.get(key))
    }

    fn apply(&self, op: &PipelineOp) {
        match op {
            PipelineOp::Set { key, value, ttl } => {
                let mut entries = self.entries.lock().unwrap();
                entries.insert(
                    key.clone(),
                    Entry {
                        value: MemValue::Str(value.clone()),
                        expires_at: ttl.map(|t| Instant::now() + t),
                    },
                );
            }
            PipelineOp::Del { key } => {
                self.entries.lock().unwrap().remove(key);
            }
            PipelineOp::HSetAll { key, fields } => {
                let mut entries = self.entries.lock().unwrap();
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: MemValue::Hash(HashMap::new()),
                    expires_at: None,
                });
                if !entry.live() {
                    *entry = Entry {
                        value: MemValue::Hash(HashMap::new()),
                        expires_at: None,
                    };
                }
                if let MemValue::Hash(hash) = &mut entry.value {
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                }
            }
            PipelineOp::SAdd { key, member } => {
                let mut entries = self.entries.lock().unwrap();
                let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                    value: MemValue::Set(HashSet::new()),
                    expires_at: None,
                });
                if let MemValue::Set(set) = &mut entry.value {
                    set.insert(member.clone());
                }
            }
            PipelineOp::SRem { key, member } => {
                let mut entries = self.entries.lock().unwrap();
                let mut emptied = false;
                if let Some(Entry {
                    value: MemValue::Set(set),
                    ..
                }) = entries.get_mut(key)
                {
                    set.remove(member);
                    emptied = set.is_empty();
                }
                if emptied {
                    entries.remove(key);
                }
            }
            PipelineOp::Expire { key, ttl } => {
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(key) {
                    entry.expires_at = Some(Instant::now() + *ttl);
                }
            }
        }
    }
}

impl KvCommands for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_live(key, |entry| match entry {
            Some(Entry {
                value: MemValue::Str(bytes),
                ..
            }) => Some(bytes.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.apply(&PipelineOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl: None,
        });
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.apply(&PipelineOp::Set {
            key: key.to_string(),
            value: value.to_vec(),
            ttl: Some(ttl),
        });
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        Ok(entries.remove(key).is_some_and(|e| e.live()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.with_live(key, |entry| entry.is_some()))
    }

    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.apply(&PipelineOp::HSetAll {
            key: key.to_string(),
            fields: fields.to_vec(),
        });
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.with_live(key, |entry| match entry {
            Some(Entry {
                value: MemValue::Hash(hash),
                ..
            }) => hash.clone(),
            _ => HashMap::new(),
        }))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.apply(&PipelineOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.with_live(key, |entry| match entry {
            Some(Entry {
                value: MemValue::Set(set),
                ..
            }) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.apply(&PipelineOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        });
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: MemValue::Counter(0),
            expires_at: None,
        });
        match &mut entry.value {
            MemValue::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            MemValue::Str(bytes) => {
                let current: i64 = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let next = current + 1;
                entry.value = MemValue::Counter(next);
                Ok(next)
            }
            _ => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(key) {
            Some(entry) if entry.live() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        Ok(self.with_live(key, |entry| match entry {
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
            Some(_) => -1,
            None => -2,
        }))
    }

    async fn pipeline(&self, pipe: Pipeline) -> Result<()> {
        for op in &pipe.ops {
            self.apply(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_roundtrip_and_delete() {
        let kv = MemoryKv::new();
        kv.set("k", b"v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(kv.del("k").await.unwrap());
        assert!(!kv.del("k").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_keys_read_as_missing() {
        let kv = MemoryKv::new();
        kv.set_ex("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert!(kv.exists("k").await.unwrap());
        kv.force_expire("k");
        assert!(!kv.exists("k").await.unwrap());
        assert_eq!(kv.ttl("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn hash_and_set_operations() {
        let kv = MemoryKv::new();
        kv.hset_all("h", &[("a".to_string(), "1".to_string())])
            .await
            .unwrap();
        kv.hset_all("h", &[("b".to_string(), "2".to_string())])
            .await
            .unwrap();
        let hash = kv.hgetall("h").await.unwrap();
        assert_eq!(hash.len(), 2);
        assert_eq!(hash["b"], "2");

        kv.sadd("s", "x").await.unwrap();
        kv.sadd("s", "y").await.unwrap();
        kv.srem("s", "x").await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["y".to_string()]);
    }

    #[tokio::test]
    async fn pipeline_applies_in_order() {
        let kv = MemoryKv::new();
        let mut pipe = Pipeline::new();
        pipe.set("k", b"first").set("k", b"second").del("gone");
        kv.pipeline(pipe).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn incr_counts_up() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("n").await.unwrap(), 1);
        assert_eq!(kv.incr("n").await.unwrap(), 2);
    }
}
