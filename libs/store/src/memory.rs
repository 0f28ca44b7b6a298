//! In-memory [`BlobStore`] implementation for tests.

use crate::client::{BlobStore, ObjectInfo};
use crate::error::Result;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, (Vec<u8>, Option<String>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes, content_type.map(String::from)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(bytes, _)| bytes.clone()))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(bytes, content_type)| ObjectInfo {
                key: key.to_string(),
                size: bytes.len() as u64,
                content_type: content_type.clone(),
            }))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, (bytes, content_type))| ObjectInfo {
                key: key.clone(),
                size: bytes.len() as u64,
                content_type: content_type.clone(),
            })
            .collect())
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://put/{key}?expires={}", ttl.as_secs()))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!("memory://get/{key}?expires={}", ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = MemoryBlobStore::new();
        store.put("files/s/f", b"data".to_vec(), None).await.unwrap();
        assert_eq!(store.get("files/s/f").await.unwrap(), Some(b"data".to_vec()));
        assert!(store.delete("files/s/f").await.unwrap());
        assert!(!store.delete("files/s/f").await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put("files/a/1", vec![0; 4], None).await.unwrap();
        store.put("files/a/2", vec![0; 8], None).await.unwrap();
        store.put("files/b/1", vec![0; 2], None).await.unwrap();
        let listed = store.list("files/a/").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].size, 4);
    }
}
