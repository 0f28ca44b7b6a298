//! Session-scoped file management over the object store.
//!
//! Large payloads move through presigned URLs so the orchestrator never
//! proxies file bodies; the session record indexes every known file.

use crate::config::FileSettings;
use crate::error::{Error, Result};
use crate::models::{FileInfo, Session};
use crate::session::SessionStore;

use coderun_store::{BlobStore, file_key, output_key};

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// File capability consumed by the runner and the (out-of-scope) HTTP
/// surface.
#[allow(async_fn_in_trait)]
pub trait FileStore: Send + Sync {
    /// Issue a presigned upload URL and index a pending file entry.
    /// Returns `(file_id, upload_url)`.
    async fn upload_file(
        &self,
        session_id: &str,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<(String, String)>;
    /// Confirm a client-direct upload landed and record its true size.
    async fn confirm_upload(&self, session_id: &str, file_id: &str) -> Result<FileInfo>;
    async fn get_file_info(&self, session_id: &str, file_id: &str) -> Result<Option<FileInfo>>;
    async fn list_files(&self, session_id: &str) -> Result<Vec<FileInfo>>;
    /// Presigned download URL.
    async fn download_file(&self, session_id: &str, file_id: &str) -> Result<String>;
    async fn get_file_content(&self, session_id: &str, file_id: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_file(&self, session_id: &str, file_id: &str) -> Result<bool>;
    /// Remove every stored object for the session; returns the count.
    async fn cleanup_session_files(&self, session_id: &str) -> Result<usize>;
    /// Store a file produced by an execution and index it into the
    /// session. Returns the new file id.
    async fn store_execution_output(
        &self,
        session_id: &str,
        execution_id: &str,
        index: usize,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<String>;
}

pub struct FileService<S, B> {
    sessions: Arc<S>,
    blobs: Arc<B>,
    settings: FileSettings,
}

impl<S: SessionStore, B: BlobStore> FileService<S, B> {
    pub fn new(sessions: Arc<S>, blobs: Arc<B>, settings: FileSettings) -> Self {
        Self {
            sessions,
            blobs,
            settings,
        }
    }

    async fn session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    fn record(session: &Session, file_id: &str, filename: &str, size: u64, content_type: &str) -> FileInfo {
        FileInfo {
            file_id: file_id.to_string(),
            filename: filename.to_string(),
            size,
            content_type: content_type.to_string(),
            created_at: Utc::now(),
            path: format!("{}/{filename}", session.working_directory),
        }
    }

    async fn index_file(&self, mut session: Session, info: FileInfo) -> Result<()> {
        session.files.insert(info.file_id.clone(), info);
        session.last_activity = Utc::now();
        self.sessions.update(&session).await?;
        Ok(())
    }
}

impl<S: SessionStore, B: BlobStore> FileStore for FileService<S, B> {
    async fn upload_file(
        &self,
        session_id: &str,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<(String, String)> {
        let session = self.session(session_id).await?;
        let file_id = Uuid::new_v4().to_string();
        let url = self
            .blobs
            .presign_put(&file_key(session_id, &file_id), self.settings.presign_ttl)
            .await?;
        let info = Self::record(
            &session,
            &file_id,
            filename,
            0,
            content_type.unwrap_or(DEFAULT_CONTENT_TYPE),
        );
        self.index_file(session, info).await?;
        debug!(msg = "upload url issued", session.id = session_id, file.id = %file_id);
        Ok((file_id, url))
    }

    async fn confirm_upload(&self, session_id: &str, file_id: &str) -> Result<FileInfo> {
        let session = self.session(session_id).await?;
        let mut info = session
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("file {file_id}")))?;
        let object = self
            .blobs
            .head(&file_key(session_id, file_id))
            .await?
            .ok_or_else(|| {
                Error::FailedPrecondition(format!("file {file_id} was never uploaded"))
            })?;
        info.size = object.size;
        if let Some(content_type) = object.content_type {
            info.content_type = content_type;
        }
        self.index_file(session, info.clone()).await?;
        Ok(info)
    }

    async fn get_file_info(&self, session_id: &str, file_id: &str) -> Result<Option<FileInfo>> {
        Ok(self.session(session_id).await?.files.get(file_id).cloned())
    }

    async fn list_files(&self, session_id: &str) -> Result<Vec<FileInfo>> {
        let mut files: Vec<FileInfo> = self.session(session_id).await?.files.into_values().collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(files)
    }

    async fn download_file(&self, session_id: &str, file_id: &str) -> Result<String> {
        let session = self.session(session_id).await?;
        if !session.files.contains_key(file_id) {
            return Err(Error::NotFound(format!("file {file_id}")));
        }
        Ok(self
            .blobs
            .presign_get(&file_key(session_id, file_id), self.settings.presign_ttl)
            .await?)
    }

    async fn get_file_content(&self, session_id: &str, file_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(&file_key(session_id, file_id)).await?)
    }

    async fn delete_file(&self, session_id: &str, file_id: &str) -> Result<bool> {
        let mut session = self.session(session_id).await?;
        let existed = self.blobs.delete(&file_key(session_id, file_id)).await?;
        if session.files.remove(file_id).is_some() {
            self.sessions.update(&session).await?;
        }
        Ok(existed)
    }

    async fn cleanup_session_files(&self, session_id: &str) -> Result<usize> {
        let prefix = format!("files/{session_id}/");
        let objects = self.blobs.list(&prefix).await?;
        let mut removed = 0;
        for object in &objects {
            match self.blobs.delete(&object.key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(msg = "failed to delete session file", key = %object.key, %e),
            }
        }
        if let Ok(Some(mut session)) = self.sessions.get(session_id).await {
            session.files.clear();
            let _ = self.sessions.update(&session).await;
        }
        Ok(removed)
    }

    async fn store_execution_output(
        &self,
        session_id: &str,
        execution_id: &str,
        index: usize,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let session = self.session(session_id).await?;
        let size = content.len() as u64;
        self.blobs
            .put(
                &output_key(execution_id, index, filename),
                content,
                Some(DEFAULT_CONTENT_TYPE),
            )
            .await?;
        let file_id = Uuid::new_v4().to_string();
        let info = Self::record(&session, &file_id, filename, size, DEFAULT_CONTENT_TYPE);
        self.index_file(session, info).await?;
        Ok(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::session::SessionService;

    use coderun_kv::memory::MemoryKv;
    use coderun_store::memory::MemoryBlobStore;

    struct Fixture {
        sessions: Arc<SessionService<MemoryKv>>,
        blobs: Arc<MemoryBlobStore>,
        files: FileService<SessionService<MemoryKv>, MemoryBlobStore>,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionService::new(
            Arc::new(MemoryKv::new()),
            SessionSettings::default(),
        ));
        let blobs = Arc::new(MemoryBlobStore::new());
        let files = FileService::new(sessions.clone(), blobs.clone(), FileSettings::default());
        Fixture {
            sessions,
            blobs,
            files,
        }
    }

    #[tokio::test]
    async fn upload_confirm_download_roundtrip() {
        let fx = fixture();
        let session = fx.sessions.create(None, Default::default(), None).await.unwrap();

        let (file_id, upload_url) = fx
            .files
            .upload_file(&session.session_id, "data.csv", Some("text/csv"))
            .await
            .unwrap();
        assert!(upload_url.contains(&file_id));

        // Simulate the client-direct upload.
        fx.blobs
            .put(
                &file_key(&session.session_id, &file_id),
                b"a,b\n1,2\n".to_vec(),
                Some("text/csv"),
            )
            .await
            .unwrap();

        let info = fx
            .files
            .confirm_upload(&session.session_id, &file_id)
            .await
            .unwrap();
        assert_eq!(info.size, 8);
        assert_eq!(info.content_type, "text/csv");
        assert_eq!(info.path, "/mnt/data/data.csv");

        let content = fx
            .files
            .get_file_content(&session.session_id, &file_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content, b"a,b\n1,2\n");

        let url = fx
            .files
            .download_file(&session.session_id, &file_id)
            .await
            .unwrap();
        assert!(url.contains(&file_id));
    }

    #[tokio::test]
    async fn confirm_without_upload_is_failed_precondition() {
        let fx = fixture();
        let session = fx.sessions.create(None, Default::default(), None).await.unwrap();
        let (file_id, _) = fx
            .files
            .upload_file(&session.session_id, "data.csv", None)
            .await
            .unwrap();
        let err = fx
            .files
            .confirm_upload(&session.session_id, &file_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let fx = fixture();
        let err = fx.files.upload_file("ghost", "x", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_file_removes_object_and_index_entry() {
        let fx = fixture();
        let session = fx.sessions.create(None, Default::default(), None).await.unwrap();
        let (file_id, _) = fx
            .files
            .upload_file(&session.session_id, "data.csv", None)
            .await
            .unwrap();
        fx.blobs
            .put(&file_key(&session.session_id, &file_id), vec![1], None)
            .await
            .unwrap();

        assert!(fx.files.delete_file(&session.session_id, &file_id).await.unwrap());
        assert!(!fx.files.delete_file(&session.session_id, &file_id).await.unwrap());
        assert!(
            fx.files
                .get_file_info(&session.session_id, &file_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn cleanup_removes_all_session_objects() {
        let fx = fixture();
        let session = fx.sessions.create(None, Default::default(), None).await.unwrap();
        for n in 0..3 {
            fx.blobs
                .put(
                    &file_key(&session.session_id, &format!("f{n}")),
                    vec![0; 4],
                    None,
                )
                .await
                .unwrap();
        }
        let removed = fx
            .files
            .cleanup_session_files(&session.session_id)
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(fx.blobs.object_count(), 0);
    }

    #[tokio::test]
    async fn execution_outputs_are_indexed_into_the_session() {
        let fx = fixture();
        let session = fx.sessions.create(None, Default::default(), None).await.unwrap();
        let file_id = fx
            .files
            .store_execution_output(&session.session_id, "exec-1", 0, "plot.png", vec![9; 16])
            .await
            .unwrap();
        let listed = fx.files.list_files(&session.session_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_id, file_id);
        assert_eq!(listed[0].filename, "plot.png");
        assert_eq!(listed[0].size, 16);
        assert!(
            fx.blobs
                .get(&output_key("exec-1", 0, "plot.png"))
                .await
                .unwrap()
                .is_some()
        );
    }
}
