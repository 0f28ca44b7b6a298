use crate::error::{Error, Result};

use std::env;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

/// Blob storage capability used by the state, file and runner services.
#[allow(async_fn_in_trait)]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String>;
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Custom endpoint for S3-compatible gateways; unset means AWS proper.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Path-style addressing, required by most self-hosted gateways.
    pub force_path_style: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            bucket: "coderun".to_string(),
            access_key: None,
            secret_key: None,
            force_path_style: true,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let opt = |name: &str| {
            env::var(name).ok().and_then(|v| {
                let trimmed = v.trim().to_string();
                if trimmed.is_empty() { None } else { Some(trimmed) }
            })
        };
        let bucket = opt("S3_BUCKET").unwrap_or(defaults.bucket);
        if bucket.is_empty() {
            return Err(Error::InvalidConfig("bucket name is empty".to_string()));
        }
        Ok(Self {
            endpoint: opt("S3_ENDPOINT"),
            region: opt("S3_REGION").unwrap_or(defaults.region),
            bucket,
            access_key: opt("S3_ACCESS_KEY"),
            secret_key: opt("S3_SECRET_KEY"),
            force_path_style: opt("S3_FORCE_PATH_STYLE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.force_path_style),
        })
    }
}

#[derive(Clone)]
pub struct ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl ObjectStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));
        if let (Some(access_key), Some(secret_key)) = (&cfg.access_key, &cfg.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "coderun-static",
            ));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }
        builder = builder.force_path_style(cfg.force_path_style);
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Ok(Self {
            client,
            bucket: cfg.bucket.clone(),
        })
    }

    /// Startup check: the configured bucket must exist, creating it when
    /// the endpoint allows.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let head = self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await;
        match head {
            Ok(_) => {
                debug!(msg = "bucket present", bucket = %self.bucket);
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if !matches!(service_error, HeadBucketError::NotFound(_)) {
                    return Err(Error::Bucket {
                        bucket: self.bucket.clone(),
                        reason: "head failed".to_string(),
                        source: Some(Box::new(service_error)),
                    });
                }
                info!(msg = "creating missing bucket", bucket = %self.bucket);
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| Error::Bucket {
                        bucket: self.bucket.clone(),
                        reason: "create failed".to_string(),
                        source: Some(Box::new(e)),
                    })?;
                Ok(())
            }
        }
    }
}

impl BlobStore for ObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .set_content_type(content_type.map(String::from))
            .send()
            .await
            .map_err(|e| Error::Request {
                op: "put",
                key: key.to_string(),
                source: Box::new(e),
            })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| Error::Request {
                        op: "get",
                        key: key.to_string(),
                        source: Box::new(e),
                    })?
                    .into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(None);
                }
                Err(Error::Request {
                    op: "get",
                    key: key.to_string(),
                    source: Box::new(service_error),
                })
            }
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                content_type: output.content_type().map(String::from),
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    return Ok(None);
                }
                Err(Error::Request {
                    op: "head",
                    key: key.to_string(),
                    source: Box::new(service_error),
                })
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        // S3 deletes are idempotent; report whether the object was there.
        let existed = self.head(key).await?.is_some();
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::Request {
                op: "delete",
                key: key.to_string(),
                source: Box::new(e),
            })?;
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Error::Request {
                    op: "list",
                    key: prefix.to_string(),
                    source: Box::new(e),
                })?;
            for object in resp.contents() {
                objects.push(ObjectInfo {
                    key: object.key().unwrap_or_default().to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    content_type: None,
                });
            }
            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| Error::Presign {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| Error::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(request.uri().to_string())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| Error::Presign {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| Error::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(request.uri().to_string())
    }
}
