//! Object storage adapter: uploads finished artifacts under per-user key
//! prefixes and enforces prefix ownership on delete.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::{config::Builder as S3ConfigBuilder, Client as S3Client};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use ulid::Ulid;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub prefix: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("storage auth failure")]
    Auth,
    #[error("storage io failure: {0}")]
    Io(String),
    #[error("storage quota exceeded")]
    Quota,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub object_key: String,
    pub url: String,
    pub file_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Ok,
    NotFound,
    Forbidden,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn put(
        &self,
        user_id: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;

    async fn delete(&self, user_id: &str, object_key: &str) -> Result<DeleteOutcome, StorageError>;

    async fn fetch(&self, user_id: &str, object_key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Server-assigned key: `<prefix><user_id>/<ulid>.mp4`. The ULID makes
/// keys collision-free without coordination.
pub fn make_object_key(prefix: &str, user_id: &str) -> String {
    format!("{}{}/{}.mp4", prefix, user_id, Ulid::new())
}

/// Prefix-based ownership check used by delete and fetch.
pub fn key_belongs_to(prefix: &str, user_id: &str, object_key: &str) -> bool {
    object_key.starts_with(&format!("{}{}/", prefix, user_id))
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
    prefix: String,
    endpoint: String,
}

const UPLOAD_ATTEMPTS: u32 = 3;

impl S3Storage {
    pub async fn connect(config: &StorageConfig) -> Self {
        let endpoint = if config.endpoint.ends_with('/') {
            config.endpoint.trim_end_matches('/').to_string()
        } else {
            config.endpoint.clone()
        };
        let base_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(&endpoint)
            .region("auto")
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "static",
            ))
            .load()
            .await;
        let s3_config = S3ConfigBuilder::from(&base_config)
            .force_path_style(true)
            .build();
        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            endpoint,
        }
    }

    fn object_url(&self, object_key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, object_key)
    }

    fn classify<E, R>(error: SdkError<E, R>) -> StorageError
    where
        E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
        R: std::fmt::Debug,
    {
        let code = error.code().map(str::to_string);
        match code.as_deref() {
            Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch") => {
                StorageError::Auth
            }
            Some("QuotaExceeded") | Some("EntityTooLarge") => StorageError::Quota,
            _ => StorageError::Io(DisplayErrorContext(error).to_string()),
        }
    }
}

#[async_trait]
impl StorageAdapter for S3Storage {
    async fn put(
        &self,
        user_id: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let file_size = data.len() as i64;
        let object_key = make_object_key(&self.prefix, user_id);

        let mut delay = Duration::from_millis(250);
        let mut last = StorageError::Io("upload not attempted".to_string());
        for attempt in 1..=UPLOAD_ATTEMPTS {
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&object_key)
                .content_type(content_type)
                .body(data.clone().into())
                .send()
                .await;
            match result {
                Ok(_) => {
                    info!(key = %object_key, size = file_size, "artifact uploaded");
                    return Ok(StoredObject {
                        url: self.object_url(&object_key),
                        object_key,
                        file_size,
                    });
                }
                Err(error) => {
                    let classified = Self::classify(error);
                    match classified {
                        // Transient IO gets backoff; auth and quota do not.
                        StorageError::Io(ref message) => {
                            warn!(attempt, "upload failed: {}", message);
                            last = classified;
                            if attempt < UPLOAD_ATTEMPTS {
                                tokio::time::sleep(delay).await;
                                delay *= 2;
                            }
                        }
                        other => return Err(other),
                    }
                }
            }
        }
        Err(last)
    }

    async fn delete(&self, user_id: &str, object_key: &str) -> Result<DeleteOutcome, StorageError> {
        if !key_belongs_to(&self.prefix, user_id, object_key) {
            return Ok(DeleteOutcome::Forbidden);
        }
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await;
        if let Err(error) = head {
            if error
                .as_service_error()
                .map(HeadObjectError::is_not_found)
                .unwrap_or(false)
            {
                return Ok(DeleteOutcome::NotFound);
            }
            return Err(Self::classify(error));
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(Self::classify)?;
        Ok(DeleteOutcome::Ok)
    }

    async fn fetch(&self, user_id: &str, object_key: &str) -> Result<Vec<u8>, StorageError> {
        if !key_belongs_to(&self.prefix, user_id, object_key) {
            return Err(StorageError::Auth);
        }
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(Self::classify)?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(body.into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_shape() {
        let key = make_object_key("", "user_2abc");
        let re = regex::Regex::new(r"^user_2abc/[0-9A-HJKMNP-TV-Z]{26}\.mp4$").unwrap();
        assert!(re.is_match(&key), "unexpected key {}", key);
    }

    #[test]
    fn keys_do_not_collide() {
        let a = make_object_key("media/", "u");
        let b = make_object_key("media/", "u");
        assert_ne!(a, b);
    }

    #[test]
    fn prefix_ownership() {
        assert!(key_belongs_to("", "alice", "alice/01J00000000000000000000000.mp4"));
        assert!(!key_belongs_to("", "bob", "alice/01J00000000000000000000000.mp4"));
        // "ali" must not own "alice/..." by accident.
        assert!(!key_belongs_to("", "ali", "alice/01J00000000000000000000000.mp4"));
        assert!(key_belongs_to("media/", "alice", "media/alice/x.mp4"));
    }
}
