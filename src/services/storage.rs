use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::AppError;

pub const PHOTO_BUCKET: &str = "trip-photos";
pub const GPX_BUCKET: &str = "trip-gpx";
pub const BUCKETS: [&str; 2] = [PHOTO_BUCKET, GPX_BUCKET];

type HmacSha256 = Hmac<Sha256>;

/// Filesystem-backed object store. Each bucket is a directory under `root`,
/// object keys are `/`-separated paths inside it.
#[derive(Clone)]
pub struct StorageService {
    root: Arc<PathBuf>,
    signer: UrlSigner,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
}

impl StorageService {
    pub fn new(root: PathBuf, signer: UrlSigner) -> Self {
        Self {
            root: Arc::new(root),
            signer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub async fn ensure_structure(&self) -> Result<(), AppError> {
        for bucket in BUCKETS {
            fs::create_dir_all(self.root().join(bucket)).await?;
        }
        Ok(())
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, AppError> {
        if !BUCKETS.contains(&bucket) {
            return Err(AppError::NotFound);
        }
        validate_key(key)?;
        let mut path = self.root().join(bucket);
        for segment in key.split('/') {
            path.push(segment);
        }
        Ok(path)
    }

    pub async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), AppError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        debug!(bucket, key, bytes = data.len(), "stored object");
        Ok(())
    }

    pub async fn read_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, AppError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), AppError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(bucket, key, "object already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Best-effort cleanup; failures are logged and swallowed.
    pub async fn delete_objects(&self, bucket: &str, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.delete_object(bucket, key).await {
                warn!(bucket, key = %key, "failed to delete object: {err}");
            }
        }
    }

    pub async fn list_objects(&self, bucket: &str) -> Result<Vec<StoredObject>, AppError> {
        if !BUCKETS.contains(&bucket) {
            return Err(AppError::NotFound);
        }
        let base = self.root().join(bucket);
        if !fs::try_exists(&base).await? {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let Ok(relative) = path.strip_prefix(&base) else {
                        continue;
                    };
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    let size = entry.metadata().await?.len();
                    objects.push(StoredObject { key, size });
                }
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

/// Rejects keys that could escape the bucket directory or need escaping in URLs.
pub fn validate_key(key: &str) -> Result<(), AppError> {
    let invalid = || AppError::BadRequest(format!("invalid object key: {key:?}"));
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(invalid());
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_'))
    {
        return Err(invalid());
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    Ok(())
}

pub fn object_key_for_photo(
    user_uuid: &str,
    trip_id: i64,
    index: usize,
    file_name: &str,
    now: DateTime<Utc>,
) -> String {
    let ext = file_extension(file_name).unwrap_or_else(|| "jpg".into());
    format!(
        "{user_uuid}/{trip_id}/{}-{index}.{ext}",
        now.timestamp_millis()
    )
}

pub fn object_key_for_gpx(user_uuid: &str, trip_id: i64, file_name: &str) -> String {
    let ext = file_extension(file_name).unwrap_or_else(|| "gpx".into());
    format!("{user_uuid}/{trip_id}/track.{ext}")
}

fn file_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

/// Issues and checks expiring HMAC signatures for `/media` URLs.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Arc<Vec<u8>>,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: Arc::new(secret.as_ref().to_vec()),
            ttl,
        }
    }

    pub fn signed_url(&self, bucket: &str, key: &str) -> Result<String, AppError> {
        self.signed_url_with_ttl(bucket, key, self.ttl)
    }

    pub fn signed_url_with_ttl(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, AppError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let expires = Utc::now().timestamp().saturating_add(ttl_secs);
        self.signed_url_at(bucket, key, expires)
    }

    pub fn signed_url_at(&self, bucket: &str, key: &str, expires: i64) -> Result<String, AppError> {
        validate_key(key)?;
        let sig = self.signature(bucket, key, expires)?;
        Ok(format!("/media/{bucket}/{key}?expires={expires}&sig={sig}"))
    }

    pub fn signature(&self, bucket: &str, key: &str, expires: i64) -> Result<String, AppError> {
        let mac = self.mac(bucket, key, expires)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), AppError> {
        if expires < now {
            return Err(AppError::Forbidden);
        }
        let provided = hex::decode(signature).map_err(|_| AppError::Forbidden)?;
        self.mac(bucket, key, expires)?
            .verify_slice(&provided)
            .map_err(|_| AppError::Forbidden)
    }

    fn mac(&self, bucket: &str, key: &str, expires: i64) -> Result<HmacSha256, AppError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| AppError::Other(anyhow::anyhow!("signing key rejected: {err}")))?;
        mac.update(format!("{bucket}/{key}:{expires}").as_bytes());
        Ok(mac)
    }
}
