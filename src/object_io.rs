//! Object-store I/O: uploads, downloads, presigned read URLs, and
//! prefix-scoped listing/deletion.
//!
//! Two backends share one interface: S3-compatible storage for
//! production, and a local directory root for development and tests.
//! Blob references travel through the system as `s3://bucket/key` URIs;
//! helpers here convert between URIs and keys. Uploads record a sha-256
//! digest and byte size so artifacts are content-addressable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use walkdir::WalkDir;

/// Result of an upload: the stable reference plus content identity.
#[derive(Debug, Clone)]
pub struct UploadedBlob {
    pub blob_url: String,
    pub blob_key: String,
    pub size_bytes: i64,
    pub sha256: String,
}

enum Backend {
    S3(Client),
    /// Files under `root/<key>`; presigned URLs are synthetic.
    Local(PathBuf),
}

#[derive(Clone)]
pub struct ObjectIO {
    backend: Arc<Backend>,
    bucket: String,
}

impl ObjectIO {
    /// Build from ambient AWS configuration (env, profile, instance role).
    pub async fn from_env(bucket: &str, endpoint: Option<&str>) -> Self {
        let base = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            backend: Arc::new(Backend::S3(Client::from_conf(builder.build()))),
            bucket: bucket.to_string(),
        }
    }

    /// Build with fixed credentials; used by tests that exercise only
    /// local signing.
    pub fn with_static_credentials(bucket: &str, region: &str, endpoint: Option<&str>) -> Self {
        let credentials =
            aws_sdk_s3::config::Credentials::new("test-access", "test-secret", None, None, "static");
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.to_string()))
            .credentials_provider(credentials);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self {
            backend: Arc::new(Backend::S3(Client::from_conf(builder.build()))),
            bucket: bucket.to_string(),
        }
    }

    /// Directory-backed store rooted at `root`.
    pub fn local(bucket: &str, root: &Path) -> Self {
        Self {
            backend: Arc::new(Backend::Local(root.to_path_buf())),
            bucket: bucket.to_string(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// `key -> s3://bucket/key`.
    pub fn blob_url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    /// Accepts `s3://bucket/key`, a presigned/plain HTTP URL, or a bare
    /// key, and returns the key.
    pub fn key_from_ref(&self, blob_ref: &str) -> String {
        if let Some(rest) = blob_ref.strip_prefix("s3://") {
            return rest
                .split_once('/')
                .map(|(_, key)| key.to_string())
                .unwrap_or_else(|| rest.to_string());
        }
        if blob_ref.starts_with("http://") || blob_ref.starts_with("https://") {
            let marker = format!("{}/", self.bucket);
            if let Some(pos) = blob_ref.find(&marker) {
                let key = &blob_ref[pos + marker.len()..];
                return key.split('?').next().unwrap_or(key).to_string();
            }
        }
        blob_ref.to_string()
    }

    fn local_path(root: &Path, key: &str) -> PathBuf {
        root.join(key)
    }

    /// Upload a local file, guessing Content-Type from the key.
    pub async fn upload_file(&self, path: &Path, key: &str) -> Result<UploadedBlob> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {} for upload", path.display()))?;
        let size_bytes = bytes.len() as i64;
        let sha256 = hex_digest(&bytes);

        match self.backend.as_ref() {
            Backend::S3(client) => {
                client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type(guess_content_type(key))
                    .body(ByteStream::from(bytes))
                    .send()
                    .await
                    .with_context(|| format!("Failed to upload s3://{}/{}", self.bucket, key))?;
            }
            Backend::Local(root) => {
                let target = Self::local_path(root, key);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .context("Failed to create blob directory")?;
                }
                tokio::fs::write(&target, bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", target.display()))?;
            }
        }

        Ok(UploadedBlob {
            blob_url: self.blob_url(key),
            blob_key: key.to_string(),
            size_bytes,
            sha256,
        })
    }

    /// Upload every file under a local directory to `prefix/relative-path`.
    pub async fn upload_dir(&self, dir: &Path, prefix: &str) -> Result<Vec<UploadedBlob>> {
        let mut uploaded = Vec::new();
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .context("Walked path outside upload root")?;
            let key = format!(
                "{}/{}",
                prefix.trim_end_matches('/'),
                relative.to_string_lossy()
            );
            uploaded.push(self.upload_file(entry.path(), &key).await?);
        }
        Ok(uploaded)
    }

    /// Download a blob to an explicit local path.
    pub async fn download_to(&self, blob_ref: &str, path: &Path) -> Result<()> {
        let key = self.key_from_ref(blob_ref);
        match self.backend.as_ref() {
            Backend::S3(client) => {
                let object = client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .with_context(|| format!("Failed to fetch s3://{}/{}", self.bucket, key))?;
                let data = object
                    .body
                    .collect()
                    .await
                    .context("Failed to read object body")?;
                tokio::fs::write(path, data.into_bytes())
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
            Backend::Local(root) => {
                let source = Self::local_path(root, &key);
                tokio::fs::copy(&source, path)
                    .await
                    .with_context(|| format!("Failed to fetch blob {}", source.display()))?;
            }
        }
        Ok(())
    }

    /// Download a blob to a temp file that is removed when the returned
    /// path guard drops. The suffix is preserved so ffmpeg can sniff the
    /// container format.
    pub async fn download_temp(&self, blob_ref: &str) -> Result<TempPath> {
        let key = self.key_from_ref(blob_ref);
        let suffix = Path::new(&key)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| ".tmp".to_string());
        let file = tempfile::Builder::new()
            .prefix("vidforge-")
            .suffix(&suffix)
            .tempfile()
            .context("Failed to create temp file")?;
        let path = file.into_temp_path();
        self.download_to(blob_ref, &path).await?;
        Ok(path)
    }

    /// Presigned GET URL for a blob reference.
    pub async fn presign(&self, blob_ref: &str, ttl: Duration) -> Result<String> {
        let key = self.key_from_ref(blob_ref);
        match self.backend.as_ref() {
            Backend::S3(client) => {
                let config = PresigningConfig::expires_in(ttl).context("Invalid presign TTL")?;
                let request = client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .presigned(config)
                    .await
                    .with_context(|| format!("Failed to presign s3://{}/{}", self.bucket, key))?;
                Ok(request.uri().to_string())
            }
            Backend::Local(_) => Ok(format!(
                "https://local.invalid/{}/{}?X-Amz-Signature=local&X-Amz-Expires={}",
                self.bucket,
                key,
                ttl.as_secs()
            )),
        }
    }

    /// All keys under a prefix.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        match self.backend.as_ref() {
            Backend::S3(client) => {
                let mut keys = Vec::new();
                let mut pages = client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .into_paginator()
                    .send();
                while let Some(page) = pages.next().await {
                    let page = page.context("Failed to list objects")?;
                    for object in page.contents() {
                        if let Some(key) = object.key() {
                            keys.push(key.to_string());
                        }
                    }
                }
                Ok(keys)
            }
            Backend::Local(root) => {
                let mut keys = Vec::new();
                for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let key = entry
                        .path()
                        .strip_prefix(root)
                        .context("Walked path outside blob root")?
                        .to_string_lossy()
                        .replace(std::path::MAIN_SEPARATOR, "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
                keys.sort();
                Ok(keys)
            }
        }
    }

    /// Delete every object under a prefix, in batches of 1000.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        };
        let keys = self.list_prefix(&prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        match self.backend.as_ref() {
            Backend::S3(client) => {
                let mut deleted = 0usize;
                for batch in keys.chunks(1000) {
                    let objects = batch
                        .iter()
                        .map(|key| {
                            ObjectIdentifier::builder()
                                .key(key)
                                .build()
                                .map_err(|e| anyhow!("Invalid object key: {}", e))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let delete = Delete::builder()
                        .set_objects(Some(objects))
                        .build()
                        .map_err(|e| anyhow!("Invalid delete request: {}", e))?;
                    let out = client
                        .delete_objects()
                        .bucket(&self.bucket)
                        .delete(delete)
                        .send()
                        .await
                        .context("Failed to delete objects")?;
                    deleted += out.deleted().len();
                }
                Ok(deleted)
            }
            Backend::Local(root) => {
                let mut deleted = 0usize;
                for key in &keys {
                    if tokio::fs::remove_file(Self::local_path(root, key)).await.is_ok() {
                        deleted += 1;
                    }
                }
                Ok(deleted)
            }
        }
    }
}

/// Object-store key for one file of a video, per the canonical layout
/// `{owner}/videos/{video_id}/{file}`.
pub fn video_key(owner_id: &str, video_id: &str, file: &str) -> String {
    format!("{}/videos/{}/{}", owner_id, video_id, file)
}

/// Prefix holding every blob of a video.
pub fn video_prefix(owner_id: &str, video_id: &str) -> String {
    format!("{}/videos/{}/", owner_id, video_id)
}

fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| match Path::new(key).extension().and_then(|e| e.to_str()) {
            Some("mp4") => "video/mp4".to_string(),
            Some("png") => "image/png".to_string(),
            Some("jpg" | "jpeg") => "image/jpeg".to_string(),
            Some("mp3") => "audio/mpeg".to_string(),
            Some("wav") => "audio/wav".to_string(),
            _ => "application/octet-stream".to_string(),
        })
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
