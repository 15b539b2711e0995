//! Blob storage for cropped figure images.

use super::{authorized_client, send};
use crate::config::ServiceSettings;
use crate::error::{IngestError, UpstreamError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const SERVICE: &str = "storage";

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload `bytes` to `path`, overwriting, and return its public URL.
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, UpstreamError>;
}

/// Supabase Storage (`{url}/storage/v1/object/{bucket}/{path}`).
pub struct SupabaseStorage {
    client: reqwest::Client,
    base: String,
    bucket: String,
    timeout_secs: u64,
}

impl SupabaseStorage {
    pub fn new(settings: &ServiceSettings) -> Result<Self, IngestError> {
        let url = settings.require_store_url()?;
        let key = settings.require_store_key()?;
        Ok(Self {
            client: authorized_client(key, settings.http_timeout_secs)?,
            base: format!("{url}/storage/v1/object"),
            bucket: settings.bucket.clone(),
            timeout_secs: settings.http_timeout_secs,
        })
    }

    pub fn public_url(&self, path: &str) -> String {
        format!("{}/public/{}/{}", self.base, self.bucket, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, UpstreamError> {
        let path = path.trim_start_matches('/');
        let size = bytes.len();
        let request = self
            .client
            .post(format!("{}/{}/{}", self.base, self.bucket, path))
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        send(SERVICE, request, self.timeout_secs).await?;
        debug!("Uploaded {} bytes to {}/{}", size, self.bucket, path);
        Ok(self.public_url(path))
    }
}

/// In-memory blob store; public URLs use the `memory://` scheme.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String, UpstreamError> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.to_string(), bytes);
        Ok(format!("memory://{path}"))
    }
}
