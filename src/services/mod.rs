//! External collaborators: item store, blob storage, figure cropper.
//!
//! Each sits behind an async trait with a production REST adapter (reqwest)
//! and, for the store and blob storage, an in-memory implementation used by
//! tests and dry runs.

pub mod blob;
pub mod cropper;
pub mod store;

pub use blob::{BlobStore, MemoryBlobStore, SupabaseStorage};
pub use cropper::{CropRequest, FigureCropper, PdfCoCropper};
pub use store::{AnswerUpdate, DocumentContext, ItemStore, MemoryStore, PostgrestStore, Topic};

use crate::error::{IngestError, UpstreamError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::Duration;

/// Build a client that sends the service-role key on every request.
pub(crate) fn authorized_client(key: &str, timeout_secs: u64) -> Result<reqwest::Client, IngestError> {
    let mut headers = HeaderMap::new();
    let key_value = HeaderValue::from_str(key.trim())
        .map_err(|_| IngestError::InvalidConfig("service key contains invalid characters".into()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", key.trim()))
        .map_err(|_| IngestError::InvalidConfig("service key contains invalid characters".into()))?;
    headers.insert("apikey", key_value);
    headers.insert(AUTHORIZATION, bearer);

    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .default_headers(headers)
        .build()
        .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))
}

/// Send a request and turn transport failures and non-2xx statuses into
/// [`UpstreamError`]s.
pub(crate) async fn send(
    service: &str,
    request: reqwest::RequestBuilder,
    timeout_secs: u64,
) -> Result<reqwest::Response, UpstreamError> {
    let response = request
        .send()
        .await
        .map_err(|e| UpstreamError::from_reqwest(service, &e, timeout_secs))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(UpstreamError::from_status(service, status.as_u16(), truncate(&body, 500)))
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
