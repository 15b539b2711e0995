//! Input resolution: fetch a document URL (or accept a local path) and
//! validate that it is a PDF.
//!
//! pdfium opens documents from a file-system path, so downloads land in a
//! `TempDir` that is removed when the [`ResolvedInput`] is dropped. The `%PDF`
//! magic bytes are checked before anything is handed to pdfium so callers
//! get [`IngestError::NotAPdf`] instead of a pdfium parse failure.

use crate::error::IngestError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A document available on the local file system.
#[derive(Debug)]
pub enum ResolvedInput {
    /// The caller passed a local file.
    Local(PathBuf),
    /// The document was downloaded; `_temp_dir` keeps the file alive.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a URL or local path to a validated PDF on disk.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, IngestError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, IngestError> {
    let path = PathBuf::from(path_str);
    let bytes = std::fs::read(&path).map_err(|e| IngestError::DownloadFailed {
        url: path_str.to_string(),
        reason: e.to_string(),
    })?;
    check_magic(path_str, &bytes)?;
    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, IngestError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            IngestError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            IngestError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(IngestError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            IngestError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            IngestError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;
    check_magic(url, &bytes)?;

    let temp_dir = TempDir::new().map_err(|e| IngestError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(filename_from_url(url));
    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| IngestError::Internal(format!("Failed to write temp file: {e}")))?;

    info!("Downloaded {} bytes to {}", bytes.len(), file_path.display());
    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Reject anything that does not start with `%PDF`.
pub fn check_magic(source: &str, bytes: &[u8]) -> Result<(), IngestError> {
    if bytes.starts_with(b"%PDF") {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    Err(IngestError::NotAPdf {
        url: source.to_string(),
        magic,
    })
}

fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|last| last.ends_with(".pdf") && !last.contains(['/', '\\']))
        .unwrap_or_else(|| "document.pdf".to_string())
}
