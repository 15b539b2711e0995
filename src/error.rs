//! Error types for the exam-ingest library.
//!
//! The pipeline distinguishes failures by how far they propagate:
//!
//! * [`IngestError`] — **Fatal**: the request cannot proceed at all (missing
//!   credential, bad request, document not a PDF, nothing could be
//!   persisted). Returned as `Err(IngestError)` from the top-level entry
//!   points and mapped to an HTTP status by [`IngestError::status_code`].
//!
//! * [`UpstreamError`] — one failed call to an external collaborator
//!   (model, cropping API, store, blob storage). [`UpstreamError::is_transient`]
//!   decides whether [`crate::pipeline::retry::retry_with_backoff`] tries again.
//!
//! * [`BatchError`] — **Non-fatal**: one page range produced no records.
//!   Stored inside [`crate::output::BatchReport`]; the run continues.
//!
//! * [`ExtractionParseError`] — the model reply could not be repaired into
//!   JSON. Treated by the caller as "zero records for this batch".
//!
//! * [`FigureError`] — a figure rectangle could not be placed on a page.

use thiserror::Error;

/// All fatal errors returned by the exam-ingest library.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// A required secret or endpoint is not configured.
    #[error("Missing required credential '{name}'\nSet it via --{flag} or the {env} environment variable.")]
    MissingCredential {
        name: &'static str,
        flag: &'static str,
        env: &'static str,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured LLM provider could not be initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Input errors ──────────────────────────────────────────────────────
    /// A required request field is missing or malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The referenced document does not exist in the store.
    #[error("Document '{document_id}' not found")]
    DocumentNotFound { document_id: String },

    /// Download of a source document failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The downloaded bytes are not a PDF.
    #[error("Document at '{url}' is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { url: String, magic: [u8; 4] },

    /// pdfium could not parse the document.
    #[error("PDF at '{url}' is corrupt: {detail}")]
    CorruptPdf { url: String, detail: String },

    /// The requested page window lies outside the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// pdfium failed to render a page.
    #[error("Failed to rasterise page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// The extracted items could not be written at all.
    #[error("Failed to persist items for document '{document_id}': {source}")]
    PersistFailed {
        document_id: String,
        #[source]
        source: UpstreamError,
    },

    /// A collaborator call failed where no degraded result is possible.
    #[error("{context}: {source}")]
    Upstream {
        context: String,
        #[source]
        source: UpstreamError,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngestError {
    /// HTTP status code used when this error is returned from a handler.
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::InvalidRequest(_)
            | IngestError::DownloadFailed { .. }
            | IngestError::DownloadTimeout { .. }
            | IngestError::NotAPdf { .. }
            | IngestError::CorruptPdf { .. }
            | IngestError::PageOutOfRange { .. } => 400,
            IngestError::DocumentNotFound { .. } => 404,
            IngestError::MissingCredential { .. }
            | IngestError::InvalidConfig(_)
            | IngestError::ProviderNotConfigured { .. }
            | IngestError::PdfiumBindingFailed(_)
            | IngestError::RasterisationFailed { .. }
            | IngestError::PersistFailed { .. }
            | IngestError::Upstream { .. }
            | IngestError::Internal(_) => 500,
        }
    }
}

/// A failed call to an external collaborator.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum UpstreamError {
    /// Connection refused, DNS failure, reset, etc.
    #[error("{service}: transport error: {detail}")]
    Transport { service: String, detail: String },

    /// The collaborator answered with a non-success status.
    #[error("{service}: HTTP {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    /// HTTP 429 or a provider-specific quota error.
    #[error("{service}: rate limit exceeded")]
    RateLimited { service: String },

    /// The call did not complete within its deadline.
    #[error("{service}: timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    /// Credentials were rejected (401/403).
    #[error("{service}: authentication rejected: {detail}")]
    Unauthorized { service: String, detail: String },

    /// The reply arrived but was unusable (empty body, wrong shape).
    #[error("{service}: invalid response: {detail}")]
    InvalidResponse { service: String, detail: String },
}

impl UpstreamError {
    /// Whether retrying the same call may succeed.
    ///
    /// Transport failures, timeouts, rate limits, 5xx and empty replies are
    /// transient. Authentication failures and other 4xx are not.
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Transport { .. }
            | UpstreamError::RateLimited { .. }
            | UpstreamError::Timeout { .. }
            | UpstreamError::InvalidResponse { .. } => true,
            UpstreamError::Status { status, .. } => *status >= 500 || *status == 408,
            UpstreamError::Unauthorized { .. } => false,
        }
    }

    /// Classify an HTTP status returned by `service`.
    pub fn from_status(service: &str, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => UpstreamError::RateLimited {
                service: service.to_string(),
            },
            401 | 403 => UpstreamError::Unauthorized {
                service: service.to_string(),
                detail: body,
            },
            _ => UpstreamError::Status {
                service: service.to_string(),
                status,
                body,
            },
        }
    }

    /// Classify a `reqwest` transport error raised while calling `service`.
    pub fn from_reqwest(service: &str, err: &reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout {
                service: service.to_string(),
                secs: timeout_secs,
            }
        } else if let Some(status) = err.status() {
            Self::from_status(service, status.as_u16(), err.to_string())
        } else {
            UpstreamError::Transport {
                service: service.to_string(),
                detail: err.to_string(),
            }
        }
    }
}

/// A non-fatal error for a single page range.
///
/// Stored alongside [`crate::output::BatchReport`] when a batch yields no
/// records. The run continues with the next range.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum BatchError {
    /// Rendering the range's pages failed.
    #[error("Pages {start}-{end}: rendering failed: {detail}")]
    RenderFailed {
        start: usize,
        end: usize,
        detail: String,
    },

    /// The model call failed after every retry.
    #[error("Pages {start}-{end}: model call failed after {attempts} attempts: {detail}")]
    ModelFailed {
        start: usize,
        end: usize,
        attempts: u32,
        detail: String,
    },

    /// The model replied but nothing parseable could be recovered.
    #[error("Pages {start}-{end}: {source}")]
    Unparseable {
        start: usize,
        end: usize,
        source: ExtractionParseError,
    },
}

/// The model reply could not be turned into JSON by any repair stage.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
#[error("unparseable model response ({raw_len} bytes), starts with {prefix:?}")]
pub struct ExtractionParseError {
    /// Length in bytes of the raw reply.
    pub raw_len: usize,
    /// Bounded prefix of the raw reply for diagnostics.
    pub prefix: String,
}

/// A figure rectangle could not be placed on a page.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FigureError {
    #[error("figure on page {page} has no reference page dimensions")]
    MissingDimensions { page: usize },

    #[error("figure page {page} is outside the document ({total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    #[error("page dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: f64, height: f64 },
}
