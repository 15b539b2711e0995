//! Configuration for paper analysis runs.
//!
//! Two structs split the knobs by who owns them:
//!
//! * [`PipelineConfig`] — how a run behaves (batch size, overlap, retries,
//!   model settings, side-effect pacing). Built via [`PipelineConfigBuilder`],
//!   which validates the combination before any processing starts.
//! * [`ServiceSettings`] — where the external collaborators live and the
//!   secrets needed to reach them. Missing values surface as
//!   [`IngestError::MissingCredential`] the moment a collaborator is built.

use crate::error::IngestError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;

/// Configuration for a paper analysis run.
///
/// # Example
/// ```rust
/// use exam_ingest::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .batch_size(8)
///     .overlap(1)
///     .model("gemini-2.0-flash")
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 8);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Pages per extraction call. Default: 10.
    pub batch_size: usize,

    /// Pages shared between consecutive batches. Must be `< batch_size`. Default: 1.
    ///
    /// A question that starts at the bottom of page 10 and ends on page 11 is
    /// seen whole by the batch that starts at page 10; the merger folds the
    /// two sightings back into one record.
    pub overlap: usize,

    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// LLM model identifier, e.g. "gemini-2.0-flash".
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per batch. Default: 16384.
    pub max_tokens: usize,

    /// Attempts per extraction call, first try included. Default: 3.
    pub max_attempts: u32,

    /// Attempts per answer-key extraction call. Default: 5.
    pub answer_key_attempts: u32,

    /// Initial backoff in milliseconds; doubles per retry. Default: 1000.
    pub retry_backoff_ms: u64,

    /// Concurrent side-effect calls per group (1–5). Default: 3.
    pub side_effect_group_size: usize,

    /// Pause between side-effect groups in milliseconds. Default: 1000.
    pub side_effect_pause_ms: u64,

    /// Attempts per side-effect call (crop, upload, rationale). Default: 3.
    pub side_effect_attempts: u32,

    /// Padding added around figure crops, in points. Default: 10.
    pub crop_padding_pt: f64,

    /// Custom extraction instruction. If None, uses the built-in one.
    pub system_prompt: Option<String>,

    /// Download timeout for source documents in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Per-model-call timeout in seconds. Default: 180.
    pub api_timeout_secs: u64,

    /// Optional observer for batch progress.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            overlap: 1,
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 16384,
            max_attempts: 3,
            answer_key_attempts: 5,
            retry_backoff_ms: 1000,
            side_effect_group_size: 3,
            side_effect_pause_ms: 1000,
            side_effect_attempts: 3,
            crop_padding_pt: 10.0,
            system_prompt: None,
            download_timeout_secs: 120,
            api_timeout_secs: 180,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("batch_size", &self.batch_size)
            .field("overlap", &self.overlap)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_attempts", &self.max_attempts)
            .field("answer_key_attempts", &self.answer_key_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("side_effect_group_size", &self.side_effect_group_size)
            .field("side_effect_pause_ms", &self.side_effect_pause_ms)
            .field("crop_padding_pt", &self.crop_padding_pt)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n;
        self
    }

    pub fn overlap(mut self, n: usize) -> Self {
        self.config.overlap = n;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn answer_key_attempts(mut self, n: u32) -> Self {
        self.config.answer_key_attempts = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn side_effect_group_size(mut self, n: usize) -> Self {
        self.config.side_effect_group_size = n;
        self
    }

    pub fn side_effect_pause_ms(mut self, ms: u64) -> Self {
        self.config.side_effect_pause_ms = ms;
        self
    }

    pub fn side_effect_attempts(mut self, n: u32) -> Self {
        self.config.side_effect_attempts = n.max(1);
        self
    }

    pub fn crop_padding_pt(mut self, pt: f64) -> Self {
        self.config.crop_padding_pt = pt.max(0.0);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, IngestError> {
        let c = &self.config;
        if c.batch_size == 0 {
            return Err(IngestError::InvalidConfig(
                "batch size must be ≥ 1".into(),
            ));
        }
        if c.overlap >= c.batch_size {
            return Err(IngestError::InvalidConfig(format!(
                "overlap ({}) must be smaller than batch size ({})",
                c.overlap, c.batch_size
            )));
        }
        if !(1..=5).contains(&c.side_effect_group_size) {
            return Err(IngestError::InvalidConfig(format!(
                "side-effect group size must be 1–5, got {}",
                c.side_effect_group_size
            )));
        }
        if c.api_timeout_secs == 0 || c.download_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "timeouts must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Service settings ─────────────────────────────────────────────────────

/// Default storage bucket for cropped figures.
pub const DEFAULT_BUCKET: &str = "exam-papers";

/// Default endpoint of the cropping API.
pub const DEFAULT_CROP_ENDPOINT: &str = "https://api.pdf.co/v1/pdf/convert/to/png";

/// Locations and secrets of the external collaborators.
#[derive(Clone)]
pub struct ServiceSettings {
    /// Base URL of the store, e.g. `https://xyz.supabase.co`.
    pub store_url: Option<String>,
    /// Service-role key used for both the relational store and blob storage.
    pub store_key: Option<String>,
    /// Blob storage bucket for figure images.
    pub bucket: String,
    /// API key for the cropping service.
    pub crop_api_key: Option<String>,
    /// Endpoint of the cropping service.
    pub crop_endpoint: String,
    /// Timeout for store, blob and cropper calls, in seconds.
    pub http_timeout_secs: u64,
}

impl fmt::Debug for ServiceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ServiceSettings")
            .field("store_url", &self.store_url)
            .field("store_key", &redact(&self.store_key))
            .field("bucket", &self.bucket)
            .field("crop_api_key", &redact(&self.crop_api_key))
            .field("crop_endpoint", &self.crop_endpoint)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish()
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceSettings {
    /// Settings with defaults for everything except the secrets.
    pub fn new() -> Self {
        Self {
            store_url: None,
            store_key: None,
            bucket: DEFAULT_BUCKET.to_string(),
            crop_api_key: None,
            crop_endpoint: DEFAULT_CROP_ENDPOINT.to_string(),
            http_timeout_secs: 60,
        }
    }

    /// Store base URL without a trailing slash.
    pub fn require_store_url(&self) -> Result<&str, IngestError> {
        non_empty(&self.store_url)
            .map(|u| u.trim_end_matches('/'))
            .ok_or(IngestError::MissingCredential {
                name: "store url",
                flag: "supabase-url",
                env: "SUPABASE_URL",
            })
    }

    pub fn require_store_key(&self) -> Result<&str, IngestError> {
        non_empty(&self.store_key).ok_or(IngestError::MissingCredential {
            name: "store service key",
            flag: "supabase-key",
            env: "SUPABASE_SERVICE_ROLE_KEY",
        })
    }

    pub fn require_crop_api_key(&self) -> Result<&str, IngestError> {
        non_empty(&self.crop_api_key).ok_or(IngestError::MissingCredential {
            name: "cropping API key",
            flag: "pdf-co-key",
            env: "PDF_CO_API_KEY",
        })
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
