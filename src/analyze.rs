//! Analysis entry points.
//!
//! [`analyze_document`] runs the whole pipeline for one paper:
//!
//! ```text
//! lookup ─▶ load ─▶ partition ─▶ extract (per range) ─▶ merge ─▶ coerce
//!        ─▶ upsert ─▶ crop figures ─▶ [answer key] ─▶ AnalysisSummary
//! ```
//!
//! Only a bad request, an unknown document, an unreadable PDF, a missing
//! credential or a failed upsert end the run with an error. Everything after
//! the upsert degrades to counted warnings.

use crate::answer_key::{extract_answer_key, plan_answers};
use crate::config::{PipelineConfig, ServiceSettings};
use crate::error::IngestError;
use crate::output::{AnalysisSummary, AnswerKeySummary};
use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::extract::{extract_batch, ExtractionModel, LlmExtractionModel};
use crate::pipeline::merge::merge_records;
use crate::pipeline::partition::{partition_window, PageRange};
use crate::pipeline::render::{DocumentLoader, PdfiumLoader};
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use crate::pipeline::validate::coerce_records;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::{extraction_context, extraction_prompt, with_output_format};
use crate::records::{PaperCategory, PersistedItem};
use crate::services::{
    BlobStore, FigureCropper, ItemStore, PdfCoCropper, PostgrestStore, SupabaseStorage,
};
use edgequake_llm::{LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Body of `POST /analyze`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub document_id: String,
    pub document_url: String,
    #[serde(default)]
    pub answer_key_url: Option<String>,
    pub category: String,
    #[serde(default)]
    pub start_page: Option<usize>,
    #[serde(default)]
    pub end_page: Option<usize>,
}

impl AnalyzeRequest {
    /// Check required fields and parse the category.
    pub fn validate(&self) -> Result<PaperCategory, IngestError> {
        require("documentId", &self.document_id)?;
        require("documentUrl", &self.document_url)?;
        let category = self
            .category
            .parse::<PaperCategory>()
            .map_err(IngestError::InvalidRequest)?;
        if self.start_page == Some(0) || self.end_page == Some(0) {
            return Err(IngestError::InvalidRequest(
                "page numbers are 1-indexed".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_page, self.end_page) {
            if end < start {
                return Err(IngestError::InvalidRequest(format!(
                    "endPage ({end}) is before startPage ({start})"
                )));
            }
        }
        Ok(category)
    }

    fn answer_key_url(&self) -> Option<&str> {
        self.answer_key_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Body of `POST /answer-key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerKeyRequest {
    pub document_id: String,
    pub answer_key_url: String,
}

impl AnswerKeyRequest {
    pub fn validate(&self) -> Result<(), IngestError> {
        require("documentId", &self.document_id)?;
        require("answerKeyUrl", &self.answer_key_url)
    }
}

fn require(field: &str, value: &str) -> Result<(), IngestError> {
    if value.trim().is_empty() {
        Err(IngestError::InvalidRequest(format!("{field} is required")))
    } else {
        Ok(())
    }
}

/// The collaborators a run talks to.
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn ExtractionModel>,
    pub store: Arc<dyn ItemStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub cropper: Arc<dyn FigureCropper>,
    pub loader: Arc<dyn DocumentLoader>,
}

impl Services {
    /// Production wiring: LLM provider, PostgREST store, Supabase storage,
    /// cropping API and the pdfium loader.
    ///
    /// # Errors
    /// [`IngestError::MissingCredential`] or
    /// [`IngestError::ProviderNotConfigured`] when something is not set up.
    pub async fn connect(settings: &ServiceSettings, config: &PipelineConfig) -> Result<Self, IngestError> {
        let provider = resolve_provider(config).await?;
        let label = config
            .model
            .clone()
            .or_else(|| config.provider_name.clone())
            .unwrap_or_else(|| "llm".to_string());
        Ok(Self {
            model: Arc::new(LlmExtractionModel::new(
                provider,
                label,
                config.temperature,
                config.max_tokens,
                config.api_timeout_secs,
            )),
            store: Arc::new(PostgrestStore::new(settings)?),
            blobs: Arc::new(SupabaseStorage::new(settings)?),
            cropper: Arc::new(PdfCoCropper::new(settings)?),
            loader: Arc::new(PdfiumLoader {
                download_timeout_secs: config.download_timeout_secs,
                max_rendered_pixels: config.max_rendered_pixels,
            }),
        })
    }

    fn dispatcher<'a>(&'a self, config: &PipelineConfig) -> Dispatcher<'a> {
        Dispatcher::new(
            self.store.as_ref(),
            self.blobs.as_ref(),
            self.cropper.as_ref(),
            self.model.as_ref(),
            config,
        )
    }
}

/// Analyse one paper and persist its questions.
///
/// # Errors
/// Fatal errors only; see the module docs. A run in which every batch
/// failed still returns `Ok` with `success: false`.
pub async fn analyze_document(
    services: &Services,
    request: &AnalyzeRequest,
    config: &PipelineConfig,
) -> Result<AnalysisSummary, IngestError> {
    let run_start = Instant::now();
    let category = request.validate()?;
    let document_id = request.document_id.trim();
    let progress = progress_of(config);
    info!("Analysing document {} ({})", document_id, category);

    // ── Step 1: Document context ─────────────────────────────────────────
    let context = services
        .store
        .document_context(document_id)
        .await
        .map_err(|source| IngestError::Upstream {
            context: format!("looking up document '{document_id}'"),
            source,
        })?
        .ok_or_else(|| IngestError::DocumentNotFound {
            document_id: document_id.to_string(),
        })?;

    // ── Step 2: Load and partition ───────────────────────────────────────
    let source = services.loader.load(request.document_url.trim()).await?;
    let total_pages = source.page_count();
    let start = request.start_page.unwrap_or(1);
    if total_pages > 0 && start > total_pages {
        return Err(IngestError::PageOutOfRange {
            page: start,
            total: total_pages,
        });
    }
    let end = request.end_page.unwrap_or(total_pages).max(start);
    let ranges = partition_window(
        PageRange::new(start, end),
        total_pages,
        config.batch_size,
        config.overlap,
    )?;
    progress.on_run_start(total_pages, ranges.len());

    let mut summary = AnalysisSummary {
        total_pages,
        batches_total: ranges.len(),
        ..Default::default()
    };

    // ── Step 3: Extract every range ──────────────────────────────────────
    let instruction = with_output_format(
        config
            .system_prompt
            .as_deref()
            .unwrap_or_else(|| extraction_prompt(category)),
    );
    let policy = RetryPolicy::new(config.max_attempts, config.retry_backoff_ms);
    let mut raw = Vec::new();

    for (i, range) in ranges.iter().copied().enumerate() {
        let batch = i + 1;
        progress.on_batch_start(batch, ranges.len(), range);
        let report = extract_batch(
            services.model.as_ref(),
            source.as_ref(),
            range,
            &instruction,
            extraction_context(context.subject_name.as_deref(), &context.topics, range),
            policy,
        )
        .await;
        summary.input_tokens += report.input_tokens;
        summary.output_tokens += report.output_tokens;

        match &report.error {
            Some(error) => {
                summary.batches_failed += 1;
                summary.warnings.push(error.to_string());
                progress.on_batch_error(batch, ranges.len(), &error.to_string());
            }
            None => progress.on_batch_complete(batch, ranges.len(), report.records.len()),
        }
        raw.extend(report.records);
    }

    // ── Step 4: Merge and coerce ─────────────────────────────────────────
    let merged = merge_records(raw);
    let allowed: HashSet<&str> = context.topics.iter().map(|t| t.id.as_str()).collect();
    let coerced = coerce_records(document_id, category, merged, &allowed, |page| {
        source.page_dimensions(page)
    });
    summary.figures_detected = coerced.figures_detected;
    summary.warnings.extend(coerced.warnings);

    // ── Step 5: Persist ──────────────────────────────────────────────────
    let stored = persist(services, document_id, &coerced.items, config).await?;
    summary.items_extracted = stored.len();
    progress.on_items_persisted(stored.len());

    // ── Step 6: Side effects ─────────────────────────────────────────────
    let dispatcher = services.dispatcher(config);
    let crops = dispatcher
        .crop_figures(request.document_url.trim(), &stored)
        .await;
    summary.figures_attempted = crops.attempted;
    summary.figures_cropped = crops.succeeded;
    summary.warnings.extend(crops.warnings);

    if let Some(key_url) = request.answer_key_url() {
        let answers = answer_pass(services, &dispatcher, &stored, key_url, config).await;
        summary.answers_attempted = answers.answers_attempted;
        summary.answers_extracted = answers.answers_extracted;
        summary.warnings.extend(answers.warnings);
    }

    summary.success = summary.batches_failed < summary.batches_total || summary.batches_total == 0;
    progress.on_run_complete(summary.items_extracted, summary.batches_failed);
    info!(
        "Analysis of {} complete: {} items, {}/{} figures, {}/{} answers, {} failed batches, {}ms",
        document_id,
        summary.items_extracted,
        summary.figures_cropped,
        summary.figures_attempted,
        summary.answers_extracted,
        summary.answers_attempted,
        summary.batches_failed,
        run_start.elapsed().as_millis()
    );
    Ok(summary)
}

/// Run only the answer-key pass for an already analysed paper.
///
/// # Errors
/// Invalid request, unknown document, or an answer-key PDF that cannot be
/// loaded.
pub async fn process_answer_key(
    services: &Services,
    request: &AnswerKeyRequest,
    config: &PipelineConfig,
) -> Result<AnswerKeySummary, IngestError> {
    request.validate()?;
    let document_id = request.document_id.trim();

    let items = services
        .store
        .items_for_document(document_id)
        .await
        .map_err(|source| IngestError::Upstream {
            context: format!("loading items of '{document_id}'"),
            source,
        })?;
    if items.is_empty() {
        return Err(IngestError::DocumentNotFound {
            document_id: document_id.to_string(),
        });
    }

    let source = services.loader.load(request.answer_key_url.trim()).await?;
    let extraction = extract_answer_key(services.model.as_ref(), source.as_ref(), config).await?;
    let plans = plan_answers(&items, &extraction.entries);
    let tally = services.dispatcher(config).apply_answers(plans).await;

    let mut warnings = extraction.warnings;
    warnings.extend(tally.warnings);
    Ok(AnswerKeySummary {
        success: tally.succeeded > 0 || tally.attempted == 0,
        answers_attempted: tally.attempted,
        answers_extracted: tally.succeeded,
        warnings,
    })
}

/// The answer-key pass inside a full analysis. Never fatal.
async fn answer_pass(
    services: &Services,
    dispatcher: &Dispatcher<'_>,
    items: &[PersistedItem],
    key_url: &str,
    config: &PipelineConfig,
) -> AnswerKeySummary {
    let loaded = match services.loader.load(key_url).await {
        Ok(source) => extract_answer_key(services.model.as_ref(), source.as_ref(), config).await,
        Err(e) => Err(e),
    };
    let extraction = match loaded {
        Ok(extraction) => extraction,
        Err(e) => {
            warn!("Answer key skipped: {}", e);
            return AnswerKeySummary {
                warnings: vec![format!("Answer key skipped: {e}")],
                ..Default::default()
            };
        }
    };

    let tally = dispatcher
        .apply_answers(plan_answers(items, &extraction.entries))
        .await;
    let mut warnings = extraction.warnings;
    warnings.extend(tally.warnings);
    AnswerKeySummary {
        success: tally.succeeded > 0 || tally.attempted == 0,
        answers_attempted: tally.attempted,
        answers_extracted: tally.succeeded,
        warnings,
    }
}

/// Upsert `items`, retrying transient store failures.
async fn persist(
    services: &Services,
    document_id: &str,
    items: &[PersistedItem],
    config: &PipelineConfig,
) -> Result<Vec<PersistedItem>, IngestError> {
    if items.is_empty() {
        warn!("No questions extracted from {}", document_id);
        return Ok(Vec::new());
    }
    let policy = RetryPolicy::new(config.side_effect_attempts, config.retry_backoff_ms);
    let stored = retry_with_backoff(policy, "upsert", |_| services.store.upsert_items(items))
        .await
        .map_err(|exhausted| IngestError::PersistFailed {
            document_id: document_id.to_string(),
            source: exhausted.last_error,
        })?;
    info!("Persisted {} items for {}", stored.len(), document_id);
    Ok(stored)
}

fn progress_of(config: &PipelineConfig) -> ProgressCallback {
    config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback))
}

// ── Provider resolution ──────────────────────────────────────────────────

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Environment variable naming the LLM provider.
pub const PROVIDER_ENV: &str = "EXAM_INGEST_LLM_PROVIDER";

/// Environment variable naming the model.
pub const MODEL_ENV: &str = "EXAM_INGEST_MODEL";

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, most specific first:
///
/// 1. `config.provider`, used as-is
/// 2. `config.provider_name` with `config.model`
/// 3. `EXAM_INGEST_LLM_PROVIDER` + `EXAM_INGEST_MODEL`, when both are set
/// 4. Gemini when `GEMINI_API_KEY` is set
/// 5. [`ProviderFactory::from_env`] auto-detection
pub async fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (std::env::var(PROVIDER_ENV), std::env::var(MODEL_ENV)) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.is_empty() {
            let model = config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL);
            return create_vision_provider("gemini", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
