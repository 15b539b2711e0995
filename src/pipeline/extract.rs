//! Extraction client: one model call per page range.
//!
//! The model sits behind [`ExtractionModel`] so runs can be driven by a
//! scripted fake. [`LlmExtractionModel`] is the production adapter over an
//! `edgequake_llm` provider.
//!
//! ## Message layout
//!
//! 1. **System message** — the instruction (extraction, mark scheme, …)
//! 2. **User message** — per-call context text plus the page images
//!
//! A failed range never aborts the run: every outcome, success or not, comes
//! back as a [`BatchReport`].

use crate::error::{BatchError, UpstreamError};
use crate::output::BatchReport;
use crate::pipeline::partition::PageRange;
use crate::pipeline::render::PageSource;
use crate::pipeline::repair::repair_json;
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use crate::pipeline::shapes;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, LlmError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Input to one model call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub instruction: String,
    pub context: String,
    pub attachments: Vec<ImageData>,
}

impl ModelRequest {
    /// A text-only request.
    pub fn text(instruction: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            context: context.into(),
            attachments: Vec::new(),
        }
    }
}

/// Text and token usage of one model reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelReply {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A multimodal model the pipeline can ask for JSON.
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    /// Label used in logs and errors.
    fn name(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError>;
}

/// [`ExtractionModel`] backed by an `edgequake_llm` provider.
pub struct LlmExtractionModel {
    provider: Arc<dyn LLMProvider>,
    name: String,
    options: CompletionOptions,
    timeout: Duration,
}

impl LlmExtractionModel {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        name: impl Into<String>,
        temperature: f32,
        max_tokens: usize,
        timeout_secs: u64,
    ) -> Self {
        Self {
            provider,
            name: name.into(),
            options: CompletionOptions {
                temperature: Some(temperature),
                max_tokens: Some(max_tokens),
                ..Default::default()
            },
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl ExtractionModel for LlmExtractionModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError> {
        let messages = vec![
            ChatMessage::system(request.instruction.as_str()),
            ChatMessage::user_with_images(request.context.as_str(), request.attachments.clone()),
        ];

        let call = self.provider.chat(&messages, Some(&self.options));
        let response = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                return Err(UpstreamError::Timeout {
                    service: self.name.clone(),
                    secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => return Err(classify_llm_error(&self.name, &e, self.timeout.as_secs())),
            Ok(Ok(response)) => response,
        };

        if response.content.trim().is_empty() {
            return Err(UpstreamError::InvalidResponse {
                service: self.name.clone(),
                detail: "empty reply".into(),
            });
        }
        Ok(ModelReply {
            text: response.content,
            input_tokens: response.prompt_tokens as usize,
            output_tokens: response.completion_tokens as usize,
        })
    }
}

/// Map a provider error onto the retry taxonomy.
///
/// Typed variants decide directly. Only the opaque ones (`ApiError`,
/// `ProviderError`, `Unknown`) fall back to reading the message.
pub fn classify_llm_error(service: &str, err: &LlmError, timeout_secs: u64) -> UpstreamError {
    let service_name = service.to_string();
    match err {
        LlmError::RateLimited(_) => UpstreamError::RateLimited {
            service: service_name,
        },
        LlmError::AuthError(detail) => UpstreamError::Unauthorized {
            service: service_name,
            detail: detail.clone(),
        },
        LlmError::Timeout => UpstreamError::Timeout {
            service: service_name,
            secs: timeout_secs,
        },
        LlmError::NetworkError(detail) => UpstreamError::Transport {
            service: service_name,
            detail: detail.clone(),
        },
        LlmError::SerializationError(e) => UpstreamError::InvalidResponse {
            service: service_name,
            detail: e.to_string(),
        },
        LlmError::ModelNotFound(detail) => UpstreamError::Status {
            service: service_name,
            status: 404,
            body: detail.clone(),
        },
        LlmError::InvalidRequest(_)
        | LlmError::TokenLimitExceeded { .. }
        | LlmError::ConfigError(_)
        | LlmError::NotSupported(_) => UpstreamError::Status {
            service: service_name,
            status: 400,
            body: err.to_string(),
        },
        LlmError::ApiError(message) | LlmError::ProviderError(message) | LlmError::Unknown(message) => {
            classify_provider_error(service, message)
        }
    }
}

/// Status code written next to an HTTP marker: `HTTP 403`, `status: 429`,
/// `status code 500`, `error 401`, `(503)`.
static RE_HTTP_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bhttp(?:/[\d.]+)?|\bstatus(?:\s*code)?|\berror|\bcode)\s*[:=]?\s*\(?([1-5]\d\d)\b|\(([1-5]\d\d)\)")
        .unwrap()
});

/// Classify an opaque provider message.
///
/// A status code is only read from HTTP-like context, so numbers elsewhere
/// in the text (token counts, echoed prompts) do not change the class.
pub fn classify_provider_error(service: &str, message: &str) -> UpstreamError {
    let status = RE_HTTP_STATUS.captures(message).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u16>().ok())
    });
    if let Some(status) = status {
        return UpstreamError::from_status(service, status, message);
    }

    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["rate limit", "resource_exhausted", "too many requests", "quota exceeded"]) {
        UpstreamError::RateLimited {
            service: service.to_string(),
        }
    } else if has(&["unauthorized", "invalid api key", "api key not valid", "permission_denied"]) {
        UpstreamError::Unauthorized {
            service: service.to_string(),
            detail: message.to_string(),
        }
    } else if has(&["bad request", "invalid_argument"]) {
        UpstreamError::Status {
            service: service.to_string(),
            status: 400,
            body: message.to_string(),
        }
    } else {
        UpstreamError::Transport {
            service: service.to_string(),
            detail: message.to_string(),
        }
    }
}

/// Render `range`, ask the model, and repair the reply into JSON.
///
/// The returned report never carries records; the parsed value is handed
/// back for the caller's shape adapter.
pub async fn request_json(
    model: &dyn ExtractionModel,
    source: &dyn PageSource,
    range: PageRange,
    instruction: &str,
    context: String,
    policy: RetryPolicy,
) -> (BatchReport, Option<Value>) {
    let start = Instant::now();
    let mut report = BatchReport {
        range,
        records: Vec::new(),
        repair_stage: None,
        input_tokens: 0,
        output_tokens: 0,
        attempts: 0,
        error: None,
        duration_ms: 0,
    };

    let attachments = match source.render(range).await {
        Ok(images) => images,
        Err(e) => {
            warn!("Pages {}: render failed: {}", range, e);
            report.error = Some(BatchError::RenderFailed {
                start: range.start,
                end: range.end,
                detail: e.to_string(),
            });
            report.duration_ms = start.elapsed().as_millis() as u64;
            return (report, None);
        }
    };

    let request = ModelRequest {
        instruction: instruction.to_string(),
        context,
        attachments,
    };
    let label = format!("pages {range}");
    let mut attempts = 0;
    let outcome = retry_with_backoff(policy, &label, |attempt| {
        attempts = attempt;
        model.complete(&request)
    })
    .await;
    report.attempts = attempts;

    let reply = match outcome {
        Ok(reply) => reply,
        Err(exhausted) => {
            report.error = Some(BatchError::ModelFailed {
                start: range.start,
                end: range.end,
                attempts: exhausted.attempts,
                detail: exhausted.last_error.to_string(),
            });
            report.duration_ms = start.elapsed().as_millis() as u64;
            return (report, None);
        }
    };
    report.input_tokens = reply.input_tokens;
    report.output_tokens = reply.output_tokens;
    debug!(
        "Pages {}: {} input tokens, {} output tokens",
        range, reply.input_tokens, reply.output_tokens
    );

    let value = match repair_json(&reply.text) {
        Ok(repaired) => {
            report.repair_stage = Some(repaired.stage);
            Some(repaired.value)
        }
        Err(parse_error) => {
            warn!("Pages {}: {}", range, parse_error);
            report.error = Some(BatchError::Unparseable {
                start: range.start,
                end: range.end,
                source: parse_error,
            });
            None
        }
    };
    report.duration_ms = start.elapsed().as_millis() as u64;
    (report, value)
}

/// Extract raw question records from one page range.
pub async fn extract_batch(
    model: &dyn ExtractionModel,
    source: &dyn PageSource,
    range: PageRange,
    instruction: &str,
    context: String,
    policy: RetryPolicy,
) -> BatchReport {
    let (mut report, value) =
        request_json(model, source, range, instruction, context, policy).await;
    if let Some(value) = value {
        report.records = shapes::records_from_value(&value, range);
        info!(
            "Pages {}: {} records ({:?})",
            range,
            report.records.len(),
            report.repair_stage
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::figure::PageDimensions;
    use crate::pipeline::repair::RepairStage;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, UpstreamError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<&str, UpstreamError>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ExtractionModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError> {
            *self.calls.lock().unwrap() += 1;
            assert!(!request.attachments.is_empty());
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok("{}".into())).map(|text| ModelReply {
                text,
                input_tokens: 100,
                output_tokens: 20,
            })
        }
    }

    struct Pages(usize);

    #[async_trait]
    impl PageSource for Pages {
        fn page_count(&self) -> usize {
            self.0
        }

        fn page_dimensions(&self, _page: usize) -> Option<PageDimensions> {
            Some(PageDimensions::A4)
        }

        async fn render(&self, range: PageRange) -> Result<Vec<ImageData>, IngestError> {
            if range.end > self.0 {
                return Err(IngestError::PageOutOfRange {
                    page: range.end,
                    total: self.0,
                });
            }
            Ok(range
                .pages()
                .map(|_| ImageData::new("AAAA".to_string(), "image/png"))
                .collect())
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, 1)
    }

    #[tokio::test]
    async fn clean_reply_yields_records() {
        let model = Scripted::new(vec![Ok(
            r#"{"questions":[{"question_number":1,"content":"a"},{"question_number":2,"content":"b"}]}"#,
        )]);
        let report = extract_batch(&model, &Pages(3), PageRange::new(1, 3), "x", "ctx".into(), policy()).await;
        assert!(report.error.is_none());
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.repair_stage, Some(RepairStage::AsIs));
        assert_eq!(report.attempts, 1);
        assert_eq!(report.input_tokens, 100);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let model = Scripted::new(vec![
            Err(UpstreamError::from_status("m", 503, "busy")),
            Ok(r#"[{"number":4,"content":"q"}]"#),
        ]);
        let report = extract_batch(&model, &Pages(2), PageRange::new(1, 2), "x", String::new(), policy()).await;
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let model = Scripted::new(vec![Err(UpstreamError::from_status("m", 401, "bad key"))]);
        let report = extract_batch(&model, &Pages(2), PageRange::new(1, 2), "x", String::new(), policy()).await;
        assert_eq!(model.calls(), 1);
        assert!(matches!(
            report.error,
            Some(BatchError::ModelFailed { attempts: 1, .. })
        ));
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_mark_the_batch_failed() {
        let busy = || Err(UpstreamError::from_status("m", 500, "boom"));
        let model = Scripted::new(vec![busy(), busy(), busy()]);
        let report = extract_batch(&model, &Pages(5), PageRange::new(2, 5), "x", String::new(), policy()).await;
        assert_eq!(model.calls(), 3);
        match report.error {
            Some(BatchError::ModelFailed { start, end, attempts, .. }) => {
                assert_eq!((start, end, attempts), (2, 5, 3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unparseable_reply_is_a_typed_failure() {
        let model = Scripted::new(vec![Ok("I could not find any questions, sorry.")]);
        let report = extract_batch(&model, &Pages(1), PageRange::new(1, 1), "x", String::new(), policy()).await;
        assert!(matches!(report.error, Some(BatchError::Unparseable { .. })));
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn render_failure_skips_the_model() {
        let model = Scripted::new(vec![]);
        let report = extract_batch(&model, &Pages(3), PageRange::new(3, 4), "x", String::new(), policy()).await;
        assert_eq!(model.calls(), 0);
        assert!(matches!(report.error, Some(BatchError::RenderFailed { .. })));
    }

    #[test]
    fn provider_errors_are_classified() {
        assert!(matches!(
            classify_provider_error("g", "API error 429: Resource has been exhausted"),
            UpstreamError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_provider_error("g", "HTTP 403 Forbidden: API key not valid"),
            UpstreamError::Unauthorized { .. }
        ));
        let bad = classify_provider_error("g", "status: 400 Bad Request: INVALID_ARGUMENT");
        assert!(!bad.is_transient());
        assert!(classify_provider_error("g", "connection reset by peer").is_transient());
        assert!(classify_provider_error("g", "upstream returned (503)").is_transient());
    }

    #[test]
    fn numbers_outside_http_context_do_not_decide_the_class() {
        let e = classify_provider_error("g", "stream closed after 401 tokens; prompt was \"page 400 of 403\"");
        assert!(matches!(e, UpstreamError::Transport { .. }));
        assert!(e.is_transient());

        let e = classify_llm_error("g", &LlmError::ApiError("overloaded, 401 tokens generated".into()), 30);
        assert!(e.is_transient());
    }

    #[test]
    fn typed_llm_errors_map_by_variant() {
        assert!(matches!(
            classify_llm_error("g", &LlmError::RateLimited("429 tokens".into()), 30),
            UpstreamError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_llm_error("g", &LlmError::AuthError("bad key".into()), 30),
            UpstreamError::Unauthorized { .. }
        ));
        assert!(matches!(
            classify_llm_error("g", &LlmError::Timeout, 30),
            UpstreamError::Timeout { secs: 30, .. }
        ));
        // The message mentions 401 but the variant says the network failed.
        assert!(classify_llm_error("g", &LlmError::NetworkError("reset after 401 bytes".into()), 30).is_transient());
        assert!(!classify_llm_error("g", &LlmError::InvalidRequest("image too large".into()), 30).is_transient());
        assert!(!classify_llm_error("g", &LlmError::TokenLimitExceeded { max: 10, got: 20 }, 30).is_transient());
    }
}
