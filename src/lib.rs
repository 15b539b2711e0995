//! # exam-ingest
//!
//! Turn exam-paper PDFs into structured, gradable question records.
//!
//! Pages are rasterised and sent in small batches to a multimodal LLM, which
//! reads questions, options, marks and figure positions off the page. The
//! crate owns everything around that call: slicing the document, retrying,
//! repairing the model's JSON, merging questions split across batches,
//! idempotent persistence, figure cropping and the optional answer-key pass.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF URL
//!  │
//!  ├─ 1. Load       download, check %PDF, read page sizes (pdfium)
//!  ├─ 2. Partition  overlapping page ranges (default 10 pages, overlap 1)
//!  ├─ 3. Extract    one model call per range, retried with backoff
//!  ├─ 4. Repair     fences, substrings, control chars, bracket balancing
//!  ├─ 5. Merge      one record per question number
//!  ├─ 6. Persist    upsert on (paper_id, question_number)
//!  └─ 7. Dispatch   crop figures, apply the answer key (paced groups)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exam_ingest::{analyze_document, AnalyzeRequest, PipelineConfig, ServiceSettings, Services};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let mut settings = ServiceSettings::new();
//!     settings.store_url = std::env::var("SUPABASE_URL").ok();
//!     settings.store_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok();
//!     settings.crop_api_key = std::env::var("PDF_CO_API_KEY").ok();
//!
//!     let services = Services::connect(&settings, &config).await?;
//!     let request = AnalyzeRequest {
//!         document_id: "8d1e…".into(),
//!         document_url: "https://example.com/paper.pdf".into(),
//!         answer_key_url: None,
//!         category: "mcq".into(),
//!         start_page: None,
//!         end_page: None,
//!     };
//!     let summary = analyze_document(&services, &request, &config).await?;
//!     eprintln!("{} questions, {} figures", summary.items_extracted, summary.figures_cropped);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | via cli | The axum router in [`server`] |
//! | `cli`    | on      | The `exam-ingest` binary (clap + anyhow + indicatif + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyze;
pub mod answer_key;
pub mod config;
pub mod error;
pub mod figure;
pub mod grading;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod records;
#[cfg(feature = "server")]
pub mod server;
pub mod services;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyze::{analyze_document, process_answer_key, AnalyzeRequest, AnswerKeyRequest, Services};
pub use answer_key::AnswerKeyEntry;
pub use config::{PipelineConfig, PipelineConfigBuilder, ServiceSettings};
pub use error::{BatchError, ExtractionParseError, FigureError, IngestError, UpstreamError};
pub use figure::{FigureLocation, PageDimensions, Rect};
pub use grading::{check_answer, grade_by_keywords, CheckAnswerRequest, GradingResult, KeywordGrade};
pub use output::{AnalysisSummary, AnswerKeySummary, BatchReport};
pub use progress::{IngestProgressCallback, NoopProgressCallback, ProgressCallback};
pub use records::{PaperCategory, PersistedItem, QuestionBlock, QuestionKind};
