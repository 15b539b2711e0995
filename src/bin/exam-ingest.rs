//! CLI binary for exam-ingest.
//!
//! A thin shim over the library crate: maps flags to `PipelineConfig` and
//! `ServiceSettings`, then either serves the HTTP API or runs one operation.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use exam_ingest::analyze::{resolve_provider, MODEL_ENV, PROVIDER_ENV};
use exam_ingest::config::{DEFAULT_BUCKET, DEFAULT_CROP_ENDPOINT};
use exam_ingest::pipeline::extract::LlmExtractionModel;
use exam_ingest::pipeline::partition::PageRange;
use exam_ingest::pipeline::retry::RetryPolicy;
use exam_ingest::server::{self, AppState};
use exam_ingest::{
    analyze_document, check_answer, grade_by_keywords, process_answer_key, AnalyzeRequest,
    AnswerKeyRequest, CheckAnswerRequest, IngestProgressCallback, PipelineConfig, ProgressCallback,
    ServiceSettings, Services,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Batch progress bar plus one log line per finished range.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_run_start(&self, total_pages: usize, total_batches: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} batches  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        self.bar.set_length(total_batches as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar
            .println(bold(&format!("◆ {total_pages} pages in {total_batches} batches")));
    }

    fn on_batch_start(&self, _batch: usize, _total: usize, range: PageRange) {
        self.bar.set_message(format!("pages {range}"));
    }

    fn on_batch_complete(&self, batch: usize, total: usize, records: usize) {
        self.bar.println(format!(
            "  {} Batch {:>2}/{:<2}  {}",
            green("✓"),
            batch,
            total,
            dim(&format!("{records} records"))
        ));
        self.bar.inc(1);
    }

    fn on_batch_error(&self, batch: usize, total: usize, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let msg: String = error.chars().take(80).collect();
        self.bar
            .println(format!("  {} Batch {:>2}/{:<2}  {}", red("✗"), batch, total, red(&msg)));
        self.bar.inc(1);
    }

    fn on_items_persisted(&self, items: usize) {
        self.bar.set_prefix("Dispatching");
        self.bar.set_message(format!("{items} questions saved"));
    }

    fn on_side_effect(&self, kind: &str, item_number: u32, ok: bool) {
        if !ok {
            self.bar
                .println(format!("  {} {} for question {}", red("✗"), kind, item_number));
        }
    }

    fn on_run_complete(&self, items: usize, batches_failed: usize) {
        self.bar.finish_and_clear();
        let mark = if batches_failed == 0 { green("✔") } else { red("⚠") };
        eprintln!(
            "{} {} questions  ({} failed batches)",
            mark,
            bold(&items.to_string()),
            self.failed.load(Ordering::SeqCst).max(batches_failed)
        );
    }
}

// ── Arguments ────────────────────────────────────────────────────────────────

/// Turn exam-paper PDFs into structured question records.
#[derive(Parser, Debug)]
#[command(
    name = "exam-ingest",
    version,
    about = "Turn exam-paper PDFs into structured, gradable question records",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON HTTP API.
    Serve {
        /// Address to bind the HTTP server to (host:port).
        #[arg(long, env = "EXAM_INGEST_BIND", default_value = "127.0.0.1:8080")]
        bind: String,
    },

    /// Analyse one paper and persist its questions.
    Analyze {
        /// Store id of the paper.
        #[arg(long)]
        document_id: String,

        /// URL of the paper PDF.
        document_url: String,

        /// Paper category: mcq or structured.
        #[arg(long, default_value = "mcq")]
        category: String,

        /// URL of the mark-scheme PDF.
        #[arg(long)]
        answer_key_url: Option<String>,

        /// First page to analyse (1-indexed).
        #[arg(long)]
        start_page: Option<usize>,

        /// Last page to analyse (inclusive).
        #[arg(long)]
        end_page: Option<usize>,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Apply a mark scheme to an already analysed paper.
    AnswerKey {
        #[arg(long)]
        document_id: String,

        answer_key_url: String,
    },

    /// Grade one answer.
    Grade {
        #[arg(long)]
        question: String,

        #[arg(long)]
        answer: String,

        #[arg(long)]
        official: Option<String>,

        #[arg(long)]
        marks: Option<u32>,

        /// Use the key-word grader instead of the model.
        #[arg(long)]
        offline: bool,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// LLM model ID (e.g. gemini-2.0-flash, gpt-4.1).
    #[arg(long, global = true, env = MODEL_ENV)]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama, azure.
    #[arg(long, global = true, env = PROVIDER_ENV)]
    provider: Option<String>,

    /// Store base URL.
    #[arg(long, global = true, env = "SUPABASE_URL")]
    supabase_url: Option<String>,

    /// Store service-role key.
    #[arg(long, global = true, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    supabase_key: Option<String>,

    /// Storage bucket for figure images.
    #[arg(long, global = true, env = "STORAGE_BUCKET", default_value = DEFAULT_BUCKET)]
    bucket: String,

    /// Cropping API key.
    #[arg(long, global = true, env = "PDF_CO_API_KEY", hide_env_values = true)]
    pdf_co_key: Option<String>,

    /// Cropping API endpoint.
    #[arg(long, global = true, env = "PDF_CO_ENDPOINT", default_value = DEFAULT_CROP_ENDPOINT)]
    crop_endpoint: String,

    /// Pages per model call.
    #[arg(long, global = true, env = "EXAM_INGEST_BATCH_SIZE", default_value_t = 10)]
    batch_size: usize,

    /// Pages shared by consecutive batches.
    #[arg(long, global = true, env = "EXAM_INGEST_OVERLAP", default_value_t = 1)]
    overlap: usize,

    /// Attempts per model call.
    #[arg(long, global = true, env = "EXAM_INGEST_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Concurrent side effects per group (1–5).
    #[arg(long, global = true, env = "EXAM_INGEST_GROUP_SIZE", default_value_t = 3)]
    group_size: usize,

    /// Path to a text file containing a custom extraction instruction.
    #[arg(long, global = true, env = "EXAM_INGEST_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Per-call LLM timeout in seconds.
    #[arg(long, global = true, env = "EXAM_INGEST_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, env = "EXAM_INGEST_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Disable the progress bar.
    #[arg(long, global = true)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = &cli.common;

    // ── Logging setup ────────────────────────────────────────────────────
    let serving = matches!(cli.command, Command::Serve { .. });
    let show_progress = !serving
        && !common.quiet
        && !common.no_progress
        && matches!(cli.command, Command::Analyze { json: false, .. });
    let filter = if common.verbose {
        "debug"
    } else if common.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn IngestProgressCallback>)
    } else {
        None
    };
    let config = build_config(common, progress).await?;

    match &cli.command {
        Command::Serve { bind } => {
            let addr: SocketAddr = bind
                .parse()
                .with_context(|| format!("invalid bind address {bind}"))?;
            let services = Services::connect(&build_settings(common), &config)
                .await
                .context("Failed to initialise services")?;
            let state = AppState {
                services,
                config: Arc::new(config),
            };
            server::serve(addr, state)
                .await
                .with_context(|| format!("server on {addr} stopped"))?;
        }

        Command::Analyze {
            document_id,
            document_url,
            category,
            answer_key_url,
            start_page,
            end_page,
            json,
        } => {
            let services = Services::connect(&build_settings(common), &config)
                .await
                .context("Failed to initialise services")?;
            let request = AnalyzeRequest {
                document_id: document_id.clone(),
                document_url: document_url.clone(),
                answer_key_url: answer_key_url.clone(),
                category: category.clone(),
                start_page: *start_page,
                end_page: *end_page,
            };
            let summary = analyze_document(&services, &request, &config)
                .await
                .context("Analysis failed")?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else if !common.quiet {
                eprintln!(
                    "   {} figures cropped of {}  /  {} answers of {}  /  {} tokens in, {} out",
                    summary.figures_cropped,
                    summary.figures_attempted,
                    summary.answers_extracted,
                    summary.answers_attempted,
                    dim(&summary.input_tokens.to_string()),
                    dim(&summary.output_tokens.to_string()),
                );
                for warning in &summary.warnings {
                    eprintln!("   {} {}", red("!"), warning);
                }
            }
        }

        Command::AnswerKey {
            document_id,
            answer_key_url,
        } => {
            let services = Services::connect(&build_settings(common), &config)
                .await
                .context("Failed to initialise services")?;
            let request = AnswerKeyRequest {
                document_id: document_id.clone(),
                answer_key_url: answer_key_url.clone(),
            };
            let summary = process_answer_key(&services, &request, &config)
                .await
                .context("Answer-key pass failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Grade {
            question,
            answer,
            official,
            marks,
            offline,
        } => {
            if *offline {
                let grade = grade_by_keywords(answer, official.as_deref(), marks.unwrap_or(1));
                println!("{}", serde_json::to_string_pretty(&grade)?);
                return Ok(());
            }
            let provider = resolve_provider(&config)
                .await
                .context("Failed to initialise LLM provider")?;
            let model = LlmExtractionModel::new(
                provider,
                config.model.clone().unwrap_or_else(|| "llm".into()),
                config.temperature,
                config.max_tokens,
                config.api_timeout_secs,
            );
            let request = CheckAnswerRequest {
                question_content: question.clone(),
                official_answer: official.clone(),
                student_answer: answer.clone(),
                marks: *marks,
                question_id: None,
            };
            let policy = RetryPolicy::new(config.max_attempts, config.retry_backoff_ms);
            let result = check_answer(&model, &request, policy)
                .await
                .context("Grading failed")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(common: &CommonArgs, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .batch_size(common.batch_size)
        .overlap(common.overlap)
        .max_attempts(common.max_attempts)
        .side_effect_group_size(common.group_size)
        .api_timeout_secs(common.api_timeout)
        .download_timeout_secs(common.download_timeout);

    if let Some(ref model) = common.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = common.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = common.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

fn build_settings(common: &CommonArgs) -> ServiceSettings {
    ServiceSettings {
        store_url: common.supabase_url.clone(),
        store_key: common.supabase_key.clone(),
        bucket: common.bucket.clone(),
        crop_api_key: common.pdf_co_key.clone(),
        crop_endpoint: common.crop_endpoint.clone(),
        ..ServiceSettings::new()
    }
}
