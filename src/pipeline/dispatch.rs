//! Side effects after persistence: figure crops and answer updates.
//!
//! Each item's side effect is independent of the others. They run in
//! groups of `group_size` concurrently, with a pause between groups to stay
//! under the collaborators' rate limits. Every external call is wrapped in
//! [`retry_with_backoff`]; a failure is logged and counted, never fatal.

use crate::answer_key::PlannedAnswer;
use crate::config::PipelineConfig;
use crate::error::UpstreamError;
use crate::pipeline::extract::{ExtractionModel, ModelRequest};
use crate::pipeline::retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::rationale_prompt;
use crate::records::PersistedItem;
use crate::services::{AnswerUpdate, BlobStore, CropRequest, FigureCropper, ItemStore};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RATIONALE_INSTRUCTION: &str =
    "You are an experienced examiner explaining answers to students. Reply with plain text only.";

/// Run `f` over `items` in sequential groups of concurrent calls.
///
/// Results keep the input order.
pub async fn run_in_groups<T, R, F, Fut>(
    items: Vec<T>,
    group_size: usize,
    pause: Duration,
    f: F,
) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let group_size = group_size.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut rest = items.into_iter().peekable();

    while rest.peek().is_some() {
        if !results.is_empty() && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let group: Vec<Fut> = rest.by_ref().take(group_size).map(&f).collect();
        results.extend(join_all(group).await);
    }
    results
}

/// Outcome of a group of side effects.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SideEffectTally {
    pub attempted: usize,
    pub succeeded: usize,
    pub warnings: Vec<String>,
}

impl SideEffectTally {
    fn from_results(results: Vec<Result<(), String>>) -> Self {
        let mut tally = Self {
            attempted: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                Ok(()) => tally.succeeded += 1,
                Err(warning) => tally.warnings.push(warning),
            }
        }
        tally
    }
}

/// The collaborators and pacing used by the side-effect phase.
pub struct Dispatcher<'a> {
    pub store: &'a dyn ItemStore,
    pub blobs: &'a dyn BlobStore,
    pub cropper: &'a dyn FigureCropper,
    pub model: &'a dyn ExtractionModel,
    pub policy: RetryPolicy,
    pub group_size: usize,
    pub pause: Duration,
    pub crop_padding: f64,
    pub progress: ProgressCallback,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        store: &'a dyn ItemStore,
        blobs: &'a dyn BlobStore,
        cropper: &'a dyn FigureCropper,
        model: &'a dyn ExtractionModel,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            cropper,
            model,
            policy: RetryPolicy::new(config.side_effect_attempts, config.retry_backoff_ms),
            group_size: config.side_effect_group_size,
            pause: Duration::from_millis(config.side_effect_pause_ms),
            crop_padding: config.crop_padding_pt,
            progress: config
                .progress_callback
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProgressCallback)),
        }
    }

    /// Crop, upload and link the figure of every stored item that has one.
    pub async fn crop_figures(&self, document_url: &str, items: &[PersistedItem]) -> SideEffectTally {
        let with_figures: Vec<&PersistedItem> = items
            .iter()
            .filter(|item| item.figure.is_some() && item.id.is_some())
            .collect();
        if with_figures.is_empty() {
            return SideEffectTally::default();
        }
        info!("Cropping {} figures", with_figures.len());

        let results = run_in_groups(with_figures, self.group_size, self.pause, |item| async move {
            let outcome = self.crop_one(document_url, item).await;
            self.progress
                .on_side_effect("crop", item.number, outcome.is_ok());
            outcome
        })
        .await;

        let tally = SideEffectTally::from_results(results);
        info!("Cropped {}/{} figures", tally.succeeded, tally.attempted);
        tally
    }

    async fn crop_one(&self, document_url: &str, item: &PersistedItem) -> Result<(), String> {
        let (Some(item_id), Some(figure)) = (item.id.as_deref(), item.figure.as_ref()) else {
            return Ok(());
        };
        let label = format!("crop Q{}", item.number);
        let request = CropRequest {
            document_url: document_url.to_string(),
            page_index: figure.page_index(),
            rect: figure.crop_rect(self.crop_padding),
        };

        let bytes = retry_with_backoff(self.policy, &label, |_| self.cropper.crop(&request))
            .await
            .map_err(|e| failure(item.number, "crop", e))?;

        let path = format!("figures/{item_id}.png");
        let public_url = retry_with_backoff(self.policy, &label, |_| {
            self.blobs.upload(&path, bytes.clone(), "image/png")
        })
        .await
        .map_err(|e| failure(item.number, "upload", e))?;

        retry_with_backoff(self.policy, &label, |_| {
            self.store.update_image(item_id, &public_url)
        })
        .await
        .map_err(|e| failure(item.number, "image link", e))?;

        debug!("Q{}: figure stored at {}", item.number, public_url);
        Ok(())
    }

    /// Write planned answers, each with a short model rationale when one
    /// can be had.
    pub async fn apply_answers(&self, plans: Vec<PlannedAnswer>) -> SideEffectTally {
        if plans.is_empty() {
            return SideEffectTally::default();
        }
        info!("Applying {} official answers", plans.len());

        let results = run_in_groups(plans, self.group_size, self.pause, |plan| async move {
            let number = plan.number;
            let outcome = self.apply_one(plan).await;
            self.progress.on_side_effect("answer", number, outcome.is_ok());
            outcome
        })
        .await;

        let tally = SideEffectTally::from_results(results);
        info!("Saved {}/{} answers", tally.succeeded, tally.attempted);
        tally
    }

    async fn apply_one(&self, plan: PlannedAnswer) -> Result<(), String> {
        let label = format!("answer Q{}", plan.number);
        let request = ModelRequest::text(
            RATIONALE_INSTRUCTION,
            rationale_prompt(plan.kind, &plan.question, &plan.official_answer),
        );
        let rationale = match retry_with_backoff(self.policy, &label, |_| self.model.complete(&request)).await {
            Ok(reply) => Some(reply.text.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                warn!("Q{}: no rationale: {}", plan.number, e.last_error);
                None
            }
        };

        let update = AnswerUpdate {
            official_answer: Some(plan.official_answer),
            ai_answer: rationale,
            marks: plan.marks,
            blocks: plan.blocks,
        };
        retry_with_backoff(self.policy, &label, |_| {
            self.store.update_answer(&plan.item_id, &update)
        })
        .await
        .map_err(|e| failure(plan.number, "answer update", e))
    }
}

fn failure(number: u32, step: &str, e: RetryExhausted<UpstreamError>) -> String {
    warn!("Q{}: {} failed after {} attempts: {}", number, step, e.attempts, e.last_error);
    format!("Question {number}: {step} failed ({})", e.last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn groups_preserve_order() {
        let out = run_in_groups(vec![1, 2, 3, 4, 5], 2, Duration::ZERO, |n| async move { n * 10 }).await;
        assert_eq!(out, vec![10, 20, 30, 40, 50]);
    }

    #[tokio::test]
    async fn group_size_bounds_concurrency() {
        let (active, peak) = (AtomicUsize::new(0), AtomicUsize::new(0));
        let (active_ref, peak_ref) = (&active, &peak);
        run_in_groups((0..7).collect(), 3, Duration::ZERO, move |_: i32| async move {
            let (active, peak) = (active_ref, peak_ref);
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            active.fetch_sub(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_between_groups_only() {
        let start = tokio::time::Instant::now();
        run_in_groups(vec![(); 5], 2, Duration::from_millis(500), |_| async {}).await;
        // Three groups, two pauses.
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn empty_input_does_nothing() {
        let out: Vec<u8> = run_in_groups(Vec::<u8>::new(), 2, Duration::from_secs(60), |n| async move { n }).await;
        assert!(out.is_empty());
    }

    #[test]
    fn tally_counts_failures() {
        let t = SideEffectTally::from_results(vec![Ok(()), Err("Question 2: crop failed".into()), Ok(())]);
        assert_eq!((t.attempted, t.succeeded), (3, 2));
        assert_eq!(t.warnings.len(), 1);
    }
}
