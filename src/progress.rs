//! Progress-callback trait for per-batch analysis events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline walks the page ranges and dispatches side effects.
//!
//! # Example
//!
//! ```rust
//! use exam_ingest::{IngestProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     records: AtomicUsize,
//! }
//!
//! impl IngestProgressCallback for CountingCallback {
//!     fn on_batch_complete(&self, _batch: usize, _total: usize, records: usize) {
//!         self.records.fetch_add(records, Ordering::SeqCst);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { records: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn IngestProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::partition::PageRange;
use std::sync::Arc;

/// Called by the pipeline as it processes each page range.
///
/// All methods default to no-ops so callers only override what they care
/// about. Side-effect events may arrive concurrently from the members of one
/// dispatch group; protect shared state accordingly.
pub trait IngestProgressCallback: Send + Sync {
    /// Called once the document is open and partitioned.
    fn on_run_start(&self, total_pages: usize, total_batches: usize) {
        let _ = (total_pages, total_batches);
    }

    /// Called just before a batch is rendered and sent to the model.
    ///
    /// `batch` is 1-indexed.
    fn on_batch_start(&self, batch: usize, total_batches: usize, range: PageRange) {
        let _ = (batch, total_batches, range);
    }

    /// Called when a batch produced `records` raw records.
    fn on_batch_complete(&self, batch: usize, total_batches: usize, records: usize) {
        let _ = (batch, total_batches, records);
    }

    /// Called when a batch yielded nothing (model failure or unparseable reply).
    fn on_batch_error(&self, batch: usize, total_batches: usize, error: &str) {
        let _ = (batch, total_batches, error);
    }

    /// Called after merging and persisting, before side effects start.
    fn on_items_persisted(&self, items: usize) {
        let _ = items;
    }

    /// Called when one side effect (crop or answer) finished.
    fn on_side_effect(&self, kind: &str, item_number: u32, ok: bool) {
        let _ = (kind, item_number, ok);
    }

    /// Called once the run is over.
    fn on_run_complete(&self, items: usize, batches_failed: usize) {
        let _ = (items, batches_failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;
