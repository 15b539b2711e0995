//! Result types returned by analysis runs.

use crate::error::BatchError;
use crate::pipeline::partition::PageRange;
use crate::pipeline::repair::RepairStage;
use crate::records::RawRecord;
use serde::{Deserialize, Serialize};

/// Outcome of one extraction call over a page range.
///
/// `error` is set when the range yielded nothing usable; `records` is then
/// empty. A clean reply with no questions (a blank page) has neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub range: PageRange,
    pub records: Vec<RawRecord>,
    /// Which repair stage produced the parsed reply.
    pub repair_stage: Option<RepairStage>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Model calls made, retries included.
    pub attempts: u32,
    pub error: Option<BatchError>,
    pub duration_ms: u64,
}

impl BatchReport {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Counts returned to the caller of an analysis run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub success: bool,
    pub items_extracted: usize,
    pub figures_detected: usize,
    pub figures_attempted: usize,
    pub figures_cropped: usize,
    pub answers_attempted: usize,
    pub answers_extracted: usize,
    pub batches_total: usize,
    pub batches_failed: usize,
    pub total_pages: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Non-fatal problems: failed batches, dropped figures, failed side effects.
    pub warnings: Vec<String>,
}

/// Counts returned by a standalone answer-key pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerKeySummary {
    pub success: bool,
    pub answers_attempted: usize,
    pub answers_extracted: usize,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_uses_camel_case() {
        let summary = AnalysisSummary {
            success: true,
            items_extracted: 12,
            figures_cropped: 2,
            figures_attempted: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["itemsExtracted"], 12);
        assert_eq!(json["figuresCropped"], 2);
        assert_eq!(json["figuresAttempted"], 3);
        assert_eq!(json["batchesFailed"], 0);
        assert!(json["warnings"].as_array().unwrap().is_empty());
    }
}
