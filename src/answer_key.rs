//! Answer keys: read official answers from a mark scheme and match them to
//! stored items.
//!
//! Matching rules:
//!
//! * **MCQ** — the first entry for the question number, accepted only when
//!   the answer is a letter of at most 2 characters (upper-cased).
//! * **Structured with parts** — each part takes the first entry whose
//!   normalised `sub_part` equals or ends with the part's normalised label;
//!   `(b)(ii)` matches `1(b)(ii)` and `bii`.
//! * **Structured without parts** — every entry for the number, joined.

use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::pipeline::extract::{request_json, ExtractionModel};
use crate::pipeline::partition::partition;
use crate::pipeline::render::PageSource;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::shapes::{clean_text, lenient_u32};
use crate::prompts::{mark_scheme_context, MARK_SCHEME_PROMPT};
use crate::records::{PersistedItem, QuestionBlock, QuestionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// One row of a mark scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerKeyEntry {
    pub question_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_part: Option<String>,
    pub official_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marks: Option<u32>,
}

/// Entries read from a repaired reply: `{"answers": [...]}` or a bare array.
///
/// Rows without a number or an answer are skipped.
pub fn entries_from_value(value: &Value) -> Vec<AnswerKeyEntry> {
    let rows = match value {
        Value::Array(rows) => rows.as_slice(),
        Value::Object(map) => match map.get("answers") {
            Some(Value::Array(rows)) => rows.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    rows.iter()
        .filter_map(|row| {
            let obj = row.as_object()?;
            let question_number = obj
                .get("question_number")
                .or_else(|| obj.get("number"))
                .and_then(lenient_u32)?;
            let official_answer = match obj.get("official_answer").or_else(|| obj.get("answer"))? {
                Value::String(s) => clean_text(s),
                Value::Null => return None,
                other => other.to_string(),
            };
            if official_answer.is_empty() {
                return None;
            }
            let sub_part = obj
                .get("sub_part")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let marks = obj.get("marks").and_then(lenient_u32);
            Some(AnswerKeyEntry {
                question_number,
                sub_part,
                official_answer,
                marks,
            })
        })
        .collect()
}

/// Lower-case ASCII alphanumerics only: `"(b)(ii)"` → `"bii"`.
pub fn normalise_label(label: &str) -> String {
    label
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Whether a mark-scheme `sub_part` refers to a question part label.
pub fn label_matches(part_label: &str, sub_part: &str) -> bool {
    let part = normalise_label(part_label);
    let sub = normalise_label(sub_part);
    !part.is_empty() && (sub == part || sub.ends_with(&part))
}

/// The MCQ answer letter, if the entry looks like one.
pub fn mcq_letter(answer: &str) -> Option<String> {
    let trimmed = answer.trim();
    (!trimmed.is_empty() && trimmed.chars().count() <= 2).then(|| trimmed.to_uppercase())
}

/// An answer to write to one item.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAnswer {
    pub item_id: String,
    pub number: u32,
    pub kind: QuestionKind,
    /// Text sent with the rationale request.
    pub question: String,
    pub official_answer: String,
    pub marks: Option<u32>,
    /// Updated structure blocks when parts were matched.
    pub blocks: Option<Vec<QuestionBlock>>,
}

/// Match entries to stored items. Items without an id or a match are skipped.
pub fn plan_answers(items: &[PersistedItem], entries: &[AnswerKeyEntry]) -> Vec<PlannedAnswer> {
    let mut plans = Vec::new();

    for item in items {
        let Some(item_id) = item.id.clone() else {
            continue;
        };
        let for_item: Vec<&AnswerKeyEntry> = entries
            .iter()
            .filter(|e| e.question_number == item.number)
            .collect();
        if for_item.is_empty() {
            continue;
        }

        let planned = match item.kind {
            QuestionKind::Mcq => mcq_letter(&for_item[0].official_answer).map(|letter| {
                PlannedAnswer {
                    item_id,
                    number: item.number,
                    kind: QuestionKind::Mcq,
                    question: item.content.clone(),
                    official_answer: letter,
                    marks: for_item[0].marks,
                    blocks: None,
                }
            }),
            QuestionKind::Structured if item.part_labels().is_empty() => {
                let joined = for_item
                    .iter()
                    .map(|e| match &e.sub_part {
                        Some(sub) => format!("{sub} {}", e.official_answer),
                        None => e.official_answer.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                let total: u32 = for_item.iter().filter_map(|e| e.marks).sum();
                Some(PlannedAnswer {
                    item_id,
                    number: item.number,
                    kind: QuestionKind::Structured,
                    question: item.content.clone(),
                    official_answer: joined,
                    marks: (total > 0).then_some(total),
                    blocks: None,
                })
            }
            QuestionKind::Structured => match_parts(item, &for_item).map(|(blocks, joined)| {
                let total = part_marks(&blocks);
                PlannedAnswer {
                    item_id,
                    number: item.number,
                    kind: QuestionKind::Structured,
                    question: item.content.clone(),
                    official_answer: joined,
                    marks: (total > 0).then_some(total),
                    blocks: Some(blocks),
                }
            }),
        };

        match planned {
            Some(plan) => plans.push(plan),
            None => debug!("Question {}: no usable answer-key entry", item.number),
        }
    }
    plans
}

fn part_marks(blocks: &[QuestionBlock]) -> u32 {
    blocks
        .iter()
        .map(|b| match b {
            QuestionBlock::QuestionPart { marks, .. } => *marks,
            _ => 0,
        })
        .sum()
}

/// Fill `official_answer` (and marks) on matched parts.
fn match_parts(
    item: &PersistedItem,
    entries: &[&AnswerKeyEntry],
) -> Option<(Vec<QuestionBlock>, String)> {
    let mut blocks = item.blocks.clone();
    let mut joined = Vec::new();

    for block in blocks.iter_mut() {
        if let QuestionBlock::QuestionPart {
            label,
            marks,
            official_answer,
            ..
        } = block
        {
            let found = entries.iter().find(|e| {
                e.sub_part
                    .as_deref()
                    .is_some_and(|sub| label_matches(label, sub))
            });
            if let Some(entry) = found {
                *official_answer = Some(entry.official_answer.clone());
                if let Some(m) = entry.marks.filter(|m| *m > 0) {
                    *marks = m;
                }
                joined.push(format!("{label} {}", entry.official_answer));
            }
        }
    }
    (!joined.is_empty()).then(|| (blocks, joined.join("; ")))
}

/// Entries read from an answer-key document plus what went wrong.
#[derive(Debug, Default)]
pub struct AnswerKeyExtraction {
    pub entries: Vec<AnswerKeyEntry>,
    pub batches_total: usize,
    pub batches_failed: usize,
    pub warnings: Vec<String>,
}

/// Run the mark-scheme instruction over every page range of `source`.
///
/// Ranges overlap, so a row seen twice keeps its first sighting.
pub async fn extract_answer_key(
    model: &dyn ExtractionModel,
    source: &dyn PageSource,
    config: &PipelineConfig,
) -> Result<AnswerKeyExtraction, IngestError> {
    let ranges = partition(source.page_count(), config.batch_size, config.overlap)?;
    let policy = RetryPolicy::new(config.answer_key_attempts, config.retry_backoff_ms);
    let mut out = AnswerKeyExtraction {
        batches_total: ranges.len(),
        ..Default::default()
    };
    let mut seen: HashSet<(u32, String)> = HashSet::new();

    for range in ranges {
        let (report, value) = request_json(
            model,
            source,
            range,
            MARK_SCHEME_PROMPT,
            mark_scheme_context(range),
            policy,
        )
        .await;
        if let Some(error) = report.error {
            out.batches_failed += 1;
            out.warnings.push(format!("Answer key: {error}"));
            continue;
        }
        let Some(value) = value else { continue };
        for entry in entries_from_value(&value) {
            let key = (
                entry.question_number,
                entry.sub_part.as_deref().map(normalise_label).unwrap_or_default(),
            );
            if seen.insert(key) {
                out.entries.push(entry);
            }
        }
    }

    if out.entries.is_empty() {
        warn!("No answers extracted from the answer key");
        out.warnings.push("No answers extracted from the answer key".into());
    } else {
        info!("Extracted {} answer-key entries", out.entries.len());
    }
    Ok(out)
}
