//! Fold raw records from every batch into one record per question number.
//!
//! Rules for a repeated number, applied in batch order:
//!
//! * `content` — concatenated with [`CONTENT_SEPARATOR`]
//! * `blocks` — appended
//! * `marks` — the larger of the values present
//! * `figure`, `options`, `topic_ids`, `kind`, `rationale` — first present wins
//!
//! First-write-wins is a known simplification: a later, possibly better
//! fragment cannot replace an earlier placeholder value. Figure pages are
//! converted from batch-relative to absolute before anything is stored.

use crate::figure::FigureBox;
use crate::records::{MergedRecord, QuestionBlock, RawRecord};
use crate::pipeline::partition::PageRange;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Joins text fragments of the same question.
pub const CONTENT_SEPARATOR: &str = "\n\n";

/// Merge raw records, keyed by question number.
pub fn merge_records<I>(records: I) -> BTreeMap<u32, MergedRecord>
where
    I: IntoIterator<Item = RawRecord>,
{
    let mut merged: BTreeMap<u32, MergedRecord> = BTreeMap::new();

    for raw in records {
        let incoming = absolutize(raw);
        match merged.get_mut(&incoming.number) {
            None => {
                merged.insert(incoming.number, incoming);
            }
            Some(existing) => {
                debug!("Merging another fragment of question {}", incoming.number);
                fold_into(existing, incoming);
            }
        }
    }

    for record in merged.values_mut() {
        make_part_labels_unique(&mut record.blocks);
    }
    merged
}

fn fold_into(existing: &mut MergedRecord, incoming: MergedRecord) {
    if !incoming.content.is_empty() {
        if existing.content.is_empty() {
            existing.content = incoming.content;
        } else {
            existing.content.push_str(CONTENT_SEPARATOR);
            existing.content.push_str(&incoming.content);
        }
    }
    existing.blocks.extend(incoming.blocks);
    existing.marks = match (existing.marks, incoming.marks) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    if existing.figure.is_none() {
        existing.figure = incoming.figure;
    }
    if existing.options.is_empty() {
        existing.options = incoming.options;
    }
    if existing.topic_ids.is_empty() {
        existing.topic_ids = incoming.topic_ids;
    }
    if existing.kind.is_none() {
        existing.kind = incoming.kind;
    }
    if existing.rationale.is_none() {
        existing.rationale = incoming.rationale;
    }
    existing.fragments += incoming.fragments;
}

/// Convert a raw record into a single-fragment merged record with absolute
/// figure pages.
fn absolutize(raw: RawRecord) -> MergedRecord {
    let source = raw.source;
    let number = raw.number;
    let figure = raw.figure.and_then(|fig| {
        let page = absolute_page(source, fig.page);
        if page.is_none() {
            warn!(
                "Question {}: figure page {} is outside pages {}, dropping figure",
                number, fig.page, source
            );
        }
        page.map(|page| FigureBox { page, ..fig })
    });
    let blocks = raw
        .blocks
        .into_iter()
        .filter_map(|block| match block {
            QuestionBlock::Figure {
                label,
                description,
                page,
                bbox,
            } => absolute_page(source, page).map(|page| QuestionBlock::Figure {
                label,
                description,
                page,
                bbox,
            }),
            other => Some(other),
        })
        .collect();

    MergedRecord {
        number,
        content: raw.content,
        kind: raw.kind,
        marks: raw.marks,
        topic_ids: raw.topic_ids,
        options: raw.options,
        figure,
        rationale: raw.rationale,
        blocks,
        fragments: 1,
    }
}

/// Batch-relative page → absolute page.
///
/// Models are told page 1 is the first image of the batch, but some echo
/// the printed page number instead; a value inside the range's absolute
/// span is accepted as-is.
fn absolute_page(source: PageRange, page: usize) -> Option<usize> {
    source
        .to_absolute(page)
        .or_else(|| source.contains(page).then_some(page))
}

/// Suffix repeated question-part labels with `_1`, `_2`, … so each label is
/// unique within its record.
pub fn make_part_labels_unique(blocks: &mut [QuestionBlock]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for block in blocks.iter_mut() {
        if let QuestionBlock::QuestionPart { label, .. } = block {
            if label.is_empty() {
                continue;
            }
            let count = seen.entry(label.clone()).or_insert(0);
            if *count > 0 {
                debug!("Deduplicating part label {:?} -> {:?}", label, format!("{label}_{count}"));
                *label = format!("{label}_{count}");
            }
            *count += 1;
        }
    }
}
