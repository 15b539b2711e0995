//! Validate and coerce merged records into storable items.

use crate::figure::{FigureLocation, PageDimensions};
use crate::pipeline::shapes::summarize_blocks;
use crate::records::{MergedRecord, PaperCategory, PersistedItem, QuestionBlock, QuestionKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});

pub fn is_uuid(s: &str) -> bool {
    UUID_RE.is_match(s)
}

/// Items ready for upsert plus what was lost on the way.
#[derive(Debug, Default)]
pub struct Coerced {
    pub items: Vec<PersistedItem>,
    /// Records that carried a figure, dropped or not.
    pub figures_detected: usize,
    pub warnings: Vec<String>,
}

/// Turn merged records into items for `document_id`.
///
/// `page_size` gives the size of an absolute page; `None` means the page
/// does not exist or its size is unknown, and the figure is dropped.
pub fn coerce_records<F>(
    document_id: &str,
    category: PaperCategory,
    merged: BTreeMap<u32, MergedRecord>,
    allowed_topics: &HashSet<&str>,
    page_size: F,
) -> Coerced
where
    F: Fn(usize) -> Option<PageDimensions>,
{
    let mut out = Coerced::default();

    for (number, record) in merged {
        let kind = resolve_kind(&record, category);
        let marks = resolve_marks(&record);
        let content = if record.content.trim().is_empty() {
            summarize_blocks(&record.blocks)
        } else {
            record.content
        };
        let topic_ids = filter_topic_ids(record.topic_ids, allowed_topics);

        let figure = match record.figure {
            None => None,
            Some(fig) => {
                out.figures_detected += 1;
                match FigureLocation::percent(fig.page, fig.rect, page_size(fig.page)) {
                    Ok(location) => Some(location),
                    Err(e) => {
                        warn!("Question {}: dropping figure: {}", number, e);
                        out.warnings
                            .push(format!("Question {number}: figure dropped ({e})"));
                        None
                    }
                }
            }
        };

        out.items.push(PersistedItem {
            id: None,
            document_id: document_id.to_string(),
            number,
            content,
            kind,
            marks,
            topic_ids,
            options: record.options,
            blocks: record.blocks,
            figure,
            image_url: None,
            official_answer: None,
            ai_answer: record.rationale,
        });
    }
    out
}

/// Explicit tag, else MCQ when options were seen, else the paper's default.
pub fn resolve_kind(record: &MergedRecord, category: PaperCategory) -> QuestionKind {
    record.kind.unwrap_or_else(|| {
        if record.options.is_empty() {
            category.default_kind()
        } else {
            QuestionKind::Mcq
        }
    })
}

/// Sum of part marks when positive, else the record's marks, else 1.
pub fn resolve_marks(record: &MergedRecord) -> u32 {
    let parts: u32 = record
        .blocks
        .iter()
        .map(|b| match b {
            QuestionBlock::QuestionPart { marks, .. } => *marks,
            _ => 0,
        })
        .sum();
    if parts > 0 {
        parts
    } else {
        record.marks.filter(|m| *m > 0).unwrap_or(1)
    }
}

/// Keep well-formed ids from the allowed set, first occurrence only.
pub fn filter_topic_ids(ids: Vec<String>, allowed: &HashSet<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| is_uuid(id) && allowed.contains(id.as_str()))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::figure::{FigureBox, Rect};

    const T1: &str = "0b6a43c2-4f9e-4d41-9d0c-1b2f3a4c5d6e";
    const T2: &str = "9F1C2B3A-1111-4222-8333-444455556666";

    fn merged(number: u32) -> MergedRecord {
        MergedRecord {
            number,
            content: format!("Question {number}"),
            kind: None,
            marks: None,
            topic_ids: vec![],
            options: vec![],
            figure: None,
            rationale: None,
            blocks: vec![],
            fragments: 1,
        }
    }

    fn part(marks: u32) -> QuestionBlock {
        QuestionBlock::QuestionPart {
            label: "(a)".into(),
            content: String::new(),
            marks,
            ai_answer: None,
            official_answer: None,
        }
    }

    #[test]
    fn uuid_format() {
        assert!(is_uuid(T1));
        assert!(is_uuid(T2));
        assert!(!is_uuid("Forces and motion"));
        assert!(!is_uuid("0b6a43c2-4f9e-4d41-9d0c-1b2f3a4c5d6"));
    }

    #[test]
    fn topic_ids_must_be_uuid_and_allowed() {
        let allowed: HashSet<&str> = [T1].into_iter().collect();
        let ids = vec![
            T1.to_string(),
            "Forces".to_string(),
            T2.to_string(),
            format!(" {T1} "),
        ];
        assert_eq!(filter_topic_ids(ids, &allowed), vec![T1.to_string()]);
    }

    #[test]
    fn marks_prefer_part_sum() {
        let mut r = merged(1);
        assert_eq!(resolve_marks(&r), 1);
        r.marks = Some(0);
        assert_eq!(resolve_marks(&r), 1);
        r.marks = Some(6);
        assert_eq!(resolve_marks(&r), 6);
        r.blocks = vec![part(2), part(3)];
        assert_eq!(resolve_marks(&r), 5);
        r.blocks = vec![part(0)];
        assert_eq!(resolve_marks(&r), 6);
    }

    #[test]
    fn kind_falls_back_to_options_then_category() {
        let mut r = merged(1);
        assert_eq!(resolve_kind(&r, PaperCategory::Structured), QuestionKind::Structured);
        r.options = vec![crate::records::AnswerOption {
            label: "A".into(),
            text: "x".into(),
        }];
        assert_eq!(resolve_kind(&r, PaperCategory::Structured), QuestionKind::Mcq);
        r.kind = Some(QuestionKind::Structured);
        assert_eq!(resolve_kind(&r, PaperCategory::Mcq), QuestionKind::Structured);
    }

    #[test]
    fn figures_without_page_size_are_dropped_and_counted() {
        let mut with_fig = merged(1);
        with_fig.figure = Some(FigureBox {
            page: 2,
            rect: Rect::new(10.0, 10.0, 20.0, 20.0),
        });
        let mut lost_fig = merged(2);
        lost_fig.figure = Some(FigureBox {
            page: 9,
            rect: Rect::new(10.0, 10.0, 20.0, 20.0),
        });
        let map: BTreeMap<u32, MergedRecord> = [(1, with_fig), (2, lost_fig)].into_iter().collect();

        let out = coerce_records("paper", PaperCategory::Mcq, map, &HashSet::new(), |page| {
            (page <= 3).then_some(PageDimensions::A4)
        });
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.figures_detected, 2);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("Question 2"));
        let loc = out.items[0].figure.unwrap();
        assert_eq!(loc.page, 2);
        assert_eq!(loc.page_size, PageDimensions::A4);
        assert!(out.items[1].figure.is_none());
    }

    #[test]
    fn empty_content_uses_block_summary() {
        let mut r = merged(4);
        r.content = "  ".into();
        r.blocks = vec![QuestionBlock::Text {
            content: "A car accelerates.".into(),
        }];
        let map: BTreeMap<u32, MergedRecord> = [(4, r)].into_iter().collect();
        let out = coerce_records("p", PaperCategory::Structured, map, &HashSet::new(), |_| None);
        assert_eq!(out.items[0].content, "A car accelerates.");
        assert_eq!(out.items[0].document_id, "p");
    }
}
