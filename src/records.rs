//! Record types flowing through the pipeline.
//!
//! ```text
//! model JSON ─▶ RawRecord ─▶ MergedRecord ─▶ PersistedItem
//!  (shapes)      per batch     per number      per (document, number)
//! ```

use crate::figure::{FigureBox, FigureLocation, Rect};
use crate::pipeline::partition::PageRange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Question category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Mcq,
    Structured,
}

impl QuestionKind {
    /// Lenient parse of the tags models actually emit.
    pub fn parse_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mcq" | "m" | "multiple_choice" | "multiple-choice" | "multiplechoice" | "choice" => {
                Some(QuestionKind::Mcq)
            }
            "structured" | "s" | "short_answer" | "long_answer" | "written" | "theory" => {
                Some(QuestionKind::Structured)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionKind::Mcq => "mcq",
            QuestionKind::Structured => "structured",
        }
    }
}

/// The kind of paper submitted for analysis.
///
/// Selects the extraction instruction and the default kind of the items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperCategory {
    Mcq,
    Structured,
}

impl PaperCategory {
    pub fn default_kind(&self) -> QuestionKind {
        match self {
            PaperCategory::Mcq => QuestionKind::Mcq,
            PaperCategory::Structured => QuestionKind::Structured,
        }
    }
}

impl FromStr for PaperCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match QuestionKind::parse_tag(s) {
            Some(QuestionKind::Mcq) => Ok(PaperCategory::Mcq),
            Some(QuestionKind::Structured) => Ok(PaperCategory::Structured),
            None => Err(format!(
                "unknown category '{s}' (expected 'mcq' or 'structured')"
            )),
        }
    }
}

impl fmt::Display for PaperCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_kind().as_str())
    }
}

/// One answer choice of a multiple-choice question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerOption {
    pub label: String,
    pub text: String,
}

/// One element of a structured question, in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionBlock {
    /// Context or stem text.
    Text { content: String },

    /// A diagram, graph or table drawn on the page.
    Figure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        page: usize,
        bbox: Rect,
    },

    /// A labelled sub-question that carries marks, e.g. `(b)(ii)`.
    QuestionPart {
        label: String,
        content: String,
        marks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ai_answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        official_answer: Option<String>,
    },
}

/// Per-item model output before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub number: u32,
    pub content: String,
    pub kind: Option<QuestionKind>,
    pub marks: Option<u32>,
    pub topic_ids: Vec<String>,
    pub options: Vec<AnswerOption>,
    /// Primary figure; page is relative to `source`.
    pub figure: Option<FigureBox>,
    pub rationale: Option<String>,
    /// Structure blocks; figure pages are relative to `source`.
    pub blocks: Vec<QuestionBlock>,
    /// The page range whose extraction produced this record.
    pub source: PageRange,
}

impl RawRecord {
    /// A record carrying only a number and text.
    pub fn new(number: u32, content: impl Into<String>, source: PageRange) -> Self {
        Self {
            number,
            content: content.into(),
            kind: None,
            marks: None,
            topic_ids: Vec::new(),
            options: Vec::new(),
            figure: None,
            rationale: None,
            blocks: Vec::new(),
            source,
        }
    }
}

/// The canonical record for one question number after merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub number: u32,
    pub content: String,
    pub kind: Option<QuestionKind>,
    pub marks: Option<u32>,
    pub topic_ids: Vec<String>,
    pub options: Vec<AnswerOption>,
    /// Primary figure; page is absolute.
    pub figure: Option<FigureBox>,
    pub rationale: Option<String>,
    /// Structure blocks; figure pages are absolute.
    pub blocks: Vec<QuestionBlock>,
    /// How many raw records were folded into this one.
    pub fragments: usize,
}

/// The stored row for one question.
///
/// Field names follow the store's column names. The fields filled in after
/// the first write (`image_url`, `official_answer`, `ai_answer`) are omitted
/// from writes while unset so a re-run never clears values set by an earlier
/// run's side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "paper_id")]
    pub document_id: String,
    #[serde(rename = "question_number")]
    pub number: u32,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub marks: u32,
    #[serde(default)]
    pub topic_ids: Vec<String>,
    #[serde(default)]
    pub options: Vec<AnswerOption>,
    #[serde(rename = "structure_data", default)]
    pub blocks: Vec<QuestionBlock>,
    #[serde(rename = "figure_location", default)]
    pub figure: Option<FigureLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_answer: Option<String>,
}

impl PersistedItem {
    /// `(document id, number)`, the upsert key.
    pub fn key(&self) -> (&str, u32) {
        (&self.document_id, self.number)
    }

    /// Labels of the question parts, in order.
    pub fn part_labels(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                QuestionBlock::QuestionPart { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::figure::PageDimensions;

    #[test]
    fn kind_tags_are_lenient() {
        assert_eq!(QuestionKind::parse_tag("MCQ"), Some(QuestionKind::Mcq));
        assert_eq!(
            QuestionKind::parse_tag("multiple_choice"),
            Some(QuestionKind::Mcq)
        );
        assert_eq!(
            QuestionKind::parse_tag(" structured "),
            Some(QuestionKind::Structured)
        );
        assert_eq!(QuestionKind::parse_tag("essay?"), None);
    }

    #[test]
    fn category_parses() {
        assert_eq!("mcq".parse::<PaperCategory>(), Ok(PaperCategory::Mcq));
        assert_eq!(
            "Structured".parse::<PaperCategory>(),
            Ok(PaperCategory::Structured)
        );
        assert!("biology".parse::<PaperCategory>().is_err());
        assert_eq!(PaperCategory::Mcq.to_string(), "mcq");
    }

    #[test]
    fn blocks_serialize_with_type_tag() {
        let block = QuestionBlock::QuestionPart {
            label: "(a)(i)".into(),
            content: "State the unit of force.".into(),
            marks: 1,
            ai_answer: Some("Newton".into()),
            official_answer: None,
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "question_part");
        assert_eq!(json["label"], "(a)(i)");
        assert!(json.get("official_answer").is_none());
    }

    #[test]
    fn persisted_item_uses_column_names_and_skips_unset_async_fields() {
        let item = PersistedItem {
            id: None,
            document_id: "paper-1".into(),
            number: 4,
            content: "Which organelle...".into(),
            kind: QuestionKind::Mcq,
            marks: 1,
            topic_ids: vec![],
            options: vec![AnswerOption {
                label: "A".into(),
                text: "Nucleus".into(),
            }],
            blocks: vec![],
            figure: Some(
                FigureLocation::percent(2, Rect::new(1.0, 2.0, 3.0, 4.0), Some(PageDimensions::A4))
                    .unwrap(),
            ),
            image_url: None,
            official_answer: None,
            ai_answer: None,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["paper_id"], "paper-1");
        assert_eq!(json["question_number"], 4);
        assert_eq!(json["type"], "mcq");
        assert_eq!(json["figure_location"]["page_size"]["width"], 595.0);
        assert!(json.get("id").is_none());
        assert!(json.get("image_url").is_none());
        assert!(json.get("official_answer").is_none());

        let back: PersistedItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }
}
