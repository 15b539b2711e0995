//! Adapters from the model's JSON reply shapes to [`RawRecord`].
//!
//! Three shapes are accepted, each with its own adapter:
//!
//! | Shape | Example | Adapter |
//! |-------|---------|---------|
//! | plain array | `[{"question_number": 1, ...}]` | [`from_plain_array`] |
//! | questions object | `{"questions": [{...}]}` | [`from_questions_object`] |
//! | compact tuples | `{"d": [[1, "text", "mcq", ...]]}` | [`from_compact`] via [`CompactRow`] |
//!
//! Everything downstream of this module sees only [`RawRecord`].

use crate::figure::{FigureBox, Rect};
use crate::pipeline::partition::PageRange;
use crate::records::{AnswerOption, QuestionBlock, QuestionKind, RawRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// The reply shapes the adapters understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    PlainArray,
    Questions,
    Compact,
}

/// Identify the shape of a parsed reply.
pub fn detect_shape(value: &Value) -> Option<ResponseShape> {
    match value {
        Value::Array(_) => Some(ResponseShape::PlainArray),
        Value::Object(map) if map.get("d").is_some_and(Value::is_array) => {
            Some(ResponseShape::Compact)
        }
        Value::Object(map) if map.get("questions").is_some_and(Value::is_array) => {
            Some(ResponseShape::Questions)
        }
        _ => None,
    }
}

/// Convert any accepted reply shape into raw records for `source`.
///
/// Unknown shapes and malformed items are skipped with a warning.
pub fn records_from_value(value: &Value, source: PageRange) -> Vec<RawRecord> {
    let records = match detect_shape(value) {
        Some(ResponseShape::PlainArray) => from_plain_array(value, source),
        Some(ResponseShape::Questions) => from_questions_object(value, source),
        Some(ResponseShape::Compact) => from_compact(value, source),
        None => {
            warn!("Pages {}: unrecognised response shape", source);
            Vec::new()
        }
    };
    debug!("Pages {}: {} raw records", source, records.len());
    records
}

/// `[ {...}, {...} ]`
pub fn from_plain_array(value: &Value, source: PageRange) -> Vec<RawRecord> {
    value
        .as_array()
        .map(|items| objects_to_records(items, source))
        .unwrap_or_default()
}

/// `{ "questions": [ {...} ] }`
pub fn from_questions_object(value: &Value, source: PageRange) -> Vec<RawRecord> {
    value
        .get("questions")
        .and_then(Value::as_array)
        .map(|items| objects_to_records(items, source))
        .unwrap_or_default()
}

/// `{ "d": [ [...], [...] ] }`
pub fn from_compact(value: &Value, source: PageRange) -> Vec<RawRecord> {
    let Some(rows) = value.get("d").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match CompactRow::from_value(row) {
            Some(row) => row.into_record(source),
            None => {
                warn!("Pages {}: skipping malformed compact row", source);
                None
            }
        })
        .collect()
}

fn objects_to_records(items: &[Value], source: PageRange) -> Vec<RawRecord> {
    items
        .iter()
        .filter_map(|item| {
            let record = item.as_object().and_then(|obj| record_from_object(obj, source));
            if record.is_none() {
                warn!("Pages {}: skipping item without a question number", source);
            }
            record
        })
        .collect()
}

// ── Named (object) form ──────────────────────────────────────────────────

fn record_from_object(obj: &Map<String, Value>, source: PageRange) -> Option<RawRecord> {
    let number = first_of(obj, &["question_number", "number", "n", "q"]).and_then(lenient_u32)?;

    let blocks: Vec<QuestionBlock> = first_of(obj, &["blocks", "structure"])
        .and_then(Value::as_array)
        .map(|bs| bs.iter().filter_map(block_from_value).collect())
        .unwrap_or_default();

    let mut content = first_of(obj, &["content", "text", "question", "stem"])
        .and_then(Value::as_str)
        .map(clean_text)
        .unwrap_or_default();
    if content.is_empty() {
        content = summarize_blocks(&blocks);
    }

    let figure = first_of(obj, &["figure", "figure_location", "bbox"])
        .and_then(figure_from_value)
        .or_else(|| first_block_figure(&blocks));

    Some(RawRecord {
        number,
        content,
        kind: first_of(obj, &["type", "kind", "category"])
            .and_then(Value::as_str)
            .and_then(QuestionKind::parse_tag),
        marks: first_of(obj, &["marks", "total_marks", "mark"]).and_then(lenient_u32),
        topic_ids: first_of(obj, &["topic_ids", "topics", "topic_id"])
            .map(string_list)
            .unwrap_or_default(),
        options: first_of(obj, &["options", "choices", "answers"])
            .map(options_from_value)
            .unwrap_or_default(),
        figure,
        rationale: first_of(obj, &["ai_answer", "rationale", "explanation", "solution"])
            .and_then(Value::as_str)
            .map(clean_text)
            .filter(|s| !s.is_empty()),
        blocks,
        source,
    })
}

fn block_from_value(value: &Value) -> Option<QuestionBlock> {
    let obj = value.as_object()?;
    let kind = obj.get("type").and_then(Value::as_str).unwrap_or("text");
    let text = |keys: &[&str]| {
        first_of(obj, keys)
            .and_then(Value::as_str)
            .map(clean_text)
            .filter(|s| !s.is_empty())
    };
    match kind {
        "figure" => {
            let fig = figure_from_value(value)?;
            Some(QuestionBlock::Figure {
                label: text(&["figure_label", "label"]),
                description: text(&["description"]),
                page: fig.page,
                bbox: fig.rect,
            })
        }
        "question_part" | "part" => Some(QuestionBlock::QuestionPart {
            label: text(&["label"]).unwrap_or_default(),
            content: text(&["content", "text"]).unwrap_or_default(),
            marks: first_of(obj, &["marks"]).and_then(lenient_u32).unwrap_or(0),
            ai_answer: text(&["ai_answer", "answer"]),
            official_answer: text(&["official_answer"]),
        }),
        _ => text(&["content", "text"]).map(|content| QuestionBlock::Text { content }),
    }
}

fn first_block_figure(blocks: &[QuestionBlock]) -> Option<FigureBox> {
    blocks.iter().find_map(|b| match b {
        QuestionBlock::Figure { page, bbox, .. } => Some(FigureBox {
            page: *page,
            rect: *bbox,
        }),
        _ => None,
    })
}

/// Join the text blocks and cut to 200 characters.
pub fn summarize_blocks(blocks: &[QuestionBlock]) -> String {
    const SUMMARY_CHARS: usize = 200;
    let joined = blocks
        .iter()
        .filter_map(|b| match b {
            QuestionBlock::Text { content } => Some(content.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ");
    joined.chars().take(SUMMARY_CHARS).collect()
}

/// Parse a figure from any of the forms models emit:
///
/// * `{"page": 1, "bbox": {"x": .., "y": .., "width": .., "height": ..}}` (percent)
/// * `{"page": 1, "x": .., "y": .., "width": .., "height": ..}` (percent)
/// * `{"page": 1, "box_2d": [ymin, xmin, ymax, xmax]}` (0–1000 grid)
/// * `[page, x, y, width, height]` (percent, compact form)
///
/// `page` defaults to 1, the first page of the batch.
pub fn figure_from_value(value: &Value) -> Option<FigureBox> {
    let (page, rect) = match value {
        Value::Array(items) => {
            let nums: Vec<f64> = items.iter().filter_map(lenient_f64).collect();
            if nums.len() != 5 || items.len() != 5 {
                return None;
            }
            (nums[0] as usize, Rect::new(nums[1], nums[2], nums[3], nums[4]))
        }
        Value::Object(obj) => {
            let page = first_of(obj, &["page", "page_number"])
                .and_then(lenient_u32)
                .unwrap_or(1) as usize;
            let rect = if let Some(grid) = obj.get("box_2d").and_then(Value::as_array) {
                let nums: Vec<f64> = grid.iter().filter_map(lenient_f64).collect();
                let coords: [f64; 4] = nums.try_into().ok()?;
                Rect::from_normalized_1000(coords)
            } else {
                let inner = first_of(obj, &["bbox", "box", "rect"])
                    .and_then(Value::as_object)
                    .unwrap_or(obj);
                rect_from_object(inner)?
            };
            (page, rect)
        }
        _ => return None,
    };
    let page = page.max(1);
    rect.clamp_percent().map(|rect| FigureBox { page, rect })
}

fn rect_from_object(obj: &Map<String, Value>) -> Option<Rect> {
    let get = |keys: &[&str]| first_of(obj, keys).and_then(lenient_f64);
    Some(Rect::new(
        get(&["x", "left"])?,
        get(&["y", "top"])?,
        get(&["width", "w"])?,
        get(&["height", "h"])?,
    ))
}

fn options_from_value(value: &Value) -> Vec<AnswerOption> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| option_from_value(idx, item))
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(label, text)| {
                text.as_str().map(|t| AnswerOption {
                    label: label.trim().to_uppercase(),
                    text: clean_text(t),
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

static RE_OPTION_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?([A-Ha-h])[\).:]\s*(.*)$").unwrap());

fn option_from_value(idx: usize, item: &Value) -> Option<AnswerOption> {
    let fallback_label = || char::from(b'A' + (idx % 26) as u8).to_string();
    match item {
        Value::String(s) => {
            let s = clean_text(s);
            Some(match RE_OPTION_PREFIX.captures(&s) {
                Some(caps) => AnswerOption {
                    label: caps[1].to_uppercase(),
                    text: caps[2].trim().to_string(),
                },
                None => AnswerOption {
                    label: fallback_label(),
                    text: s,
                },
            })
        }
        Value::Array(pair) => {
            let label = pair.first()?.as_str()?.trim().to_uppercase();
            let text = clean_text(pair.get(1)?.as_str()?);
            Some(AnswerOption { label, text })
        }
        Value::Object(obj) => {
            let text = first_of(obj, &["text", "content", "value"])?.as_str()?;
            let label = first_of(obj, &["label", "letter", "key"])
                .and_then(Value::as_str)
                .map(|l| l.trim().to_uppercase())
                .unwrap_or_else(fallback_label);
            Some(AnswerOption {
                label,
                text: clean_text(text),
            })
        }
        _ => None,
    }
}

// ── Compact tuple form ───────────────────────────────────────────────────

/// One row of the compact `{"d": [...]}` reply.
///
/// Position is the only schema, so every field goes through a named
/// accessor:
///
/// | idx | field | type |
/// |-----|-------|------|
/// | 0 | number | integer or numeric string (required) |
/// | 1 | content | string (required) |
/// | 2 | kind | `"mcq"` / `"structured"` |
/// | 3 | marks | integer |
/// | 4 | topic ids | array of strings |
/// | 5 | options | array of strings or `[label, text]` pairs |
/// | 6 | figure | `[page, x, y, width, height]` in percent, or null |
/// | 7 | rationale | string |
#[derive(Debug, Clone, PartialEq)]
pub struct CompactRow(Vec<Value>);

impl CompactRow {
    const NUMBER: usize = 0;
    const CONTENT: usize = 1;
    const KIND: usize = 2;
    const MARKS: usize = 3;
    const TOPICS: usize = 4;
    const OPTIONS: usize = 5;
    const FIGURE: usize = 6;
    const RATIONALE: usize = 7;

    /// Accept an array with at least a number and a content string.
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let row = Self(items.clone());
        row.number()?;
        row.content()?;
        Some(row)
    }

    fn field(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx).filter(|v| !v.is_null())
    }

    pub fn number(&self) -> Option<u32> {
        self.field(Self::NUMBER).and_then(lenient_u32)
    }

    pub fn content(&self) -> Option<String> {
        self.field(Self::CONTENT)
            .and_then(Value::as_str)
            .map(clean_text)
    }

    pub fn kind(&self) -> Option<QuestionKind> {
        self.field(Self::KIND)
            .and_then(Value::as_str)
            .and_then(QuestionKind::parse_tag)
    }

    pub fn marks(&self) -> Option<u32> {
        self.field(Self::MARKS).and_then(lenient_u32)
    }

    pub fn topic_ids(&self) -> Vec<String> {
        self.field(Self::TOPICS).map(string_list).unwrap_or_default()
    }

    pub fn options(&self) -> Vec<AnswerOption> {
        self.field(Self::OPTIONS)
            .map(options_from_value)
            .unwrap_or_default()
    }

    pub fn figure(&self) -> Option<FigureBox> {
        self.field(Self::FIGURE).and_then(figure_from_value)
    }

    pub fn rationale(&self) -> Option<String> {
        self.field(Self::RATIONALE)
            .and_then(Value::as_str)
            .map(clean_text)
            .filter(|s| !s.is_empty())
    }

    /// Convert to the named record type.
    pub fn into_record(self, source: PageRange) -> Option<RawRecord> {
        Some(RawRecord {
            number: self.number()?,
            content: self.content()?,
            kind: self.kind(),
            marks: self.marks(),
            topic_ids: self.topic_ids(),
            options: self.options(),
            figure: self.figure(),
            rationale: self.rationale(),
            blocks: Vec::new(),
            source,
        })
    }
}

// ── Lenient scalar helpers ───────────────────────────────────────────────

fn first_of<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

static RE_LEADING_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// `3`, `3.0`, `"3"`, `"Q3"`, `"3."` → 3.
pub fn lenient_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => RE_LEADING_INT
            .find(s)
            .and_then(|m| m.as_str().parse::<u32>().ok()),
        _ => None,
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Normalise line endings, trim trailing whitespace per line, and drop
/// invisible Unicode the model sometimes copies from the page.
pub fn clean_text(input: &str) -> String {
    const INVISIBLE: [char; 6] = ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}'];
    let normalised = input.replace("\r\n", "\n").replace('\r', "\n");
    normalised
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .chars()
        .filter(|c| !INVISIBLE.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn range() -> PageRange {
        PageRange::new(11, 20)
    }

    #[test]
    fn shapes_are_detected() {
        assert_eq!(detect_shape(&json!([])), Some(ResponseShape::PlainArray));
        assert_eq!(
            detect_shape(&json!({"questions": []})),
            Some(ResponseShape::Questions)
        );
        assert_eq!(detect_shape(&json!({"d": []})), Some(ResponseShape::Compact));
        assert_eq!(detect_shape(&json!({"answers": []})), None);
        assert_eq!(detect_shape(&json!("text")), None);
    }

    #[test]
    fn all_three_shapes_yield_the_same_record() {
        let named = json!({
            "question_number": 7,
            "content": "Which gas is produced?",
            "type": "mcq",
            "marks": 1,
            "topic_ids": ["t-1"],
            "options": ["A) Oxygen", "B) Carbon dioxide"],
            "figure": {"page": 2, "x": 10, "y": 20, "width": 50, "height": 30},
            "ai_answer": "B"
        });
        let compact = json!({"d": [[7, "Which gas is produced?", "mcq", 1, ["t-1"],
            ["A) Oxygen", "B) Carbon dioxide"], [2, 10, 20, 50, 30], "B"]]});

        let a = from_plain_array(&json!([named.clone()]), range());
        let b = from_questions_object(&json!({"questions": [named]}), range());
        let c = from_compact(&compact, range());
        assert_eq!(a.len(), 1);
        assert_eq!(a, b);
        assert_eq!(a, c);

        let r = &a[0];
        assert_eq!(r.number, 7);
        assert_eq!(r.kind, Some(QuestionKind::Mcq));
        assert_eq!(r.options[1].label, "B");
        assert_eq!(r.options[1].text, "Carbon dioxide");
        assert_eq!(r.figure.unwrap().page, 2);
        assert_eq!(r.rationale.as_deref(), Some("B"));
        assert_eq!(r.source, range());
    }

    #[test]
    fn compact_row_needs_number_and_content() {
        assert!(CompactRow::from_value(&json!([1])).is_none());
        assert!(CompactRow::from_value(&json!(["x", "text"])).is_none());
        assert!(CompactRow::from_value(&json!({"n": 1})).is_none());
        let row = CompactRow::from_value(&json!([3, "Partial"])).unwrap();
        assert_eq!(row.number(), Some(3));
        assert_eq!(row.kind(), None);
        assert!(row.options().is_empty());
        assert!(row.figure().is_none());
    }

    #[test]
    fn compact_null_fields_are_absent() {
        let row = CompactRow::from_value(&json!([4, "Q", null, null, null, null, null, null]))
            .unwrap();
        let rec = row.into_record(range()).unwrap();
        assert_eq!(rec.marks, None);
        assert!(rec.topic_ids.is_empty());
        assert!(rec.figure.is_none());
    }

    #[test]
    fn items_without_numbers_are_skipped() {
        let v = json!({"questions": [{"content": "orphan"}, {"number": "Q2", "content": "kept"}]});
        let records = records_from_value(&v, range());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].number, 2);
    }

    #[test]
    fn normalized_grid_figures_become_percent() {
        let fig = figure_from_value(&json!({"page": 1, "box_2d": [200, 100, 500, 900]})).unwrap();
        assert_eq!(fig.page, 1);
        assert!(fig.rect.approx_eq(&Rect::new(10.0, 20.0, 80.0, 30.0), 1e-9));
    }

    #[test]
    fn nested_bbox_figures_parse() {
        let fig = figure_from_value(
            &json!({"page": "3", "bbox": {"x": "5%", "y": 6, "w": 7, "h": 8}}),
        )
        .unwrap();
        assert_eq!(fig.page, 3);
        assert!(fig.rect.approx_eq(&Rect::new(5.0, 6.0, 7.0, 8.0), 1e-9));
        assert!(figure_from_value(&json!({"page": 1, "x": 1})).is_none());
        assert!(figure_from_value(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn structured_blocks_fill_content_and_figure() {
        let v = json!({"questions": [{
            "question_number": 2,
            "blocks": [
                {"type": "text", "content": "A ball is dropped."},
                {"type": "figure", "figure_label": "Fig. 2.1", "page": 2,
                 "bbox": {"x": 10, "y": 20, "width": 80, "height": 30}},
                {"type": "question_part", "label": "(a)", "content": "State g.", "marks": 1,
                 "ai_answer": "9.8 m/s²"}
            ]
        }]});
        let records = records_from_value(&v, range());
        let r = &records[0];
        assert_eq!(r.content, "A ball is dropped.");
        assert_eq!(r.blocks.len(), 3);
        assert_eq!(r.figure.unwrap().page, 2);
        assert!(matches!(
            &r.blocks[2],
            QuestionBlock::QuestionPart { label, marks: 1, .. } if label == "(a)"
        ));
    }

    #[test]
    fn summary_is_bounded() {
        let blocks = vec![QuestionBlock::Text {
            content: "x".repeat(500),
        }];
        assert_eq!(summarize_blocks(&blocks).chars().count(), 200);
    }

    #[test]
    fn options_accept_pairs_and_maps() {
        let pairs = options_from_value(&json!([["a", "one"], ["b", "two"]]));
        assert_eq!(pairs[0].label, "A");
        assert_eq!(pairs[1].text, "two");
        let map = options_from_value(&json!({"A": "one", "B": "two"}));
        assert_eq!(map.len(), 2);
        let plain = options_from_value(&json!(["first", "second"]));
        assert_eq!(plain[1].label, "B");
        assert_eq!(plain[1].text, "second");
    }

    #[test]
    fn lenient_numbers() {
        assert_eq!(lenient_u32(&json!(3)), Some(3));
        assert_eq!(lenient_u32(&json!(3.0)), Some(3));
        assert_eq!(lenient_u32(&json!(3.5)), None);
        assert_eq!(lenient_u32(&json!("Q12")), Some(12));
        assert_eq!(lenient_u32(&json!(-1)), None);
        assert_eq!(lenient_u32(&json!(null)), None);
    }

    #[test]
    fn clean_text_normalises() {
        assert_eq!(clean_text("  a \r\nb\u{200B}  \r\n"), "a\nb");
    }
}
