//! Layered repair of near-JSON model replies.
//!
//! Stages run in order and stop at the first one that yields valid JSON:
//!
//! 1. strip enclosing markdown code fences (always applied)
//! 2. parse as-is
//! 3. parse the span from the first `{`/`[` to the last matching closer
//! 4. escape raw control characters that sit inside string literals
//! 5. close an unterminated string and append closers for every bracket
//!    still open; if that alone is not enough, cut back to earlier
//!    top-level commas until the leading complete records parse
//!
//! Stages 4 and 5 scan with an explicit quote state so already-escaped
//! sequences and brackets inside strings are left alone.

use crate::error::ExtractionParseError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum characters of the raw reply kept in [`ExtractionParseError::prefix`].
pub const DIAGNOSTIC_PREFIX_CHARS: usize = 200;

/// Upper bound on cut-back attempts in stage 5.
const MAX_TRUNCATION_RETRIES: usize = 64;

/// The stage that produced valid JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStage {
    /// Stage 2: the (fence-stripped) text was already valid.
    AsIs,
    /// Stage 3: valid once surrounding chatter was dropped.
    Substring,
    /// Stage 4: valid once raw control characters were escaped.
    ControlChars,
    /// Stage 5: valid once open strings and brackets were closed.
    Balanced,
}

/// Parsed JSON and how it was obtained.
#[derive(Debug, Clone)]
pub struct Repaired {
    pub value: Value,
    pub stage: RepairStage,
}

/// Turn a raw model reply into JSON, repairing it if necessary.
pub fn repair_json(raw: &str) -> Result<Repaired, ExtractionParseError> {
    // ── Stage 1: fences ─────────────────────────────────────────────────
    let text = strip_code_fences(raw);
    let text = text.trim();

    // ── Stage 2: as-is ──────────────────────────────────────────────────
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(done(value, RepairStage::AsIs));
    }

    // ── Stage 3: first plausible object ─────────────────────────────────
    if let Some(value) = parse_outer_span(text) {
        return Ok(done(value, RepairStage::Substring));
    }

    let tail = match text.find(['{', '[']) {
        Some(idx) => &text[idx..],
        None => return Err(parse_error(raw)),
    };

    // ── Stage 4: raw control characters ─────────────────────────────────
    let escaped = escape_control_chars(tail);
    if let Ok(value) = serde_json::from_str::<Value>(&escaped) {
        return Ok(done(value, RepairStage::ControlChars));
    }
    if let Some(value) = parse_outer_span(&escaped) {
        return Ok(done(value, RepairStage::ControlChars));
    }

    // ── Stage 5: bracket balance ────────────────────────────────────────
    if let Some(value) = balance_and_parse(&escaped) {
        return Ok(done(value, RepairStage::Balanced));
    }

    // ── Stage 6: give up ────────────────────────────────────────────────
    Err(parse_error(raw))
}

fn done(value: Value, stage: RepairStage) -> Repaired {
    Repaired { value, stage }
}

fn parse_error(raw: &str) -> ExtractionParseError {
    ExtractionParseError {
        raw_len: raw.len(),
        prefix: raw.chars().take(DIAGNOSTIC_PREFIX_CHARS).collect(),
    }
}

// ── Stage 1 ──────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n?(.*?)\n?```\s*$").unwrap());

/// Remove a fence pair around the whole reply. A truncated reply may have
/// the opening fence only; that line is dropped too.
pub fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    if let Some(caps) = RE_OUTER_FENCES.captures(trimmed) {
        return caps[1].to_string();
    }
    if trimmed.starts_with("```") {
        return match trimmed.split_once('\n') {
            Some((_, rest)) => rest.to_string(),
            None => String::new(),
        };
    }
    trimmed.to_string()
}

// ── Stage 3 ──────────────────────────────────────────────────────────────

fn parse_outer_span(text: &str) -> Option<Value> {
    let open = text.find(['{', '['])?;
    let closer = if text[open..].starts_with('{') { '}' } else { ']' };
    let close = text.rfind(closer)?;
    if close <= open {
        return None;
    }
    serde_json::from_str(&text[open..=close]).ok()
}

// ── Stage 4 ──────────────────────────────────────────────────────────────

/// Escape bare control characters that appear inside string literals.
///
/// Characters outside strings are structural whitespace and stay as they
/// are; `\"` and `\\` inside strings are recognised so escape state is
/// never lost.
pub fn escape_control_chars(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

// ── Stage 5 ──────────────────────────────────────────────────────────────

fn balance_and_parse(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(&close_open_brackets(text)) {
        return Some(value);
    }
    // The tail is a half-written member; drop it and retry from each
    // earlier comma that sits outside a string.
    comma_positions(text)
        .into_iter()
        .rev()
        .take(MAX_TRUNCATION_RETRIES)
        .find_map(|pos| serde_json::from_str(&close_open_brackets(&text[..pos])).ok())
}

/// Append whatever is needed to close the text: a quote for an open string,
/// `null` for a dangling key, and one closer per open bracket.
pub fn close_open_brackets(input: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = input.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    let kept = out.trim_end().trim_end_matches(',').trim_end().len();
    out.truncate(kept);
    if out.ends_with(':') {
        out.push_str("null");
    }

    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Byte offsets of commas that are not inside a string literal.
fn comma_positions(input: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
        } else if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            positions.push(idx);
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_passes_at_stage_two() {
        let raw = r#"{"questions":[{"number":1,"content":"What is 2+2?"}]}"#;
        let r = repair_json(raw).unwrap();
        assert_eq!(r.stage, RepairStage::AsIs);
        assert_eq!(r.value, serde_json::from_str::<Value>(raw).unwrap());
    }

    #[test]
    fn fenced_json_is_still_stage_two() {
        let raw = "```json\n{\"questions\": []}\n```";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.stage, RepairStage::AsIs);
        assert_eq!(r.value, json!({"questions": []}));
    }

    #[test]
    fn chatter_around_object_is_dropped() {
        let raw = "Here is the data you asked for:\n{\"questions\": [{\"number\": 3}]}\nLet me know!";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.stage, RepairStage::Substring);
        assert_eq!(r.value["questions"][0]["number"], 3);
    }

    #[test]
    fn raw_newline_inside_string_is_escaped() {
        let raw = "{\"questions\":[{\"number\":1,\"content\":\"line one\nline two\ttabbed\"}]}";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.stage, RepairStage::ControlChars);
        assert_eq!(r.value["questions"][0]["content"], "line one\nline two\ttabbed");
    }

    #[test]
    fn escaped_sequences_are_not_double_escaped() {
        let input = "{\"a\":\"keep \\\" and \\n\nraw\"}";
        let out = escape_control_chars(input);
        assert_eq!(out, "{\"a\":\"keep \\\" and \\n\\nraw\"}");
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["a"], "keep \" and \n\nraw");
    }

    #[test]
    fn newlines_outside_strings_are_untouched() {
        let input = "{\n  \"a\": 1\n}";
        assert_eq!(escape_control_chars(input), input);
    }

    #[test]
    fn one_missing_bracket_is_closed() {
        let raw = r#"{"questions":[{"number":1,"content":"a"}]"#;
        let r = repair_json(raw).unwrap();
        assert_eq!(r.stage, RepairStage::Balanced);
        assert_eq!(r.value["questions"][0]["content"], "a");
    }

    #[test]
    fn truncated_compact_output_keeps_leading_rows() {
        let raw = r#"{"d": [[1,"Q1 text","mcq",1],[2,"Q2 text","structured",4],[3,"Q3 is cut o"#;
        let r = repair_json(raw).unwrap();
        assert_eq!(r.stage, RepairStage::Balanced);
        let rows = r.value["d"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], json!([1, "Q1 text", "mcq", 1]));
        assert_eq!(rows[1][1], "Q2 text");
        assert_eq!(rows[2][1], "Q3 is cut o");
    }

    #[test]
    fn half_written_member_is_cut_back() {
        let raw = r#"{"questions":[{"number":1,"content":"a"},{"number":2,"conte"#;
        let r = repair_json(raw).unwrap();
        assert_eq!(r.stage, RepairStage::Balanced);
        let qs = r.value["questions"].as_array().unwrap();
        assert_eq!(qs[0]["number"], 1);
        assert_eq!(qs.last().unwrap()["number"], 2);
    }

    #[test]
    fn dangling_colon_gets_null() {
        assert_eq!(close_open_brackets(r#"{"a": 1, "b":"#), r#"{"a": 1, "b":null}"#);
        assert_eq!(close_open_brackets(r#"[1, 2, "#), "[1, 2]");
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        assert_eq!(
            close_open_brackets(r#"{"a": "[{ not real"#),
            r#"{"a": "[{ not real"}"#
        );
    }

    #[test]
    fn truncated_reply_with_opening_fence_only() {
        let raw = "```json\n{\"questions\":[{\"number\":7}";
        let r = repair_json(raw).unwrap();
        assert_eq!(r.value["questions"][0]["number"], 7);
    }

    #[test]
    fn prose_only_is_a_parse_error() {
        let raw = "I'm sorry, I can't read this page.";
        let err = repair_json(raw).unwrap_err();
        assert_eq!(err.raw_len, raw.len());
        assert_eq!(err.prefix, raw);
    }

    #[test]
    fn parse_error_prefix_is_bounded() {
        let raw = format!("nope {}", "x".repeat(1000));
        let err = repair_json(&raw).unwrap_err();
        assert_eq!(err.prefix.chars().count(), DIAGNOSTIC_PREFIX_CHARS);
        assert_eq!(err.raw_len, raw.len());
    }

    #[test]
    fn repair_is_stable_on_its_own_output() {
        let raw = r#"{"d": [[1,"a"],[2,"b"#;
        let first = repair_json(raw).unwrap();
        let again = repair_json(&first.value.to_string()).unwrap();
        assert_eq!(again.stage, RepairStage::AsIs);
        assert_eq!(again.value, first.value);
    }
}
