//! Model instructions for extraction, answer keys, rationales and grading.
//!
//! Every instruction the crate sends lives here so wording changes touch one
//! file and tests can inspect prompts without a model. The extraction
//! instruction can be replaced via [`crate::config::PipelineConfig::system_prompt`];
//! the output-format block is always appended so replies stay parseable.

use crate::pipeline::partition::PageRange;
use crate::records::{PaperCategory, QuestionKind};
use crate::services::Topic;

/// Extraction instruction for multiple-choice papers.
pub const MCQ_EXTRACTION_PROMPT: &str = r#"You are an expert exam paper analyser for IGCSE/GCSE multiple-choice papers.

The attached images are consecutive pages of one exam paper.

For EVERY question visible on these pages extract:
1. question_number — the printed question number as an integer
2. content — the complete question stem, without the answer options
3. options — every answer choice as {"label": "A", "text": "..."}
4. topic_ids — ids from the AVAILABLE TOPICS list; never topic names
5. figure — only if the question has a diagram, graph, table or image

RULES
- A question cut off at the first or last page: extract the part you can see
- Do not invent questions, options or answers
- Ignore page headers, footers, blank pages and candidate instructions"#;

/// Extraction instruction for structured (written-answer) papers.
pub const STRUCTURED_EXTRACTION_PROMPT: &str = r#"You are an expert exam paper analyser for IGCSE/GCSE structured papers.

The attached images are consecutive pages of one exam paper.

For EVERY main question visible on these pages extract:
1. question_number — the printed main question number as an integer
2. blocks — the question in reading order, each one of:
   {"type": "text", "content": "..."}                       context or stem
   {"type": "figure", "page": 1, "bbox": {...}, "label": "Fig. 1.1"}
   {"type": "question_part", "label": "(a)(i)", "content": "...", "marks": 2,
    "ai_answer": "a short model answer"}
3. marks — total marks for the question
4. topic_ids — ids from the AVAILABLE TOPICS list; never topic names
5. figure — the main diagram of the question, if any

RULES
- Keep every sub-part (a), (b)(i), (b)(ii) as its own question_part block
- Part marks come from the bracketed [n] beside each part
- A question cut off at the first or last page: extract the part you can see
- Ignore page headers, footers, blank pages and "DO NOT WRITE IN THIS MARGIN""#;

/// Output format appended to every extraction instruction.
pub const EXTRACTION_OUTPUT_FORMAT: &str = r#"FIGURES
- page: 1 for the first attached image, 2 for the second, and so on
- x, y, width, height: percent of the page (0-100), origin top-left
- Be generous: include the figure caption and some margin

OUTPUT
Return ONLY valid JSON, no markdown fences, no commentary:
{"questions": [
  {"question_number": 1, "content": "...", "type": "mcq", "marks": 1,
   "topic_ids": ["..."], "options": [{"label": "A", "text": "..."}],
   "figure": {"page": 1, "x": 10, "y": 30, "width": 40, "height": 25}}
]}
Omit "figure" when there is none. Use [] when no topic matches."#;

/// Instruction for reading official answers out of a mark scheme.
pub const MARK_SCHEME_PROMPT: &str = r#"Extract the OFFICIAL ANSWERS from the attached mark scheme pages.

RULES
1. question_number — the main question number as an integer
2. sub_part — the exact part label, e.g. "(a)(i)"; for "1(a)(i)" use "(a)(i)"; omit for MCQ
3. official_answer — the key marking points, joined with semicolons; for MCQ only the letter
4. marks — the number in the Marks column
5. Extract EVERY row of the mark scheme table

OUTPUT
Return ONLY valid JSON, no markdown fences:
{"answers": [
  {"question_number": 1, "sub_part": "(a)(i)", "official_answer": "Sun", "marks": 1}
]}"#;

/// Instruction used when grading a student answer.
pub const GRADING_PROMPT: &str = r#"You are an expert IGCSE/GCSE examiner. Compare the student's answer with the official mark scheme and give feedback.

Return ONLY valid JSON:
{"isCorrect": true, "score": 85, "feedback": "2-3 encouraging sentences",
 "hints": ["..."], "strengths": ["..."], "improvements": ["..."]}

- isCorrect: true when the answer is substantially correct (at least 70%)
- score: 0-100, partial credit allowed
- hints and improvements: empty when the answer is fully correct
- For multiple choice only the letter matters
- For written answers check key concepts and terminology
- Use simple, student-friendly language"#;

/// The extraction instruction for a paper category.
pub fn extraction_prompt(category: PaperCategory) -> &'static str {
    match category {
        PaperCategory::Mcq => MCQ_EXTRACTION_PROMPT,
        PaperCategory::Structured => STRUCTURED_EXTRACTION_PROMPT,
    }
}

/// Append the fixed output-format block to an instruction.
pub fn with_output_format(instruction: &str) -> String {
    format!("{instruction}\n\n{EXTRACTION_OUTPUT_FORMAT}")
}

/// Per-batch context: subject, allowed topics and the pages attached.
pub fn extraction_context(subject: Option<&str>, topics: &[Topic], range: PageRange) -> String {
    let topics_json = serde_json::to_string(topics).unwrap_or_else(|_| "[]".to_string());
    let subject = subject.map(|s| format!("SUBJECT: {s}\n")).unwrap_or_default();
    format!(
        "{subject}AVAILABLE TOPICS (use the \"id\" values):\n{topics_json}\n\n\
         Attached: pages {} to {} of the paper ({} images).",
        range.start,
        range.end,
        range.page_count()
    )
}

/// Context for one batch of mark-scheme pages.
pub fn mark_scheme_context(range: PageRange) -> String {
    format!(
        "Attached: mark scheme pages {} to {} ({} images).",
        range.start,
        range.end,
        range.page_count()
    )
}

/// Ask for a short explanation of why `official_answer` is right.
pub fn rationale_prompt(kind: QuestionKind, question: &str, official_answer: &str) -> String {
    match kind {
        QuestionKind::Mcq => format!(
            "Explain why \"{official_answer}\" is the correct answer to this question. \
             At most 3 sentences.\n\nQUESTION:\n{question}"
        ),
        QuestionKind::Structured => format!(
            "Write a model answer for this question using the mark-scheme points. \
             At most 3 sentences.\n\nQUESTION:\n{question}\n\nMARK SCHEME POINTS:\n{official_answer}"
        ),
    }
}

/// The grading request body.
pub fn grading_context(
    question: &str,
    official_answer: Option<&str>,
    student_answer: &str,
    marks: Option<u32>,
) -> String {
    let official = official_answer
        .filter(|a| !a.trim().is_empty())
        .unwrap_or("Not available - use your subject knowledge to evaluate");
    let marks = marks.map(|m| format!("\n\nTOTAL MARKS: {m}")).unwrap_or_default();
    format!(
        "QUESTION:\n{question}\n\nOFFICIAL ANSWER / MARK SCHEME:\n{official}\n\n\
         STUDENT'S ANSWER:\n{student_answer}{marks}"
    )
}
