//! Grade a student's answer against the official one.
//!
//! [`check_answer`] asks the model and always returns a result the caller
//! can show: a reply that cannot be repaired into JSON becomes
//! [`GradingResult::fallback`]. [`grade_by_keywords`] is the offline
//! alternative used when no model is wanted.

use crate::error::IngestError;
use crate::pipeline::extract::{ExtractionModel, ModelRequest};
use crate::pipeline::repair::repair_json;
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use crate::prompts::{grading_context, GRADING_PROMPT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Ratio of matched key words at which an answer counts as correct.
pub const CORRECT_RATIO: f64 = 0.7;

/// Body of `POST /check-answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAnswerRequest {
    pub question_content: String,
    #[serde(default)]
    pub official_answer: Option<String>,
    pub student_answer: String,
    #[serde(default)]
    pub marks: Option<u32>,
    #[serde(default)]
    pub question_id: Option<String>,
}

impl CheckAnswerRequest {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.student_answer.trim().is_empty() {
            return Err(IngestError::InvalidRequest(
                "studentAnswer is required".into(),
            ));
        }
        if self.question_content.trim().is_empty() {
            return Err(IngestError::InvalidRequest(
                "questionContent is required".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingResult {
    pub is_correct: bool,
    /// 0–100.
    pub score: u32,
    pub feedback: String,
    pub hints: Vec<String>,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
}

impl GradingResult {
    /// Shown when the model reply is unusable.
    pub fn fallback() -> Self {
        Self {
            is_correct: false,
            score: 0,
            feedback: "Unable to evaluate your answer. Please try again.".into(),
            hints: Vec::new(),
            strengths: Vec::new(),
            improvements: vec!["Try again with a clearer answer".into()],
        }
    }
}

/// Read a grading reply, defaulting missing fields and clamping the score.
///
/// Returns `None` when the text cannot be repaired into a JSON object.
pub fn parse_grading_reply(text: &str) -> Option<GradingResult> {
    let repaired = repair_json(text).ok()?;
    let obj = repaired.value.as_object()?;

    let score = match obj.get("score") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        _ => 0.0,
    };
    let score = score.round().clamp(0.0, 100.0) as u32;
    let is_correct = match obj.get("isCorrect").or_else(|| obj.get("is_correct")) {
        Some(Value::Bool(b)) => *b,
        _ => score as f64 >= CORRECT_RATIO * 100.0,
    };
    let feedback = obj
        .get("feedback")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Unable to evaluate answer.")
        .to_string();

    Some(GradingResult {
        is_correct,
        score,
        feedback,
        hints: string_list(obj.get("hints")),
        strengths: string_list(obj.get("strengths")),
        improvements: string_list(obj.get("improvements")),
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Grade one answer with the model.
///
/// Fails only on an invalid request or when the model cannot be reached
/// after retries.
pub async fn check_answer(
    model: &dyn ExtractionModel,
    request: &CheckAnswerRequest,
    policy: RetryPolicy,
) -> Result<GradingResult, IngestError> {
    request.validate()?;

    let prompt = ModelRequest::text(
        GRADING_PROMPT,
        grading_context(
            &request.question_content,
            request.official_answer.as_deref(),
            &request.student_answer,
            request.marks,
        ),
    );
    let reply = retry_with_backoff(policy, "grading", |_| model.complete(&prompt))
        .await
        .map_err(|exhausted| IngestError::Upstream {
            context: format!("grading failed after {} attempts", exhausted.attempts),
            source: exhausted.last_error,
        })?;

    match parse_grading_reply(&reply.text) {
        Some(result) => {
            debug!(
                "Graded {}: score {}",
                request.question_id.as_deref().unwrap_or("answer"),
                result.score
            );
            Ok(result)
        }
        None => {
            warn!("Grading reply was not JSON ({} chars)", reply.text.len());
            Ok(GradingResult::fallback())
        }
    }
}

/// Result of [`grade_by_keywords`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordGrade {
    pub score: u32,
    pub is_correct: bool,
    pub feedback: String,
}

fn normalise(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Offline grading by key-word overlap.
pub fn grade_by_keywords(student: &str, official: Option<&str>, max_marks: u32) -> KeywordGrade {
    let official = official.map(str::trim).filter(|o| !o.is_empty());
    let Some(official) = official else {
        return KeywordGrade {
            score: 0,
            is_correct: false,
            feedback: "Incorrect. Try reviewing the relevant topic and attempt again.".into(),
        };
    };

    let ratio = if normalise(student) == normalise(official) {
        1.0
    } else {
        let keywords: Vec<String> = words(official).filter(|w| w.chars().count() > 3).collect();
        if keywords.is_empty() {
            0.0
        } else {
            let answered: HashSet<String> = words(student).collect();
            let matched = keywords.iter().filter(|k| answered.contains(*k)).count();
            matched as f64 / keywords.len() as f64
        }
    };

    let score = (max_marks as f64 * ratio).floor() as u32;
    let is_correct = ratio >= CORRECT_RATIO;
    let feedback = if ratio >= 1.0 || is_correct {
        "Great job! Your answer is correct."
    } else if score > 0 {
        "Partially correct. Review the official answer for more details."
    } else {
        "Incorrect. Try reviewing the relevant topic and attempt again."
    };
    KeywordGrade {
        score,
        is_correct,
        feedback: feedback.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::pipeline::extract::ModelReply;
    use async_trait::async_trait;

    struct Reply(Result<&'static str, UpstreamError>);

    #[async_trait]
    impl ExtractionModel for Reply {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, UpstreamError> {
            assert!(request.context.contains("STUDENT'S ANSWER"));
            self.0.clone().map(|text| ModelReply {
                text: text.into(),
                ..Default::default()
            })
        }
    }

    fn request(student: &str) -> CheckAnswerRequest {
        CheckAnswerRequest {
            question_content: "Name the force that pulls objects to Earth.".into(),
            official_answer: Some("Gravity".into()),
            student_answer: student.into(),
            marks: Some(1),
            question_id: None,
        }
    }

    #[test]
    fn reply_fields_are_defaulted_and_clamped() {
        let r = parse_grading_reply(r#"```json
{"score": 140, "hints": ["a", ""], "strengths": "clear"}
```"#)
        .unwrap();
        assert_eq!(r.score, 100);
        assert!(r.is_correct);
        assert_eq!(r.feedback, "Unable to evaluate answer.");
        assert_eq!(r.hints, vec!["a"]);
        assert_eq!(r.strengths, vec!["clear"]);

        let r = parse_grading_reply(r#"{"isCorrect": false, "score": "-5", "feedback": "Close"}"#).unwrap();
        assert_eq!(r.score, 0);
        assert!(!r.is_correct);
        assert_eq!(r.feedback, "Close");
    }

    #[tokio::test]
    async fn model_result_is_returned() {
        let model = Reply(Ok(r#"{"isCorrect":true,"score":90,"feedback":"Well done","hints":[],"strengths":["precise"],"improvements":[]}"#));
        let r = check_answer(&model, &request("gravity"), RetryPolicy::new(1, 1))
            .await
            .unwrap();
        assert!(r.is_correct);
        assert_eq!(r.score, 90);
        assert_eq!(r.strengths, vec!["precise"]);
    }

    #[tokio::test]
    async fn prose_reply_falls_back() {
        let model = Reply(Ok("The student seems to understand gravity."));
        let r = check_answer(&model, &request("gravity"), RetryPolicy::new(1, 1))
            .await
            .unwrap();
        assert_eq!(r, GradingResult::fallback());
    }

    #[tokio::test]
    async fn empty_answer_is_rejected() {
        let model = Reply(Ok("{}"));
        let err = check_answer(&model, &request("   "), RetryPolicy::new(1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn unreachable_model_is_an_upstream_error() {
        let model = Reply(Err(UpstreamError::from_status("m", 401, "bad key")));
        let err = check_answer(&model, &request("gravity"), RetryPolicy::new(3, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Upstream { .. }));
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn keyword_exact_match_scores_full_marks() {
        let g = grade_by_keywords("  Gravity ", Some("gravity"), 2);
        assert_eq!(g.score, 2);
        assert!(g.is_correct);
        assert_eq!(g.feedback, "Great job! Your answer is correct.");
    }

    #[test]
    fn keyword_overlap_scores_partially() {
        // Key words: friction, converts, kinetic, energy, heat.
        let official = "Friction converts kinetic energy to heat";
        let g = grade_by_keywords("kinetic energy becomes heat", Some(official), 5);
        assert_eq!(g.score, 3);
        assert!(!g.is_correct);
        assert!(g.feedback.starts_with("Partially correct"));

        let g = grade_by_keywords("friction converts kinetic energy", Some(official), 5);
        assert_eq!(g.score, 4);
        assert!(g.is_correct);
    }

    #[test]
    fn keyword_without_official_answer_scores_zero() {
        let g = grade_by_keywords("anything", None, 4);
        assert_eq!(g.score, 0);
        assert!(!g.is_correct);
        assert!(g.feedback.starts_with("Incorrect"));
    }
}
