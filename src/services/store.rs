//! Item persistence.
//!
//! Writes are upserts keyed by `(paper_id, question_number)`, so re-running
//! an analysis converges on one row per question. The PostgREST adapter
//! speaks the Supabase REST dialect; [`MemoryStore`] mirrors its merge
//! semantics in a `HashMap`.

use super::{authorized_client, send};
use crate::config::ServiceSettings;
use crate::error::{IngestError, UpstreamError};
use crate::records::{PersistedItem, QuestionBlock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

const SERVICE: &str = "store";

/// A topic a question may be tagged with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
}

/// What the extractor needs to know about the document being analysed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentContext {
    pub subject_name: Option<String>,
    pub topics: Vec<Topic>,
}

/// Fields written by the answer-key pass. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnswerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub official_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marks: Option<u32>,
    #[serde(rename = "structure_data", skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Vec<QuestionBlock>>,
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Subject and topics of a document; `None` when the document is unknown.
    async fn document_context(&self, document_id: &str) -> Result<Option<DocumentContext>, UpstreamError>;

    /// Insert or update items by `(document id, number)`; returns the stored
    /// rows with their ids.
    async fn upsert_items(&self, items: &[PersistedItem]) -> Result<Vec<PersistedItem>, UpstreamError>;

    async fn update_image(&self, item_id: &str, image_url: &str) -> Result<(), UpstreamError>;

    async fn update_answer(&self, item_id: &str, update: &AnswerUpdate) -> Result<(), UpstreamError>;

    async fn items_for_document(&self, document_id: &str) -> Result<Vec<PersistedItem>, UpstreamError>;
}

// ── PostgREST ────────────────────────────────────────────────────────────

/// [`ItemStore`] over a PostgREST endpoint (`{url}/rest/v1`).
pub struct PostgrestStore {
    client: reqwest::Client,
    base: String,
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct PaperRow {
    subject_id: Option<String>,
    #[serde(default)]
    subjects: Option<SubjectRow>,
}

#[derive(Deserialize)]
struct SubjectRow {
    name: Option<String>,
}

impl PostgrestStore {
    pub fn new(settings: &ServiceSettings) -> Result<Self, IngestError> {
        let url = settings.require_store_url()?;
        let key = settings.require_store_key()?;
        Ok(Self {
            client: authorized_client(key, settings.http_timeout_secs)?,
            base: format!("{url}/rest/v1"),
            timeout_secs: settings.http_timeout_secs,
        })
    }

    fn invalid(detail: impl std::fmt::Display) -> UpstreamError {
        UpstreamError::InvalidResponse {
            service: SERVICE.to_string(),
            detail: detail.to_string(),
        }
    }

    async fn patch(&self, item_id: &str, body: &impl Serialize) -> Result<(), UpstreamError> {
        let request = self
            .client
            .patch(format!("{}/questions", self.base))
            .query(&[("id", format!("eq.{item_id}"))])
            .header("Prefer", "return=minimal")
            .json(body);
        send(SERVICE, request, self.timeout_secs).await?;
        Ok(())
    }
}

#[async_trait]
impl ItemStore for PostgrestStore {
    async fn document_context(&self, document_id: &str) -> Result<Option<DocumentContext>, UpstreamError> {
        let request = self
            .client
            .get(format!("{}/papers", self.base))
            .query(&[
                ("id", format!("eq.{document_id}")),
                ("select", "id,subject_id,subjects(name)".to_string()),
            ]);
        let papers: Vec<PaperRow> = send(SERVICE, request, self.timeout_secs)
            .await?
            .json()
            .await
            .map_err(Self::invalid)?;
        let Some(paper) = papers.into_iter().next() else {
            return Ok(None);
        };

        let topics = match &paper.subject_id {
            Some(subject_id) => {
                let request = self
                    .client
                    .get(format!("{}/topics", self.base))
                    .query(&[
                        ("subject_id", format!("eq.{subject_id}")),
                        ("select", "id,name".to_string()),
                    ]);
                send(SERVICE, request, self.timeout_secs)
                    .await?
                    .json::<Vec<Topic>>()
                    .await
                    .map_err(Self::invalid)?
            }
            None => Vec::new(),
        };
        debug!("Document {}: {} topics", document_id, topics.len());

        Ok(Some(DocumentContext {
            subject_name: paper.subjects.and_then(|s| s.name),
            topics,
        }))
    }

    async fn upsert_items(&self, items: &[PersistedItem]) -> Result<Vec<PersistedItem>, UpstreamError> {
        let mut stored = Vec::with_capacity(items.len());
        for group in column_groups(items) {
            let request = self
                .client
                .post(format!("{}/questions", self.base))
                .query(&[("on_conflict", "paper_id,question_number")])
                .header("Prefer", "resolution=merge-duplicates,return=representation")
                .json(&group);
            let rows: Vec<PersistedItem> = send(SERVICE, request, self.timeout_secs)
                .await?
                .json()
                .await
                .map_err(Self::invalid)?;
            stored.extend(rows);
        }
        stored.sort_by_key(|row| row.number);
        info!("Upserted {} items", stored.len());
        Ok(stored)
    }

    async fn update_image(&self, item_id: &str, image_url: &str) -> Result<(), UpstreamError> {
        self.patch(item_id, &serde_json::json!({ "image_url": image_url }))
            .await
    }

    async fn update_answer(&self, item_id: &str, update: &AnswerUpdate) -> Result<(), UpstreamError> {
        self.patch(item_id, update).await
    }

    async fn items_for_document(&self, document_id: &str) -> Result<Vec<PersistedItem>, UpstreamError> {
        let request = self
            .client
            .get(format!("{}/questions", self.base))
            .query(&[
                ("paper_id", format!("eq.{document_id}")),
                ("order", "question_number.asc".to_string()),
            ]);
        send(SERVICE, request, self.timeout_secs)
            .await?
            .json()
            .await
            .map_err(Self::invalid)
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, DocumentContext>,
    rows: HashMap<(String, u32), PersistedItem>,
    next_id: u64,
    fail_upserts: bool,
}

/// Split `items` into batches that serialize the same set of columns.
///
/// A bulk upsert takes its column list from the first row, so a row that
/// omits an optional column next to one that sets it would have it nulled.
pub(crate) fn column_groups(items: &[PersistedItem]) -> Vec<Vec<&PersistedItem>> {
    let mut groups: Vec<((bool, bool, bool), Vec<&PersistedItem>)> = Vec::new();
    for item in items {
        let columns = (
            item.image_url.is_some(),
            item.official_answer.is_some(),
            item.ai_answer.is_some(),
        );
        match groups.iter_mut().find(|(key, _)| *key == columns) {
            Some((_, group)) => group.push(item),
            None => groups.push((columns, vec![item])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

/// [`ItemStore`] kept in memory with the same upsert semantics as the
/// PostgREST adapter: an existing row keeps its id, and fields omitted from
/// the write (`image_url`, `official_answer`, `ai_answer`) keep their stored
/// values.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document so lookups succeed.
    pub fn with_document(self, document_id: &str, context: DocumentContext) -> Self {
        self.lock().documents.insert(document_id.to_string(), context);
        self
    }

    /// Make every upsert fail with a 503.
    pub fn failing_upserts(self) -> Self {
        self.lock().fail_upserts = true;
        self
    }

    /// Every stored row, ordered by document and number.
    pub fn rows(&self) -> Vec<PersistedItem> {
        let mut rows: Vec<PersistedItem> = self.lock().rows.values().cloned().collect();
        rows.sort_by(|a, b| (&a.document_id, a.number).cmp(&(&b.document_id, b.number)));
        rows
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_by_id<'a>(
        state: &'a mut MemoryState,
        item_id: &str,
    ) -> Result<&'a mut PersistedItem, UpstreamError> {
        state
            .rows
            .values_mut()
            .find(|row| row.id.as_deref() == Some(item_id))
            .ok_or_else(|| UpstreamError::from_status(SERVICE, 404, format!("no item {item_id}")))
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn document_context(&self, document_id: &str) -> Result<Option<DocumentContext>, UpstreamError> {
        Ok(self.lock().documents.get(document_id).cloned())
    }

    async fn upsert_items(&self, items: &[PersistedItem]) -> Result<Vec<PersistedItem>, UpstreamError> {
        let mut state = self.lock();
        if state.fail_upserts {
            return Err(UpstreamError::from_status(SERVICE, 503, "unavailable"));
        }
        let mut stored = Vec::with_capacity(items.len());
        for item in items {
            let key = (item.document_id.clone(), item.number);
            let mut row = item.clone();
            match state.rows.get(&key) {
                Some(existing) => {
                    row.id = existing.id.clone();
                    row.image_url = row.image_url.or_else(|| existing.image_url.clone());
                    row.official_answer =
                        row.official_answer.or_else(|| existing.official_answer.clone());
                    row.ai_answer = row.ai_answer.or_else(|| existing.ai_answer.clone());
                }
                None => {
                    state.next_id += 1;
                    row.id = Some(format!("item-{}", state.next_id));
                }
            }
            state.rows.insert(key, row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn update_image(&self, item_id: &str, image_url: &str) -> Result<(), UpstreamError> {
        let mut state = self.lock();
        Self::row_by_id(&mut state, item_id)?.image_url = Some(image_url.to_string());
        Ok(())
    }

    async fn update_answer(&self, item_id: &str, update: &AnswerUpdate) -> Result<(), UpstreamError> {
        let mut state = self.lock();
        let row = Self::row_by_id(&mut state, item_id)?;
        if let Some(answer) = &update.official_answer {
            row.official_answer = Some(answer.clone());
        }
        if let Some(ai) = &update.ai_answer {
            row.ai_answer = Some(ai.clone());
        }
        if let Some(marks) = update.marks {
            row.marks = marks;
        }
        if let Some(blocks) = &update.blocks {
            row.blocks = blocks.clone();
        }
        Ok(())
    }

    async fn items_for_document(&self, document_id: &str) -> Result<Vec<PersistedItem>, UpstreamError> {
        Ok(self
            .rows()
            .into_iter()
            .filter(|row| row.document_id == document_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::QuestionKind;

    fn item(doc: &str, number: u32, content: &str) -> PersistedItem {
        PersistedItem {
            id: None,
            document_id: doc.into(),
            number,
            content: content.into(),
            kind: QuestionKind::Structured,
            marks: 1,
            topic_ids: vec![],
            options: vec![],
            blocks: vec![],
            figure: None,
            image_url: None,
            official_answer: None,
            ai_answer: None,
        }
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row_per_key() {
        let store = MemoryStore::new();
        let first = store
            .upsert_items(&[item("p", 1, "a"), item("p", 2, "b")])
            .await
            .unwrap();
        let second = store
            .upsert_items(&[item("p", 1, "a2"), item("p", 2, "b")])
            .await
            .unwrap();
        assert_eq!(store.rows().len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(store.rows()[0].content, "a2");
    }

    #[tokio::test]
    async fn rerun_does_not_clear_side_effect_fields() {
        let store = MemoryStore::new();
        let stored = store.upsert_items(&[item("p", 3, "q")]).await.unwrap();
        let id = stored[0].id.clone().unwrap();
        store.update_image(&id, "https://cdn/figures/x.png").await.unwrap();
        store
            .update_answer(
                &id,
                &AnswerUpdate {
                    official_answer: Some("B".into()),
                    ai_answer: Some("Velocity has a direction.".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.upsert_items(&[item("p", 3, "q")]).await.unwrap();
        let row = &store.rows()[0];
        assert_eq!(row.image_url.as_deref(), Some("https://cdn/figures/x.png"));
        assert_eq!(row.official_answer.as_deref(), Some("B"));
        assert_eq!(row.ai_answer.as_deref(), Some("Velocity has a direction."));
    }

    #[test]
    fn unset_answer_columns_are_not_written() {
        let json = serde_json::to_value(item("p", 1, "q")).unwrap();
        let row = json.as_object().unwrap();
        assert!(!row.contains_key("ai_answer"));
        assert!(!row.contains_key("official_answer"));
        assert!(!row.contains_key("image_url"));

        let mut with_rationale = item("p", 2, "q");
        with_rationale.ai_answer = Some("because".into());
        let json = serde_json::to_value(&with_rationale).unwrap();
        assert_eq!(json["ai_answer"], "because");
    }

    #[test]
    fn rows_are_grouped_by_written_columns() {
        let mut explained = item("p", 2, "b");
        explained.ai_answer = Some("because".into());
        let items = vec![item("p", 1, "a"), explained, item("p", 3, "c")];

        let groups = column_groups(&items);
        let numbers: Vec<Vec<u32>> = groups
            .iter()
            .map(|g| g.iter().map(|i| i.number).collect())
            .collect();
        assert_eq!(numbers, vec![vec![1, 3], vec![2]]);
        assert!(column_groups(&[]).is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_and_documents() {
        let store = MemoryStore::new().with_document("p", DocumentContext::default());
        assert!(store.document_context("p").await.unwrap().is_some());
        assert!(store.document_context("nope").await.unwrap().is_none());
        let err = store.update_image("missing", "u").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn answer_update_omits_unset_fields() {
        let update = AnswerUpdate {
            official_answer: Some("C".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json, serde_json::json!({"official_answer": "C"}));
    }
}
