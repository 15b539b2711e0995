//! JSON HTTP surface over the analysis entry points.
//!
//! | Route | Body | Reply |
//! |-------|------|-------|
//! | `GET /healthz` | – | `ok` |
//! | `POST /analyze` | [`AnalyzeRequest`] | [`AnalysisSummary`] |
//! | `POST /answer-key` | [`AnswerKeyRequest`] | [`AnswerKeySummary`] |
//! | `POST /check-answer` | [`CheckAnswerRequest`] | [`GradingResult`] |
//!
//! Errors reply `{"error": "..."}` with the status from
//! [`IngestError::status_code`]. A body that is not JSON, or lacks a required
//! field, is a 400 and never reaches the pipeline.

use crate::analyze::{analyze_document, process_answer_key, AnalyzeRequest, AnswerKeyRequest, Services};
use crate::config::PipelineConfig;
use crate::error::IngestError;
use crate::grading::{check_answer, CheckAnswerRequest, GradingResult};
use crate::output::{AnalysisSummary, AnswerKeySummary};
use crate::pipeline::retry::RetryPolicy;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub config: Arc<PipelineConfig>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type HandlerError = (StatusCode, Json<ErrorBody>);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/analyze", post(analyze_handler))
        .route("/answer-key", post(answer_key_handler))
        .route("/check-answer", post(check_answer_handler))
        .with_state(state)
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("exam-ingest listening on http://{}", addr);
    axum::serve(listener, router(state)).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn analyze_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalysisSummary>, HandlerError> {
    let request = body(payload)?;
    analyze_document(&state.services, &request, &state.config)
        .await
        .map(Json)
        .map_err(to_response)
}

async fn answer_key_handler(
    State(state): State<AppState>,
    payload: Result<Json<AnswerKeyRequest>, JsonRejection>,
) -> Result<Json<AnswerKeySummary>, HandlerError> {
    let request = body(payload)?;
    process_answer_key(&state.services, &request, &state.config)
        .await
        .map(Json)
        .map_err(to_response)
}

async fn check_answer_handler(
    State(state): State<AppState>,
    payload: Result<Json<CheckAnswerRequest>, JsonRejection>,
) -> Result<Json<GradingResult>, HandlerError> {
    let request = body(payload)?;
    let policy = RetryPolicy::new(state.config.max_attempts, state.config.retry_backoff_ms);
    check_answer(state.services.model.as_ref(), &request, policy)
        .await
        .map(Json)
        .map_err(to_response)
}

/// Unwrap a JSON body; every rejection is a bad request.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, HandlerError> {
    payload
        .map(|Json(request)| request)
        .map_err(|rejection| to_response(IngestError::InvalidRequest(rejection.body_text())))
}

fn to_response(err: IngestError) -> HandlerError {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::pipeline::extract::{ExtractionModel, ModelReply, ModelRequest};
    use crate::pipeline::render::{DocumentLoader, PageSource};
    use crate::services::{CropRequest, FigureCropper, MemoryBlobStore, MemoryStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExtractionModel for CountingModel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn complete(&self, _request: &ModelRequest) -> Result<ModelReply, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelReply {
                text: r#"{"isCorrect": true, "score": 90, "feedback": "Correct unit."}"#.into(),
                ..Default::default()
            })
        }
    }

    struct NoLoader;

    #[async_trait]
    impl DocumentLoader for NoLoader {
        async fn load(&self, url: &str) -> Result<Arc<dyn PageSource>, IngestError> {
            panic!("unexpected download of {url}");
        }
    }

    struct NoCropper;

    #[async_trait]
    impl FigureCropper for NoCropper {
        async fn crop(&self, _request: &CropRequest) -> Result<Vec<u8>, UpstreamError> {
            panic!("unexpected crop");
        }
    }

    fn app() -> (Router, Arc<CountingModel>) {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let state = AppState {
            services: Services {
                model: model.clone(),
                store: Arc::new(MemoryStore::new()),
                blobs: Arc::new(MemoryBlobStore::new()),
                cropper: Arc::new(NoCropper),
                loader: Arc::new(NoLoader),
            },
            config: Arc::new(PipelineConfig::default()),
        };
        (router(state), model)
    }

    async fn post(app: Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| panic!("non-JSON body: {}", String::from_utf8_lossy(&bytes)));
        (status, json)
    }

    #[test]
    fn errors_map_to_status_and_body() {
        let (status, Json(body)) = to_response(IngestError::DocumentNotFound {
            document_id: "p-9".into(),
        });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.error.contains("p-9"));

        let (status, _) = to_response(IngestError::InvalidRequest("studentAnswer is required".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = to_response(IngestError::InvalidConfig("x".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn health_check() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn missing_field_is_a_json_bad_request() {
        let (app, model) = app();
        let (status, body) = post(
            app,
            "/analyze",
            r#"{"documentUrl":"https://x/p.pdf","category":"mcq"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("documentId"));

        let (app, _) = self::app();
        let (status, body) = post(app, "/check-answer", r#"{"questionContent":"Unit of force?"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("studentAnswer"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_a_json_bad_request() {
        let (app, _) = app();
        let (status, body) = post(app, "/answer-key", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn missing_content_type_is_a_bad_request() {
        let (app, _) = app();
        let request = Request::post("/check-answer")
            .body(Body::from(r#"{"questionContent":"q","studentAnswer":"a"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_category_is_rejected_before_any_call() {
        let (app, model) = app();
        let (status, body) = post(
            app,
            "/analyze",
            r#"{"documentId":"p","documentUrl":"https://x/p.pdf","category":"essay"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("essay"));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_document_is_not_found() {
        let (app, _) = app();
        let (status, body) = post(
            app,
            "/analyze",
            r#"{"documentId":"missing","documentUrl":"https://x/p.pdf","category":"mcq"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));

        let (app, _) = self::app();
        let (status, _) = post(
            app,
            "/answer-key",
            r#"{"documentId":"missing","answerKeyUrl":"https://x/k.pdf"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn check_answer_returns_the_grade() {
        let (app, model) = app();
        let (status, body) = post(
            app,
            "/check-answer",
            r#"{"questionContent":"State the SI unit of force.","officialAnswer":"newton","studentAnswer":"N","marks":1}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isCorrect"], true);
        assert_eq!(body["score"], 90);
        assert_eq!(body["feedback"], "Correct unit.");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }
}
