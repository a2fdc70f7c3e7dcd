use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use index::{CacheStats, GraphStats, SearchHit};
use pipeline::{IngestionReport, PipelineContext};
use query::QueryResult;

use crate::error::ApiError;
use crate::metrics::{Metrics, MetricsSnapshot, TimedOperation};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PipelineContext>,
    pub metrics: Arc<Metrics>,
    pub cache: Option<Arc<index::CachedEmbedder>>,
}

#[derive(Deserialize)]
struct IngestParams {
    source: Option<String>,
}

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
}

#[derive(Deserialize)]
struct SearchRequest {
    text: String,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    5
}

#[derive(Serialize)]
struct HealthResponse {
    store: String,
    ready: bool,
    ingesting: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    graph: GraphStats,
    pipeline: MetricsSnapshot,
    embedding_cache: Option<CacheStats>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ingest", post(ingest_document))
        .route("/query", post(answer_question))
        .route("/search", post(search_entities))
        .route("/stats", get(get_stats))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, store) = match state.pipeline.health().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("error: {e}")),
    };

    (
        status,
        Json(HealthResponse {
            store,
            ready: state.pipeline.is_ready(),
            ingesting: state.pipeline.is_ingesting(),
        }),
    )
}

/// Raw document bytes in the body, the upload name in `?source=`.
async fn ingest_document(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> Result<Json<IngestionReport>, ApiError> {
    let source = params.source.unwrap_or_else(|| "upload.txt".to_string());
    let timer = TimedOperation::start();

    let result = state.pipeline.ingest_bytes(&body, &source).await;
    state.metrics.record_ingest(timer.elapsed(), result.as_ref().ok());

    Ok(Json(result?))
}

async fn answer_question(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResult>, ApiError> {
    let timer = TimedOperation::start();

    let result = state.pipeline.ask(&req.question).await;
    state.metrics.record_question(timer.elapsed(), result.is_ok());

    Ok(Json(result?))
}

async fn search_entities(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    let hits = state.pipeline.search(&req.text, req.k).await?;
    Ok(Json(hits))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let graph = state.pipeline.stats().await?;

    Ok(Json(StatsResponse {
        graph,
        pipeline: state.metrics.snapshot(),
        embedding_cache: state.cache.as_ref().map(|c| c.stats()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use extract::provider::{RawNode, RawNodeRef, RawRelationship};
    use extract::{ExtractionError, ExtractionProvider, GraphSchema, LlmError, RawExtraction, TextGenerator};
    use index::{Embedder, EmbeddingError, MemoryGraphStore};
    use ingest::Chunk;
    use pipeline::{PipelineConfig, Services};

    struct JohnTakesMetformin;

    #[async_trait]
    impl ExtractionProvider for JohnTakesMetformin {
        async fn extract(&self, _chunk: &Chunk, _schema: &GraphSchema) -> Result<RawExtraction, ExtractionError> {
            let john = RawNodeRef {
                id: "John".into(),
                node_type: "Patient".into(),
            };
            let metformin = RawNodeRef {
                id: "Metformin".into(),
                node_type: "Medication".into(),
            };
            Ok(RawExtraction {
                nodes: vec![RawNode {
                    id: "John".into(),
                    node_type: "Patient".into(),
                    properties: Value::Null,
                }],
                relationships: vec![RawRelationship {
                    source: john,
                    target: metformin,
                    rel_type: "TAKES_MEDICATION".into(),
                    properties: Value::Null,
                }],
            })
        }
    }

    struct Model;

    #[async_trait]
    impl TextGenerator for Model {
        async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
            if prompt.contains("Question: Tell me a joke") {
                Ok("Why did the chicken cross the road?".into())
            } else if prompt.trim_end().ends_with("Cypher Query:") {
                Ok("MATCH (p:Patient)-[:TAKES_MEDICATION]->(m:Medication) RETURN m.id".into())
            } else {
                Ok("John takes Metformin.".into())
            }
        }
    }

    struct Flat;

    #[async_trait]
    impl Embedder for Flat {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![1.0, text.len() as f32])
        }
    }

    fn app() -> Router {
        let pipeline = PipelineContext::new(
            PipelineConfig::default(),
            GraphSchema::biomedical(),
            Services {
                store: Arc::new(MemoryGraphStore::new()),
                extraction: Arc::new(JohnTakesMetformin),
                llm: Arc::new(Model),
                embedder: Arc::new(Flat),
                entity_index: None,
            },
        )
        .unwrap();
        let state = AppState {
            pipeline: Arc::new(pipeline),
            metrics: Metrics::new(),
            cache: None,
        };
        router(state, 1024 * 1024)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn ingest_note() -> Request<Body> {
        Request::post("/ingest?source=note.txt")
            .body(Body::from("Patient John takes Metformin."))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_readiness() {
        let app = app();
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "ok");
        assert_eq!(body["ready"], false);
    }

    #[tokio::test]
    async fn query_needs_an_ingested_document() {
        let app = app();
        let (status, body) = send(&app, post_json("/query", json!({ "question": "What does John take?" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["status"], 409);
    }

    #[tokio::test]
    async fn ingest_then_ask() {
        let app = app();

        let (status, report) = send(&app, ingest_note()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["source"], "note.txt");
        assert_eq!(report["entities"], 2);
        assert_eq!(report["relationships"], 1);

        let (status, body) = send(&app, post_json("/query", json!({ "question": "What does John take?" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], "John takes Metformin.");
        assert_eq!(body["result_rows"][0]["m.id"], "Metformin");
        assert!(body["raw_response"]["intermediate_steps"].is_array());

        let (status, stats) = send(&app, Request::get("/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["graph"]["node_count"], 2);
        assert_eq!(stats["pipeline"]["ingestions"], 1);
        assert_eq!(stats["pipeline"]["questions"], 1);
    }

    #[tokio::test]
    async fn unplannable_question_is_a_per_question_error() {
        let app = app();
        send(&app, ingest_note()).await;

        let (status, body) = send(&app, post_json("/query", json!({ "question": "Tell me a joke" }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"]["message"].as_str().unwrap().contains("usable query"));

        let (status, _) = send(&app, post_json("/query", json!({ "question": "What does John take?" }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn search_returns_hits() {
        let app = app();
        send(&app, ingest_note()).await;

        let (status, hits) = send(&app, post_json("/search", json!({ "text": "John" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(hits[0]["id"], "John");
        assert_eq!(hits[0]["label"], "Patient");
    }

    #[tokio::test]
    async fn undecodable_upload_is_unprocessable() {
        let app = app();
        let request = Request::post("/ingest?source=scan.bin")
            .body(Body::from(vec![0xff, 0xfe, 0x00, 0x9f]))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
