//! Axum JSON API exposing extraction triggers and queries.
//!
//! Authentication/session issuance is an external collaborator and is
//! not wired here.

use std::sync::Arc;

use adpulse_core::{ProjectReport, ProjectStatus, SourceOutcome};
use adpulse_extract::{ExtractionPipeline, ExtractionRequest, PipelineConfig, PipelineError};
use adpulse_integrations::{requirements, CredentialValidation, SUPPORTED_PLATFORMS};
use adpulse_store::{ExtractedDataFilter, DEFAULT_QUERY_LIMIT};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adpulse-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ExtractionPipeline>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/platforms", get(platforms_handler))
        .route(
            "/api/v1/platforms/{platform}/validate-credentials",
            post(validate_credentials_handler),
        )
        .route("/api/v1/data-sources/{id}/extract", post(extract_source_handler))
        .route("/api/v1/projects/{id}/extract", post(extract_project_handler))
        .route("/api/v1/projects/{id}/status", get(project_status_handler))
        .route("/api/v1/data", get(query_data_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let pipeline = Arc::new(ExtractionPipeline::from_config(&config).await?);

    let scheduler = pipeline.maybe_build_scheduler(&config).await?;
    if let Some(mut scheduler) = scheduler {
        scheduler.start().await?;
    }

    let port: u16 = std::env::var("ADPULSE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving AdPulse API");
    axum::serve(listener, app(AppState { pipeline })).await?;
    Ok(())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::ProjectInactive(_) | PipelineError::NoActiveDataSources(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn platforms_handler() -> Json<Value> {
    let platforms: Vec<Value> = SUPPORTED_PLATFORMS
        .iter()
        .map(|platform| {
            json!({
                "platform": platform,
                "requirements": requirements(platform),
            })
        })
        .collect();
    Json(json!({ "platforms": platforms }))
}

async fn validate_credentials_handler(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    Json(payload): Json<Map<String, Value>>,
) -> Json<CredentialValidation> {
    Json(
        state
            .pipeline
            .registry()
            .validate_credential_payload(&platform, &payload)
            .await,
    )
}

#[derive(Debug, Deserialize)]
struct ExtractBody {
    start_date: NaiveDate,
    end_date: NaiveDate,
    #[serde(default)]
    force_refresh: bool,
}

/// Always HTTP 200 with the structured outcome; failures are carried
/// by the `success` flag, mirroring the orchestrator's contract.
async fn extract_source_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExtractBody>,
) -> Json<SourceOutcome> {
    let request = ExtractionRequest::manual(body.start_date, body.end_date, body.force_refresh);
    Json(state.pipeline.extract_for_source(id, request).await)
}

async fn extract_project_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExtractBody>,
) -> Result<Json<ProjectReport>, ApiError> {
    let request = ExtractionRequest::manual(body.start_date, body.end_date, body.force_refresh);
    Ok(Json(state.pipeline.extract_for_project(id, request).await?))
}

async fn project_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectStatus>, ApiError> {
    Ok(Json(state.pipeline.extraction_status(id).await?))
}

#[derive(Debug, Deserialize, Default)]
struct DataQuery {
    data_source_id: Option<Uuid>,
    project_id: Option<Uuid>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    limit: Option<u32>,
}

async fn query_data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DataQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = ExtractedDataFilter {
        data_source_id: query.data_source_id,
        project_id: query.project_id,
        start_date: query.start_date,
        end_date: query.end_date,
        limit: query.limit,
    };
    let rows = state.pipeline.query_extracted(&filter).await?;
    Ok(Json(json!({
        "count": rows.len(),
        "limit": filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
        "data": rows,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adpulse_core::{ExtractionConfig, ScheduleConfig};
    use adpulse_integrations::IntegrationRegistry;
    use adpulse_store::MetricStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Uuid, Uuid) {
        let store = MetricStore::connect_in_memory().await.unwrap();
        let pipeline = ExtractionPipeline::new(store, IntegrationRegistry::new().unwrap());

        let project = pipeline.store().create_project("Acme").await.unwrap();
        let mut payload = Map::new();
        payload.insert("api_key".into(), json!("k-test"));
        let credential = pipeline
            .store()
            .create_credential(project.id, "klaviyo", &payload)
            .await
            .unwrap();
        let source = pipeline
            .store()
            .create_data_source(
                project.id,
                credential.id,
                "klaviyo",
                "Email campaigns",
                &ExtractionConfig::default(),
                &ScheduleConfig::default(),
            )
            .await
            .unwrap();

        let app = app(AppState {
            pipeline: Arc::new(pipeline),
        });
        (app, project.id, source.id)
    }

    fn json_request(method: &str, uri: String, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (app, _, _) = test_app().await;
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], json!("healthy"));
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    async fn platform_catalog_lists_requirements() {
        let (app, _, _) = test_app().await;
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/platforms")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let platforms = body["platforms"].as_array().unwrap();
        assert!(platforms
            .iter()
            .any(|entry| entry["platform"] == json!("google_ads")));
        assert!(platforms.iter().all(|entry| entry["requirements"]["required_fields"].is_array()));
    }

    #[tokio::test]
    async fn extract_query_and_status_round_trip() {
        let (app, project_id, source_id) = test_app().await;

        let extract_body = json!({ "start_date": "2026-02-27", "end_date": "2026-02-27" });
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                format!("/api/v1/data-sources/{source_id}/extract"),
                extract_body.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let outcome = body_json(resp).await;
        assert_eq!(outcome["success"], json!(true));
        assert_eq!(outcome["records_count"], json!(4));

        // Second trigger without force short-circuits on existing data.
        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                format!("/api/v1/data-sources/{source_id}/extract"),
                extract_body,
            ))
            .await
            .unwrap();
        let outcome = body_json(resp).await;
        assert_eq!(outcome["success"], json!(true));
        assert_eq!(outcome["message"], json!("data already exists"));

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/data?project_id={project_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["count"], json!(4));
        assert_eq!(body["limit"], json!(1000));

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/projects/{project_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data_sources"][0]["status"], json!("completed"));
    }

    #[tokio::test]
    async fn missing_project_maps_to_not_found() {
        let (app, _, _) = test_app().await;
        let resp = app
            .oneshot(json_request(
                "POST",
                format!("/api/v1/projects/{}/extract", Uuid::new_v4()),
                json!({ "start_date": "2026-02-27", "end_date": "2026-02-27" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("project not found"));
    }

    #[tokio::test]
    async fn credential_validation_reports_missing_fields() {
        let (app, _, _) = test_app().await;
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/v1/platforms/klaviyo/validate-credentials".to_string(),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["valid"], json!(false));
        assert_eq!(body["missing_fields"], json!(["api_key"]));
    }
}
