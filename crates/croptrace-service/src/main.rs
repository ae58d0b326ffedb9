use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use croptrace_api::{
    CropTraceApi, HarvestSubmission, LabSubmission, ManufacturingSubmission, MigrateResult,
    API_CONTRACT_VERSION,
};
use croptrace_core::{HtmlRenderer, ProvenanceSnapshot, TraceError, TrackingCode, TrackingRecord};
use croptrace_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: CropTraceApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "croptrace-service")]
#[command(about = "Local HTTP service for CropTrace")]
struct Args {
    #[arg(long, default_value = "./croptrace.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Base URL embedded in verification links.
    #[arg(long, default_value = "http://127.0.0.1:4020")]
    base_url: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn service_error(err: &TraceError) -> ServiceError {
    let status = match err {
        TraceError::UpstreamNotFound(_) | TraceError::TrackerNotFound(_) | TraceError::NotFound(_) => {
            StatusCode::NOT_FOUND
        }
        TraceError::NotPublicYet(_) => StatusCode::FORBIDDEN,
        TraceError::Validation(_) => StatusCode::BAD_REQUEST,
        TraceError::AlreadyExists { .. } => StatusCode::CONFLICT,
        TraceError::RendererFailure(_) | TraceError::Inconsistent { .. } | TraceError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    ServiceError {
        status,
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: err.to_string(),
    }
}

fn bad_request(message: impl Into<String>) -> ServiceError {
    ServiceError {
        status: StatusCode::BAD_REQUEST,
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: message.into(),
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_code(raw: &str) -> Result<TrackingCode, ServiceError> {
    TrackingCode::parse(raw).ok_or_else(|| bad_request(format!("malformed tracking code: {raw}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/harvest", post(submit_harvest))
        .route("/v1/manufacturing", post(submit_manufacturing))
        .route("/v1/lab", post(submit_lab))
        .route("/v1/track/:code", get(track_show))
        .route("/v1/track/:code/snapshot", get(track_snapshot))
        .route("/v1/track/:code/report", get(track_report))
        .route("/v1/admin/track/:code/promote", post(admin_promote))
        .route("/v1/admin/harvest/:harvest_id/regenerate", post(admin_regenerate))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let state = ServiceState { api: CropTraceApi::new(args.db, args.base_url) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "croptrace service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn submit_harvest(
    State(state): State<ServiceState>,
    Json(request): Json<HarvestSubmission>,
) -> Result<Json<ServiceEnvelope<TrackingRecord>>, ServiceError> {
    let record = state.api.record_harvest(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(record)))
}

async fn submit_manufacturing(
    State(state): State<ServiceState>,
    Json(request): Json<ManufacturingSubmission>,
) -> Result<Json<ServiceEnvelope<TrackingRecord>>, ServiceError> {
    let (_, tracker) = state.api.record_manufacturing(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(tracker)))
}

async fn submit_lab(
    State(state): State<ServiceState>,
    Json(request): Json<LabSubmission>,
) -> Result<Json<ServiceEnvelope<TrackingRecord>>, ServiceError> {
    let (_, tracker) = state.api.record_lab(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(tracker)))
}

async fn track_show(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> Result<Json<ServiceEnvelope<TrackingRecord>>, ServiceError> {
    let code = parse_code(&code)?;
    let record = state.api.lookup_by_code(&code, true).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(record)))
}

async fn track_snapshot(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> Result<Json<ServiceEnvelope<ProvenanceSnapshot>>, ServiceError> {
    let code = parse_code(&code)?;
    let _ = state.api.lookup_by_code(&code, true).map_err(|err| service_error(&err))?;
    let snapshot = state.api.build_snapshot(&code).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(snapshot)))
}

async fn track_report(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> Result<Response, ServiceError> {
    let code = parse_code(&code)?;
    let document =
        state.api.generate_document(&code, &HtmlRenderer).map_err(|err| service_error(&err))?;
    Ok((StatusCode::OK, [("content-type", "text/html; charset=utf-8")], document).into_response())
}

async fn admin_promote(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> Result<Json<ServiceEnvelope<TrackingRecord>>, ServiceError> {
    let code = parse_code(&code)?;
    let record = state.api.promote_to_public(&code).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(record)))
}

async fn admin_regenerate(
    State(state): State<ServiceState>,
    Path(harvest_id): Path<String>,
) -> Result<Json<ServiceEnvelope<TrackingRecord>>, ServiceError> {
    let record = state.api.regenerate(&harvest_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("croptrace-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_state(db_path: &std::path::Path) -> ServiceState {
        ServiceState {
            api: CropTraceApi::new(db_path.to_path_buf(), "https://trace.example.org"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn get_path(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let response = get_path(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(&db_path));

        let response = get_path(router, "/v1/openapi").await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/track/{code}/report"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn full_chain_flow_publishes_and_renders_the_report() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path);

        let harvest_payload = serde_json::json!({
            "harvest_id": "H-1",
            "species": "Ashwagandha",
            "weight_kg": 10.0,
            "season": "winter",
            "location": "Field 7",
            "farmer": "farmer-anita",
            "proof_uri": null
        });
        let response = post_json(app(state.clone()), "/v1/harvest", &harvest_payload).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let code = value
            .get("data")
            .and_then(|data| data.get("tracking_code"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.tracking_code in response: {value}"))
            .to_string();

        // Gate holds while the chain is incomplete.
        let gated = get_path(app(state.clone()), &format!("/v1/track/{code}/report")).await;
        assert_eq!(gated.status(), StatusCode::FORBIDDEN);

        let manufacturing_payload = serde_json::json!({
            "harvest_id": "H-1",
            "manufacturer": "acme-botanicals",
            "batch_id": "B-9",
            "product_name": "Ashwagandha Extract",
            "process_description": "dried and milled",
            "location": "Plant 2",
            "started_at": null,
            "completed_at": null,
            "metadata": {}
        });
        let response =
            post_json(app(state.clone()), "/v1/manufacturing", &manufacturing_payload).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.get("data").and_then(|data| data.get("status")).and_then(serde_json::Value::as_str),
            Some("manufacturing")
        );

        let lab_payload = serde_json::json!({
            "harvest_id": "H-1",
            "lab": "metro-labs",
            "test_type": "heavy-metals",
            "result": "PASS",
            "report_uri": null,
            "tested_at": null,
            "metadata": {}
        });
        let response = post_json(app(state.clone()), "/v1/lab", &lab_payload).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(
            value.get("data").and_then(|data| data.get("status")).and_then(serde_json::Value::as_str),
            Some("public")
        );

        let snapshot_response =
            get_path(app(state.clone()), &format!("/v1/track/{code}/snapshot")).await;
        assert_eq!(snapshot_response.status(), StatusCode::OK);
        let snapshot = response_json(snapshot_response).await;
        assert_eq!(
            snapshot
                .get("data")
                .and_then(|data| data.get("manufacturing"))
                .and_then(|section| section.get("batch_id"))
                .and_then(serde_json::Value::as_str),
            Some("B-9")
        );

        let report = get_path(app(state), &format!("/v1/track/{code}/report")).await;
        assert_eq!(report.status(), StatusCode::OK);
        let bytes = match to_bytes(report.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read report body: {err}"),
        };
        let html = String::from_utf8_lossy(&bytes);
        assert!(html.contains("PASS"));
        assert!(html.contains("B-9"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn admin_promotion_opens_the_public_read_path() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path);

        let harvest_payload = serde_json::json!({
            "harvest_id": "H-2",
            "species": "Tulsi",
            "weight_kg": 4.5,
            "season": "summer",
            "location": "Field 2",
            "farmer": "farmer-ravi",
            "proof_uri": null
        });
        let response = post_json(app(state.clone()), "/v1/harvest", &harvest_payload).await;
        let value = response_json(response).await;
        let code = value
            .get("data")
            .and_then(|data| data.get("tracking_code"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.tracking_code in response: {value}"))
            .to_string();

        let hidden = get_path(app(state.clone()), &format!("/v1/track/{code}")).await;
        assert_eq!(hidden.status(), StatusCode::FORBIDDEN);

        let promoted = post_json(
            app(state.clone()),
            &format!("/v1/admin/track/{code}/promote"),
            &serde_json::json!({}),
        )
        .await;
        assert_eq!(promoted.status(), StatusCode::OK);
        let value = response_json(promoted).await;
        assert_eq!(
            value
                .get("data")
                .and_then(|data| data.get("published_by"))
                .and_then(serde_json::Value::as_str),
            Some("administrative")
        );

        let visible = get_path(app(state), &format!("/v1/track/{code}")).await;
        assert_eq!(visible.status(), StatusCode::OK);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn unknown_code_and_missing_lineage_map_to_not_found() {
        let db_path = unique_temp_db_path();
        let state = test_state(&db_path);

        let code = "0".repeat(32);
        let missing = get_path(app(state.clone()), &format!("/v1/track/{code}")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = get_path(app(state.clone()), "/v1/track/not-a-code").await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let lab_payload = serde_json::json!({
            "harvest_id": "H-404",
            "lab": "metro-labs",
            "test_type": "heavy-metals",
            "result": "PASS",
            "report_uri": null,
            "tested_at": null,
            "metadata": {}
        });
        let orphan = post_json(app(state), "/v1/lab", &lab_payload).await;
        assert_eq!(orphan.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_file(&db_path);
    }
}
