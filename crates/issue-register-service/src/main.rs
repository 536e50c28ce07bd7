use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use issue_register_api::{
    load_config, AcceptStepsRequest, ActivityReportRequest, AgendaRequest, EditIssueRequest, IngestRequest,
    IssueRegisterApi, LinkMeetingDocumentRequest, MergeIssuesRequest, ResolvePendingRequest, SplitIssueRequest,
    API_CONTRACT_VERSION,
};
use issue_register_core::{
    DocumentDraft, EvidenceRequest, IssueDraft, IssueFilter, IssueId, IssueStatus, MeetingDraft, PendingMatchId,
    PendingStatus, RegisterError, SourceKind, SourceRef, StaleRevisionConflict,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    api: IssueRegisterApi,
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
    error_code: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    conflict: Option<StaleRevisionConflict>,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ExportRequest {
    out_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct ImportRequest {
    in_dir: PathBuf,
    #[serde(default)]
    skip_existing: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct BackupRequest {
    out_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
struct RestoreRequest {
    in_file: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListIssuesQuery {
    status: Option<IssueStatus>,
    domain: Option<String>,
    owner: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListPendingQuery {
    status: Option<PendingStatus>,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceEvidenceQuery {
    #[serde(default)]
    source_kind: SourceKind,
    source_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "issue-register-service")]
#[command(about = "Local HTTP service for the issue register")]
struct Args {
    #[arg(long, default_value = "./issue_register.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// YAML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, error_code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_code,
            error: message.into(),
            conflict: None,
        }
    }
}

impl From<RegisterError> for ServiceError {
    fn from(err: RegisterError) -> Self {
        Self::from(anyhow::Error::from(err))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let Some(register_error) = err.downcast_ref::<RegisterError>() else {
            return Self::new(StatusCode::BAD_REQUEST, "request_failed", message);
        };
        let status = match register_error {
            RegisterError::StaleRevision(_) => StatusCode::CONFLICT,
            RegisterError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RegisterError::NotFound(_) => StatusCode::NOT_FOUND,
            RegisterError::OracleUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegisterError::Validation(_) => StatusCode::BAD_REQUEST,
            RegisterError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut service_error = Self::new(status, register_error.code(), message);
        if let RegisterError::StaleRevision(conflict) = register_error {
            service_error.conflict = Some((**conflict).clone());
        }
        service_error
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

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

/// SQLite access and ingestion block, so every API call runs on the blocking pool.
async fn blocking<T, F>(call: F) -> ServiceResult<T>
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let data = tokio::task::spawn_blocking(call).await.map_err(|err| {
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", format!("worker task failed: {err}"))
    })??;
    Ok(Json(envelope(data)))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/db/export", post(db_export))
        .route("/v1/db/import", post(db_import))
        .route("/v1/db/backup", post(db_backup))
        .route("/v1/db/restore", post(db_restore))
        .route("/v1/issues", get(issues_list).post(issues_create))
        .route("/v1/issues/:issue_id", get(issues_get))
        .route("/v1/issues/:issue_id/edit", post(issues_edit))
        .route("/v1/issues/:issue_id/revisions", get(issues_revisions))
        .route("/v1/issues/:issue_id/evidence", get(issues_evidence).post(issues_link_evidence))
        .route("/v1/issues/:issue_id/accept-steps", post(issues_accept_steps))
        .route("/v1/issues/:issue_id/split", post(issues_split))
        .route("/v1/merges", post(merges_apply))
        .route("/v1/merges/suggest", post(merges_suggest))
        .route("/v1/pending", get(pending_list))
        .route("/v1/pending/:pending_id", get(pending_get))
        .route("/v1/pending/:pending_id/confirm", post(pending_confirm))
        .route("/v1/pending/:pending_id/reject", post(pending_reject))
        .route("/v1/ingest", post(ingest_run))
        .route("/v1/ingest/retry-deferred", post(ingest_retry_deferred))
        .route("/v1/ingest/deferred", get(ingest_deferred))
        .route("/v1/ingest/last-run", get(ingest_last_run))
        .route("/v1/agenda", post(agenda))
        .route("/v1/reports/activity", post(report_activity))
        .route("/v1/sources/documents", get(sources_documents).post(sources_register_document))
        .route("/v1/sources/meetings", get(sources_meetings).post(sources_register_meeting))
        .route("/v1/sources/meeting-documents", get(sources_meeting_documents).post(sources_link_meeting_document))
        .route("/v1/sources/evidence", get(sources_evidence))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(args.config.as_deref())?;
    let state = ServiceState { api: IssueRegisterApi::with_config(args.db, config) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "issue register service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn parse_issue_id(raw: &str) -> Result<IssueId, ServiceError> {
    Ok(IssueId::parse(raw)?)
}

fn parse_pending_id(raw: &str) -> Result<PendingMatchId, ServiceError> {
    Ok(PendingMatchId::parse(raw)?)
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> ServiceResult<issue_register_store_sqlite::SchemaStatus> {
    blocking(move || state.api.schema_status()).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<issue_register_api::MigrateResult> {
    blocking(move || state.api.migrate(request.dry_run)).await
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> ServiceResult<issue_register_store_sqlite::IntegrityReport> {
    blocking(move || state.api.integrity_check()).await
}

async fn db_export(
    State(state): State<ServiceState>,
    Json(request): Json<ExportRequest>,
) -> ServiceResult<issue_register_store_sqlite::ExportManifest> {
    blocking(move || state.api.export_snapshot(&request.out_dir)).await
}

async fn db_import(
    State(state): State<ServiceState>,
    Json(request): Json<ImportRequest>,
) -> ServiceResult<issue_register_store_sqlite::ImportSummary> {
    blocking(move || state.api.import_snapshot(&request.in_dir, request.skip_existing)).await
}

async fn db_backup(
    State(state): State<ServiceState>,
    Json(request): Json<BackupRequest>,
) -> ServiceResult<serde_json::Value> {
    blocking(move || {
        state.api.backup(&request.out_file)?;
        Ok(serde_json::json!({ "backup_file": request.out_file }))
    })
    .await
}

async fn db_restore(
    State(state): State<ServiceState>,
    Json(request): Json<RestoreRequest>,
) -> ServiceResult<serde_json::Value> {
    blocking(move || {
        state.api.restore(&request.in_file)?;
        Ok(serde_json::json!({ "restored_from": request.in_file }))
    })
    .await
}

async fn issues_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListIssuesQuery>,
) -> ServiceResult<Vec<issue_register_core::Issue>> {
    let filter = IssueFilter {
        status: query.status,
        domain_contains: query.domain,
        owner_contains: query.owner,
        limit: query.limit,
    };
    blocking(move || state.api.list_issues(&filter)).await
}

async fn issues_create(
    State(state): State<ServiceState>,
    Json(request): Json<IssueDraft>,
) -> ServiceResult<issue_register_core::Issue> {
    blocking(move || state.api.create_issue(request)).await
}

async fn issues_get(
    State(state): State<ServiceState>,
    Path(issue_id): Path<String>,
) -> ServiceResult<issue_register_core::Issue> {
    let issue_id = parse_issue_id(&issue_id)?;
    blocking(move || state.api.get_issue(issue_id)).await
}

async fn issues_edit(
    State(state): State<ServiceState>,
    Path(issue_id): Path<String>,
    Json(request): Json<EditIssueRequest>,
) -> ServiceResult<issue_register_core::Issue> {
    let issue_id = parse_issue_id(&issue_id)?;
    blocking(move || state.api.edit_issue(issue_id, &request)).await
}

async fn issues_revisions(
    State(state): State<ServiceState>,
    Path(issue_id): Path<String>,
) -> ServiceResult<Vec<issue_register_core::Revision>> {
    let issue_id = parse_issue_id(&issue_id)?;
    blocking(move || state.api.issue_revisions(issue_id)).await
}

async fn issues_evidence(
    State(state): State<ServiceState>,
    Path(issue_id): Path<String>,
) -> ServiceResult<Vec<issue_register_core::EvidenceLink>> {
    let issue_id = parse_issue_id(&issue_id)?;
    blocking(move || state.api.issue_evidence(issue_id)).await
}

async fn issues_link_evidence(
    State(state): State<ServiceState>,
    Path(issue_id): Path<String>,
    Json(request): Json<EvidenceRequest>,
) -> ServiceResult<issue_register_core::EvidenceLink> {
    let issue_id = parse_issue_id(&issue_id)?;
    blocking(move || state.api.link_evidence(issue_id, request)).await
}

async fn issues_accept_steps(
    State(state): State<ServiceState>,
    Path(issue_id): Path<String>,
    Json(request): Json<AcceptStepsRequest>,
) -> ServiceResult<issue_register_core::Issue> {
    let issue_id = parse_issue_id(&issue_id)?;
    blocking(move || state.api.accept_suggested_steps(issue_id, request)).await
}

async fn issues_split(
    State(state): State<ServiceState>,
    Path(issue_id): Path<String>,
    Json(request): Json<SplitIssueRequest>,
) -> ServiceResult<issue_register_core::SplitReceipt> {
    let issue_id = parse_issue_id(&issue_id)?;
    blocking(move || state.api.split_issue(issue_id, &request)).await
}

async fn merges_apply(
    State(state): State<ServiceState>,
    Json(request): Json<MergeIssuesRequest>,
) -> ServiceResult<issue_register_core::MergeReceipt> {
    blocking(move || state.api.merge_issues(request)).await
}

async fn merges_suggest(
    State(state): State<ServiceState>,
) -> ServiceResult<Vec<issue_register_core::MergeSuggestion>> {
    blocking(move || state.api.suggest_merges()).await
}

async fn pending_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListPendingQuery>,
) -> ServiceResult<Vec<issue_register_core::PendingMatch>> {
    blocking(move || state.api.list_pending(query.status)).await
}

async fn pending_get(
    State(state): State<ServiceState>,
    Path(pending_id): Path<String>,
) -> ServiceResult<issue_register_core::PendingMatch> {
    let pending_id = parse_pending_id(&pending_id)?;
    blocking(move || state.api.get_pending(pending_id)).await
}

async fn pending_confirm(
    State(state): State<ServiceState>,
    Path(pending_id): Path<String>,
    Json(request): Json<ResolvePendingRequest>,
) -> ServiceResult<issue_register_core::ReconcileResult> {
    let pending_id = parse_pending_id(&pending_id)?;
    blocking(move || state.api.confirm_pending(pending_id, request)).await
}

async fn pending_reject(
    State(state): State<ServiceState>,
    Path(pending_id): Path<String>,
    Json(request): Json<ResolvePendingRequest>,
) -> ServiceResult<issue_register_core::RejectReceipt> {
    let pending_id = parse_pending_id(&pending_id)?;
    blocking(move || state.api.reject_pending(pending_id, request)).await
}

async fn ingest_run(
    State(state): State<ServiceState>,
    Json(request): Json<IngestRequest>,
) -> ServiceResult<issue_register_core::IngestReport> {
    blocking(move || state.api.ingest(request)).await
}

async fn ingest_retry_deferred(
    State(state): State<ServiceState>,
) -> ServiceResult<issue_register_core::IngestReport> {
    blocking(move || state.api.retry_deferred()).await
}

async fn ingest_deferred(
    State(state): State<ServiceState>,
) -> ServiceResult<Vec<issue_register_core::DeferredCandidate>> {
    blocking(move || state.api.list_deferred()).await
}

async fn ingest_last_run(
    State(state): State<ServiceState>,
) -> ServiceResult<issue_register_api::IngestRunWindow> {
    blocking(move || state.api.last_ingest_run()).await
}

async fn agenda(
    State(state): State<ServiceState>,
    Json(request): Json<AgendaRequest>,
) -> ServiceResult<Vec<issue_register_core::AgendaItem>> {
    blocking(move || state.api.agenda(&request)).await
}

async fn report_activity(
    State(state): State<ServiceState>,
    Json(request): Json<ActivityReportRequest>,
) -> ServiceResult<issue_register_api::ActivityReport> {
    blocking(move || state.api.activity_report(&request)).await
}

async fn sources_evidence(
    State(state): State<ServiceState>,
    Query(query): Query<SourceEvidenceQuery>,
) -> ServiceResult<Vec<issue_register_core::EvidenceLink>> {
    let source = SourceRef { kind: query.source_kind, id: query.source_id };
    blocking(move || state.api.evidence_for_source(&source)).await
}

async fn sources_documents(
    State(state): State<ServiceState>,
) -> ServiceResult<Vec<issue_register_core::Document>> {
    blocking(move || state.api.list_documents()).await
}

async fn sources_register_document(
    State(state): State<ServiceState>,
    Json(request): Json<DocumentDraft>,
) -> ServiceResult<issue_register_api::DocumentRegistration> {
    blocking(move || state.api.register_document(request)).await
}

async fn sources_meetings(
    State(state): State<ServiceState>,
) -> ServiceResult<Vec<issue_register_core::Meeting>> {
    blocking(move || state.api.list_meetings()).await
}

async fn sources_register_meeting(
    State(state): State<ServiceState>,
    Json(request): Json<MeetingDraft>,
) -> ServiceResult<issue_register_core::Meeting> {
    blocking(move || state.api.register_meeting(request)).await
}

async fn sources_meeting_documents(
    State(state): State<ServiceState>,
) -> ServiceResult<Vec<issue_register_core::MeetingDocumentLink>> {
    blocking(move || state.api.meeting_document_links()).await
}

async fn sources_link_meeting_document(
    State(state): State<ServiceState>,
    Json(request): Json<LinkMeetingDocumentRequest>,
) -> ServiceResult<issue_register_core::MeetingDocumentLink> {
    blocking(move || state.api.link_meeting_document(&request)).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use http::Request;
    use issue_register_core::{MergeDetectionConfig, RegisterConfig, RegisterResult, SimilarityOracle};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("issue-register-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn router_for(api: IssueRegisterApi) -> Router {
        app(ServiceState { api })
    }

    struct DownOracle;

    impl SimilarityOracle for DownOracle {
        fn score(&self, _left: &str, _right: &str) -> RegisterResult<f32> {
            Err(RegisterError::OracleUnavailable("embedding endpoint returned HTTP 429".to_string()))
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
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

    fn data_str<'a>(value: &'a Value, field: &str) -> &'a str {
        value
            .get("data")
            .and_then(|data| data.get(field))
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing data.{field} in response: {value}"))
    }

    fn error_code(value: &Value) -> Option<&str> {
        value.get("error_code").and_then(Value::as_str)
    }

    async fn create_issue(router: &Router, title: &str, domain: &str) -> String {
        let response = send(
            router,
            "POST",
            "/v1/issues",
            Some(json!({ "title": title, "domain": domain, "confidence": 0.5 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        data_str(&response_json(response).await, "id").to_string()
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = router_for(IssueRegisterApi::new(unique_temp_db_path()));
        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.get("api_contract_version").and_then(Value::as_str), Some(API_CONTRACT_VERSION));
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = router_for(IssueRegisterApi::new(unique_temp_db_path()));
        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/issues/{issue_id}/edit"));
        assert!(body.contains("/v1/reports/activity"));
    }

    #[tokio::test]
    async fn stale_edits_conflict_and_closed_issues_reject_changes() {
        let router = router_for(IssueRegisterApi::new(unique_temp_db_path()));
        let issue_id = create_issue(&router, "Office lease renewal", "Facilities").await;
        let edit_uri = format!("/v1/issues/{issue_id}/edit");

        let first = send(&router, "POST", &edit_uri, Some(json!({ "base_revision": 1, "owner": "dana" }))).await;
        assert_eq!(first.status(), StatusCode::OK);

        let stale = send(&router, "POST", &edit_uri, Some(json!({ "base_revision": 1, "title": "Lease" }))).await;
        assert_eq!(stale.status(), StatusCode::CONFLICT);
        let stale_value = response_json(stale).await;
        assert_eq!(error_code(&stale_value), Some("stale_revision"));
        assert_eq!(
            stale_value
                .get("conflict")
                .and_then(|conflict| conflict.get("current_revision"))
                .and_then(Value::as_u64),
            Some(2)
        );

        let closed = send(&router, "POST", &edit_uri, Some(json!({ "base_revision": 2, "status": "closed" }))).await;
        assert_eq!(closed.status(), StatusCode::OK);
        let rejected = send(&router, "POST", &edit_uri, Some(json!({ "base_revision": 3, "title": "Lease" }))).await;
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error_code(&response_json(rejected).await), Some("invalid_transition"));

        let revisions = send(&router, "GET", &format!("/v1/issues/{issue_id}/revisions"), None).await;
        assert_eq!(revisions.status(), StatusCode::OK);
        let revisions_value = response_json(revisions).await;
        assert_eq!(revisions_value.get("data").and_then(Value::as_array).map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_map_to_404_and_400() {
        let router = router_for(IssueRegisterApi::new(unique_temp_db_path()));
        let missing = send(&router, "GET", &format!("/v1/issues/{}", ulid::Ulid::new()), None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(&response_json(missing).await), Some("not_found"));

        let malformed = send(&router, "GET", "/v1/issues/not-a-ulid", None).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response_json(malformed).await), Some("validation_error"));
    }

    #[tokio::test]
    async fn ingest_then_confirm_pending_match() {
        let router = router_for(IssueRegisterApi::new(unique_temp_db_path()));
        let seed = json!({
            "candidates": [{
                "source_id": "doc-1",
                "text": "Supplier lead times slipped to twelve weeks",
                "themes": ["Supply Chain"],
                "domain": "Supply Chain"
            }]
        });
        let created = send(&router, "POST", "/v1/ingest", Some(seed)).await;
        assert_eq!(created.status(), StatusCode::OK);
        let created_value = response_json(created).await;
        assert_eq!(
            created_value.pointer("/data/summary/created").and_then(Value::as_u64),
            Some(1)
        );

        let possible = json!({
            "candidates": [{
                "source_id": "doc-2",
                "text": "Supplier lead times now affect the spring launch",
                "domain": "Supply Chain"
            }]
        });
        let pending = send(&router, "POST", "/v1/ingest", Some(possible)).await;
        let pending_value = response_json(pending).await;
        assert_eq!(pending_value.pointer("/data/summary/pending").and_then(Value::as_u64), Some(1));

        let listed = response_json(send(&router, "GET", "/v1/pending?status=pending", None).await).await;
        let pending_id = listed
            .pointer("/data/0/pending_id")
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing pending id: {listed}"))
            .to_string();

        let shown = response_json(send(&router, "GET", &format!("/v1/pending/{pending_id}"), None).await).await;
        assert_eq!(data_str(&shown, "status"), "pending");
        assert_eq!(shown.pointer("/data/candidate/source_id").and_then(Value::as_str), Some("doc-2"));

        let confirmed = send(&router, "POST", &format!("/v1/pending/{pending_id}/confirm"), Some(json!({}))).await;
        assert_eq!(confirmed.status(), StatusCode::OK);
        let confirmed_value = response_json(confirmed).await;
        assert_eq!(data_str(&confirmed_value, "outcome"), "revised");
        let issue_id = data_str(&confirmed_value, "issue_id").to_string();

        let resolved = response_json(send(&router, "GET", &format!("/v1/pending/{pending_id}"), None).await).await;
        assert_eq!(data_str(&resolved, "status"), "confirmed");

        let cited = send(&router, "GET", "/v1/sources/evidence?source_kind=document&source_id=doc-2", None).await;
        assert_eq!(cited.status(), StatusCode::OK);
        let cited_value = response_json(cited).await;
        assert_eq!(cited_value.get("data").and_then(Value::as_array).map(Vec::len), Some(1));
        assert_eq!(cited_value.pointer("/data/0/issue_id").and_then(Value::as_str), Some(issue_id.as_str()));

        let uncited = response_json(send(&router, "GET", "/v1/sources/evidence?source_id=doc-404", None).await).await;
        assert_eq!(uncited.get("data").and_then(Value::as_array).map(Vec::len), Some(0));

        let missing = send(&router, "GET", &format!("/v1/pending/{}", ulid::Ulid::new()), None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let again = send(&router, "POST", &format!("/v1/pending/{pending_id}/confirm"), Some(json!({}))).await;
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);

        let last_run = response_json(send(&router, "GET", "/v1/ingest/last-run", None).await).await;
        assert!(last_run.pointer("/data/finished_at").and_then(Value::as_str).is_some());
    }

    #[tokio::test]
    async fn oracle_outage_surfaces_as_503_for_merge_suggestions() {
        let config = RegisterConfig {
            merge_detection: MergeDetectionConfig { enabled: true, threshold: Some(0.6) },
            ..RegisterConfig::default()
        };
        let api = IssueRegisterApi::with_oracle(unique_temp_db_path(), config, Arc::new(DownOracle));
        let router = router_for(api);
        create_issue(&router, "Supplier lead times slipped", "Supply Chain").await;
        create_issue(&router, "Supplier lead times slipped again", "Supply Chain").await;

        let response = send(&router, "POST", "/v1/merges/suggest", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(&response_json(response).await), Some("oracle_unavailable"));

        let ingest = send(
            &router,
            "POST",
            "/v1/ingest",
            Some(json!({ "candidates": [{ "source_id": "doc-7", "text": "Supplier lead times slipped" }] })),
        )
        .await;
        assert_eq!(ingest.status(), StatusCode::OK);
        let report = response_json(ingest).await;
        assert_eq!(report.pointer("/data/summary/deferred").and_then(Value::as_u64), Some(1));
    }

    #[tokio::test]
    async fn agenda_and_activity_report_read_registered_meetings() {
        let router = router_for(IssueRegisterApi::new(unique_temp_db_path()));
        let meeting = send(
            &router,
            "POST",
            "/v1/sources/meetings",
            Some(json!({
                "title": "Ops sync",
                "source_tag": "Meetings.2025-03-04",
                "scheduled_at": "2025-03-04T15:00:00Z"
            })),
        )
        .await;
        assert_eq!(meeting.status(), StatusCode::OK);
        let meeting_id = data_str(&response_json(meeting).await, "source_id").to_string();

        let issue_id = create_issue(&router, "Warehouse scanners drop off the network", "Operations").await;
        let linked = send(
            &router,
            "POST",
            &format!("/v1/issues/{issue_id}/evidence"),
            Some(json!({
                "source": { "kind": "meeting", "id": meeting_id },
                "excerpt": "scanners dropped twice",
                "observed_at": "2025-03-04T15:30:00Z"
            })),
        )
        .await;
        assert_eq!(linked.status(), StatusCode::OK);

        let agenda = response_json(
            send(
                &router,
                "POST",
                "/v1/agenda",
                Some(json!({ "as_of": "2025-03-05T09:00:00Z", "window_days": 7 })),
            )
            .await,
        )
        .await;
        assert_eq!(agenda.pointer("/data/0/issue_id").and_then(Value::as_str), Some(issue_id.as_str()));

        let oversized = send(
            &router,
            "POST",
            "/v1/agenda",
            Some(json!({ "as_of": "2025-03-05T09:00:00Z", "window_days": u32::MAX })),
        )
        .await;
        assert_eq!(oversized.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response_json(oversized).await), Some("validation_error"));

        let report = response_json(
            send(
                &router,
                "POST",
                "/v1/reports/activity",
                Some(json!({ "start": "2025-03-01", "end": "2025-03-07" })),
            )
            .await,
        )
        .await;
        assert_eq!(report.pointer("/data/meetings").and_then(Value::as_array).map(Vec::len), Some(1));
        assert_eq!(
            report.pointer("/data/meeting_issues/0/issue_id").and_then(Value::as_str),
            Some(issue_id.as_str())
        );
    }
}
