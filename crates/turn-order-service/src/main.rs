use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use turn_order_api::{
    ComputeTurnOrderRequest, MigrateResult, OrganizationMemberRequest, StableMemberRequest,
    StableRequest, TurnOrderApi, UserProfileRequest, API_CONTRACT_VERSION,
};
use turn_order_core::{
    CompletedProcess, EngineError, RotationHistoryRecord, Selection, TurnOrderResult, WorkItem,
};
use turn_order_store_sqlite::SchemaStatus;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: TurnOrderApi,
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
#[command(name = "turn-order-service")]
#[command(about = "Local HTTP service for the stable turn-order engine")]
struct Args {
    #[arg(long, default_value = "./turn_order.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let status = match err.downcast_ref::<EngineError>() {
            Some(EngineError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(EngineError::Storage(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{err:#}"), "request failed");
        }
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
        }
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/directory/organization-member", post(directory_organization_member))
        .route("/v1/directory/stable-member", post(directory_stable_member))
        .route("/v1/directory/user-profile", post(directory_user_profile))
        .route("/v1/stables", post(stables_set))
        .route("/v1/work-items", post(work_items_upsert))
        .route("/v1/selections", post(selections_add))
        .route("/v1/turn-order", post(turn_order_compute))
        .route("/v1/history/complete", post(history_complete))
        .route("/v1/history/:stable_id/last", get(history_last))
        .route("/v1/history/:stable_id", get(history_list))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { api: TurnOrderApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "turn-order service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn directory_organization_member(
    State(state): State<ServiceState>,
    Json(request): Json<OrganizationMemberRequest>,
) -> ServiceResult<OrganizationMemberRequest> {
    state.api.upsert_organization_member(&request)?;
    Ok(Json(envelope(request)))
}

async fn directory_stable_member(
    State(state): State<ServiceState>,
    Json(request): Json<StableMemberRequest>,
) -> ServiceResult<StableMemberRequest> {
    state.api.upsert_stable_member(&request)?;
    Ok(Json(envelope(request)))
}

async fn directory_user_profile(
    State(state): State<ServiceState>,
    Json(request): Json<UserProfileRequest>,
) -> ServiceResult<UserProfileRequest> {
    state.api.upsert_user_profile(&request)?;
    Ok(Json(envelope(request)))
}

async fn stables_set(
    State(state): State<ServiceState>,
    Json(request): Json<StableRequest>,
) -> ServiceResult<StableRequest> {
    state.api.set_stable(&request)?;
    Ok(Json(envelope(request)))
}

async fn work_items_upsert(
    State(state): State<ServiceState>,
    Json(item): Json<WorkItem>,
) -> ServiceResult<WorkItem> {
    state.api.upsert_work_item(&item)?;
    Ok(Json(envelope(item)))
}

async fn selections_add(
    State(state): State<ServiceState>,
    Json(selection): Json<Selection>,
) -> ServiceResult<Selection> {
    state.api.add_selection(&selection)?;
    Ok(Json(envelope(selection)))
}

async fn turn_order_compute(
    State(state): State<ServiceState>,
    Json(request): Json<ComputeTurnOrderRequest>,
) -> ServiceResult<TurnOrderResult> {
    let result = state.api.compute_turn_order(&request)?;
    Ok(Json(envelope(result)))
}

async fn history_complete(
    State(state): State<ServiceState>,
    Json(process): Json<CompletedProcess>,
) -> ServiceResult<RotationHistoryRecord> {
    let record = state.api.complete_process(&process)?;
    Ok(Json(envelope(record)))
}

async fn history_last(
    State(state): State<ServiceState>,
    Path(stable_id): Path<String>,
) -> ServiceResult<Option<RotationHistoryRecord>> {
    let record = state.api.last_history(&stable_id)?;
    Ok(Json(envelope(record)))
}

async fn history_list(
    State(state): State<ServiceState>,
    Path(stable_id): Path<String>,
) -> ServiceResult<Vec<RotationHistoryRecord>> {
    let records = state.api.list_history(&stable_id)?;
    Ok(Json(envelope(records)))
}
