use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use provenance_api::{
    FruitHistory, MigrateResult, ProvenanceApi, RegisterUserRequest, SubmitStageRequest,
    TombstoneResult, UserFruits, API_CONTRACT_VERSION,
};
use provenance_core::{
    DriverInput, FactoryInput, FarmerInput, Fruit, HistoryVerification, ProvenanceError,
    ShopInput, StageReceipt, TraceabilityCode, User, UserId,
};
use provenance_store_sqlite::{LedgerOptions, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const DEFAULT_LOG_FILTER: &str =
    "warn,provenance_core=info,provenance_store_sqlite=info,provenance_api=info,provenance_service=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ProvenanceApi,
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
    service_contract_version: &'static str,
    error: String,
    kind: &'static str,
    retryable: bool,
    #[serde(skip)]
    status: StatusCode,
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
#[command(name = "provenance-service")]
#[command(about = "Local HTTP service for the fruit provenance ledger")]
struct Args {
    #[arg(long, env = "PROVENANCE_DB", default_value = "./provenance.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "PROVENANCE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "PROVENANCE_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let (status, kind, retryable) = match err.downcast_ref::<ProvenanceError>() {
            Some(ledger_err) => {
                (status_for(ledger_err), ledger_err.kind(), ledger_err.is_retryable())
            }
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal", false),
        };
        if status.is_server_error() {
            error!(error = %format!("{err:#}"), "request failed");
        } else if retryable {
            warn!(error = %err, "request lost a write race");
        }
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
            kind,
            retryable,
            status,
        }
    }
}

impl From<ProvenanceError> for ServiceError {
    fn from(err: ProvenanceError) -> Self {
        Self::from(anyhow::Error::new(err))
    }
}

fn status_for(err: &ProvenanceError) -> StatusCode {
    match err {
        ProvenanceError::NotFound { .. } => StatusCode::NOT_FOUND,
        ProvenanceError::DuplicateCode { .. }
        | ProvenanceError::DuplicateUser { .. }
        | ProvenanceError::InvalidTransition { .. }
        | ProvenanceError::Conflict { .. } => StatusCode::CONFLICT,
        ProvenanceError::UnauthorizedRole { .. } => StatusCode::FORBIDDEN,
        ProvenanceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ProvenanceError::Encoding(_)
        | ProvenanceError::Tampered { .. }
        | ProvenanceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
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
        .route("/v1/users", post(user_register))
        .route("/v1/users/:user_id", get(user_show))
        .route("/v1/users/:user_id/fruits", get(user_fruits))
        .route("/v1/stages/farmer", post(stage_farmer))
        .route("/v1/stages/factory", post(stage_factory))
        .route("/v1/stages/driver", post(stage_driver))
        .route("/v1/stages/shop", post(stage_shop))
        .route("/v1/fruits/:code", get(fruit_show))
        .route("/v1/fruits/:code/history", get(fruit_history))
        .route("/v1/fruits/:code/verify", get(fruit_verify))
        .route("/v1/fruits/:code/tombstone", post(fruit_tombstone))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let api = ProvenanceApi::with_options(
        args.db.clone(),
        LedgerOptions { busy_timeout_ms: args.busy_timeout_ms },
    );
    let migrated = api.migrate(false)?;
    info!(
        db = %args.db.display(),
        schema_version = ?migrated.after_version,
        "ledger ready"
    );

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "provenance service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    Ok(Json(envelope(state.api.migrate(request.dry_run)?)))
}

async fn user_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterUserRequest>,
) -> ServiceResult<User> {
    Ok(Json(envelope(state.api.register_user(request)?)))
}

async fn user_show(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> ServiceResult<User> {
    let user_id = UserId::parse(&user_id)?;
    Ok(Json(envelope(state.api.get_user(&user_id)?)))
}

async fn user_fruits(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> ServiceResult<UserFruits> {
    let user_id = UserId::parse(&user_id)?;
    Ok(Json(envelope(state.api.get_user_fruits(&user_id)?)))
}

async fn stage_farmer(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitStageRequest<FarmerInput>>,
) -> ServiceResult<StageReceipt> {
    Ok(Json(envelope(state.api.submit_farmer_stage(request)?)))
}

async fn stage_factory(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitStageRequest<FactoryInput>>,
) -> ServiceResult<StageReceipt> {
    Ok(Json(envelope(state.api.submit_factory_stage(request)?)))
}

async fn stage_driver(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitStageRequest<DriverInput>>,
) -> ServiceResult<StageReceipt> {
    Ok(Json(envelope(state.api.submit_driver_stage(request)?)))
}

async fn stage_shop(
    State(state): State<ServiceState>,
    Json(request): Json<SubmitStageRequest<ShopInput>>,
) -> ServiceResult<StageReceipt> {
    Ok(Json(envelope(state.api.submit_shop_stage(request)?)))
}

async fn fruit_show(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> ServiceResult<Fruit> {
    let code = TraceabilityCode::parse(&code)?;
    Ok(Json(envelope(state.api.get_fruit(&code)?)))
}

async fn fruit_history(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> ServiceResult<FruitHistory> {
    let code = TraceabilityCode::parse(&code)?;
    Ok(Json(envelope(state.api.get_fruit_history(&code)?)))
}

async fn fruit_verify(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> ServiceResult<HistoryVerification> {
    let code = TraceabilityCode::parse(&code)?;
    Ok(Json(envelope(state.api.verify_history(&code)?)))
}

async fn fruit_tombstone(
    State(state): State<ServiceState>,
    Path(code): Path<String>,
) -> ServiceResult<TombstoneResult> {
    let code = TraceabilityCode::parse(&code)?;
    Ok(Json(envelope(state.api.tombstone_fruit(&code)?)))
}
