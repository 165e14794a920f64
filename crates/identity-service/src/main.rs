use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_api::{IdentifyRequest, IdentifyResponse, IdentityApi, API_CONTRACT_VERSION};
use identity_core::{ContactId, ContactSummary, IdentityError};
use identity_store_sqlite::SchemaStatus;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
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
struct ServiceErrorBody {
    service_contract_version: &'static str,
    error: String,
}

/// Failure of a versioned `/v1` route.
#[derive(Debug)]
struct ServiceError {
    status: StatusCode,
    message: String,
}

/// Failure of `POST /identify`, rendered as a bare `{"error": ...}` object.
#[derive(Debug)]
struct IdentifyError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct IdentifyErrorBody {
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "identity-service")]
#[command(about = "HTTP service for contact identity reconciliation")]
struct Args {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long, env = "IDENTITY_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = ServiceErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl IntoResponse for IdentifyError {
    fn into_response(self) -> Response {
        (self.status, Json(IdentifyErrorBody { error: self.message })).into_response()
    }
}

/// Map an api failure to a status code, hiding internal details from the client.
fn classify(err: &anyhow::Error) -> (StatusCode, String) {
    match err.downcast_ref::<IdentityError>() {
        Some(domain @ IdentityError::InvalidInput(_)) => (StatusCode::BAD_REQUEST, domain.to_string()),
        Some(domain @ IdentityError::NotFound(_)) => (StatusCode::NOT_FOUND, domain.to_string()),
        _ => {
            tracing::error!(error = %format!("{err:#}"), "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE.to_string())
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let (status, message) = classify(&err);
        Self { status, message }
    }
}

impl From<anyhow::Error> for IdentifyError {
    fn from(err: anyhow::Error) -> Self {
        let (status, message) = classify(&err);
        Self { status, message }
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

/// Run a blocking api call on tokio's blocking pool.
async fn run_blocking<T, F>(state: ServiceState, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&IdentityApi) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&state.api)).await?
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/contacts/:contact_id", get(contact_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let args = Args::parse();
    let api = IdentityApi::new(args.db.clone())
        .with_busy_timeout(Duration::from_millis(args.busy_timeout_ms));
    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "identity service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, IdentifyError> {
    let Json(request) = payload.map_err(|rejection| IdentifyError {
        status: StatusCode::BAD_REQUEST,
        message: rejection.body_text(),
    })?;
    let response = run_blocking(state, move |api| api.identify(request)).await?;
    Ok(Json(response))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = run_blocking(state, IdentityApi::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<i64>,
) -> Result<Json<ServiceEnvelope<ContactSummary>>, ServiceError> {
    let summary = run_blocking(state, move |api| api.contact_show(ContactId(contact_id))).await?;
    Ok(Json(envelope(summary)))
}
