use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_identity_core::{ContactId, IdentifyRequest, IdentityError, IdentityView};
use contact_identity_store_sqlite::{SqliteContactStore, CONTACTS_MIGRATION_VERSION};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "contacts.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    db_path: PathBuf,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

/// One-shot claim shared by a blocking operation and the timeout that guards it.
///
/// Whoever claims first wins. The worker claims right before committing; the
/// request handler claims when the timeout fires. A worker that loses must roll
/// back, and a handler that loses waits for the commit it can no longer stop.
#[derive(Debug, Clone, Default)]
struct CommitGate(Arc<AtomicBool>);

impl CommitGate {
    fn try_claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    contact_not_found_total: AtomicU64,
    consistency_violation_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    contact_not_found_total: u64,
    consistency_violation_total: u64,
    storage_unavailable_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessChecks {
    current_schema_version: Option<i64>,
    target_schema_version: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    checks: ReadinessChecks,
}

#[derive(Debug, Parser)]
#[command(name = "contact-identity-service")]
#[command(about = "Local HTTP service for contact identity resolution")]
struct Args {
    #[arg(long, default_value = "./contacts.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_path_with_telemetry(&self, rejection: &PathRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn classify_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        if let Some(identity) = err.downcast_ref::<IdentityError>() {
            let status = match identity {
                IdentityError::Validation(_) => StatusCode::BAD_REQUEST,
                IdentityError::NotFound(_) => StatusCode::NOT_FOUND,
                IdentityError::Consistency(_) => StatusCode::INTERNAL_SERVER_ERROR,
                IdentityError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            return Self::failure(status, identity.code(), identity.to_string(), None);
        }

        // Open and pragma failures arrive as context-wrapped rusqlite errors.
        if err.chain().any(|cause| cause.downcast_ref::<rusqlite::Error>().is_some()) {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                format!("{err:#}"),
                None,
            );
        }

        Self::failure(default_status, default_code, err.to_string(), None)
    }

    /// Runs `op` on a blocking thread under the operation timeout. The closure
    /// receives the database path and opens its own connection.
    ///
    /// Writers must claim the [`CommitGate`] before committing. Once the timeout
    /// claims it first, the worker's commit is refused; if the worker claimed it
    /// first, the handler waits for that commit instead of reporting a timeout.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf, CommitGate) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db_path = self.db_path.clone();
        let gate = CommitGate::default();
        let worker_gate = gate.clone();
        let mut handle = tokio::task::spawn_blocking(move || op(db_path, worker_gate));

        let join_result = match tokio::time::timeout(self.operation_timeout, &mut handle).await {
            Ok(join_result) => join_result,
            Err(_) if gate.try_claim() => {
                self.telemetry.record_failure(default_code, true);
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = self.operation_timeout.as_millis(),
                    "operation timed out"
                );
                return Err(Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                ));
            }
            Err(_) => {
                tracing::debug!(
                    operation = operation_label,
                    "timeout reached during commit; awaiting result"
                );
                handle.await
            }
        };

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, false);
                tracing::warn!(
                    operation = operation_label,
                    code = failure.code,
                    error = %format!("{err:#}"),
                    "operation failed"
                );
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "contact_not_found" => &self.contact_not_found_total,
            "consistency_violation" => &self.consistency_violation_total,
            "storage_unavailable" => &self.storage_unavailable_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            contact_not_found_total: self.contact_not_found_total.load(Ordering::Relaxed),
            consistency_violation_total: self.consistency_violation_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/contacts/:contact_id/group", get(contact_group))
        .with_state(state)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(env_filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let store = SqliteContactStore::open(&args.db)?;
    store.migrate().with_context(|| format!("failed to migrate {}", args.db.display()))?;
    drop(store);

    let state = ServiceState {
        db_path: args.db,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %state.db_path.display(), "contact identity service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentityView>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let view = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "identify_failed",
            "identify",
            move |db_path, gate| {
                let mut store = SqliteContactStore::open(&db_path)?;
                store
                    .identify_guarded(&request, || gate.try_claim())
                    .map_err(anyhow::Error::from)
            },
        )
        .await?;
    Ok(Json(view))
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let current = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            "schema_version",
            |db_path, _gate| SqliteContactStore::open(&db_path)?.schema_version(),
        )
        .await?;

    let checks = ReadinessChecks {
        current_schema_version: current,
        target_schema_version: CONTACTS_MIGRATION_VERSION,
    };
    if current == Some(CONTACTS_MIGRATION_VERSION) {
        return Ok(Json(envelope(ReadinessResponse { status: "ready", checks })));
    }

    state.telemetry.record_failure("storage_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "storage_unavailable",
        "database schema is not ready; run `cid db migrate` before serving traffic",
        Some(json!({
            "current_version": checks.current_schema_version,
            "target_version": checks.target_schema_version
        })),
    ))
}

async fn contact_group(
    State(state): State<ServiceState>,
    contact_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<IdentityView>, ServiceFailure> {
    let Path(contact_id) =
        contact_id.map_err(|rejection| state.invalid_path_with_telemetry(&rejection))?;
    let view = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "contact_group",
            move |db_path, _gate| {
                let store = SqliteContactStore::open(&db_path)?;
                store.group_of(ContactId(contact_id)).map_err(anyhow::Error::from)
            },
        )
        .await?;
    Ok(Json(view))
}
