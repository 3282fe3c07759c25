// Bank Sync - Web Server
// REST API with Axum: tenant login + OTP, sync dispatch, task polling

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use bank_sync::config::Settings;
use bank_sync::logging::init_tracing;
use bank_sync::{
    db, AuthOutcome, Authenticator, BankClient, Maintenance, Orchestrator, Scheduler, SharedConnection,
    SqliteSessionStore, SyncError, TaskId, TaskRecord, TenantId,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    auth: Authenticator,
    orchestrator: Orchestrator,
    db: SharedConnection,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

fn reply<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(ApiResponse::ok(data))).into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::AuthenticationRejected(_)
        | SyncError::SessionExpired
        | SyncError::CredentialsNotFound => StatusCode::UNAUTHORIZED,
        SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::TransientNetwork(_) | SyncError::UnexpectedUpstream(_) => StatusCode::BAD_GATEWAY,
        SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sync_error(err: SyncError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    failure(status, err.to_string())
}

fn parse_tenant(raw: &str) -> Result<TenantId, Response> {
    raw.parse::<TenantId>().map_err(sync_error)
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Deserialize)]
struct AuthRequest {
    tenant_id: String,
    login: String,
    password: String,
}

#[derive(Deserialize)]
struct ConfirmOtpRequest {
    tenant_id: String,
    session_id: Uuid,
    code: String,
}

/// Login result as shown to API clients. Tokens never leave the server.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AuthResponse {
    Authenticated { sync_task_id: TaskId },
    NeedsConfirmation {
        session_id: Uuid,
        confirm_phone: Option<String>,
        expires_in_secs: i64,
    },
}

#[derive(Serialize)]
struct TaskAccepted {
    task_id: TaskId,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tenants: usize,
    transactions: i64,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/health
async fn health_check(State(state): State<AppState>) -> Response {
    let counts = db::with_connection(&state.db, |conn| {
        Ok((db::list_tenants(conn)?.len(), db::count_transactions(conn)?))
    });

    match counts {
        Ok((tenants, transactions)) => reply(
            StatusCode::OK,
            HealthResponse {
                status: "ok",
                version: bank_sync::VERSION,
                tenants,
                transactions,
            },
        ),
        Err(e) => {
            error!(error = %e, "health check failed");
            failure(StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}

/// POST /api/integrate/auth
async fn integrate_auth(State(state): State<AppState>, Json(body): Json<AuthRequest>) -> Response {
    let tenant = match parse_tenant(&body.tenant_id) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.auth.login(&tenant, &body.login, &body.password).await {
        Ok(AuthOutcome::Authenticated(_)) => {
            let handle = state.orchestrator.dispatch_sync_tenant_accounts(tenant);
            info!(tenant = %tenant, task_id = %handle.id(), "login completed, accounts sync dispatched");
            reply(
                StatusCode::OK,
                AuthResponse::Authenticated {
                    sync_task_id: handle.id(),
                },
            )
        }
        Ok(AuthOutcome::NeedsConfirmation {
            session_id,
            confirm_phone,
        }) => reply(
            StatusCode::OK,
            AuthResponse::NeedsConfirmation {
                session_id,
                confirm_phone,
                expires_in_secs: bank_sync::auth::CONFIRMATION_TTL_SECS,
            },
        ),
        Ok(AuthOutcome::Rejected { reason }) => {
            warn!(tenant = %tenant, "login rejected");
            failure(StatusCode::UNAUTHORIZED, reason)
        }
        Err(e) => sync_error(e),
    }
}

/// POST /api/integrate/confirm-otp
async fn integrate_confirm_otp(
    State(state): State<AppState>,
    Json(body): Json<ConfirmOtpRequest>,
) -> Response {
    let tenant = match parse_tenant(&body.tenant_id) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.auth.confirm_otp(&tenant, &body.session_id, &body.code).await {
        Ok(_) => {
            let handle = state.orchestrator.dispatch_sync_tenant_accounts(tenant);
            info!(tenant = %tenant, task_id = %handle.id(), "OTP confirmed, accounts sync dispatched");
            reply(
                StatusCode::OK,
                AuthResponse::Authenticated {
                    sync_task_id: handle.id(),
                },
            )
        }
        Err(e) => sync_error(e),
    }
}

/// POST /api/sync/accounts
async fn sync_all_accounts(State(state): State<AppState>) -> Response {
    let handle = state.orchestrator.dispatch_sync_all_accounts();
    reply(StatusCode::ACCEPTED, TaskAccepted { task_id: handle.id() })
}

/// POST /api/sync/accounts/:tenant_id
async fn sync_tenant_accounts(State(state): State<AppState>, Path(tenant_id): Path<String>) -> Response {
    match parse_tenant(&tenant_id) {
        Ok(tenant) => {
            let handle = state.orchestrator.dispatch_sync_tenant_accounts(tenant);
            reply(StatusCode::ACCEPTED, TaskAccepted { task_id: handle.id() })
        }
        Err(response) => response,
    }
}

/// POST /api/sync/transactions
async fn sync_all_transactions(State(state): State<AppState>) -> Response {
    let handle = state.orchestrator.dispatch_sync_all_transactions();
    reply(StatusCode::ACCEPTED, TaskAccepted { task_id: handle.id() })
}

/// POST /api/sync/transactions/:tenant_id
async fn sync_tenant_transactions(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match parse_tenant(&tenant_id) {
        Ok(tenant) => {
            let handle = state.orchestrator.dispatch_sync_tenant_transactions(tenant);
            reply(StatusCode::ACCEPTED, TaskAccepted { task_id: handle.id() })
        }
        Err(response) => response,
    }
}

/// GET /api/tasks
async fn list_tasks(State(state): State<AppState>) -> Response {
    let tasks: Vec<TaskRecord> = state.orchestrator.registry().list();
    reply(StatusCode::OK, tasks)
}

/// GET /api/tasks/:task_id
async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let id = match task_id.parse::<TaskId>() {
        Ok(id) => id,
        Err(e) => return sync_error(e),
    };

    match state.orchestrator.registry().get(&id) {
        Some(record) => reply(StatusCode::OK, record),
        None => failure(StatusCode::NOT_FOUND, format!("task {} not found", id)),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("BANK_SYNC_CONFIG").ok();
    let settings = Settings::load(config_path.as_deref())?;
    init_tracing(&settings.logging);
    settings.validate().map_err(anyhow::Error::msg)?;

    println!("🌐 Bank Sync - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db = db::open_shared(&settings.storage.database_path)?;
    println!("✓ Database opened: {}", settings.storage.database_path);

    let store = Arc::new(SqliteSessionStore::new(db.clone()));
    let maintenance = Maintenance::new(db.clone(), &settings.storage).with_sessions(store.clone());
    let report = maintenance.run()?;
    println!(
        "✓ Housekeeping: {} old events, {} expired sessions removed",
        report.events_deleted, report.sessions_purged
    );

    let client = BankClient::new(settings.bank.clone())?;
    let auth = Authenticator::new(store, client);
    let orchestrator = Orchestrator::new(auth.clone(), db.clone(), &settings);

    let _scheduler = Scheduler::start(orchestrator.clone(), &settings.scheduler)
        .with_maintenance(maintenance, &settings.scheduler);

    let state = AppState {
        auth,
        orchestrator,
        db,
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/integrate/auth", post(integrate_auth))
        .route("/integrate/confirm-otp", post(integrate_confirm_otp))
        .route("/sync/accounts", post(sync_all_accounts))
        .route("/sync/accounts/:tenant_id", post(sync_tenant_accounts))
        .route("/sync/transactions", post(sync_all_transactions))
        .route("/sync/transactions/:tenant_id", post(sync_tenant_transactions))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task))
        .with_state(state);

    let mut app = Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    if settings.server.enable_cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = settings.server.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/health", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
