use anyhow::{Context, Result};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{log_requests, metrics, state::*, ServerConfig};
use crate::backup::ManagerError;
use crate::router_store::{
    ArtifactId, BackupKind, NewRouter, NewSchedule, RouterConnectParams, RouterId, RouterUpdate,
    ScheduleId, DEFAULT_API_PORT, DEFAULT_API_SSL_PORT,
};

const DEFAULT_RETENTION_DAYS: u32 = 30;
const DEFAULT_RUNS_LIMIT: usize = 50;

#[derive(Serialize)]
struct HealthResponse {
    pub status: &'static str,
    pub uptime: String,
    pub version: &'static str,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

#[derive(Deserialize, Debug)]
struct TestConnectionBody {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_ssl: bool,
}

fn default_username() -> String {
    "admin".to_string()
}

#[derive(Deserialize, Debug, Default)]
struct BackupQuery {
    pub kind: Option<BackupKind>,
}

#[derive(Deserialize, Debug, Default)]
struct ListBackupsQuery {
    pub router_id: Option<RouterId>,
}

#[derive(Deserialize, Debug, Default)]
struct RunsQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct PruneBody {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

#[derive(Serialize)]
struct CheckStatusEntry {
    pub router_id: RouterId,
    #[serde(flatten)]
    pub result: crate::backup::ConnectionTestResult,
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime: format_uptime(state.start_time.elapsed()),
        version: env!("CARGO_PKG_VERSION"),
    })
}

// =============================================================================
// Routers
// =============================================================================

async fn list_routers(State(manager): State<GuardedBackupManager>) -> Response {
    match manager.list_routers() {
        Ok(routers) => Json(routers).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn post_router(
    State(manager): State<GuardedBackupManager>,
    Json(body): Json<NewRouter>,
) -> Response {
    match manager.create_router(body) {
        Ok(router) => (StatusCode::CREATED, Json(router)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_router(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<RouterId>,
) -> Response {
    match manager.get_router(id) {
        Ok(router) => Json(router).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn put_router(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<RouterId>,
    Json(body): Json<RouterUpdate>,
) -> Response {
    match manager.update_router(id, body) {
        Ok(router) => Json(router).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_router(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<RouterId>,
) -> Response {
    match manager.delete_router(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn test_router(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<RouterId>,
) -> Response {
    match manager.test_router(id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_router_runs(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<RouterId>,
    Query(query): Query<RunsQuery>,
) -> Response {
    match manager.list_runs(id, query.limit.unwrap_or(DEFAULT_RUNS_LIMIT)) {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// Connectivity and backups
// =============================================================================

async fn test_connection(
    State(manager): State<GuardedBackupManager>,
    Json(body): Json<TestConnectionBody>,
) -> Response {
    let host = body.host.trim().to_string();
    if host.is_empty() {
        return ManagerError::InvalidInput("Router host is required".to_string()).into_response();
    }
    let params = RouterConnectParams {
        host,
        port: body.port.unwrap_or(if body.use_ssl {
            DEFAULT_API_SSL_PORT
        } else {
            DEFAULT_API_PORT
        }),
        username: body.username,
        password: body.password,
        use_ssl: body.use_ssl,
    };
    Json(manager.test_connection(&params).await).into_response()
}

async fn check_status(State(manager): State<GuardedBackupManager>) -> Response {
    match manager.check_all_routers().await {
        Ok(results) => Json(
            results
                .into_iter()
                .map(|(router_id, result)| CheckStatusEntry { router_id, result })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn post_backup(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<RouterId>,
    Query(query): Query<BackupQuery>,
) -> Response {
    let kind = query.kind.unwrap_or(BackupKind::Full);
    match manager.trigger_backup_now(id, kind).await {
        Ok(artifact) => (StatusCode::CREATED, Json(artifact)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_backups(
    State(manager): State<GuardedBackupManager>,
    Query(query): Query<ListBackupsQuery>,
) -> Response {
    match manager.list_artifacts(query.router_id) {
        Ok(artifacts) => Json(artifacts).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn download_backup(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<ArtifactId>,
) -> Response {
    let (artifact, data) = match manager.read_artifact(id).await {
        Ok(x) => x,
        Err(e) => return e.into_response(),
    };
    let content_type = match artifact.kind {
        BackupKind::Full => "application/octet-stream",
        BackupKind::Config => "text/plain; charset=utf-8",
    };
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.filename),
            ),
        ],
        Body::from(data),
    )
        .into_response()
}

async fn delete_backup(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<ArtifactId>,
) -> Response {
    match manager.delete_artifact(id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn prune_backups(
    State(manager): State<GuardedBackupManager>,
    Json(body): Json<PruneBody>,
) -> Response {
    match manager.prune_artifacts(body.retention_days).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// Schedules and stats
// =============================================================================

async fn list_schedules(State(manager): State<GuardedBackupManager>) -> Response {
    match manager.list_schedules() {
        Ok(schedules) => Json(schedules).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn post_schedule(
    State(manager): State<GuardedBackupManager>,
    Json(body): Json<NewSchedule>,
) -> Response {
    match manager.create_schedule(body) {
        Ok(schedule) => (StatusCode::CREATED, Json(schedule)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_schedule(
    State(manager): State<GuardedBackupManager>,
    Path(id): Path<ScheduleId>,
) -> Response {
    match manager.delete_schedule(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_stats(State(manager): State<GuardedBackupManager>) -> Response {
    match manager.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => e.into_response(),
    }
}

pub fn make_app(state: ServerState) -> Router {
    let router_routes: Router = Router::new()
        .route("/", get(list_routers).post(post_router))
        .route("/{id}", get(get_router).put(put_router).delete(delete_router))
        .route("/{id}/test", post(test_router))
        .route("/{id}/runs", get(get_router_runs))
        .with_state(state.clone());

    let backup_routes: Router = Router::new()
        .route("/", get(list_backups))
        .route("/prune", post(prune_backups))
        .route("/{id}", delete(delete_backup))
        .route("/{id}/download", get(download_backup))
        .with_state(state.clone());

    let schedule_routes: Router = Router::new()
        .route("/", get(list_schedules).post(post_schedule))
        .route("/{id}", delete(delete_schedule))
        .with_state(state.clone());

    let api_routes: Router = Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/test-connection", post(test_connection))
        .route("/check-status", post(check_status))
        .route("/backup/{id}", post(post_backup))
        .with_state(state.clone())
        .nest("/routers", router_routes)
        .nest("/backups", backup_routes)
        .nest("/schedules", schedule_routes);

    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .nest("/api", api_routes)
        .layer(middleware::from_fn_with_state(
            state.config.clone(),
            log_requests,
        ))
}

/// Serves until `shutdown_token` is cancelled.
pub async fn run_server(
    manager: GuardedBackupManager,
    config: ServerConfig,
    shutdown_token: CancellationToken,
) -> Result<()> {
    let port = config.port;
    let app = make_app(ServerState::new(config, manager));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Ready to serve at port {}!", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await
        .context("HTTP server failed")
}
