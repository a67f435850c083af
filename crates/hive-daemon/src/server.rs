use std::{
    collections::BTreeMap, env, fmt::Write as _, net::SocketAddr, path::PathBuf, str::FromStr,
    sync::Arc, time::Duration,
};

use anyhow::{bail, Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hive_kernel::{
    AuditConfig, CredentialSnapshot, CredentialSpec, HiveKernel, KernelConfig, LifecycleError,
    PoolError, ProcessSandboxRuntime, SandboxUsage, SessionDescriptor, SessionStatus, SyncBatch,
    MAX_SYNC_LIMIT,
};
use hive_store::{Database, MessageRecord, MessageRole, SessionState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;
/// Hint sent with 503 responses for retryable capacity errors.
const RETRY_AFTER_SECS: u64 = 5;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let runtime = ProcessSandboxRuntime::new(&config.kernel.isolation)
        .context("initializing sandbox runtime")?;

    let kernel = HiveKernel::bootstrap(db.clone(), Arc::new(runtime), config.kernel.clone(), None)
        .await
        .context("bootstrapping kernel")?;

    for spec in config.credentials.iter().cloned() {
        let id = spec.id.clone();
        kernel
            .credentials
            .register(spec)
            .await
            .with_context(|| format!("registering credential {id}"))?;
    }

    let shutdown = CancellationToken::new();
    let sweeper = kernel.scheduler.clone().spawn(shutdown.clone());

    let state = Arc::new(AppState {
        kernel: kernel.clone(),
        db,
    });
    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "hive-daemon listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server exited")?;

    shutdown.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "reclamation scheduler task failed");
    }
    kernel.supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => {}
    }
    info!("shutdown requested");
    shutdown.cancel();
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/v1/sessions", post(init_session))
        .route("/api/v1/sessions/:id/start", post(start_session))
        .route("/api/v1/sessions/:id/status", get(session_status))
        .route("/api/v1/sessions/:id/end", post(end_session))
        .route("/api/v1/sessions/:id/heartbeat", post(heartbeat_session))
        .route("/api/v1/sessions/:id/resources", get(session_resources))
        .route(
            "/api/v1/sessions/:id/messages",
            post(append_message).get(sync_messages),
        )
        .route("/api/v1/sessions/:id/input", post(submit_input))
        .route("/api/v1/users/:user_id/sessions", get(list_user_sessions))
        .route(
            "/api/v1/credentials",
            get(list_credentials).post(register_credential),
        )
        .route("/api/v1/credentials/:id/failure", post(report_credential_failure))
        .route("/api/v1/credentials/:id/success", post(report_credential_success))
        .route("/api/v1/credentials/:id/replenish", post(replenish_credential))
        .route("/api/v1/credentials/:id/usage", post(record_credential_usage))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    kernel: HiveKernel,
    db: Database,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    kernel: KernelConfig,
    credentials: Vec<CredentialSpec>,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("HIVE_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid HIVE_API_ADDR")?;

        let db_url = lookup("HIVE_DB_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./hive.db".to_string());

        let mut kernel = KernelConfig::default();

        if let Some(path) = non_empty(lookup("HIVE_WORKSPACE_ROOT")) {
            kernel.workspace_root = PathBuf::from(path);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_IDLE_TIMEOUT_SECS")? {
            kernel.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(mib) = parse_var::<u64>(&lookup, "HIVE_MEM_CAP_MIB")? {
            kernel.mem_cap_bytes = mib * MIB;
        }
        if let Some(size) = parse_var::<usize>(&lookup, "HIVE_POOL_SIZE")? {
            kernel.pool_size = size;
        }
        if let Some(mib) = parse_var::<u64>(&lookup, "HIVE_LOW_WATERMARK_MIB")? {
            kernel.low_watermark_bytes = mib * MIB;
        }
        if let Some(mib) = parse_var::<u64>(&lookup, "HIVE_HIGH_WATERMARK_MIB")? {
            kernel.high_watermark_bytes = mib * MIB;
        }
        if let Some(mib) = parse_var::<u64>(&lookup, "HIVE_MEMORY_BUDGET_MIB")? {
            kernel.host_memory_budget_bytes = mib * MIB;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_SWEEP_INTERVAL_SECS")? {
            kernel.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_ACTIVE_GRACE_SECS")? {
            kernel.active_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_REUSE_WINDOW_SECS")? {
            kernel.reuse_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_DESTROY_GRACE_SECS")? {
            kernel.destroy_grace = Duration::from_secs(secs);
        }
        if let Some(workers) = parse_var::<usize>(&lookup, "HIVE_WORKER_THREADS")? {
            kernel.worker_threads = workers;
        }
        if let Some(uid) = parse_var::<u32>(&lookup, "HIVE_BASE_UID")? {
            kernel.identity.base_uid = uid;
        }
        if let Some(gid) = parse_var::<u32>(&lookup, "HIVE_BASE_GID")? {
            kernel.identity.base_gid = gid;
        }
        if let Some(mib) = parse_var::<u64>(&lookup, "HIVE_WORKDIR_QUOTA_MIB")? {
            kernel.workdir_quota_bytes = Some(mib * MIB);
        }
        if let Some(max) = parse_var::<u64>(&lookup, "HIVE_MAX_PROCESSES")? {
            kernel.process_limits.max_processes = max;
        }
        if let Some(millis) = parse_var::<u32>(&lookup, "HIVE_CPU_MILLIS")? {
            kernel.process_limits.cpu_millis = millis;
        }

        if let Some(value) = bool_var(&lookup, "HIVE_ENABLE_CGROUPS") {
            kernel.isolation.enable_cgroups = value;
        }
        if let Some(path) = non_empty(lookup("HIVE_CGROUP_ROOT")) {
            kernel.isolation.cgroup_root = Some(PathBuf::from(path));
        }
        if let Some(value) = bool_var(&lookup, "HIVE_ASSIGN_IDENTITY") {
            kernel.isolation.assign_identity = value;
        }
        if let Some(command) = non_empty(lookup("HIVE_AGENT_COMMAND")) {
            kernel.isolation.agent_command = command;
        }
        if let Some(args) = lookup("HIVE_AGENT_ARGS") {
            kernel.isolation.agent_args = split_list(&args);
        }

        if let Some(threshold) = parse_var::<u32>(&lookup, "HIVE_CREDENTIAL_FAILURE_THRESHOLD")? {
            kernel.credentials.failure_threshold = threshold;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_CREDENTIAL_BASE_BACKOFF_SECS")? {
            kernel.credentials.base_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_CREDENTIAL_MAX_BACKOFF_SECS")? {
            kernel.credentials.max_backoff = Duration::from_secs(secs);
        }
        if let Some(threshold) = parse_var::<u32>(&lookup, "HIVE_LOSS_ALERT_THRESHOLD")? {
            kernel.loss_alert.threshold = threshold;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "HIVE_LOSS_ALERT_WINDOW_SECS")? {
            kernel.loss_alert.window = Duration::from_secs(secs);
        }

        let audit_hmac_key = match non_empty(lookup("HIVE_AUDIT_LOG_HMAC_KEY")) {
            Some(value) => Some(
                STANDARD
                    .decode(value.trim())
                    .context("invalid base64 in HIVE_AUDIT_LOG_HMAC_KEY")?,
            ),
            None => None,
        };
        kernel.audit = AuditConfig {
            enabled: bool_var(&lookup, "HIVE_AUDIT_LOG_ENABLED").unwrap_or(true),
            log_path: non_empty(lookup("HIVE_AUDIT_LOG_PATH"))
                .map(PathBuf::from)
                .unwrap_or_else(|| AuditConfig::default().log_path),
            hmac_key: audit_hmac_key,
        };

        kernel.validate().context("invalid kernel configuration")?;

        let credentials = match lookup("HIVE_CREDENTIALS") {
            Some(raw) => parse_credentials(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            listen_addr,
            db_url,
            kernel,
            credentials,
        })
    }
}

/// Parses `id|secret_ref|quota|max_sessions` entries separated by commas.
/// `max_sessions` defaults to 1.
fn parse_credentials(raw: &str) -> Result<Vec<CredentialSpec>> {
    let mut specs = Vec::new();
    for entry in split_list(raw) {
        let fields: Vec<&str> = entry.split('|').map(str::trim).collect();
        let (id, secret_ref, quota, max_sessions) = match fields.as_slice() {
            [id, secret_ref, quota] => (*id, *secret_ref, *quota, "1"),
            [id, secret_ref, quota, max_sessions] => (*id, *secret_ref, *quota, *max_sessions),
            _ => bail!("HIVE_CREDENTIALS entry '{entry}' must be id|secret_ref|quota[|max_sessions]"),
        };
        if id.is_empty() {
            bail!("HIVE_CREDENTIALS entry '{entry}' has an empty id");
        }
        specs.push(CredentialSpec {
            id: id.to_string(),
            secret_ref: secret_ref.to_string(),
            quota: quota
                .parse()
                .with_context(|| format!("invalid quota in HIVE_CREDENTIALS entry '{entry}'"))?,
            max_sessions: max_sessions.parse().with_context(|| {
                format!("invalid max_sessions in HIVE_CREDENTIALS entry '{entry}'")
            })?,
        });
    }
    Ok(specs)
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain"))
)]
async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.kernel.supervisor.stats();
    let sessions = state.db.list_sessions().await.map_err(ApiError::internal)?;
    let credentials = state.kernel.credentials.snapshot().await;

    let mut by_state: BTreeMap<&'static str, usize> = [
        SessionState::Uninitialized,
        SessionState::Initializing,
        SessionState::Ready,
        SessionState::Active,
        SessionState::Idle,
        SessionState::Terminated,
    ]
    .into_iter()
    .map(|s| (s.as_str(), 0))
    .collect();
    for session in &sessions {
        *by_state.entry(session.state.as_str()).or_default() += 1;
    }

    let mut body = String::new();
    let _ = writeln!(body, "hive_live_sandboxes {}", stats.live_sandboxes);
    let _ = writeln!(body, "hive_free_identities {}", stats.free_identities);
    let _ = writeln!(body, "hive_identity_capacity {}", stats.identity_capacity);
    let _ = writeln!(body, "hive_reserved_memory_bytes {}", stats.reserved_bytes);
    let _ = writeln!(body, "hive_memory_budget_bytes {}", stats.budget_bytes);
    for (name, count) in by_state {
        let _ = writeln!(body, "hive_sessions{{state=\"{name}\"}} {count}");
    }
    for credential in credentials {
        let _ = writeln!(
            body,
            "hive_credential_active_leases{{credential=\"{}\"}} {}",
            credential.id, credential.active_leases
        );
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions",
    request_body = InitSessionBody,
    responses(
        (status = 200, description = "Session backed by a ready sandbox", body = SessionResponse),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 503, description = "Host capacity exhausted; retry later", body = ErrorBody)
    )
)]
async fn init_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<InitSessionBody>,
) -> Result<Json<SessionResponse>, ApiError> {
    if payload.user_id.trim().is_empty() || payload.agent_id.trim().is_empty() {
        return Err(ApiError::bad_request("user_id and agent_id must not be empty"));
    }
    let descriptor = state
        .kernel
        .lifecycle
        .init(&payload.user_id, &payload.agent_id)
        .await?;
    Ok(Json(descriptor.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/start",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session active", body = SessionResponse),
        (status = 404, description = "Session not found", body = ErrorBody),
        (status = 409, description = "Session cannot be started in its state", body = ErrorBody),
        (status = 410, description = "Sandbox lost; initialize again", body = ErrorBody),
        (status = 503, description = "No credential available; retry later", body = ErrorBody)
    )
)]
async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let descriptor = state.kernel.lifecycle.start(id).await?;
    Ok(Json(descriptor.into()))
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}/status",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session status", body = SessionStatusResponse),
        (status = 404, description = "Session not found", body = ErrorBody)
    )
)]
async fn session_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let status = state.kernel.lifecycle.status(id).await?;
    Ok(Json(status.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/end",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Session ended", body = EndSessionResponse),
        (status = 404, description = "Session not found", body = ErrorBody),
        (status = 409, description = "Session was never initialized", body = ErrorBody)
    )
)]
async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    let status = state.kernel.lifecycle.end(id).await?;
    Ok(Json(EndSessionResponse {
        ok: true,
        session: status.into(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/heartbeat",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Activity recorded", body = SessionStatusResponse),
        (status = 404, description = "Session not found", body = ErrorBody),
        (status = 409, description = "Session holds no sandbox", body = ErrorBody),
        (status = 410, description = "Sandbox lost; initialize again", body = ErrorBody)
    )
)]
async fn heartbeat_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let status = state.kernel.lifecycle.heartbeat(id).await?;
    Ok(Json(status.into()))
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}/resources",
    params(("id" = Uuid, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Sandbox resource usage", body = ResourcesResponse),
        (status = 404, description = "Session not found", body = ErrorBody),
        (status = 409, description = "Session holds no sandbox", body = ErrorBody),
        (status = 410, description = "Sandbox lost; initialize again", body = ErrorBody)
    )
)]
async fn session_resources(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ResourcesResponse>, ApiError> {
    let usage = state.kernel.lifecycle.resources(id).await?;
    Ok(Json(ResourcesResponse::new(id, usage)))
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/messages",
    params(("id" = Uuid, Path, description = "Session identifier")),
    request_body = AppendMessageBody,
    responses(
        (status = 201, description = "Message appended", body = MessageResponse),
        (status = 400, description = "Unknown role", body = ErrorBody),
        (status = 404, description = "Session not found", body = ErrorBody)
    )
)]
async fn append_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AppendMessageBody>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let role = MessageRole::from_str(&payload.role).map_err(ApiError::bad_request)?;
    let record = state
        .kernel
        .lifecycle
        .append(id, role, payload.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/sessions/{id}/messages",
    params(("id" = Uuid, Path, description = "Session identifier"), SyncQuery),
    responses(
        (status = 200, description = "Messages after `since`, oldest first", body = SyncResponse),
        (status = 404, description = "Session not found", body = ErrorBody)
    )
)]
async fn sync_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    let batch = state
        .kernel
        .lifecycle
        .sync_since(
            id,
            query.since.unwrap_or(0),
            query.limit.unwrap_or(MAX_SYNC_LIMIT),
        )
        .await?;
    Ok(Json(batch.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/sessions/{id}/input",
    params(("id" = Uuid, Path, description = "Session identifier")),
    request_body = SubmitInputBody,
    responses(
        (status = 201, description = "Input recorded; session active", body = MessageResponse),
        (status = 404, description = "Session not found", body = ErrorBody),
        (status = 503, description = "Capacity or credential unavailable; retry later", body = ErrorBody)
    )
)]
async fn submit_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SubmitInputBody>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let record = state
        .kernel
        .lifecycle
        .submit(id, MessageRole::User, payload.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

#[utoipa::path(
    get,
    path = "/api/v1/users/{user_id}/sessions",
    params(("user_id" = String, Path, description = "User identifier")),
    responses(
        (status = 200, description = "Sessions of the user with their latest seq", body = [UserSessionResponse])
    )
)]
async fn list_user_sessions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<UserSessionResponse>>, ApiError> {
    let sessions = state
        .db
        .list_sessions_for_user(&user_id)
        .await
        .map_err(ApiError::internal)?;
    let latest = state
        .kernel
        .ledger
        .counts_for_user(&user_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(
        sessions
            .into_iter()
            .map(|session| UserSessionResponse {
                latest_seq: latest.get(&session.id).copied().unwrap_or(0),
                session_id: session.id,
                agent_id: session.agent_id,
                state: session.state.as_str().to_string(),
                last_sync_seq: session.last_sync_seq,
            })
            .collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/credentials",
    responses((status = 200, description = "Credential pool state", body = [CredentialResponse]))
)]
async fn list_credentials(State(state): State<Arc<AppState>>) -> Json<Vec<CredentialResponse>> {
    let snapshot = state.kernel.credentials.snapshot().await;
    Json(snapshot.into_iter().map(CredentialResponse::from).collect())
}

#[utoipa::path(
    post,
    path = "/api/v1/credentials",
    request_body = RegisterCredentialBody,
    responses(
        (status = 201, description = "Credential registered or refreshed", body = CredentialResponse),
        (status = 400, description = "Invalid request", body = ErrorBody)
    )
)]
async fn register_credential(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterCredentialBody>,
) -> Result<(StatusCode, Json<CredentialResponse>), ApiError> {
    if payload.id.trim().is_empty() {
        return Err(ApiError::bad_request("credential id must not be empty"));
    }
    let snapshot = state
        .kernel
        .credentials
        .register(CredentialSpec {
            id: payload.id,
            secret_ref: payload.secret_ref,
            quota: payload.quota,
            max_sessions: payload.max_sessions.unwrap_or(1),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot.into())))
}

#[utoipa::path(
    post,
    path = "/api/v1/credentials/{id}/failure",
    params(("id" = String, Path, description = "Credential identifier")),
    responses(
        (status = 200, description = "Failure recorded", body = CredentialResponse),
        (status = 404, description = "Credential not found", body = ErrorBody)
    )
)]
async fn report_credential_failure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CredentialResponse>, ApiError> {
    let snapshot = state.kernel.credentials.report_failure(&id).await?;
    Ok(Json(snapshot.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/credentials/{id}/success",
    params(("id" = String, Path, description = "Credential identifier")),
    responses(
        (status = 200, description = "Failure streak reset", body = CredentialResponse),
        (status = 404, description = "Credential not found", body = ErrorBody)
    )
)]
async fn report_credential_success(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CredentialResponse>, ApiError> {
    let snapshot = state.kernel.credentials.report_success(&id).await?;
    Ok(Json(snapshot.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/credentials/{id}/replenish",
    params(("id" = String, Path, description = "Credential identifier")),
    request_body = ReplenishBody,
    responses(
        (status = 200, description = "Quota reset", body = CredentialResponse),
        (status = 400, description = "Negative quota", body = ErrorBody),
        (status = 404, description = "Credential not found", body = ErrorBody)
    )
)]
async fn replenish_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<ReplenishBody>,
) -> Result<Json<CredentialResponse>, ApiError> {
    if payload.quota < 0 {
        return Err(ApiError::bad_request("quota must not be negative"));
    }
    let snapshot = state
        .kernel
        .credentials
        .replenish(&id, payload.quota)
        .await?;
    Ok(Json(snapshot.into()))
}

#[utoipa::path(
    post,
    path = "/api/v1/credentials/{id}/usage",
    params(("id" = String, Path, description = "Credential identifier")),
    request_body = UsageBody,
    responses(
        (status = 200, description = "Quota consumed", body = CredentialResponse),
        (status = 400, description = "Non-positive amount", body = ErrorBody),
        (status = 404, description = "Credential not found", body = ErrorBody)
    )
)]
async fn record_credential_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UsageBody>,
) -> Result<Json<CredentialResponse>, ApiError> {
    if payload.amount <= 0 {
        return Err(ApiError::bad_request("amount must be positive"));
    }
    let snapshot = state
        .kernel
        .credentials
        .record_usage(&id, payload.amount)
        .await?;
    Ok(Json(snapshot.into()))
}

#[derive(Debug, Deserialize, ToSchema)]
struct InitSessionBody {
    user_id: String,
    agent_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct SessionResponse {
    session_id: Uuid,
    user_id: String,
    agent_id: String,
    sandbox_id: Option<Uuid>,
    state: String,
}

impl From<SessionDescriptor> for SessionResponse {
    fn from(value: SessionDescriptor) -> Self {
        Self {
            session_id: value.session_id,
            user_id: value.user_id,
            agent_id: value.agent_id,
            sandbox_id: value.sandbox_id,
            state: value.state.as_str().to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct SessionStatusResponse {
    session_id: Uuid,
    user_id: String,
    agent_id: String,
    state: String,
    sandbox_id: Option<Uuid>,
    credential_id: Option<String>,
    heartbeat_age_ms: Option<u64>,
    last_sync_seq: i64,
    end_reason: Option<String>,
}

impl From<SessionStatus> for SessionStatusResponse {
    fn from(value: SessionStatus) -> Self {
        Self {
            session_id: value.session_id,
            user_id: value.user_id,
            agent_id: value.agent_id,
            state: value.state.as_str().to_string(),
            sandbox_id: value.sandbox_id,
            credential_id: value.credential_id,
            heartbeat_age_ms: value.heartbeat_age_ms,
            last_sync_seq: value.last_sync_seq,
            end_reason: value.end_reason.map(|reason| reason.as_str().to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct EndSessionResponse {
    ok: bool,
    session: SessionStatusResponse,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ResourcesResponse {
    session_id: Uuid,
    sandbox_id: Uuid,
    /// `memory.current` of the sandbox cgroup, absent without cgroups.
    memory_current_bytes: Option<u64>,
    memory_max_bytes: u64,
    resident_bytes: Option<u64>,
    pids_current: Option<u64>,
    pids_max: u64,
    cpu_usage_usec: Option<u64>,
    oom_kills: u64,
    workdir_bytes: u64,
    workdir_quota_bytes: Option<u64>,
    over_quota: bool,
}

impl ResourcesResponse {
    fn new(session_id: Uuid, usage: SandboxUsage) -> Self {
        Self {
            session_id,
            over_quota: usage.over_quota(),
            sandbox_id: usage.sandbox_id,
            memory_current_bytes: usage.memory_current_bytes,
            memory_max_bytes: usage.memory_max_bytes,
            resident_bytes: usage.resident_bytes,
            pids_current: usage.pids_current,
            pids_max: usage.pids_max,
            cpu_usage_usec: usage.cpu_usage_usec,
            oom_kills: usage.oom_kills,
            workdir_bytes: usage.workdir_bytes,
            workdir_quota_bytes: usage.workdir_quota_bytes,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
struct AppendMessageBody {
    /// One of `user`, `assistant`, `system`, `tool`.
    role: String,
    #[schema(value_type = Object)]
    payload: Value,
}

#[derive(Debug, Deserialize, ToSchema)]
struct SubmitInputBody {
    #[schema(value_type = Object)]
    payload: Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct MessageResponse {
    session_id: Uuid,
    seq: i64,
    role: String,
    #[schema(value_type = Object)]
    payload: Value,
    created_at: DateTime<Utc>,
}

impl From<MessageRecord> for MessageResponse {
    fn from(value: MessageRecord) -> Self {
        Self {
            session_id: value.session_id,
            seq: value.seq,
            role: value.role.as_str().to_string(),
            payload: value.payload,
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct SyncQuery {
    /// Highest seq the caller already holds.
    since: Option<i64>,
    /// Page size, clamped to 1..=100.
    limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct SyncResponse {
    session_id: Uuid,
    messages: Vec<MessageResponse>,
    high_water: i64,
    has_more: bool,
}

impl From<SyncBatch> for SyncResponse {
    fn from(value: SyncBatch) -> Self {
        Self {
            session_id: value.session_id,
            messages: value.messages.into_iter().map(MessageResponse::from).collect(),
            high_water: value.high_water,
            has_more: value.has_more,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct UserSessionResponse {
    session_id: Uuid,
    agent_id: String,
    state: String,
    latest_seq: i64,
    last_sync_seq: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
struct RegisterCredentialBody {
    id: String,
    /// Reference to where the secret lives, never the secret itself.
    secret_ref: String,
    quota: i64,
    max_sessions: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ReplenishBody {
    quota: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
struct UsageBody {
    amount: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct CredentialResponse {
    id: String,
    secret_ref: String,
    quota_remaining: i64,
    cooldown_until: Option<DateTime<Utc>>,
    failure_count: i64,
    consecutive_failures: i64,
    max_sessions: i64,
    active_leases: usize,
}

impl From<CredentialSnapshot> for CredentialResponse {
    fn from(value: CredentialSnapshot) -> Self {
        Self {
            id: value.id,
            secret_ref: value.secret_ref,
            quota_remaining: value.quota_remaining,
            cooldown_until: value.cooldown_until,
            failure_count: value.failure_count,
            consecutive_failures: value.consecutive_failures,
            max_sessions: value.max_sessions,
            active_leases: value.active_leases,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    fn retryable(message: impl Into<String>) -> Self {
        Self {
            retry_after: Some(RETRY_AFTER_SECS),
            ..Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
        }
    }

    fn bad_request<E: std::fmt::Display>(message: E) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.to_string())
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let message = err.to_string();
        match err {
            LifecycleError::ResourceExhausted(_) | LifecycleError::CredentialUnavailable => {
                ApiError::retryable(message)
            }
            LifecycleError::SandboxLost(_) => ApiError::new(StatusCode::GONE, message),
            LifecycleError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, message),
            LifecycleError::InvalidTransition { .. } | LifecycleError::Cancelled(_) => {
                ApiError::new(StatusCode::CONFLICT, message)
            }
            LifecycleError::Sandbox(_) | LifecycleError::Storage(_) => ApiError::internal(message),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let message = err.to_string();
        match err {
            PoolError::Exhausted => ApiError::retryable(message),
            PoolError::UnknownCredential(_) => ApiError::new(StatusCode::NOT_FOUND, message),
            PoolError::Storage(_) => ApiError::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, message = %self.message, "api error");
        } else {
            warn!(status = %self.status, message = %self.message, "api request rejected");
        }
        let mut response = (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Hive Daemon API", version = "0.1.0"),
        paths(
            healthz,
            metrics,
            init_session,
            start_session,
            session_status,
            end_session,
            heartbeat_session,
            session_resources,
            append_message,
            sync_messages,
            submit_input,
            list_user_sessions,
            list_credentials,
            register_credential,
            report_credential_failure,
            report_credential_success,
            replenish_credential,
            record_credential_usage
        ),
        components(schemas(
            InitSessionBody,
            SessionResponse,
            SessionStatusResponse,
            EndSessionResponse,
            ResourcesResponse,
            AppendMessageBody,
            SubmitInputBody,
            MessageResponse,
            SyncResponse,
            UserSessionResponse,
            RegisterCredentialBody,
            ReplenishBody,
            UsageBody,
            CredentialResponse,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup(key)) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("invalid {key}='{value}': {err}")),
        None => Ok(None),
    }
}

fn bool_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    lookup(key).and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use hive_kernel::{SandboxInstance, SandboxRuntime, SpawnRequest};
    use serde_json::json;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, Ordering},
    };
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct StubInstance {
        alive: AtomicBool,
    }

    #[async_trait]
    impl SandboxInstance for StubInstance {
        fn pid(&self) -> Option<u32> {
            None
        }
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn resident_bytes(&self) -> Option<u64> {
            Some(4096)
        }
        async fn terminate(&self, _grace: Duration) -> anyhow::Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn kill_now(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    struct StubRuntime;

    #[async_trait]
    impl SandboxRuntime for StubRuntime {
        async fn spawn(&self, _request: &SpawnRequest) -> anyhow::Result<Arc<dyn SandboxInstance>> {
            Ok(Arc::new(StubInstance {
                alive: AtomicBool::new(true),
            }))
        }
    }

    async fn setup_test_app() -> (Arc<AppState>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::connect("sqlite::memory:").await.expect("db");

        let mut config = KernelConfig {
            workspace_root: temp.path().join("workspaces"),
            mem_cap_bytes: MIB,
            host_memory_budget_bytes: 64 * MIB,
            pool_size: 4,
            reuse_window: Duration::ZERO,
            destroy_grace: Duration::from_millis(10),
            ..KernelConfig::default()
        };
        config.isolation.enable_cgroups = false;
        config.isolation.assign_identity = false;

        let kernel = HiveKernel::bootstrap(db.clone(), Arc::new(StubRuntime), config, None)
            .await
            .expect("kernel");
        let state = Arc::new(AppState { kernel, db });
        let router = build_router(state.clone());
        (state, router, temp)
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register_key(router: &Router, id: &str, quota: i64) {
        let response = send(
            router,
            "POST",
            "/api/v1/credentials",
            Some(json!({ "id": id, "secret_ref": format!("env:{id}"), "quota": quota, "max_sessions": 4 })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn session_round_trip_over_http() {
        let (_state, router, _tmp) = setup_test_app().await;
        register_key(&router, "key1", 100).await;

        let response = send(
            &router,
            "POST",
            "/api/v1/sessions",
            Some(json!({ "user_id": "alice", "agent_id": "writer" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let session = json_body(response).await;
        assert_eq!(session["state"], "ready");
        let id = session["session_id"].as_str().unwrap().to_string();

        let response = send(&router, "POST", &format!("/api/v1/sessions/{id}/start"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["state"], "active");

        let response = send(
            &router,
            "POST",
            &format!("/api/v1/sessions/{id}/input"),
            Some(json!({ "payload": { "text": "hello" } })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let input = json_body(response).await;
        assert_eq!(input["seq"], 1);
        assert_eq!(input["role"], "user");

        let response = send(
            &router,
            "POST",
            &format!("/api/v1/sessions/{id}/messages"),
            Some(json!({ "role": "assistant", "payload": { "text": "hi" } })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["seq"], 2);

        let response = send(
            &router,
            "GET",
            &format!("/api/v1/sessions/{id}/messages?since=1&limit=10"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let batch = json_body(response).await;
        assert_eq!(batch["messages"].as_array().unwrap().len(), 1);
        assert_eq!(batch["messages"][0]["payload"]["text"], "hi");
        assert_eq!(batch["high_water"], 2);
        assert_eq!(batch["has_more"], false);

        let response = send(&router, "GET", &format!("/api/v1/sessions/{id}/status"), None).await;
        let status = json_body(response).await;
        assert_eq!(status["credential_id"], "key1");
        assert_eq!(status["last_sync_seq"], 2);

        let response = send(&router, "POST", &format!("/api/v1/sessions/{id}/end"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let ended = json_body(response).await;
        assert_eq!(ended["ok"], true);
        assert_eq!(ended["session"]["state"], "terminated");
        assert_eq!(ended["session"]["end_reason"], "ended");

        let response = send(&router, "GET", "/api/v1/users/alice/sessions", None).await;
        let sessions = json_body(response).await;
        assert_eq!(sessions[0]["latest_seq"], 2);
        assert_eq!(sessions[0]["state"], "terminated");
    }

    #[tokio::test]
    async fn start_without_credential_is_retryable() {
        let (_state, router, _tmp) = setup_test_app().await;
        let response = send(
            &router,
            "POST",
            "/api/v1/sessions",
            Some(json!({ "user_id": "alice", "agent_id": "writer" })),
        )
        .await;
        let id = json_body(response).await["session_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = send(&router, "POST", &format!("/api/v1/sessions/{id}/start"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &RETRY_AFTER_SECS.to_string()
        );
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_state, router, _tmp) = setup_test_app().await;
        let id = Uuid::new_v4();
        let response = send(&router, "GET", &format!("/api/v1/sessions/{id}/status"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains(&id.to_string()));
    }

    #[tokio::test]
    async fn heartbeat_before_init_conflicts() {
        let (state, router, _tmp) = setup_test_app().await;
        let record = state.db.ensure_session("alice", "writer").await.unwrap();
        let response = send(
            &router,
            "POST",
            &format!("/api/v1/sessions/{}/heartbeat", record.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn lost_sandbox_maps_to_gone() {
        let (state, router, _tmp) = setup_test_app().await;
        register_key(&router, "key1", 100).await;
        let descriptor = state.kernel.lifecycle.init("alice", "writer").await.unwrap();
        state
            .kernel
            .supervisor
            .destroy(descriptor.sandbox_id.unwrap())
            .await
            .unwrap();

        let response = send(
            &router,
            "POST",
            &format!("/api/v1/sessions/{}/start", descriptor.session_id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn resources_report_workdir_usage() {
        let (state, router, _tmp) = setup_test_app().await;
        let descriptor = state.kernel.lifecycle.init("alice", "writer").await.unwrap();
        let sandbox_id = descriptor.sandbox_id.unwrap();
        let workdir = state.kernel.supervisor.get(sandbox_id).unwrap().workdir;
        std::fs::write(workdir.join("notes.txt"), "twelve bytes").unwrap();

        let uri = format!("/api/v1/sessions/{}/resources", descriptor.session_id);
        let response = send(&router, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["sandbox_id"], sandbox_id.to_string());
        assert_eq!(body["memory_max_bytes"], MIB);
        assert_eq!(body["resident_bytes"], 4096);
        assert_eq!(body["workdir_bytes"], 12);
        assert!(body["memory_current_bytes"].is_null());
        assert!(body["workdir_quota_bytes"].is_null());
        assert_eq!(body["over_quota"], false);

        state.kernel.supervisor.destroy(sandbox_id).await.unwrap();
        let response = send(&router, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::GONE);
        let response = send(&router, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_role_is_rejected() {
        let (state, router, _tmp) = setup_test_app().await;
        let descriptor = state.kernel.lifecycle.init("alice", "writer").await.unwrap();
        let response = send(
            &router,
            "POST",
            &format!("/api/v1/sessions/{}/messages", descriptor.session_id),
            Some(json!({ "role": "narrator", "payload": {} })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn credential_failures_trigger_cooldown() {
        let (_state, router, _tmp) = setup_test_app().await;
        register_key(&router, "key2", 10).await;

        let mut last = Value::Null;
        for _ in 0..3 {
            let response = send(&router, "POST", "/api/v1/credentials/key2/failure", None).await;
            assert_eq!(response.status(), StatusCode::OK);
            last = json_body(response).await;
        }
        assert_eq!(last["consecutive_failures"], 3);
        assert_eq!(last["failure_count"], 3);
        assert!(last["cooldown_until"].is_string());

        let response = send(&router, "POST", "/api/v1/credentials/key2/success", None).await;
        assert_eq!(json_body(response).await["consecutive_failures"], 0);

        let response = send(
            &router,
            "POST",
            "/api/v1/credentials/key2/usage",
            Some(json!({ "amount": 4 })),
        )
        .await;
        assert_eq!(json_body(response).await["quota_remaining"], 6);

        let response = send(
            &router,
            "POST",
            "/api/v1/credentials/key2/replenish",
            Some(json!({ "quota": 50 })),
        )
        .await;
        assert_eq!(json_body(response).await["quota_remaining"], 50);

        let response = send(&router, "POST", "/api/v1/credentials/missing/failure", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&router, "GET", "/api/v1/credentials", None).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metrics_report_pool_and_sessions() {
        let (state, router, _tmp) = setup_test_app().await;
        state.kernel.lifecycle.init("alice", "writer").await.unwrap();

        let response = send(&router, "GET", "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("hive_live_sandboxes 1"));
        assert!(text.contains("hive_free_identities 3"));
        assert!(text.contains("hive_sessions{state=\"ready\"} 1"));
        assert!(text.contains("hive_sessions{state=\"active\"} 0"));
    }

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_without_environment() {
        let config = AppConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.db_url, "sqlite://./hive.db");
        assert_eq!(config.kernel.pool_size, KernelConfig::default().pool_size);
        assert!(config.kernel.audit.enabled);
        assert!(config.credentials.is_empty());
    }

    #[test]
    fn config_reads_overrides() {
        let key = STANDARD.encode(b"audit-key");
        let config = AppConfig::from_lookup(lookup_from(&[
            ("HIVE_API_ADDR", "0.0.0.0:9000"),
            ("HIVE_DB_URL", "sqlite::memory:"),
            ("HIVE_IDLE_TIMEOUT_SECS", "600"),
            ("HIVE_MEM_CAP_MIB", "128"),
            ("HIVE_POOL_SIZE", "10"),
            ("HIVE_ENABLE_CGROUPS", "false"),
            ("HIVE_WORKDIR_QUOTA_MIB", "256"),
            ("HIVE_AGENT_ARGS", "--stdio, --quiet"),
            ("HIVE_AUDIT_LOG_HMAC_KEY", key.as_str()),
            ("HIVE_CREDENTIALS", "key1|env:KEY1|0, key2|env:KEY2|10|3"),
        ]))
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.db_url, "sqlite::memory:");
        assert_eq!(config.kernel.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.kernel.mem_cap_bytes, 128 * MIB);
        assert_eq!(config.kernel.pool_size, 10);
        assert!(!config.kernel.isolation.enable_cgroups);
        assert_eq!(config.kernel.workdir_quota_bytes, Some(256 * MIB));
        assert_eq!(config.kernel.isolation.agent_args, vec!["--stdio", "--quiet"]);
        assert_eq!(config.kernel.audit.hmac_key.as_deref(), Some(&b"audit-key"[..]));
        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.credentials[0].max_sessions, 1);
        assert_eq!(config.credentials[1].quota, 10);
        assert_eq!(config.credentials[1].max_sessions, 3);
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = AppConfig::from_lookup(lookup_from(&[("HIVE_POOL_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("HIVE_POOL_SIZE"));

        let err = AppConfig::from_lookup(lookup_from(&[
            ("HIVE_LOW_WATERMARK_MIB", "4096"),
            ("HIVE_HIGH_WATERMARK_MIB", "1024"),
        ]))
        .unwrap_err();
        assert!(format!("{err:#}").contains("high_watermark_bytes"));

        assert!(parse_credentials("only-an-id").is_err());
        assert!(parse_credentials("k|env:K|many").is_err());
    }

    #[test]
    fn openapi_lists_session_routes() {
        let doc = docs::ApiDoc::openapi();
        let yaml = doc.to_yaml().unwrap();
        assert!(yaml.contains("/api/v1/sessions/{id}/start"));
        assert!(yaml.contains("/api/v1/sessions/{id}/resources"));
        assert!(yaml.contains("/api/v1/credentials/{id}/replenish"));
    }
}
