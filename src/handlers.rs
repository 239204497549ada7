use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::{
        DefaultBodyLimit, Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{
    admission::admission_middleware,
    approvals::ensure_approval,
    auth::{AuthContext, bearer_auth_middleware, bearer_token},
    config::{Capability, Config},
    deps::{self, InstallMode, ManagerChoice},
    error::ApiError,
    git::{self, CloneOptions},
    jobs::{JobSnapshot, ProgressKind},
    opener::{self, OpenTarget},
    runner::run_command,
    sandbox::{SandboxError, ensure_relative, resolve_inside_workspace},
    state::AppState,
};

/// Request bodies above this are rejected with `request_too_large`.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/git/clone", post(git_clone))
        .route("/v1/git/fetch", post(git_fetch))
        .route("/v1/git/status", get(git_status))
        .route("/v1/os/open", post(os_open))
        .route("/v1/deps/install", post(deps_install))
        .route("/v1/jobs/:job_id", get(job_get))
        .route("/v1/jobs/:job_id/stream", get(job_stream))
        .route("/v1/jobs/:job_id/cancel", post(job_cancel))
        .route("/v1/diagnostics", get(diagnostics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ));

    Router::new()
        .route("/v1/meta", get(meta))
        .route("/v1/pair", post(pair))
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn caller_origin(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::OriginNotAllowed("missing Origin header".to_string()))
}

fn require_workspace(config: &Config) -> Result<PathBuf, ApiError> {
    config
        .workspace_root
        .clone()
        .ok_or(ApiError::WorkspaceRequired)
}

/// Sandbox failures for generic (non-repo) path fields.
fn map_path_error(err: SandboxError) -> ApiError {
    match err {
        SandboxError::Missing(path) => ApiError::PathNotFound(path.display().to_string()),
        SandboxError::Outside => ApiError::PathOutsideWorkspace,
        SandboxError::TooLong => ApiError::validation(err),
        SandboxError::Io(err) => ApiError::internal(err),
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::JobNotFound(raw.to_string()))
}

// --- meta ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaResponse {
    version: &'static str,
    build: &'static str,
    pairing: MetaPairing,
    workspace: MetaWorkspace,
    tools: MetaTools,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaPairing {
    paired: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaWorkspace {
    configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    root: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetaTools {
    git: bool,
    npm: bool,
    pnpm: bool,
    yarn: bool,
    vscode: bool,
}

async fn meta(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<MetaResponse>, ApiError> {
    let origin = caller_origin(&headers)?;
    let config = state.config.get();
    let paired = state.tokens.get_active(&origin).is_some();

    Ok(Json(MetaResponse {
        version: env!("CARGO_PKG_VERSION"),
        build: if cfg!(debug_assertions) { "debug" } else { "release" },
        pairing: MetaPairing { paired },
        workspace: MetaWorkspace {
            configured: config.workspace_root.is_some(),
            root: config
                .workspace_root
                .as_ref()
                .map(|root| root.display().to_string()),
        },
        tools: MetaTools {
            git: deps::tool_on_path("git"),
            npm: deps::tool_on_path("npm"),
            pnpm: deps::tool_on_path("pnpm"),
            yarn: deps::tool_on_path("yarn"),
            vscode: deps::tool_on_path("code"),
        },
    }))
}

// --- pairing ---

#[derive(Deserialize)]
#[serde(tag = "step", rename_all = "lowercase")]
enum PairRequest {
    Start,
    Confirm { code: String },
    Revoke,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PairConfirmResponse {
    access_token: String,
    token_type: &'static str,
    expires_at: DateTime<Utc>,
}

async fn pair(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PairRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = payload?;
    let origin = caller_origin(&headers)?;

    match payload {
        PairRequest::Start => {
            let challenge = state.pairing.start(&origin);
            Ok(Json(challenge).into_response())
        }
        PairRequest::Confirm { code } => {
            if code.is_empty() {
                return Err(ApiError::validation("code must not be empty"));
            }
            if !state.pairing.confirm(&origin, &code) {
                return Err(ApiError::validation("pairing code invalid or expired"));
            }

            let ttl_days = state.config.get().pairing.token_ttl_days;
            let tokens = state.tokens.clone();
            let issue_origin = origin.clone();
            let (access_token, expires_at) =
                tokio::task::spawn_blocking(move || tokens.issue(&issue_origin, ttl_days))
                    .await
                    .map_err(ApiError::internal)?
                    .map_err(ApiError::internal)?;

            Ok(Json(PairConfirmResponse {
                access_token,
                token_type: "Bearer",
                expires_at,
            })
            .into_response())
        }
        PairRequest::Revoke => {
            let token = bearer_token(&headers)?;
            let tokens = state.tokens.clone();
            let check_origin = origin.clone();
            let valid = tokio::task::spawn_blocking(move || tokens.verify(&check_origin, &token))
                .await
                .map_err(ApiError::internal)?;
            if !valid {
                return Err(ApiError::AuthInvalid);
            }
            state.tokens.revoke(&origin).map_err(ApiError::internal)?;
            Ok(Json(json!({"ok": true})).into_response())
        }
    }
}

// --- git ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloneRequest {
    repo_url: String,
    dest_relative: String,
    #[serde(default)]
    options: Option<CloneRequestOptions>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CloneRequestOptions {
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    depth: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobAccepted {
    job_id: Uuid,
}

async fn git_clone(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    payload: Result<Json<CloneRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let Json(payload) = payload?;

    git::validate_repo_url(&payload.repo_url)?;
    ensure_relative(&payload.dest_relative).map_err(|_| ApiError::PathOutsideWorkspace)?;

    let options = payload.options.unwrap_or_default();
    if options.depth.is_some_and(|depth| depth < 1) {
        return Err(ApiError::validation("options.depth must be at least 1"));
    }

    let root = require_workspace(&state.config.get())?;
    let dest = resolve_inside_workspace(&root, &payload.dest_relative, true)
        .await
        .map_err(map_path_error)?;
    if tokio::fs::metadata(&dest).await.is_ok() {
        return Err(ApiError::Conflict(format!(
            "destination already exists: {}",
            payload.dest_relative
        )));
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(ApiError::internal)?;
    }

    let args = git::clone_args(
        &payload.repo_url,
        &dest,
        &CloneOptions {
            branch: options.branch,
            depth: options.depth,
        },
    );
    let repo_url = payload.repo_url;
    let job = state.jobs.enqueue(move |ctx| async move {
        ctx.progress(ProgressKind::Git, None, Some(format!("cloning {repo_url}")));
        run_command(ctx, "git", args, root).await
    });

    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id: job.id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchRequest {
    repo_path: String,
    #[serde(default = "default_remote")]
    remote: String,
    #[serde(default)]
    prune: bool,
}

fn default_remote() -> String {
    "origin".to_string()
}

async fn git_fetch(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    payload: Result<Json<FetchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let Json(payload) = payload?;

    let root = require_workspace(&state.config.get())?;
    let repo = git::resolve_repo_path(&root, &payload.repo_path).await?;

    let args = git::fetch_args(&repo, &payload.remote, payload.prune);
    let remote = payload.remote;
    let job = state.jobs.enqueue(move |ctx| async move {
        ctx.progress(ProgressKind::Git, None, Some(format!("fetching {remote}")));
        run_command(ctx, "git", args, root).await
    });

    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id: job.id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    repo_path: String,
}

async fn git_status(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<git::GitStatus>, ApiError> {
    let Query(query) = query?;
    let root = require_workspace(&state.config.get())?;
    let repo = git::resolve_repo_path(&root, &query.repo_path).await?;
    let status = git::run_status(&repo).await.map_err(ApiError::internal)?;
    Ok(Json(status))
}

// --- os.open ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenRequest {
    target: OpenTarget,
    path: String,
}

async fn os_open(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<OpenRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(payload) = payload?;

    let root = require_workspace(&state.config.get())?;
    let resolved = resolve_inside_workspace(&root, &payload.path, false)
        .await
        .map_err(map_path_error)?;

    let capability = match payload.target {
        OpenTarget::Folder => None,
        OpenTarget::Terminal => Some(Capability::OpenTerminal),
        OpenTarget::Vscode => Some(Capability::OpenVscode),
    };
    if let Some(capability) = capability {
        ensure_approval(&state, &auth.origin, &resolved, capability).await?;
    }

    opener::open_path(payload.target, &resolved)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({"ok": true})))
}

// --- deps.install ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepsInstallRequest {
    repo_path: String,
    #[serde(default)]
    manager: ManagerChoice,
    #[serde(default)]
    mode: InstallMode,
    #[serde(default)]
    safer: Option<bool>,
}

async fn deps_install(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<DepsInstallRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let Json(payload) = payload?;

    let config = state.config.get();
    let root = require_workspace(&config)?;
    let resolved = resolve_inside_workspace(&root, &payload.repo_path, false)
        .await
        .map_err(map_path_error)?;
    if tokio::fs::metadata(resolved.join("package.json")).await.is_err() {
        return Err(ApiError::PathNotFound(format!(
            "{}/package.json",
            payload.repo_path
        )));
    }

    ensure_approval(&state, &auth.origin, &resolved, Capability::DepsInstall).await?;

    let probe = deps::probe_repo(&resolved).await.map_err(ApiError::internal)?;
    let manager = deps::select_manager(payload.manager, &probe, |candidate| {
        deps::tool_on_path(candidate.program())
    });
    let safer = payload.safer.unwrap_or(config.deps.default_safer);
    let args = deps::build_install_args(manager, payload.mode, safer, &probe);

    let program = manager.program();
    let job = state.jobs.enqueue(move |ctx| async move {
        ctx.progress(
            ProgressKind::Deps,
            None,
            Some(format!("running {program} install")),
        );
        run_command(ctx, program, args, resolved).await
    });

    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id: job.id })))
}

// --- jobs ---

async fn job_get(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let id = parse_job_id(&job_id)?;
    state
        .jobs
        .get(id)
        .map(Json)
        .ok_or(ApiError::JobNotFound(job_id))
}

async fn job_cancel(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<JobSnapshot>), ApiError> {
    let id = parse_job_id(&job_id)?;
    match state.jobs.cancel(id) {
        None => Err(ApiError::JobNotFound(job_id)),
        Some(Err(())) => Err(ApiError::Conflict(
            "job already reached a terminal state".to_string(),
        )),
        Some(Ok(snapshot)) => Ok((StatusCode::ACCEPTED, Json(snapshot))),
    }
}

/// Replay the job's event ring, then follow live events until a terminal
/// `state` event closes the stream. Subscribing happens under the same
/// lock as the ring snapshot, so no event is lost between the two.
async fn job_stream(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiError>
{
    let id = parse_job_id(&job_id)?;
    let (history, rx) = state.jobs.subscribe(id).ok_or(ApiError::JobNotFound(job_id))?;

    let live = BroadcastStream::new(rx).filter_map(|result| futures::future::ready(result.ok()));
    let upstream = futures::stream::iter(history).chain(live).boxed();
    // The stream must end right after the terminal event; waiting for a
    // further upstream item would hang, as the broadcast sender stays
    // alive and the terminal event is the last one emitted.
    let stream = futures::stream::unfold((upstream, false), |(mut upstream, finished)| async move {
        if finished {
            return None;
        }
        let event = upstream.next().await?;
        let terminal = event.is_terminal_state();
        Some((event, (upstream, terminal)))
    })
    .map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text(""),
    ))
}

// --- diagnostics ---

async fn diagnostics(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
) -> Json<Value> {
    let config = state.config.get();
    Json(json!({
        "server": {
            "port": config.server_port,
            "tlsEnabled": config.tls.enabled,
        },
        "origins": config.origin_allowlist.len(),
        "workspace": {
            "configured": config.workspace_root.is_some(),
        },
        "jobs": {
            "maxConcurrent": config.jobs.max_concurrent,
            "timeoutSeconds": config.jobs.timeout_seconds,
            "counts": state.jobs.counts_by_state(),
        },
        "rateLimit": {
            "trackedPeers": state.global_limiter.tracked_peers(),
        },
        "configDir": state.config_dir.display().to_string(),
    }))
}
