//! Router assembly and HTTP handlers (§6 External Interfaces). Route paths,
//! payload shapes and error bodies are the ones named there; this module
//! just wires them onto the components built elsewhere.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::diff_cache::{DiffCache, DiffStats};
use crate::directories::{self, DirectoryMatch};
use crate::error::ApiResult;
use crate::fs as project_fs;
use crate::git;
use crate::idle_monitor::IdleMonitor;
use crate::registry::{CreateSessionRequest, CreateSessionResult, DeclaredSession, MergedSession, SessionRegistry};
use crate::session_manager::SessionManager;
use crate::settings::{self, Settings};
use crate::ws;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) session_manager: Arc<SessionManager>,
    pub(crate) diff_cache: Arc<DiffCache>,
    pub(crate) settings_path: PathBuf,
    pub(crate) settings: Arc<RwLock<Settings>>,
}

impl AppState {
    async fn workdir(&self, name: &str) -> ApiResult<String> {
        self.registry.get_session_workdir(name).await
    }
}

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tmux-studio-server")]
pub struct Args {
    #[arg(long, env = "TMUX_STUDIO_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "TMUX_STUDIO_PORT", default_value_t = 7870)]
    pub port: u16,

    /// Overrides the directory holding sessions.json/settings.json/etc.
    #[arg(long, env = "TMUX_STUDIO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Root directory `/api/directories/search` walks when the caller
    /// doesn't override it with a `root` query parameter.
    #[arg(long, env = "TMUX_STUDIO_REPO_ROOT")]
    pub repo_search_root: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ---------------------------------------------------------------------
// Session registry CRUD
// ---------------------------------------------------------------------

async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<MergedSession>>> {
    Ok(Json(state.registry.list_sessions().await?))
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResult>> {
    Ok(Json(state.registry.create_session(req).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchSessionRequest {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

async fn patch_session(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Json(req): Json<PatchSessionRequest>,
) -> ApiResult<Json<DeclaredSession>> {
    Ok(Json(
        state
            .registry
            .update_session(&name, req.description, req.display_name)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct DeleteSessionQuery {
    #[serde(default)]
    cleanup_worktree: bool,
}

async fn delete_session(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Query(query): Query<DeleteSessionQuery>,
) -> ApiResult<Json<Value>> {
    state.registry.delete_session(&name, query.cleanup_worktree).await?;
    state.diff_cache.invalidate(&name).await;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn touch_session(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<Value>> {
    state.registry.touch_session(&name).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn reset_session(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<Value>> {
    state.registry.reset_session(&name).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

#[derive(Debug, Deserialize)]
struct BranchesForWorktreeQuery {
    repo_path: String,
}

async fn worktree_branches(Query(query): Query<BranchesForWorktreeQuery>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(git::branches_for_worktree(&query.repo_path).await?))
}

// ---------------------------------------------------------------------
// Session-scoped git routes
// ---------------------------------------------------------------------

async fn git_status(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<git::GitStatus>> {
    let workdir = state.workdir(&name).await?;
    Ok(Json(git::status(&workdir).await?))
}

/// Marks `name` active in the diff cache and returns the warm value (§4.6).
/// If the poller hasn't populated it yet, computes it inline once so the
/// first request after attach doesn't return an empty diff.
async fn git_diff(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<git::DiffSnapshot>> {
    let workdir = state.workdir(&name).await?;
    state.diff_cache.mark_active(&name, &workdir).await;
    if let Some(snapshot) = state.diff_cache.get_diff(&name).await {
        return Ok(Json(snapshot));
    }
    Ok(Json(git::diff_with_untracked(&workdir).await?))
}

/// Never marks `name` active (§4.6, §8 invariant 8) — a caller polling only
/// stats should not keep a session's full diff warm by itself.
async fn git_diff_stats(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<DiffStats>> {
    if let Some(stats) = state.diff_cache.get_stats(&name).await {
        return Ok(Json(stats));
    }
    let workdir = state.workdir(&name).await?;
    let snapshot = git::diff_with_untracked(&workdir).await?;
    Ok(Json(DiffStats {
        files: snapshot.files.len(),
        additions: snapshot.additions,
        deletions: snapshot.deletions,
    }))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    50
}

async fn git_log(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<git::CommitLogEntry>>> {
    let workdir = state.workdir(&name).await?;
    Ok(Json(git::commit_log(&workdir, query.limit).await?))
}

async fn git_commit_diff(
    State(state): State<AppState>,
    AxPath((name, hash)): AxPath<(String, String)>,
) -> ApiResult<Json<git::CommitDiffResult>> {
    let workdir = state.workdir(&name).await?;
    Ok(Json(git::commit_diff(&workdir, &hash).await?))
}

#[derive(Debug, Deserialize)]
struct CommitRequest {
    message: String,
}

async fn git_commit(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Json(req): Json<CommitRequest>,
) -> ApiResult<Json<git::CommitResult>> {
    let workdir = state.workdir(&name).await?;
    let result = git::stage_all_and_commit(&workdir, &req.message).await?;
    state.diff_cache.invalidate(&name).await;
    Ok(Json(result))
}

async fn git_reset(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<git::ResetResult>> {
    let workdir = state.workdir(&name).await?;
    let result = git::reset_to_head(&workdir).await?;
    state.diff_cache.invalidate(&name).await;
    Ok(Json(result))
}

async fn git_push(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<git::PushResult>> {
    let workdir = state.workdir(&name).await?;
    Ok(Json(git::push(&workdir).await?))
}

async fn git_pull(State(state): State<AppState>, AxPath(name): AxPath<String>) -> ApiResult<Json<git::PullResult>> {
    let workdir = state.workdir(&name).await?;
    let result = git::pull_rebase(&workdir).await?;
    state.diff_cache.invalidate(&name).await;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct RemoteStatusQuery {
    #[serde(default)]
    fetch: bool,
}

async fn git_remote_status(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Query(query): Query<RemoteStatusQuery>,
) -> ApiResult<Json<git::RemoteStatus>> {
    let workdir = state.workdir(&name).await?;
    Ok(Json(git::remote_status(&workdir, query.fetch).await?))
}

async fn git_branches(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
) -> ApiResult<Json<git::GitBranches>> {
    let workdir = state.workdir(&name).await?;
    Ok(Json(git::branches(&workdir).await?))
}

#[derive(Debug, Deserialize)]
struct CheckoutRequest {
    branch: String,
}

async fn git_checkout(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<git::CheckoutResult>> {
    let workdir = state.workdir(&name).await?;
    let result = git::checkout_branch(&workdir, &req.branch).await?;
    state.diff_cache.invalidate(&name).await;
    Ok(Json(result))
}

// ---------------------------------------------------------------------
// Session-scoped todos / scratchpad / files
// ---------------------------------------------------------------------

async fn get_todos(AxPath(name): AxPath<String>) -> ApiResult<Json<Value>> {
    let data = crate::registry::load_session_data(&name).await;
    Ok(Json(data.todos.0.get(&name).cloned().unwrap_or(Value::Null)))
}

async fn post_todos(AxPath(name): AxPath<String>, Json(value): Json<Value>) -> ApiResult<Json<Value>> {
    let mut data = crate::registry::load_session_data(&name).await;
    data.todos.0.insert(name.clone(), value);
    crate::registry::save_session_data(&name, &data).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn get_scratchpad(AxPath(name): AxPath<String>) -> ApiResult<Json<Value>> {
    let data = crate::registry::load_session_data(&name).await;
    Ok(Json(data.scratchpad.0.get(&name).cloned().unwrap_or(Value::Null)))
}

async fn post_scratchpad(AxPath(name): AxPath<String>, Json(value): Json<Value>) -> ApiResult<Json<Value>> {
    let mut data = crate::registry::load_session_data(&name).await;
    data.scratchpad.0.insert(name.clone(), value);
    crate::registry::save_session_data(&name, &data).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn list_files(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
) -> ApiResult<Json<Vec<project_fs::ProjectFileEntry>>> {
    let workdir = state.workdir(&name).await?;
    Ok(Json(project_fs::list_project_files(Path::new(&workdir)).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileContentResponse {
    path: String,
    language: &'static str,
    content: String,
}

async fn read_file(
    State(state): State<AppState>,
    AxPath((name, file_path)): AxPath<(String, String)>,
) -> ApiResult<Json<FileContentResponse>> {
    let workdir = state.workdir(&name).await?;
    let (content, language) = project_fs::read_project_file(Path::new(&workdir), &file_path).await?;
    Ok(Json(FileContentResponse {
        path: file_path,
        language,
        content,
    }))
}

// ---------------------------------------------------------------------
// Directory search
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DirectorySearchQuery {
    #[serde(default)]
    query: String,
    #[serde(default)]
    root: Option<String>,
}

async fn search_directories(
    State(state): State<AppState>,
    Query(query): Query<DirectorySearchQuery>,
) -> Json<Vec<DirectoryMatch>> {
    let root = match query.root {
        Some(root) => root,
        None => state.settings.read().await.repo_search_root.clone(),
    };
    Json(directories::search(Path::new(&root), &query.query).await)
}

// ---------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------

fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/branches", get(worktree_branches))
        .route("/api/sessions/{name}", patch(patch_session).delete(delete_session))
        .route("/api/sessions/{name}/touch", post(touch_session))
        .route("/api/sessions/{name}/reset", post(reset_session))
        .route("/api/sessions/{name}/git/status", get(git_status))
        .route("/api/sessions/{name}/git/diff", get(git_diff))
        .route("/api/sessions/{name}/git/diff-stats", get(git_diff_stats))
        .route("/api/sessions/{name}/git/log", get(git_log))
        .route("/api/sessions/{name}/git/commit/{hash}", get(git_commit_diff))
        .route("/api/sessions/{name}/git/commit", post(git_commit))
        .route("/api/sessions/{name}/git/reset", post(git_reset))
        .route("/api/sessions/{name}/git/push", post(git_push))
        .route("/api/sessions/{name}/git/pull", post(git_pull))
        .route("/api/sessions/{name}/git/remote-status", get(git_remote_status))
        .route("/api/sessions/{name}/git/branches", get(git_branches))
        .route("/api/sessions/{name}/git/checkout", post(git_checkout))
        .route("/api/sessions/{name}/todos", get(get_todos).post(post_todos))
        .route("/api/sessions/{name}/scratchpad", get(get_scratchpad).post(post_scratchpad))
        .route("/api/sessions/{name}/files", get(list_files))
        .route("/api/sessions/{name}/files/{*path}", get(read_file))
        .route("/api/directories/search", get(search_directories))
        .route("/api/session/{name}/stream", get(ws::session_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin.as_bytes().starts_with(b"http://localhost") || origin.as_bytes().starts_with(b"http://127.0.0.1")
        }))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    if let Some(dir) = &args.data_dir {
        unsafe {
            std::env::set_var("TMUX_STUDIO_DATA_DIR", dir);
        }
    }

    let (settings_path, mut loaded_settings) = settings::load().await;
    if let Some(root) = args.repo_search_root.clone() {
        loaded_settings.repo_search_root = root;
    }

    let state = AppState {
        registry: Arc::new(SessionRegistry::new()),
        session_manager: Arc::new(SessionManager::new()),
        diff_cache: Arc::new(DiffCache::new()),
        settings_path,
        settings: Arc::new(RwLock::new(loaded_settings)),
    };

    tokio::spawn(IdleMonitor::new().run());
    tokio::spawn(state.diff_cache.clone().run());

    let cors = build_cors();
    let router = build_router(state, cors);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    tracing::info!(%addr, "tmux-studio listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
