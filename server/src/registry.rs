//! Session registry (§4.7): CRUD over declared sessions, reconciled against
//! the live tmux server and the per-session data store into one merged view.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ApiResult, AppError};
use crate::git;
use crate::pane;
use crate::pty;
use crate::store::{self, Store, Table};

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SessionType {
    Direct,
    Worktree,
}

impl Default for SessionType {
    fn default() -> Self {
        SessionType::Direct
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeclaredSession {
    pub name: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub worktree_parent_repo: Option<String>,
    #[serde(default)]
    pub worktree_branch: Option<String>,
    #[serde(default)]
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub parent_repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub create_branch: bool,
    #[serde(default)]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionResult {
    pub session: DeclaredSession,
    pub existing: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MergedSession {
    pub name: String,
    pub workdir: Option<String>,
    pub description: Option<String>,
    pub display_name: Option<String>,
    #[serde(rename = "type")]
    pub session_type: Option<SessionType>,
    pub worktree_parent_repo: Option<String>,
    pub worktree_branch: Option<String>,
    pub last_used_at: Option<String>,
    pub alive: bool,
    pub attached: bool,
    pub windows: u32,
    pub status: Option<String>,
    pub status_updated_at: Option<String>,
    pub idle_state: Option<String>,
    pub idle_state_updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SessionDataDocument {
    #[serde(default)]
    pub todos: Table<serde_json::Value>,
    #[serde(default)]
    pub scratchpad: Table<serde_json::Value>,
    #[serde(default)]
    pub status: Table<StatusRecord>,
    #[serde(default)]
    pub idle_state: Table<IdleStateRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StatusRecord {
    pub status: String,
    pub status_updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct IdleStateRecord {
    pub state: String,
    pub updated_at: String,
}

pub(crate) fn now_iso() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Serializes registry mutations so concurrent `create`/`delete`/`touch`
/// calls against `sessions.json` never interleave.
pub(crate) struct SessionRegistry {
    lock: Mutex<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    fn store() -> Store<Table<DeclaredSession>> {
        Store::new(store::sessions_path())
    }

    async fn load(&self) -> Table<DeclaredSession> {
        Self::store().load().await
    }

    async fn save(&self, table: &Table<DeclaredSession>) -> ApiResult<()> {
        Self::store()
            .save(table)
            .await
            .map_err(|e| AppError::internal(e.to_string()))
    }

    fn validate_name(name: &str) -> ApiResult<()> {
        if !NAME_PATTERN.is_match(name) {
            return Err(AppError::bad_request(format!(
                "invalid session name '{name}': must match [A-Za-z0-9_-]+"
            )));
        }
        Ok(())
    }

    /// The mandatory default startup sequence: activate a discoverable venv,
    /// then launch `claude`. A configurable override is an open question the
    /// spec leaves unresolved; this hardcodes the documented default.
    fn startup_commands(workdir: &str) -> Vec<String> {
        let mut commands = Vec::new();
        for candidate in [".venv/bin/activate", "backend/.venv/bin/activate"] {
            let path = Path::new(workdir).join(candidate);
            if path.exists() {
                commands.push(format!("source {}", path.display()));
                break;
            }
        }
        commands.push("claude".to_string());
        commands
    }

    /// Exposed for the session manager's auto-recreate path (§4.4 step 2),
    /// which needs to re-run the same startup sequence after an external kill.
    pub(crate) async fn create_tmux_session(name: &str, workdir: &str) -> ApiResult<()> {
        let commands = Self::startup_commands(workdir);
        let refs: Vec<&str> = commands.iter().map(|s| s.as_str()).collect();
        pty::ensure_tmux_session(name, workdir, &refs)
            .map_err(|e| AppError::internal(format!("failed to create tmux session: {e}")))?;
        Ok(())
    }

    pub async fn create_session(&self, req: CreateSessionRequest) -> ApiResult<CreateSessionResult> {
        let _guard = self.lock.lock().await;
        Self::validate_name(&req.name)?;

        let mode = req.mode.as_deref().unwrap_or("direct");
        let mut table = self.load().await;

        if pane::session_exists(&req.name).await {
            return Err(AppError::exists(format!(
                "a tmux session named '{}' already exists",
                req.name
            )));
        }

        let (workdir, session_type, worktree_parent_repo, worktree_branch) = match mode {
            "worktree" => {
                let parent_repo = req.parent_repo.clone().ok_or_else(|| {
                    AppError::bad_request("parent_repo is required for worktree sessions")
                })?;
                let branch = req
                    .branch
                    .clone()
                    .ok_or_else(|| AppError::bad_request("branch is required for worktree sessions"))?;
                if !Path::new(&parent_repo).join(".git").exists() {
                    return Err(AppError::bad_request(format!(
                        "{parent_repo} is not a git repository"
                    )));
                }
                let path = git::create_worktree(&parent_repo, &branch, req.create_branch, req.base_branch.as_deref())
                    .await?;
                (
                    path.to_string_lossy().into_owned(),
                    SessionType::Worktree,
                    Some(parent_repo),
                    Some(branch),
                )
            }
            _ => {
                let workdir = req
                    .workdir
                    .clone()
                    .ok_or_else(|| AppError::bad_request("workdir is required for direct sessions"))?;
                let path = Path::new(&workdir);
                if !path.is_dir() {
                    return Err(AppError::bad_request(format!(
                        "{workdir} does not exist or is not a directory"
                    )));
                }

                if let Some(existing) = table.0.values().find(|s| s.workdir.as_deref() == Some(workdir.as_str())) {
                    return Ok(CreateSessionResult {
                        session: existing.clone(),
                        existing: true,
                    });
                }

                (workdir, SessionType::Direct, None, None)
            }
        };

        Self::create_tmux_session(&req.name, &workdir).await?;

        let session = DeclaredSession {
            name: req.name.clone(),
            workdir: Some(workdir),
            description: req.description,
            display_name: req.display_name,
            session_type,
            worktree_parent_repo,
            worktree_branch,
            last_used_at: Some(now_iso()),
        };
        table.0.insert(req.name.clone(), session.clone());
        self.save(&table).await?;

        Ok(CreateSessionResult {
            session,
            existing: false,
        })
    }

    pub async fn reset_session(&self, name: &str) -> ApiResult<()> {
        let _guard = self.lock.lock().await;
        if !pane::session_exists(name).await {
            return Err(AppError::not_found(format!("no live session named '{name}'")));
        }
        let table = self.load().await;
        let workdir = table
            .0
            .get(name)
            .and_then(|s| s.workdir.clone())
            .ok_or_else(|| AppError::not_found(format!("session '{name}' has no recorded workdir")))?;

        let _ = std::process::Command::new("tmux")
            .args(["kill-window", "-a", "-t", &format!("{name}:")])
            .status();
        let _ = std::process::Command::new("tmux")
            .args(["respawn-window", "-k", "-c", &workdir])
            .status();

        let commands = Self::startup_commands(&workdir);
        for command in &commands {
            let _ = std::process::Command::new("tmux")
                .args(["send-keys", "-t", name, command, "Enter"])
                .status();
        }

        Ok(())
    }

    pub async fn delete_session(&self, name: &str, cleanup_worktree: bool) -> ApiResult<()> {
        let _guard = self.lock.lock().await;
        if pane::session_exists(name).await {
            pane::kill_session(name)
                .await
                .map_err(|e| AppError::internal(e.to_string()))?;
        }

        let mut table = self.load().await;
        if let Some(declared) = table.0.get(name)
            && declared.session_type == SessionType::Worktree
            && cleanup_worktree
            && let (Some(parent), Some(workdir)) = (declared.worktree_parent_repo.clone(), declared.workdir.clone())
        {
            let _ = git::remove_worktree(&parent, &workdir, true).await;
        }

        table.0.remove(name);
        self.save(&table).await?;
        Ok(())
    }

    pub async fn update_session(
        &self,
        name: &str,
        description: Option<String>,
        display_name: Option<String>,
    ) -> ApiResult<DeclaredSession> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await;
        let session = table
            .0
            .get_mut(name)
            .ok_or_else(|| AppError::not_found(format!("no declared session named '{name}'")))?;
        if description.is_some() {
            session.description = description;
        }
        if display_name.is_some() {
            session.display_name = display_name;
        }
        let updated = session.clone();
        self.save(&table).await?;
        Ok(updated)
    }

    pub async fn touch_session(&self, name: &str) -> ApiResult<()> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await;
        let now = now_iso();
        table
            .0
            .entry(name.to_string())
            .and_modify(|s| s.last_used_at = Some(now.clone()))
            .or_insert_with(|| DeclaredSession {
                name: name.to_string(),
                workdir: None,
                description: None,
                display_name: None,
                session_type: SessionType::Direct,
                worktree_parent_repo: None,
                worktree_branch: None,
                last_used_at: Some(now),
            });
        self.save(&table).await?;
        Ok(())
    }

    pub async fn get_session_workdir(&self, name: &str) -> ApiResult<String> {
        let table = self.load().await;
        if let Some(workdir) = table.0.get(name).and_then(|s| s.workdir.clone()) {
            return Ok(workdir);
        }

        let output = tokio::process::Command::new("tmux")
            .args(["display-message", "-p", "-t", name, "#{pane_current_path}"])
            .output()
            .await
            .map_err(|e| AppError::internal(e.to_string()))?;
        if !output.status.success() {
            return Err(AppError::not_found(format!("no workdir known for session '{name}'")));
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path.is_empty() || !Path::new(&path).is_dir() {
            return Err(AppError::not_found(format!("no workdir known for session '{name}'")));
        }
        Ok(path)
    }

    pub async fn list_sessions(&self) -> ApiResult<Vec<MergedSession>> {
        let table = self.load().await;

        let live_names = live_tmux_sessions().await;

        let mut names: Vec<String> = table.0.keys().cloned().collect();
        for name in live_names.keys() {
            if !table.0.contains_key(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names.dedup();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let declared = table.0.get(&name);
            let live = live_names.get(&name);
            let data = load_session_data(&name).await;

            out.push(MergedSession {
                name: name.clone(),
                workdir: declared.and_then(|s| s.workdir.clone()),
                description: declared.and_then(|s| s.description.clone()),
                display_name: declared.and_then(|s| s.display_name.clone()),
                session_type: declared.map(|s| s.session_type),
                worktree_parent_repo: declared.and_then(|s| s.worktree_parent_repo.clone()),
                worktree_branch: declared.and_then(|s| s.worktree_branch.clone()),
                last_used_at: declared.and_then(|s| s.last_used_at.clone()),
                alive: live.is_some(),
                attached: live.map(|l| l.attached).unwrap_or(false),
                windows: live.map(|l| l.windows).unwrap_or(0),
                status: data.status.0.get(&name).map(|s| s.status.clone()),
                status_updated_at: data.status.0.get(&name).map(|s| s.status_updated_at.clone()),
                idle_state: data.idle_state.0.get(&name).map(|s| s.state.clone()),
                idle_state_updated_at: data.idle_state.0.get(&name).map(|s| s.updated_at.clone()),
            });
        }

        Ok(out)
    }
}

struct LiveSession {
    windows: u32,
    attached: bool,
}

async fn live_tmux_sessions() -> std::collections::HashMap<String, LiveSession> {
    let output = tokio::process::Command::new("tmux")
        .args([
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_windows}\t#{session_attached}",
        ])
        .output()
        .await;

    let mut map = std::collections::HashMap::new();
    let Ok(output) = output else {
        return map;
    };
    if !output.status.success() {
        return map;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        let mut parts = line.splitn(3, '\t');
        let Some(name) = parts.next() else { continue };
        let windows = parts.next().and_then(|w| w.parse().ok()).unwrap_or(0);
        let attached = parts.next().map(|a| a.trim() != "0").unwrap_or(false);
        map.insert(name.to_string(), LiveSession { windows, attached });
    }
    map
}

pub(crate) async fn load_session_data(name: &str) -> SessionDataDocument {
    Store::<SessionDataDocument>::new(store::session_data_path(name)).load().await
}

pub(crate) async fn save_session_data(name: &str, data: &SessionDataDocument) -> std::io::Result<()> {
    Store::<SessionDataDocument>::new(store::session_data_path(name))
        .save(data)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_session_names() {
        assert!(SessionRegistry::validate_name("demo-session_1").is_ok());
        assert!(SessionRegistry::validate_name("has space").is_err());
        assert!(SessionRegistry::validate_name("slash/here").is_err());
    }

    #[test]
    fn startup_commands_always_end_with_claude() {
        let commands = SessionRegistry::startup_commands("/tmp/definitely-missing-dir-xyz");
        assert_eq!(commands, vec!["claude".to_string()]);
    }
}
