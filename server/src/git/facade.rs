//! Git read/write facade (§4.8). Every operation takes an absolute working
//! directory and never leaks a raw git invocation shape past this module —
//! callers (the session registry, the diff cache, the HTTP routes) only see
//! the shapes named in the design.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{ApiResult, AppError};

use super::exec::{lock_repo, run_git};
use super::utils::{abs_path, classify_git_failure, is_safe_repo_rel_path};

fn dir(directory: &str) -> PathBuf {
    abs_path(directory)
}

fn git_err(context: &str, code: i32, stdout: &str, stderr: &str) -> AppError {
    let telemetry = classify_git_failure(code, stdout, stderr);
    let detail = if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else if !stdout.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        format!("{context} failed")
    };
    match telemetry.map(|t| t.code) {
        Some("git_auth_required") | Some("git_ssh_auth_failed") => AppError::PushAuth {
            message: detail,
        },
        Some("git_network_error") | Some("git_tls_error") => AppError::PushConnection {
            message: detail,
        },
        Some("git_push_rejected") => AppError::PushRejected { message: detail },
        _ => AppError::internal(format!("{context}: {detail}")),
    }
}

// ---------------------------------------------------------------------
// status()
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFile {
    pub path: String,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
    pub branch: String,
    pub files: Vec<StatusFile>,
    pub clean: bool,
}

fn classify_porcelain_code(x: char, y: char) -> &'static str {
    if x == 'U' || y == 'U' || (x == 'A' && y == 'A') || (x == 'D' && y == 'D') {
        return "unmerged";
    }
    if x == '?' && y == '?' {
        return "untracked";
    }
    if x == 'R' || y == 'R' {
        return "renamed";
    }
    if x == 'C' || y == 'C' {
        return "copied";
    }
    if x == 'A' || y == 'A' {
        return "added";
    }
    if x == 'D' || y == 'D' {
        return "deleted";
    }
    "modified"
}

async fn current_branch_label(repo: &Path) -> String {
    let (code, out, _) = run_git(repo, &["symbolic-ref", "--short", "-q", "HEAD"])
        .await
        .unwrap_or((1, String::new(), String::new()));
    if code == 0 {
        let name = out.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    let (_, out, _) = run_git(repo, &["rev-parse", "--short", "HEAD"])
        .await
        .unwrap_or((1, String::new(), String::new()));
    let sha = out.trim();
    if sha.is_empty() {
        "HEAD".to_string()
    } else {
        format!("HEAD detached at {sha}")
    }
}

pub async fn status(directory: &str) -> ApiResult<GitStatus> {
    let repo = dir(directory);
    let branch = current_branch_label(&repo).await;

    let (code, out, stderr) = run_git(&repo, &["status", "--porcelain=v1", "-uall"])
        .await
        .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("status", code, &out, &stderr));
    }

    let mut files = Vec::new();
    for line in out.lines().filter(|l| !l.is_empty()) {
        if line.len() < 4 {
            continue;
        }
        let mut chars = line.chars();
        let x = chars.next().unwrap_or(' ');
        let y = chars.next().unwrap_or(' ');
        let path = line[3..].to_string();
        let path = path.split(" -> ").next_back().unwrap_or(&path).to_string();
        files.push(StatusFile {
            path,
            status: classify_porcelain_code(x, y),
        });
    }

    Ok(GitStatus {
        branch,
        clean: files.is_empty(),
        files,
    })
}

// ---------------------------------------------------------------------
// diffWithUntracked()
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub path: String,
    pub diff: String,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSnapshot {
    pub files: Vec<DiffEntry>,
    pub additions: u32,
    pub deletions: u32,
}

fn count_diff_lines(diff: &str) -> (u32, u32) {
    let mut additions = 0u32;
    let mut deletions = 0u32;
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if let Some(stripped) = line.strip_prefix('+') {
            let _ = stripped;
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    (additions, deletions)
}

fn synthesize_untracked_diff(path: &str, content: &str) -> String {
    let mut out = format!("diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n");
    let lines: Vec<&str> = content.split('\n').collect();
    // `split('\n')` on "a\nb\n" yields ["a", "b", ""]; the trailing empty
    // entry represents the final newline and is counted as its own `+`
    // line by every implementation this spec was distilled from.
    out.push_str(&format!("@@ -0,0 +1,{} @@\n", lines.len()));
    for line in &lines {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out
}

async fn blob_at_head(repo: &Path, path: &str) -> Option<String> {
    let (code, out, _) = run_git(repo, &["show", &format!("HEAD:{path}")])
        .await
        .ok()?;
    if code != 0 {
        return None;
    }
    Some(out)
}

async fn untracked_files(repo: &Path) -> ApiResult<Vec<String>> {
    let (code, out, stderr) = run_git(repo, &["ls-files", "--others", "--exclude-standard"])
        .await
        .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("list untracked files", code, &out, &stderr));
    }
    Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
}

async fn tracked_diff_paths(repo: &Path) -> ApiResult<Vec<String>> {
    let (code, out, stderr) = run_git(repo, &["diff", "HEAD", "--name-only"])
        .await
        .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("diff HEAD", code, &out, &stderr));
    }
    Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
}

/// The working-tree diff against `HEAD`, plus a synthesized all-additions
/// diff for every untracked file (§4.8, §8 S5).
pub async fn diff_with_untracked(directory: &str) -> ApiResult<DiffSnapshot> {
    let repo = dir(directory);
    let mut snapshot = DiffSnapshot::default();

    for path in tracked_diff_paths(&repo).await? {
        let (code, diff_text, stderr) = run_git(&repo, &["diff", "HEAD", "--", &path])
            .await
            .map_err(AppError::internal)?;
        if code != 0 {
            return Err(git_err("diff", code, &diff_text, &stderr));
        }
        let (add, del) = count_diff_lines(&diff_text);
        snapshot.additions += add;
        snapshot.deletions += del;
        let old_content = blob_at_head(&repo, &path).await;
        let new_content = tokio::fs::read_to_string(repo.join(&path)).await.ok();
        snapshot.files.push(DiffEntry {
            path,
            diff: diff_text,
            old_content,
            new_content,
        });
    }

    for path in untracked_files(&repo).await? {
        let Ok(content) = tokio::fs::read_to_string(repo.join(&path)).await else {
            continue;
        };
        let diff_text = synthesize_untracked_diff(&path, &content);
        let (add, del) = count_diff_lines(&diff_text);
        snapshot.additions += add;
        snapshot.deletions += del;
        snapshot.files.push(DiffEntry {
            path,
            diff: diff_text,
            old_content: None,
            new_content: Some(content),
        });
    }

    Ok(snapshot)
}

// ---------------------------------------------------------------------
// commitLog() / commitDiff()
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitLogEntry {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub author: String,
    pub relative_date: String,
}

const LOG_FIELD_SEP: &str = "\x1f";
const LOG_RECORD_SEP: &str = "\x1e";

fn parse_log_output(raw: &str) -> Vec<CommitLogEntry> {
    raw.split(LOG_RECORD_SEP)
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .filter_map(|record| {
            let parts: Vec<&str> = record.split(LOG_FIELD_SEP).collect();
            if parts.len() < 4 {
                return None;
            }
            let hash = parts[0].trim().to_string();
            Some(CommitLogEntry {
                short_hash: hash.chars().take(7).collect(),
                hash,
                author: parts[1].trim().to_string(),
                relative_date: parts[2].trim().to_string(),
                message: parts[3].trim().to_string(),
            })
        })
        .collect()
}

pub async fn commit_log(directory: &str, limit: usize) -> ApiResult<Vec<CommitLogEntry>> {
    let repo = dir(directory);
    let fmt = format!("%H{LOG_FIELD_SEP}%an{LOG_FIELD_SEP}%ad{LOG_FIELD_SEP}%s{LOG_RECORD_SEP}");
    let limit_arg = format!("-{}", limit.max(1));
    let (code, out, stderr) = run_git(
        &repo,
        &[
            "log",
            &limit_arg,
            &format!("--pretty=format:{fmt}"),
            "--date=format:%Y-%m-%d %H:%M",
        ],
    )
    .await
    .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("log", code, &out, &stderr));
    }
    Ok(parse_log_output(&out))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitDiffResult {
    pub commit: CommitLogEntry,
    pub diff: DiffSnapshot,
}

async fn has_parent(repo: &Path, hash: &str) -> bool {
    let (code, _, _) = run_git(repo, &["rev-parse", "--verify", "-q", &format!("{hash}^")])
        .await
        .unwrap_or((1, String::new(), String::new()));
    code == 0
}

async fn changed_paths(repo: &Path, hash: &str) -> ApiResult<Vec<String>> {
    let (code, out, stderr) = run_git(
        repo,
        &["diff-tree", "--no-commit-id", "--name-only", "-r", hash],
    )
    .await
    .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("diff-tree", code, &out, &stderr));
    }
    Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
}

async fn blob_at_rev(repo: &Path, rev: &str, path: &str) -> Option<String> {
    let (code, out, _) = run_git(repo, &["show", &format!("{rev}:{path}")]).await.ok()?;
    if code != 0 {
        return None;
    }
    Some(out)
}

/// The commit's metadata plus a per-file diff against its (sole) parent.
/// For a root commit every file's content lands only in `newContent`.
pub async fn commit_diff(directory: &str, hash: &str) -> ApiResult<CommitDiffResult> {
    let repo = dir(directory);
    let fmt = format!("%H{LOG_FIELD_SEP}%an{LOG_FIELD_SEP}%ad{LOG_FIELD_SEP}%s");
    let (code, out, stderr) = run_git(
        &repo,
        &[
            "show",
            "-s",
            &format!("--pretty=format:{fmt}"),
            "--date=format:%Y-%m-%d %H:%M",
            hash,
        ],
    )
    .await
    .map_err(AppError::internal)?;
    if code != 0 {
        return Err(AppError::not_found(format!("commit {hash} not found")));
    }
    let parts: Vec<&str> = out.trim().split(LOG_FIELD_SEP).collect();
    if parts.len() < 4 {
        return Err(AppError::internal("unexpected git show output"));
    }
    let full_hash = parts[0].to_string();
    let commit = CommitLogEntry {
        short_hash: full_hash.chars().take(7).collect(),
        hash: full_hash.clone(),
        author: parts[1].to_string(),
        relative_date: parts[2].to_string(),
        message: parts[3].to_string(),
    };

    let is_root = !has_parent(&repo, &full_hash).await;
    let mut snapshot = DiffSnapshot::default();
    for path in changed_paths(&repo, &full_hash).await? {
        let new_content = blob_at_rev(&repo, &full_hash, &path).await;
        let old_content = if is_root {
            None
        } else {
            blob_at_rev(&repo, &format!("{full_hash}^"), &path).await
        };

        let diff_range = if is_root {
            format!("{full_hash}")
        } else {
            format!("{full_hash}^..{full_hash}")
        };
        let (_, diff_text, _) = run_git(&repo, &["diff", &diff_range, "--", &path])
            .await
            .unwrap_or((1, String::new(), String::new()));
        let (add, del) = count_diff_lines(&diff_text);
        snapshot.additions += add;
        snapshot.deletions += del;
        snapshot.files.push(DiffEntry {
            path,
            diff: diff_text,
            old_content,
            new_content,
        });
    }

    Ok(CommitDiffResult {
        commit,
        diff: snapshot,
    })
}

// ---------------------------------------------------------------------
// branches() / checkoutBranch()
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalBranch {
    pub name: String,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBranch {
    pub name: String,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitBranches {
    pub current: String,
    pub local: Vec<LocalBranch>,
    pub remote: Vec<RemoteBranch>,
    pub clean: bool,
}

pub async fn branches(directory: &str) -> ApiResult<GitBranches> {
    let repo = dir(directory);
    let current = current_branch_label(&repo).await;

    let (code, out, stderr) = run_git(
        &repo,
        &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
    )
    .await
    .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("list local branches", code, &out, &stderr));
    }
    let local: Vec<LocalBranch> = out
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|name| LocalBranch {
            current: name == current,
            name: name.to_string(),
        })
        .collect();

    let (code, out, stderr) = run_git(
        &repo,
        &["for-each-ref", "--format=%(refname:short)", "refs/remotes"],
    )
    .await
    .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("list remote branches", code, &out, &stderr));
    }
    let remote: Vec<RemoteBranch> = out
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.ends_with("/HEAD"))
        .filter_map(|full| {
            let (remote_name, branch) = full.split_once('/')?;
            Some(RemoteBranch {
                name: branch.to_string(),
                remote: remote_name.to_string(),
            })
        })
        .collect();

    let is_clean = is_tree_clean(&repo).await?;

    Ok(GitBranches {
        current,
        local,
        remote,
        clean: is_clean,
    })
}

async fn is_tree_clean(repo: &Path) -> ApiResult<bool> {
    let (code, out, stderr) = run_git(repo, &["status", "--porcelain=v1"])
        .await
        .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("status", code, &out, &stderr));
    }
    Ok(out.trim().is_empty())
}

/// Only *tracked*-file dirtiness blocks a checkout; untracked files do not.
async fn has_pending_tracked_changes(repo: &Path) -> ApiResult<bool> {
    let (code, out, stderr) = run_git(repo, &["diff", "--name-only", "HEAD"])
        .await
        .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("status", code, &out, &stderr));
    }
    Ok(!out.trim().is_empty())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResult {
    pub status: &'static str,
    pub branch: String,
}

pub async fn checkout_branch(directory: &str, branch: &str) -> ApiResult<CheckoutResult> {
    let repo = dir(directory);
    let _guard = lock_repo(&repo)
        .await
        .map_err(|_| AppError::internal("failed to lock repository"))?;

    let branch = branch.trim();
    if branch.is_empty() {
        return Err(AppError::bad_request("branch is required"));
    }

    if has_pending_tracked_changes(&repo).await? {
        return Err(AppError::PendingChanges {
            message: "checkout blocked: tracked working tree has pending changes".to_string(),
        });
    }

    let (code, out, stderr) = run_git(&repo, &["checkout", branch]).await.map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("checkout", code, &out, &stderr));
    }

    Ok(CheckoutResult {
        status: "ok",
        branch: branch.to_string(),
    })
}

// ---------------------------------------------------------------------
// stageAllAndCommit() / resetToHead()
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn stage_all_and_commit(directory: &str, message: &str) -> ApiResult<CommitResult> {
    let repo = dir(directory);
    let _guard = lock_repo(&repo)
        .await
        .map_err(|_| AppError::internal("failed to lock repository"))?;

    let message = message.trim();
    if message.is_empty() {
        return Err(AppError::bad_request("commit message is required"));
    }

    if is_tree_clean(&repo).await? && untracked_files(&repo).await?.is_empty() {
        return Ok(CommitResult {
            status: "nothing_to_commit",
            hash: None,
            message: None,
        });
    }

    let (code, out, stderr) = run_git(&repo, &["add", "-A"]).await.map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("stage", code, &out, &stderr));
    }

    let (code, out, stderr) = run_git(&repo, &["commit", "-m", message]).await.map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("commit", code, &out, &stderr));
    }

    let (_, hash_out, _) = run_git(&repo, &["rev-parse", "HEAD"]).await.unwrap_or((1, String::new(), String::new()));

    Ok(CommitResult {
        status: "ok",
        hash: Some(hash_out.trim().to_string()),
        message: Some(message.to_string()),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResult {
    pub status: &'static str,
}

/// Hard reset plus `clean -fd`, discarding tracked and untracked changes alike.
pub async fn reset_to_head(directory: &str) -> ApiResult<ResetResult> {
    let repo = dir(directory);
    let _guard = lock_repo(&repo)
        .await
        .map_err(|_| AppError::internal("failed to lock repository"))?;

    if is_tree_clean(&repo).await? && untracked_files(&repo).await?.is_empty() {
        return Ok(ResetResult {
            status: "nothing_to_reset",
        });
    }

    let (code, out, stderr) = run_git(&repo, &["reset", "--hard", "HEAD"]).await.map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("reset", code, &out, &stderr));
    }
    let (code, out, stderr) = run_git(&repo, &["clean", "-fd"]).await.map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("clean", code, &out, &stderr));
    }

    Ok(ResetResult { status: "ok" })
}

// ---------------------------------------------------------------------
// push() / pullRebase()
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub status: &'static str,
    pub remote: String,
    pub branch: Option<String>,
}

async fn tracking_remote(repo: &Path) -> Option<String> {
    let (code, out, _) = run_git(repo, &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])
        .await
        .unwrap_or((1, String::new(), String::new()));
    if code != 0 {
        return None;
    }
    out.trim().split('/').next().map(|s| s.to_string())
}

/// Push the current branch, defaulting to `origin` when no upstream is set,
/// publishing with `--set-upstream` on first push.
pub async fn push(directory: &str) -> ApiResult<PushResult> {
    let repo = dir(directory);
    let _guard = lock_repo(&repo)
        .await
        .map_err(|_| AppError::internal("failed to lock repository"))?;

    let remote_exists = {
        let (code, out, _) = run_git(&repo, &["remote"]).await.unwrap_or((1, String::new(), String::new()));
        code == 0 && !out.trim().is_empty()
    };
    if !remote_exists {
        return Err(AppError::RemoteNotConfigured {
            message: "no remote configured".to_string(),
        });
    }

    let remote = tracking_remote(&repo).await.unwrap_or_else(|| "origin".to_string());

    let (code, out, stderr) = run_git(&repo, &["push", &remote]).await.map_err(AppError::internal)?;
    if code == 0 {
        return Ok(PushResult {
            status: "ok",
            remote,
            branch: None,
        });
    }

    let combined = format!("{out}\n{stderr}").to_ascii_lowercase();
    if combined.contains("has no upstream branch") || combined.contains("set the remote as upstream") {
        let (bcode, bout, _) = run_git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap_or((1, String::new(), String::new()));
        if bcode != 0 {
            return Err(AppError::conflict("cannot push from a detached HEAD"));
        }
        let branch = bout.trim().to_string();
        let (code, out2, stderr2) = run_git(&repo, &["push", "--set-upstream", &remote, &branch])
            .await
            .map_err(AppError::internal)?;
        if code != 0 {
            return Err(git_err("push", code, &out2, &stderr2));
        }
        return Ok(PushResult {
            status: "ok",
            remote,
            branch: Some(branch),
        });
    }

    Err(git_err("push", code, &out, &stderr))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub status: &'static str,
    pub files_changed: u32,
}

pub async fn pull_rebase(directory: &str) -> ApiResult<PullResult> {
    let repo = dir(directory);
    let _guard = lock_repo(&repo)
        .await
        .map_err(|_| AppError::internal("failed to lock repository"))?;

    let remote_exists = {
        let (code, out, _) = run_git(&repo, &["remote"]).await.unwrap_or((1, String::new(), String::new()));
        code == 0 && !out.trim().is_empty()
    };
    if !remote_exists {
        return Err(AppError::RemoteNotConfigured {
            message: "no remote configured".to_string(),
        });
    }

    let (code, out, stderr) = run_git(&repo, &["pull", "--rebase", "--stat"])
        .await
        .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("pull", code, &out, &stderr));
    }

    let files_changed = out
        .lines()
        .filter(|l| l.contains('|'))
        .count() as u32;

    Ok(PullResult {
        status: "ok",
        files_changed,
    })
}

// ---------------------------------------------------------------------
// remoteStatus()
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub branch: String,
    pub remote: Option<String>,
    pub tracking: Option<String>,
    pub ahead: i32,
    pub behind: i32,
}

/// Best-effort fetch then ahead/behind against the tracking ref. Fetch
/// failures are swallowed — the counts just reflect the last known ref.
pub async fn remote_status(directory: &str, fetch: bool) -> ApiResult<RemoteStatus> {
    let repo = dir(directory);
    let (code, out, _) = run_git(&repo, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .unwrap_or((1, String::new(), String::new()));
    if code != 0 {
        return Err(AppError::internal("not a git repository"));
    }
    let branch = out.trim().to_string();

    if fetch {
        let _ = run_git(&repo, &["fetch", "--quiet"]).await;
    }

    let tracking = tracking_full_ref(&repo).await;
    let Some(tracking_ref) = tracking.clone() else {
        return Ok(RemoteStatus {
            branch,
            remote: None,
            tracking: None,
            ahead: 0,
            behind: 0,
        });
    };

    let remote = tracking_ref.split('/').next().map(|s| s.to_string());
    let (ahead, behind) = ahead_behind(&repo, &tracking_ref).await.unwrap_or((0, 0));

    Ok(RemoteStatus {
        branch,
        remote,
        tracking: Some(tracking_ref),
        ahead,
        behind,
    })
}

async fn tracking_full_ref(repo: &Path) -> Option<String> {
    let (code, out, _) = run_git(repo, &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"])
        .await
        .ok()?;
    if code != 0 {
        return None;
    }
    let s = out.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

async fn ahead_behind(repo: &Path, upstream: &str) -> Option<(i32, i32)> {
    let (code, out, _) = run_git(
        repo,
        &["rev-list", "--left-right", "--count", &format!("HEAD...{upstream}")],
    )
    .await
    .ok()?;
    if code != 0 {
        return None;
    }
    let mut parts = out.split_whitespace();
    let ahead = parts.next()?.parse::<i32>().ok()?;
    let behind = parts.next()?.parse::<i32>().ok()?;
    Some((ahead, behind))
}

// ---------------------------------------------------------------------
// Worktrees
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub head: Option<String>,
}

pub async fn list_worktrees(directory: &str) -> ApiResult<Vec<WorktreeInfo>> {
    let repo = dir(directory);
    let (code, out, stderr) = run_git(&repo, &["worktree", "list", "--porcelain"])
        .await
        .map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("worktree list", code, &out, &stderr));
    }

    let mut result = Vec::new();
    let mut path: Option<String> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;
    for line in out.lines() {
        if let Some(rest) = line.strip_prefix("worktree ") {
            if let Some(p) = path.take() {
                result.push(WorktreeInfo {
                    path: p,
                    branch: branch.take(),
                    head: head.take(),
                });
            }
            path = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            head = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(rest.trim().trim_start_matches("refs/heads/").to_string());
        }
    }
    if let Some(p) = path.take() {
        result.push(WorktreeInfo {
            path: p,
            branch,
            head,
        });
    }
    Ok(result)
}

/// `feat/login` -> `feat-login`, `fix/bug#123` -> `fix-bug-123`,
/// `///foo///` -> `foo`.
pub fn sanitize_branch_for_path(branch: &str) -> String {
    let replaced: String = branch
        .chars()
        .map(|c| if "/\\#@:~^".contains(c) { '-' } else if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();

    let mut out = String::with_capacity(replaced.len());
    let mut last_dash = false;
    for c in replaced.chars() {
        if c == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}

pub async fn validate_branch_for_worktree(directory: &str, branch: &str) -> ApiResult<()> {
    let worktrees = list_worktrees(directory).await?;
    if worktrees.iter().any(|w| w.branch.as_deref() == Some(branch)) {
        return Err(AppError::conflict(format!(
            "branch {branch} is already checked out in another worktree"
        )));
    }
    Ok(())
}

/// Branches offered for a new worktree: every local branch not already
/// checked out somewhere else.
pub async fn branches_for_worktree(directory: &str) -> ApiResult<Vec<String>> {
    let all = branches(directory).await?;
    let worktrees = list_worktrees(directory).await?;
    let taken: HashSet<String> = worktrees.into_iter().filter_map(|w| w.branch).collect();
    Ok(all
        .local
        .into_iter()
        .map(|b| b.name)
        .filter(|n| !taken.contains(n))
        .collect())
}

/// New worktrees for repo `/…/name` land under `/…/name-worktrees/<sanitized-branch>`.
pub fn worktree_path_for_branch(repo: &Path, branch: &str) -> PathBuf {
    let sanitized = sanitize_branch_for_path(branch);
    let repo_name = repo.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let parent = repo.parent().unwrap_or(repo);
    parent
        .join(format!("{repo_name}-worktrees"))
        .join(sanitized)
}

pub async fn create_worktree(
    directory: &str,
    branch: &str,
    create_branch: bool,
    base_branch: Option<&str>,
) -> ApiResult<PathBuf> {
    let repo = dir(directory);
    let _guard = lock_repo(&repo)
        .await
        .map_err(|_| AppError::internal("failed to lock repository"))?;

    validate_branch_for_worktree(directory, branch).await?;

    let target = worktree_path_for_branch(&repo, branch);
    let target_str = target.to_string_lossy().into_owned();

    let mut args: Vec<&str> = vec!["worktree", "add"];
    if create_branch {
        args.push("-b");
        args.push(branch);
        args.push(&target_str);
        if let Some(base) = base_branch {
            args.push(base);
        }
    } else {
        args.push(&target_str);
        args.push(branch);
    }

    let (code, out, stderr) = run_git(&repo, &args).await.map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("worktree add", code, &out, &stderr));
    }
    Ok(target)
}

pub async fn remove_worktree(directory: &str, path: &str, force: bool) -> ApiResult<()> {
    if !is_safe_repo_rel_path(path) && !Path::new(path).is_absolute() {
        return Err(AppError::bad_request("invalid worktree path"));
    }
    let repo = dir(directory);
    let _guard = lock_repo(&repo)
        .await
        .map_err(|_| AppError::internal("failed to lock repository"))?;

    let mut args = vec!["worktree", "remove"];
    if force {
        args.push("--force");
    }
    args.push(path);
    let (code, out, stderr) = run_git(&repo, &args).await.map_err(AppError::internal)?;
    if code != 0 {
        return Err(git_err("worktree remove", code, &out, &stderr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_slashes_and_hashes() {
        assert_eq!(sanitize_branch_for_path("feat/login"), "feat-login");
        assert_eq!(sanitize_branch_for_path("fix/bug#123"), "fix-bug-123");
        assert_eq!(sanitize_branch_for_path("///foo///"), "foo");
    }

    #[test]
    fn counts_untracked_pseudo_diff_as_all_additions() {
        let diff = synthesize_untracked_diff("new.txt", "a\nb\n");
        let (add, del) = count_diff_lines(&diff);
        assert_eq!((add, del), (3, 0));
        assert!(diff.contains("new file mode 100644"));
        assert!(diff.contains("--- /dev/null"));
    }

    #[test]
    fn classifies_porcelain_status_codes() {
        assert_eq!(classify_porcelain_code('?', '?'), "untracked");
        assert_eq!(classify_porcelain_code('A', ' '), "added");
        assert_eq!(classify_porcelain_code('U', 'U'), "unmerged");
        assert_eq!(classify_porcelain_code(' ', 'M'), "modified");
    }

    #[test]
    fn worktree_path_lives_alongside_repo() {
        let repo = Path::new("/home/alice/projects/myrepo");
        let path = worktree_path_for_branch(repo, "feat/thing");
        assert_eq!(
            path,
            PathBuf::from("/home/alice/projects/myrepo-worktrees/feat-thing")
        );
    }
}
