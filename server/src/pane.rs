//! One-shot pane snapshots, independent of any attached PTY.
//!
//! Used for the initial state classification on session creation/resume
//! and by the background idle monitor, neither of which holds an open PTY
//! attachment to the session.

use tokio::process::Command;

/// Capture the full scrollback-to-cursor content of a tmux session's active
/// pane, ANSI escapes included, exactly as a client would see it on attach.
/// Lines come back from `tmux` LF-joined; re-joined as CRLF to match what a
/// real terminal attach would have produced (§4.2).
pub(crate) async fn capture_pane_content(session_name: &str) -> std::io::Result<String> {
    let output = Command::new("tmux")
        .args([
            "capture-pane",
            "-e",
            "-p",
            "-t",
            session_name,
            "-S",
            "-",
            "-E",
            "-",
        ])
        .output()
        .await?;

    if !output.status.success() {
        return Ok(String::new());
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = raw.lines().collect();
    if lines.is_empty() {
        return Ok(String::new());
    }
    Ok(format!("{}\r\n", lines.join("\r\n")))
}

pub(crate) async fn session_exists(session_name: &str) -> bool {
    Command::new("tmux")
        .args(["has-session", "-t", session_name])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

pub(crate) async fn kill_session(session_name: &str) -> std::io::Result<()> {
    let _ = Command::new("tmux")
        .args(["kill-session", "-t", session_name])
        .status()
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonexistent_session_reports_not_alive() {
        assert!(!session_exists("tmux-studio-test-definitely-missing-xyz").await);
    }

    #[tokio::test]
    async fn capturing_a_missing_session_returns_empty_string() {
        let content = capture_pane_content("tmux-studio-test-definitely-missing-xyz")
            .await
            .unwrap();
        assert!(content.is_empty());
    }
}
