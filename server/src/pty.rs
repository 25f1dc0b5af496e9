//! PTY adapter: attaches a pseudo-terminal to an existing (or freshly
//! created) tmux session and exposes spawn/resize/write/read/close.
//!
//! Every client of a session gets its own PTY attached via
//! `tmux attach-session`, matching how the original tmux-session manager
//! this is modeled on keeps one pane attachment per client and lets tmux
//! itself arbitrate terminal size via `window-size largest`.

use std::io::{Read, Write};

use bytes::Bytes;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

pub(crate) struct PtyHandle {
    master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    writer: std::sync::Mutex<Box<dyn Write + Send>>,
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

pub(crate) struct PtySpawnOutcome {
    pub handle: PtyHandle,
    /// Receives raw output chunks read from the PTY until it closes.
    pub output_rx: mpsc::UnboundedReceiver<Bytes>,
    /// Resolves once the attached process exits.
    pub exited_rx: tokio::sync::oneshot::Receiver<()>,
}

/// Create the tmux session rooted at `cwd` and run `startup_commands` if it
/// doesn't already exist. Returns whether it was freshly created. Used both
/// by `spawn_attached` (which then opens a PTY onto it) and directly by the
/// session registry's `createTmuxSession`/`resetSession`, which only need
/// the tmux session itself.
pub(crate) fn ensure_tmux_session(name: &str, cwd: &str, startup_commands: &[&str]) -> std::io::Result<bool> {
    let has = std::process::Command::new("tmux")
        .args(["has-session", "-t", name])
        .output()?;
    if has.status.success() {
        return Ok(false);
    }

    let mut cmd = std::process::Command::new("tmux");
    cmd.args(["new-session", "-d", "-s", name, "-c", cwd]);
    cmd.status()?;

    for command in startup_commands {
        let _ = std::process::Command::new("tmux")
            .args(["send-keys", "-t", name, command, "Enter"])
            .status();
    }

    Ok(true)
}

/// Spawn a PTY and attach it to `session_name`, creating the tmux session
/// (and running the mandatory startup sequence) if it doesn't already exist.
pub(crate) fn spawn_attached(
    session_name: &str,
    cwd: &str,
    cols: u16,
    rows: u16,
    startup_commands: &[&str],
) -> anyhow::Result<PtySpawnOutcome> {
    ensure_tmux_session(session_name, cwd, startup_commands)?;

    // tmux grows the window to fit the widest attached client; without this
    // a second, smaller client can shrink the shared pane for everyone.
    let _ = std::process::Command::new("tmux")
        .args(["set-option", "-t", session_name, "window-size", "largest"])
        .status();

    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let mut cmd = CommandBuilder::new("tmux");
    cmd.arg("attach-session");
    cmd.arg("-t");
    cmd.arg(session_name);
    cmd.cwd(cwd);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");

    let child = pair.slave.spawn_command(cmd)?;
    let killer = child.clone_killer();
    drop(pair.slave);

    let reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;
    let master = pair.master;

    let (output_tx, output_rx) = mpsc::unbounded_channel::<Bytes>();
    let (exited_tx, exited_rx) = tokio::sync::oneshot::channel();

    spawn_reader_task(reader, output_tx);
    spawn_wait_task(child, exited_tx);

    Ok(PtySpawnOutcome {
        handle: PtyHandle {
            master: std::sync::Mutex::new(master),
            writer: std::sync::Mutex::new(writer),
            killer: std::sync::Mutex::new(killer),
        },
        output_rx,
        exited_rx,
    })
}

fn spawn_reader_task(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

fn spawn_wait_task(
    mut child: Box<dyn Child + Send + Sync>,
    tx: tokio::sync::oneshot::Sender<()>,
) {
    tokio::task::spawn_blocking(move || {
        let _ = child.wait();
        let _ = tx.send(());
    });
}

impl PtyHandle {
    pub fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.master.lock().unwrap().resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;
        Ok(())
    }

    pub fn close(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }
}
