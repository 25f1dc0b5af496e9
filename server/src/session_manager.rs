//! Session manager / PTY pool (§4.4): fans tmux output out to clients,
//! aggregates keystrokes, and owns the single streaming `IdleDetector` per
//! session. Sizing policy: **per-client PTY** (policy a) — every client gets
//! its own `tmux attach-session`, and `window-size=largest` (set in
//! `pty::spawn_attached`) lets tmux itself arbitrate the shared pane size.
//! A single map lock serializes register/unregister; read loops and client
//! writes never hold it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};

use crate::error::{ApiResult, AppError};
use crate::pane;
use crate::pty::{self, PtyHandle};
use crate::registry::{self, SessionRegistry};
use crate::state::{IdleDetector, SessionState};
use crate::ws::ServerFrame;

/// Idle-state persistence is rate-limited to at most once per second per
/// session (§4.4, invariant 6 in §8).
const PERSIST_RATE_LIMIT: Duration = Duration::from_millis(1000);

struct ClientHandle {
    pty: Arc<PtyHandle>,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

struct ManagedSession {
    clients: HashMap<u64, ClientHandle>,
    detector: IdleDetector,
    current_state: SessionState,
    last_persist: Option<Instant>,
}

impl ManagedSession {
    fn new() -> Self {
        Self {
            clients: HashMap::new(),
            detector: IdleDetector::new(),
            current_state: SessionState::Unknown,
            last_persist: None,
        }
    }

    fn broadcast(&mut self, frame: ServerFrame) {
        self.clients.retain(|_, client| client.tx.send(frame.clone()).is_ok());
    }
}

pub(crate) struct ClientSession {
    pub client_id: u64,
    pub pty: Arc<PtyHandle>,
    pub frames: mpsc::UnboundedReceiver<ServerFrame>,
}

pub(crate) struct SessionManager {
    sessions: Mutex<HashMap<String, ManagedSession>>,
    next_client_id: AtomicU64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    async fn ensure_attached(
        registry: &SessionRegistry,
        name: &str,
        cols: u16,
        rows: u16,
    ) -> ApiResult<(pty::PtySpawnOutcome, String)> {
        let mut workdir = registry.get_session_workdir(name).await.ok();

        if !pane::session_exists(name).await {
            let wd = workdir
                .clone()
                .ok_or_else(|| AppError::not_found(format!("session '{name}' not found and has no recorded workdir")))?;
            if !Path::new(&wd).is_dir() {
                return Err(AppError::not_found(format!(
                    "recorded workdir for '{name}' no longer exists on disk"
                )));
            }
            SessionRegistry::create_tmux_session(name, &wd).await?;
            workdir = Some(wd);
        }

        let workdir = workdir.ok_or_else(|| AppError::not_found(format!("session '{name}' has no known workdir")))?;
        let outcome = pty::spawn_attached(name, &workdir, cols, rows, &[])
            .map_err(|e| AppError::internal(format!("failed to attach to session '{name}': {e}")))?;
        Ok((outcome, workdir))
    }

    /// §4.4 `registerClient`. Attaches a fresh PTY (auto-recreating the tmux
    /// session once if it was killed externally), registers the client, and
    /// primes it with the current pane snapshot before starting its read loop.
    pub async fn register_client(
        self: &Arc<Self>,
        registry: &Arc<SessionRegistry>,
        name: &str,
        cols: u16,
        rows: u16,
    ) -> ApiResult<ClientSession> {
        let (outcome, _workdir) = Self::ensure_attached(registry, name, cols, rows).await?;
        let pty::PtySpawnOutcome {
            handle,
            output_rx,
            exited_rx,
        } = outcome;
        let pty = Arc::new(handle);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut sessions = self.sessions.lock().await;
            let managed = sessions.entry(name.to_string()).or_insert_with(ManagedSession::new);
            managed.clients.insert(
                client_id,
                ClientHandle {
                    pty: pty.clone(),
                    tx: tx.clone(),
                },
            );
        }

        // Snapshot + initial state outside the lock (the capture itself is
        // blocking I/O run via a subprocess, not worth holding the map lock for).
        let snapshot = pane::capture_pane_content(name).await.unwrap_or_default();
        let _ = tx.send(ServerFrame::Output {
            data: snapshot.clone(),
        });

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(managed) = sessions.get_mut(name) {
                let result = managed.detector.analyze_initial_content(&snapshot);
                if result.state != SessionState::Unknown && result.state != managed.current_state {
                    managed.current_state = result.state;
                    let _ = tx.send(ServerFrame::state_change(result.state));
                }
            }
        }

        let manager = self.clone();
        let session_name = name.to_string();
        tokio::spawn(async move {
            manager
                .run_read_loop(session_name, client_id, output_rx, exited_rx)
                .await;
        });

        Ok(ClientSession {
            client_id,
            pty,
            frames: rx,
        })
    }

    /// §4.4 `unregisterClient`. Closes the client's PTY and, if it was the
    /// last one, drops the managed session entirely (the tmux session is
    /// left running).
    pub async fn unregister_client(&self, name: &str, client_id: u64) {
        let mut sessions = self.sessions.lock().await;
        let Some(managed) = sessions.get_mut(name) else {
            return;
        };
        if let Some(client) = managed.clients.remove(&client_id) {
            client.pty.close();
        }
        if managed.clients.is_empty() {
            sessions.remove(name);
        }
    }

    async fn run_read_loop(
        self: Arc<Self>,
        name: String,
        client_id: u64,
        mut output_rx: mpsc::UnboundedReceiver<bytes::Bytes>,
        mut exited_rx: tokio::sync::oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                chunk = output_rx.recv() => {
                    match chunk {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            self.handle_output_chunk(&name, client_id, &text).await;
                        }
                        None => {
                            self.handle_possible_death(&name).await;
                            break;
                        }
                    }
                }
                _ = &mut exited_rx => {
                    while let Ok(bytes) = output_rx.try_recv() {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        self.handle_output_chunk(&name, client_id, &text).await;
                    }
                    self.handle_possible_death(&name).await;
                    break;
                }
            }
        }
    }

    async fn handle_output_chunk(&self, name: &str, client_id: u64, text: &str) {
        let mut sessions = self.sessions.lock().await;
        let Some(managed) = sessions.get_mut(name) else {
            return;
        };

        if let Some(client) = managed.clients.get(&client_id) {
            let _ = client.tx.send(ServerFrame::Output { data: text.to_string() });
        }

        let result = managed.detector.process_output(text);
        if result.state == managed.current_state {
            return;
        }
        managed.current_state = result.state;
        managed.broadcast(ServerFrame::state_change(result.state));

        let should_persist = managed
            .last_persist
            .map(|last| last.elapsed() >= PERSIST_RATE_LIMIT)
            .unwrap_or(true);
        if should_persist {
            managed.last_persist = Some(Instant::now());
            let name = name.to_string();
            let state = result.state.as_str().to_string();
            tokio::spawn(async move {
                persist_idle_state(&name, &state).await;
            });
        }
    }

    /// tmux's control channel already confirms EOF once per attach (unlike a
    /// raw fd where the spec anticipates several consecutive reads before
    /// trusting it); we treat this single confirmed close as equivalent and
    /// verify liveness once before declaring the session dead.
    async fn handle_possible_death(&self, name: &str) {
        if pane::session_exists(name).await {
            return;
        }
        let mut sessions = self.sessions.lock().await;
        if let Some(managed) = sessions.get_mut(name) {
            managed.broadcast(ServerFrame::SessionDead {
                message: format!("tmux session '{name}' no longer exists"),
            });
        }
    }
}

async fn persist_idle_state(name: &str, state: &str) {
    let mut data = registry::load_session_data(name).await;
    data.idle_state.0.insert(
        name.to_string(),
        registry::IdleStateRecord {
            state: state.to_string(),
            updated_at: registry::now_iso(),
        },
    );
    let _ = registry::save_session_data(name, &data).await;
}
