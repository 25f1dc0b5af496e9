//! Background idle monitor (§4.5): a single long-lived task that keeps
//! `idle_state[name]` accurate for every live tmux session, independent of
//! whether any client is currently attached.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::pane;
use crate::registry;
use crate::state::{IdleDetector, SessionState};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// A session reported continuously `working` past this threshold is
/// overridden to `stalled` (§4.3 stall overlay, §8 invariant 5).
const STALL_THRESHOLD: Duration = Duration::from_secs(600);

struct Tracked {
    detector: IdleDetector,
    last_persisted: Option<SessionState>,
    working_since: Option<Instant>,
}

/// Owns its own private state; per the design notes this never shares
/// mutable data with the session manager's streaming detectors.
pub(crate) struct IdleMonitor {
    tracked: HashMap<String, Tracked>,
}

impl Default for IdleMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleMonitor {
    pub fn new() -> Self {
        Self {
            tracked: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            self.poll_once().await;
        }
    }

    async fn poll_once(&mut self) {
        let live = live_session_names().await;

        self.tracked.retain(|name, _| live.contains(name));

        for name in &live {
            let tracked = self.tracked.entry(name.clone()).or_insert_with(|| Tracked {
                detector: IdleDetector::new(),
                last_persisted: None,
                working_since: None,
            });

            let snapshot = match pane::capture_pane_content(name).await {
                Ok(content) => content,
                Err(_) => continue,
            };

            let result = tracked.detector.analyze_initial_content(&snapshot);
            let mut state = result.state;

            if state == SessionState::Working {
                let since = *tracked.working_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= STALL_THRESHOLD {
                    state = SessionState::Stalled;
                }
            } else {
                tracked.working_since = None;
            }

            if tracked.last_persisted != Some(state) {
                tracked.last_persisted = Some(state);
                persist_idle_state(name, state).await;
            }
        }
    }
}

async fn live_session_names() -> std::collections::HashSet<String> {
    let output = tokio::process::Command::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .output()
        .await;
    let Ok(output) = output else {
        return Default::default();
    };
    if !output.status.success() {
        return Default::default();
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

async fn persist_idle_state(name: &str, state: SessionState) {
    let mut data = registry::load_session_data(name).await;
    data.idle_state.0.insert(
        name.to_string(),
        registry::IdleStateRecord {
            state: state.as_str().to_string(),
            updated_at: registry::now_iso(),
        },
    );
    let _ = registry::save_session_data(name, &data).await;
}
