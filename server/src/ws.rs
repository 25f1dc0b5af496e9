//! WebSocket protocol (§6) and the `/api/session/{name}/stream` handler.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::session_manager::ClientSession;
use crate::state::SessionState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ServerFrame {
    Output {
        data: String,
    },
    StateChange {
        state: &'static str,
    },
    #[allow(dead_code)] // emitted only under sizing policy (b); this build uses policy (a)
    ResizeSync {
        cols: u16,
        rows: u16,
    },
    SessionDead {
        message: String,
    },
    SessionNotFound {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn state_change(state: SessionState) -> Self {
        ServerFrame::StateChange { state: state.as_str() }
    }
}

pub(crate) async fn session_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, name, socket))
}

const INITIAL_COLS: u16 = 80;
const INITIAL_ROWS: u16 = 24;

async fn handle_socket(state: AppState, name: String, mut socket: WebSocket) {
    let ClientSession {
        client_id,
        pty,
        mut frames,
    } = match state
        .session_manager
        .register_client(&state.registry, &name, INITIAL_COLS, INITIAL_ROWS)
        .await
    {
        Ok(session) => session,
        Err(err) => {
            let frame = ServerFrame::SessionNotFound {
                message: err.to_string(),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(text.into())).await;
            }
            return;
        }
    };

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let is_terminal = matches!(frame, ServerFrame::SessionDead { .. });
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                if is_terminal {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(&pty, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.session_manager.unregister_client(&name, client_id).await;
}

fn handle_client_text(pty: &Arc<crate::pty::PtyHandle>, text: &str) {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        return;
    };
    match frame {
        ClientFrame::Input { data } => {
            let _ = pty.write(data.as_bytes());
        }
        ClientFrame::Resize { cols, rows } => {
            let _ = pty.resize(cols, rows);
        }
    }
}
