//! Reference session server for the terminal bridge.
//!
//! Run with: cargo run -p bridge-server
//!
//! Each launched session is a shell process with piped stdio. Output is
//! streamed as `output` frames over `/sessions/{id}/ws`; input arrives
//! either over that socket or via `POST /sessions/{id}/input`.

use std::{collections::HashMap, net::SocketAddr, process::Stdio, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use term_bridge_core::{LaunchRequest, ProtocolMessage, ServerFrame};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::{Mutex, RwLock, broadcast, mpsc, watch},
    task::JoinHandle,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const READ_CHUNK: usize = 4096;

/// A running shell and the plumbing around it.
struct ShellSession {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    output: broadcast::Sender<String>,
    exited: watch::Sender<bool>,
    readers: Vec<JoinHandle<()>>,
}

impl ShellSession {
    fn spawn(shell: &str, request: &LaunchRequest) -> anyhow::Result<Self> {
        let mut child = Command::new(shell)
            .arg("-i")
            .env("TASK_ID", &request.task_id)
            .env("CONTEXT_FILE", &request.context_file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {shell}"))?;

        let stdin = child.stdin.take().context("stdin not piped")?;
        let stdout = child.stdout.take().context("stdout not piped")?;
        let stderr = child.stderr.take().context("stderr not piped")?;

        let (output, _) = broadcast::channel(256);
        let (exited, _) = watch::channel(false);
        let readers = vec![
            spawn_reader(stdout, output.clone(), Some(exited.clone())),
            spawn_reader(stderr, output.clone(), None),
        ];

        Ok(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            output,
            exited,
            readers,
        })
    }

    /// Pipes carry no line discipline, so carriage returns become newlines.
    async fn write(&self, data: &str) -> std::io::Result<()> {
        let data = data.replace("\r\n", "\n").replace('\r', "\n");
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(data.as_bytes()).await?;
        stdin.flush().await
    }

    async fn terminate(&self) {
        for reader in &self.readers {
            reader.abort();
        }
        if let Err(e) = self.child.lock().await.kill().await {
            tracing::debug!("Shell already gone: {e}");
        }
        self.exited.send_replace(true);
    }
}

fn spawn_reader<R>(
    mut reader: R,
    output: broadcast::Sender<String>,
    exited: Option<watch::Sender<bool>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let _ = output.send(String::from_utf8_lossy(&buf[..n]).into_owned());
                }
                Err(e) => {
                    tracing::warn!("Shell read failed: {e}");
                    break;
                }
            }
        }
        if let Some(exited) = exited {
            exited.send_replace(true);
        }
    })
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    shell: Arc<str>,
    sessions: Arc<RwLock<HashMap<String, Arc<ShellSession>>>>,
}

impl AppState {
    async fn get(&self, id: &str) -> Option<Arc<ShellSession>> {
        self.sessions.read().await.get(id).cloned()
    }
}

#[derive(Serialize)]
struct Reply {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Reply {
    const fn ok(session_id: Option<String>) -> Self {
        Self {
            success: true,
            session_id,
            error: None,
        }
    }

    fn err(status: StatusCode, error: impl Into<String>) -> Response {
        let body = Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct InputBody {
    input: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let addr: SocketAddr = std::env::var("BRIDGE_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
        .parse()
        .context("invalid BRIDGE_SERVER_ADDR")?;

    let state = AppState {
        shell: std::env::var("BRIDGE_SHELL")
            .unwrap_or_else(|_| "sh".to_string())
            .into(),
        sessions: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/sessions/launch", post(launch_handler))
        .route("/sessions/{id}/stop", post(stop_handler))
        .route("/sessions/{id}/input", post(input_handler))
        .route("/sessions/{id}/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!("Server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn launch_handler(
    State(state): State<AppState>,
    Json(request): Json<LaunchRequest>,
) -> Response {
    if request.task_id.is_empty() {
        return Reply::err(StatusCode::BAD_REQUEST, "task_id is required");
    }

    let session = match ShellSession::spawn(&state.shell, &request) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Launch failed: {e:#}");
            return Reply::err(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"));
        }
    };

    let id = Uuid::new_v4().to_string();
    state
        .sessions
        .write()
        .await
        .insert(id.clone(), Arc::new(session));
    tracing::info!(session_id = %id, task_id = %request.task_id, "Session launched");

    Json(Reply::ok(Some(id))).into_response()
}

async fn stop_handler(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let Some(session) = state.sessions.write().await.remove(&id) else {
        return Reply::err(StatusCode::NOT_FOUND, "unknown session");
    };
    session.terminate().await;
    tracing::info!(session_id = %id, "Session stopped");
    Json(Reply::ok(None)).into_response()
}

async fn input_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<InputBody>,
) -> Response {
    let Some(session) = state.get(&id).await else {
        return Reply::err(StatusCode::NOT_FOUND, "unknown session");
    };
    match session.write(&body.input).await {
        Ok(()) => Json(Reply::ok(None)).into_response(),
        Err(e) => Reply::err(StatusCode::GONE, e.to_string()),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Some(session) = state.get(&id).await else {
        return Reply::err(StatusCode::NOT_FOUND, "unknown session");
    };
    ws.on_upgrade(move |socket| handle_socket(socket, id, session))
}

async fn handle_socket(socket: WebSocket, id: String, session: Arc<ShellSession>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut output = session.output.subscribe();
    let output_tx = tx.clone();
    let output_task = tokio::spawn(async move {
        loop {
            match output.recv().await {
                Ok(chunk) => {
                    if output_tx.send(ServerFrame::output(chunk)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Socket fell behind shell output");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut exited = session.exited.subscribe();
    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = exited.wait_for(|done| *done) => break,
        };
        let text = match msg {
            Some(Ok(Message::Text(t))) => t.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let message: ProtocolMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx.send(ServerFrame::Error {
                    message: e.to_string(),
                });
                continue;
            }
        };

        match message.input_payload() {
            Some(data) => {
                if let Err(e) = session.write(data).await {
                    tracing::error!("Failed to write to shell: {e}");
                    let _ = tx.send(ServerFrame::Error {
                        message: e.to_string(),
                    });
                }
            }
            None => {
                let _ = tx.send(ServerFrame::Pong);
            }
        }
    }

    output_task.abort();
    drop(tx);
    let _ = send_task.await;
    tracing::info!(session_id = %id, "WebSocket disconnected");
}
