//! HTTP API and page link for the voice bridge.
//!
//! Runs on port 8767 (configurable) using axum:
//! - `GET /status` pipeline, settings and avatar link state
//! - `POST /speak` speak plain text
//! - `POST /settings` partial settings update
//! - `GET /report?date=` daily speech report (markdown)
//! - `GET /page` WebSocket for the browser page link

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::avatar::ConnectionState;
use crate::history::SpeechHistory;
use crate::normalizer::Normalizer;
use crate::observer::PageEvent;
use crate::pipeline::{PipelineStatus, SpeechPipeline};
use crate::service::PageCommand;
use crate::settings::{Settings, SettingsStore};
use crate::Result;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: SpeechPipeline,
    pub normalizer: Arc<Normalizer>,
    pub settings: Arc<SettingsStore>,
    pub history: Option<SpeechHistory>,
    pub avatar: Option<watch::Receiver<ConnectionState>>,
    pub page_events: mpsc::Sender<PageEvent>,
    pub commands: broadcast::Sender<PageCommand>,
    pub pages: Arc<AtomicUsize>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct SpeakRequest {
    text: String,
}

#[derive(Deserialize)]
struct ReportQuery {
    #[serde(default = "default_date")]
    date: String,
}

fn default_date() -> String {
    "today".to_string()
}

#[derive(Serialize)]
struct StatusResponse {
    speech: PipelineStatus,
    settings: Settings,
    avatar: Option<ConnectionState>,
    pages: usize,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            chunks: None,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            chunks: None,
            error: Some(message.into()),
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/speak", post(handle_speak))
        .route("/settings", post(handle_settings))
        .route("/report", get(handle_report))
        .route("/page", get(handle_page))
        .with_state(state)
}

/// Serve the API on loopback until cancelled.
pub async fn serve(state: ApiState, port: u16, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        speech: state.pipeline.status(),
        settings: state.settings.current(),
        avatar: state.avatar.as_ref().map(|rx| *rx.borrow()),
        pages: state.pages.load(Ordering::Relaxed),
    })
}

async fn handle_speak(
    State(state): State<ApiState>,
    Json(req): Json<SpeakRequest>,
) -> Json<SimpleResponse> {
    let text = state.normalizer.normalize_text(&req.text);
    if text.is_empty() {
        return Json(SimpleResponse::err("nothing speakable"));
    }

    let preview: String = text.chars().take(40).collect();
    info!(
        "HTTP /speak: \"{}{}\" ({} chars)",
        preview.replace('\n', " "),
        if text.chars().count() > 40 { "..." } else { "" },
        text.chars().count(),
    );

    let chunks = state.pipeline.enqueue_text(&text);
    Json(SimpleResponse {
        chunks: Some(chunks),
        ..SimpleResponse::ok("speaking")
    })
}

/// Returns the full settings after the update, or an error response.
async fn handle_settings(
    State(state): State<ApiState>,
    Json(patch): Json<Value>,
) -> Json<Value> {
    let body = match state.settings.update(&patch) {
        Ok(settings) => serde_json::to_value(settings),
        Err(e) => {
            warn!("Rejected settings update: {e}");
            serde_json::to_value(SimpleResponse::err(e.to_string()))
        }
    };
    Json(body.unwrap_or_default())
}

async fn handle_report(
    State(state): State<ApiState>,
    Query(query): Query<ReportQuery>,
) -> String {
    match &state.history {
        Some(history) => history.report(&query.date),
        None => "Speech history is disabled.".to_string(),
    }
}

async fn handle_page(State(state): State<ApiState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| page_socket(socket, state))
}

/// One browser page: mutation reports in, control commands out.
async fn page_socket(socket: WebSocket, state: ApiState) {
    let (mut sender, mut receiver) = socket.split();
    let mut commands = state.commands.subscribe();
    let connected = state.pages.fetch_add(1, Ordering::Relaxed) + 1;
    info!("Page connected ({connected} open)");

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<PageEvent>(text.as_str()) {
                        Ok(event) => {
                            if state.page_events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Bad page event: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Page socket error: {e}");
                    break;
                }
            },
            command = commands.recv() => match command {
                Ok(command) => {
                    let Ok(json) = serde_json::to_string(&command) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Page link lagged, {n} command(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    state.pages.fetch_sub(1, Ordering::Relaxed);
    info!("Page disconnected");
}
