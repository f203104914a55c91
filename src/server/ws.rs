//! `/ws/run`: one socket, one run.
//!
//! The run starts when the upgrade completes and its events are forwarded as
//! JSON text frames. The run is cancelled when the socket goes away first.

use std::str::FromStr;
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use super::api::{HttpError, SharedState};
use crate::controller::RunRequest;
use crate::events::{LogLevel, RunEvent};
use crate::flows::{FlowKind, RunMode};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct RunParams {
    pub flow: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
}

impl RunParams {
    pub fn into_request(self) -> Result<RunRequest, HttpError> {
        let flow = FlowKind::from_str(&self.flow)
            .map_err(|e| HttpError::BadRequest(e.to_string()))?;
        let mode = match (self.mode.as_deref(), self.step) {
            (None | Some("full"), _) => RunMode::Full,
            (Some("to-step" | "toStep"), Some(step)) if !step.trim().is_empty() => {
                RunMode::ToStep(step.trim().to_string())
            }
            (Some("to-step" | "toStep"), _) => {
                return Err(HttpError::BadRequest(
                    "mode=to-step needs a step parameter".into(),
                ));
            }
            (Some(other), _) => {
                return Err(HttpError::BadRequest(format!(
                    "Unknown mode '{other}'. Expected full or to-step"
                )));
            }
        };
        mode.validate(flow)
            .map_err(|e| HttpError::BadRequest(e.to_string()))?;
        Ok(RunRequest { flow, mode })
    }
}

pub async fn run_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<RunParams>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, HttpError> {
    let request = params.into_request()?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, request)))
}

async fn handle_socket(socket: WebSocket, state: SharedState, request: RunRequest) {
    let (mut sender, receiver) = socket.split();
    let handle = match state.controller.start(request).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start run for websocket client");
            let event = RunEvent::Log {
                level: LogLevel::Error,
                message: e.to_string(),
                data: Some(serde_json::json!({ "outcome": "failed" })),
                progress: None,
                timestamp: chrono::Utc::now(),
            };
            if let Ok(json) = serde_json::to_string(&event) {
                let _ = sender.send(Message::Text(json.into())).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let run_id = handle.run_id;
    tracing::info!(%run_id, "websocket client attached to run");
    let finished = run_socket_loop(sender, receiver, handle.events).await;
    if !finished && state.controller.cancel_run(run_id) {
        tracing::info!(%run_id, "websocket closed, run cancelled");
    }
}

/// Forward run events to the socket with ping/pong keepalive.
///
/// Returns `true` when the run's event stream ended (the run finished), and
/// `false` when the socket went away first.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: UnboundedReceiver<RunEvent>,
) -> bool {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    let finished = loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::warn!("websocket client stopped answering pings");
                    break false;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break false;
                }
                awaiting_pong = true;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    break true;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break false;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize run event"),
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break false,
                    Some(Ok(_)) => {}
                }
            }
        }
    };

    let _ = sender.send(Message::Close(None)).await;
    finished
}
