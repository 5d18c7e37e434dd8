use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use ter_core::live::{ClientMessage, LiveOptions, ServerMessage, Snapshot};
use ter_probes::{ProbeError, SessionQuery};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::live::{Aggregator, LiveSources};
use crate::Config;

const OUTBOUND_QUEUE: usize = 32;

pub struct AgentState<S> {
    pub config: Config,
    pub aggregator: Aggregator<S>,
    conn_counter: AtomicU64,
}

impl<S: LiveSources> AgentState<S> {
    pub fn new(config: Config, sources: S) -> Self {
        Self {
            config,
            aggregator: Aggregator::new(sources),
            conn_counter: AtomicU64::new(0),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("live-{id}")
    }

    /// Pushes a snapshot immediately, then every interval, until the client
    /// goes away or a write stalls past the write timeout.
    async fn run_live(self: Arc<Self>, socket: WebSocket, options: LiveOptions) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let write_timeout = self.config.write_timeout;
        let writer_id = conn_id.clone();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = "write_error", conn_id = %writer_id, error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "write_timeout", conn_id = %writer_id);
                        return;
                    }
                }
            }
        });

        info!(event = "live_connected", conn_id = %conn_id, options = %options.options_key());

        let mut ticker = tokio::time::interval(options.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping = (!self.config.ping_interval.is_zero()).then(|| {
            let start = tokio::time::Instant::now() + self.config.ping_interval;
            tokio::time::interval_at(start, self.config.ping_interval)
        });

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.aggregator.snapshot(&options).await;
                    if !push(&tx, outcome).await {
                        break "send_failed";
                    }
                }
                _ = next_ping(&mut ping) => {
                    if tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break "ping_failed";
                    }
                }
                incoming = ws_receiver.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break "client_closed",
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(event = "read_error", conn_id = %conn_id, error = %err);
                            break "read_error";
                        }
                    };
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Refresh) => {
                            debug!(event = "live_refresh", conn_id = %conn_id);
                            let outcome = self.aggregator.refresh(&options).await;
                            if !push(&tx, outcome).await {
                                break "send_failed";
                            }
                            ticker.reset();
                        }
                        Err(err) => {
                            debug!(event = "message_invalid", conn_id = %conn_id, error = %err);
                        }
                    }
                }
            }
        };

        drop(tx);
        let _ = write_task.await;
        info!(event = "live_disconnected", conn_id = %conn_id, reason);
    }
}

async fn next_ping(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Queues a snapshot, or the error when nothing could be built. `false` once
/// the writer is gone.
async fn push(tx: &mpsc::Sender<Message>, outcome: Result<Snapshot, ProbeError>) -> bool {
    let message = match outcome {
        Ok(snapshot) => ServerMessage::Snapshot(snapshot),
        Err(err) => {
            warn!(event = "snapshot_failed", kind = err.kind().as_str(), error = %err);
            ServerMessage::Error {
                message: err.to_string(),
            }
        }
    };
    match serde_json::to_string(&message) {
        Ok(text) => tx.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            warn!(event = "encode_error", error = %err);
            true
        }
    }
}

pub fn router<S: LiveSources>(state: Arc<AgentState<S>>) -> Router {
    Router::new()
        .route("/health", get(health::<S>))
        .route("/ping", get(ping))
        .route("/host", get(host::<S>))
        .route("/usage", get(usage::<S>))
        .route("/docker", get(docker::<S>))
        .route("/sessions", get(sessions::<S>))
        .route("/events", get(events::<S>))
        .with_state(state)
}

/// Accepts `Authorization: Bearer <token>` or a `token` query parameter when
/// the agent has a token configured.
pub fn authorized(expected: Option<&str>, headers: &HeaderMap, query: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    if from_header == Some(expected) {
        return true;
    }
    query.is_some_and(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .any(|(key, value)| key == "token" && value == expected)
    })
}

fn guard<S>(state: &AgentState<S>, headers: &HeaderMap, query: Option<&str>) -> Result<(), Response> {
    if authorized(state.config.auth_token.as_deref(), headers, query) {
        Ok(())
    } else {
        warn!(event = "unauthorized");
        Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response())
    }
}

fn probe_failure(err: ProbeError) -> Response {
    let status = match err.kind() {
        ter_core::ErrorKind::ToolMissing | ter_core::ErrorKind::NotConnected => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ter_core::ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": err.to_string(), "kind": err.kind() })),
    )
        .into_response()
}

async fn health<S: LiveSources>(State(state): State<Arc<AgentState<S>>>) -> Json<serde_json::Value> {
    let tmux_version = state
        .aggregator
        .sources()
        .multiplexer_version()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Json(json!({
        "ok": true,
        "host": state.config.label,
        "tmuxVersion": tmux_version,
    }))
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "ts": Utc::now().timestamp_millis() }))
}

async fn host<S: LiveSources>(
    State(state): State<Arc<AgentState<S>>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(denied) = guard(&state, &headers, query.as_deref()) {
        return denied;
    }
    match state.aggregator.sources().host().await {
        Ok(info) => Json(info).into_response(),
        Err(err) => probe_failure(err),
    }
}

async fn usage<S: LiveSources>(
    State(state): State<Arc<AgentState<S>>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(denied) = guard(&state, &headers, query.as_deref()) {
        return denied;
    }
    Json(state.aggregator.sources().usage().await).into_response()
}

async fn docker<S: LiveSources>(
    State(state): State<Arc<AgentState<S>>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(denied) = guard(&state, &headers, query.as_deref()) {
        return denied;
    }
    match state.aggregator.sources().docker().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => probe_failure(err),
    }
}

async fn sessions<S: LiveSources>(
    State(state): State<Arc<AgentState<S>>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(denied) = guard(&state, &headers, query.as_deref()) {
        return denied;
    }
    let options = LiveOptions::from_query(query.as_deref().unwrap_or(""));
    let session_query = SessionQuery {
        preview: options.preview,
        preview_lines: options.preview_lines,
        insights: options.insights,
    };
    match state.aggregator.sources().sessions(session_query).await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(err) => probe_failure(err),
    }
}

async fn events<S: LiveSources>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AgentState<S>>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(denied) = guard(&state, &headers, query.as_deref()) {
        return denied;
    }
    let options = LiveOptions::from_query(query.as_deref().unwrap_or(""));
    ws.on_upgrade(move |socket| state.run_live(socket, options))
}
