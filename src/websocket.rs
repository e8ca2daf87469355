use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream::SplitStream, Sink, SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionId, ConnectionRegistry, Outbound, ViewerHandle};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::types::{SubjectId, ViewerScope};

const PONG_QUEUE: usize = 8;

/// Per-connection delivery limits
#[derive(Debug, Clone, Copy)]
pub struct ViewerSettings {
    pub queue_capacity: usize,
    pub send_timeout: Duration,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            send_timeout: Duration::from_secs(2),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub stats: Arc<PipelineStats>,
    pub viewer: ViewerSettings,
}

/// HTTP routes: health, stats, and the two viewer sockets
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/stats", get(pipeline_stats))
        .route("/api/v1/ws/live_eeg/{patient_id}", get(live_eeg_websocket))
        .route("/api/v1/ws/seizure_alerts", get(seizure_alerts_websocket))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub pipeline: StatsSnapshot,
    pub total_connections: usize,
    pub alert_connections: usize,
    pub watched_subjects: Vec<SubjectId>,
}

async fn pipeline_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pipeline: state.stats.snapshot(),
        total_connections: state.registry.total_connections(),
        alert_connections: state.registry.alert_connection_count(),
        watched_subjects: state.registry.subject_ids(),
    })
}

/// Live readings for one patient
async fn live_eeg_websocket(
    Path(patient_id): Path<SubjectId>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_viewer(
            socket,
            state,
            ViewerScope::Subject {
                subject_id: patient_id,
            },
        )
    })
}

/// Seizure alerts for every patient
async fn seizure_alerts_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_viewer(socket, state, ViewerScope::Alerts))
}

/// Serve one viewer until it disconnects or the registry drops it
async fn handle_viewer(socket: WebSocket, state: AppState, scope: ViewerScope) {
    let (handle, outbound) = ViewerHandle::channel(state.viewer.queue_capacity);
    let id = handle.id();
    let cancel = handle.cancel_token();

    match scope {
        ViewerScope::Subject { subject_id } => state.registry.register_subject(handle, subject_id),
        ViewerScope::Alerts => state.registry.register_alert(handle),
    }
    info!(connection = %id, ?scope, "Viewer connected");

    let (sender, receiver) = socket.split();
    let (pong_tx, pong_rx) = mpsc::channel(PONG_QUEUE);

    let writer = tokio::spawn(write_loop(
        sender,
        outbound,
        pong_rx,
        cancel.clone(),
        state.viewer.send_timeout,
        id,
    ));

    read_loop(receiver, pong_tx, &cancel, id).await;

    cancel.cancel();
    unregister(&state.registry, id, scope);
    if let Err(e) = writer.await {
        warn!(connection = %id, "Viewer writer task failed: {}", e);
    }

    info!(connection = %id, "Viewer disconnected");
}

fn unregister(registry: &ConnectionRegistry, id: ConnectionId, scope: ViewerScope) {
    match scope {
        ViewerScope::Subject { subject_id } => {
            registry.unregister_subject(id, subject_id);
        }
        ViewerScope::Alerts => {
            registry.unregister_alert(id);
        }
    }
}

/// Incoming frames: text is ignored, ping is answered, close ends the session
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    pong_tx: mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
    id: ConnectionId,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Ping(data))) => {
                if pong_tx.try_send(data).is_err() {
                    debug!(connection = %id, "Pong queue full, skipping");
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!(connection = %id, "Viewer closed the socket");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(connection = %id, "WebSocket error: {}", e);
                break;
            }
            None => break,
        }
    }
}

/// Outgoing frames, each write bounded by `send_timeout`
async fn write_loop<S>(
    mut sender: S,
    mut outbound: mpsc::Receiver<Outbound>,
    mut pongs: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    send_timeout: Duration,
    id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            Some(data) = pongs.recv() => Some(Message::Pong(data)),
            next = outbound.recv() => match next {
                Some(Outbound::Text(payload)) => Some(Message::Text(payload.to_string().into())),
                Some(Outbound::Close) | None => None,
            },
        };

        let Some(message) = message else {
            break;
        };

        match tokio::time::timeout(send_timeout, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = %id, "Viewer send failed: {}", e);
                cancel.cancel();
                return;
            }
            Err(_) => {
                warn!(connection = %id, "Viewer send timed out after {:?}", send_timeout);
                cancel.cancel();
                return;
            }
        }
    }

    // Best-effort close frame
    let _ = tokio::time::timeout(send_timeout, sender.send(Message::Close(None))).await;
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future;

    fn stalled_sink() -> impl Sink<Message, Error = axum::Error> + Unpin + Send + 'static {
        Box::pin(futures_util::sink::unfold((), |_, _: Message| {
            future::pending::<Result<(), axum::Error>>()
        }))
    }

    #[tokio::test]
    async fn test_stalled_writer_is_dropped_and_sibling_keeps_receiving() {
        let registry = ConnectionRegistry::new();
        let (stalled, outbound) = ViewerHandle::channel(4);
        let (healthy, mut healthy_rx) = ViewerHandle::channel(4);
        let stalled_id = stalled.id();
        let cancel = stalled.cancel_token();
        registry.register_subject(stalled, 1);
        registry.register_subject(healthy, 1);

        let (_pong_tx, pong_rx) = mpsc::channel(1);
        let writer = tokio::spawn(write_loop(
            stalled_sink(),
            outbound,
            pong_rx,
            cancel.clone(),
            Duration::from_millis(50),
            stalled_id,
        ));

        let report = registry.fanout_subject(1, "first");
        assert_eq!(report.delivered, 2);

        tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());

        let report = registry.fanout_subject(1, "second");
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(registry.subject_connection_count(1), 1);

        for expected in ["first", "second"] {
            match healthy_rx.recv().await {
                Some(Outbound::Text(payload)) => assert_eq!(&*payload, expected),
                _ => panic!("expected text for the healthy viewer"),
            }
        }
    }
}
