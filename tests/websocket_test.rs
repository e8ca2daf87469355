use axum::body::Body;
use axum::http::{Request, StatusCode};
use eeg_ingest::{
    router, AppState, ConnectionRegistry, Dispatcher, FeedSettings, FeedSubscriber,
    IngestPipeline, MemoryBroker, MemoryReadingStore, PipelineStats, ThresholdClassifier,
    ViewerSettings,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

const TOPIC: &str = "eeg/data";
const WAIT: Duration = Duration::from_secs(2);

struct Service {
    addr: SocketAddr,
    broker: MemoryBroker,
    pipeline: IngestPipeline,
    registry: ConnectionRegistry,
}

fn app_state(registry: ConnectionRegistry, stats: Arc<PipelineStats>) -> AppState {
    AppState {
        registry,
        stats,
        viewer: ViewerSettings::default(),
    }
}

async fn spawn_service() -> Service {
    let broker = MemoryBroker::new();
    let registry = ConnectionRegistry::new();
    let stats = Arc::new(PipelineStats::new());

    let dispatcher = Dispatcher::new(
        Arc::new(MemoryReadingStore::new()),
        Arc::new(ThresholdClassifier::default()),
        registry.clone(),
        true,
        stats.clone(),
    );
    let settings = FeedSettings {
        shutdown_grace: Duration::from_secs(1),
        ..FeedSettings::default()
    };
    let feed = FeedSubscriber::new(broker.transport(TOPIC), settings, stats.clone());
    let mut pipeline = IngestPipeline::new(feed, dispatcher, 64);
    pipeline.start().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(app_state(registry.clone(), stats));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Service {
        addr,
        broker,
        pipeline,
        registry,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn reading(subject_id: i64, values: &[f64]) -> String {
    json!({
        "patient_id": subject_id,
        "timestamp": "2024-01-01T00:00:00",
        "channel_data": values,
    })
    .to_string()
}

#[tokio::test]
async fn test_live_viewer_receives_subject_readings() {
    let mut service = spawn_service().await;
    let url = format!("ws://{}/api/v1/ws/live_eeg/2", service.addr);
    let (mut socket, _) = connect_async(url).await.unwrap();

    let registry = service.registry.clone();
    wait_until(|| registry.subject_connection_count(2) == 1).await;

    service.broker.publish(TOPIC, reading(3, &[1.0; 8]));
    service.broker.publish(TOPIC, reading(2, &[4.0; 8]));

    let frame = tokio::time::timeout(WAIT, socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: serde_json::Value = match frame {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("unexpected frame: {:?}", other),
    };
    assert_eq!(value["patient_id"], 2);
    assert_eq!(value["channel_data"], json!(vec![4.0; 8]));

    // Viewer text frames are ignored
    socket.send(Message::Text("hello".into())).await.unwrap();

    socket.close(None).await.unwrap();
    wait_until(|| registry.total_connections() == 0).await;

    service.pipeline.stop().await;
}

#[tokio::test]
async fn test_alert_viewer_receives_seizure_alert() {
    let mut service = spawn_service().await;
    let url = format!("ws://{}/api/v1/ws/seizure_alerts", service.addr);
    let (mut socket, _) = connect_async(url).await.unwrap();

    let registry = service.registry.clone();
    wait_until(|| registry.alert_connection_count() == 1).await;

    service.broker.publish(TOPIC, reading(7, &[9.0; 8]));

    let frame = tokio::time::timeout(WAIT, socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text("Seizure Alert for patient 7".into()));

    service.pipeline.stop().await;
}

#[tokio::test]
async fn test_stop_closes_viewer_sockets() {
    let mut service = spawn_service().await;
    let url = format!("ws://{}/api/v1/ws/live_eeg/1", service.addr);
    let (mut socket, _) = connect_async(url).await.unwrap();

    let registry = service.registry.clone();
    wait_until(|| registry.total_connections() == 1).await;

    service.pipeline.stop().await;

    let closed = tokio::time::timeout(WAIT, async {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn test_ping_is_answered() {
    let mut service = spawn_service().await;
    let url = format!("ws://{}/api/v1/ws/live_eeg/1", service.addr);
    let (mut socket, _) = connect_async(url).await.unwrap();

    socket
        .send(Message::Ping(vec![1, 2, 3].into()))
        .await
        .unwrap();

    let frame = tokio::time::timeout(WAIT, socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Pong(vec![1, 2, 3].into()));

    service.pipeline.stop().await;
}

#[tokio::test]
async fn test_health() {
    let app = router(app_state(ConnectionRegistry::new(), Arc::new(PipelineStats::new())));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn test_stats_reports_counters_and_connections() {
    let registry = ConnectionRegistry::new();
    let stats = Arc::new(PipelineStats::new());
    stats.record_received();
    stats.record_decode_failure();

    let (handle, _rx) = eeg_ingest::ViewerHandle::channel(4);
    registry.register_subject(handle, 12);

    let app = router(app_state(registry, stats));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/stats")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["messages_received"], 1);
    assert_eq!(value["decode_failures"], 1);
    assert_eq!(value["total_connections"], 1);
    assert_eq!(value["watched_subjects"], json!([12]));
}

#[tokio::test]
async fn test_invalid_patient_id_is_rejected() {
    let app = router(app_state(ConnectionRegistry::new(), Arc::new(PipelineStats::new())));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/ws/live_eeg/not-a-number")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
