use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use guardian_stream::{
    capture::{CaptureSession, DeviceDescriptor, DeviceRegistry, Resolution, SyntheticBackend},
    guard::{LeaveConfirmation, Navigation, SessionState},
    render::DrawOp,
    server::{HttpServer, SharedState},
    session::{MonitoringSession, NavigationOutcome, SessionSettings, SessionStatus},
    settings::SettingsSync,
    telemetry::Metrics,
};
use serde::Deserialize;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, sync::broadcast, time::sleep};

const PERSON: &str =
    r#"{"predictions":[{"box":[0,0,10,10],"label":"person","score":0.95}],"alerts":[]}"#;

#[derive(Default)]
struct Backend {
    frames: AtomicUsize,
    jpeg_frames: AtomicUsize,
    closes: AtomicUsize,
    hang_up: AtomicBool,
    interval: AtomicUsize,
    settings_calls: AtomicUsize,
}

#[derive(Deserialize)]
struct IntervalQuery {
    interval: usize,
}

async fn annotate(mut socket: WebSocket, backend: Arc<Backend>) {
    let mut replied = false;
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(frame) => {
                backend.frames.fetch_add(1, Ordering::SeqCst);
                if frame.starts_with(&[0xFF, 0xD8]) {
                    backend.jpeg_frames.fetch_add(1, Ordering::SeqCst);
                }
                if backend.hang_up.load(Ordering::SeqCst) {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                if !replied {
                    let _ = socket.send(Message::Text(PERSON.into())).await;
                    replied = true;
                }
            }
            Message::Close(_) => {
                backend.closes.fetch_add(1, Ordering::SeqCst);
                return;
            }
            _ => {}
        }
    }
}

async fn spawn_backend(backend: Arc<Backend>) -> String {
    backend.interval.store(2, Ordering::SeqCst);
    let app = Router::new()
        .route(
            "/security/ws",
            get(
                |ws: WebSocketUpgrade, State(backend): State<Arc<Backend>>| async move {
                    ws.on_upgrade(move |socket| annotate(socket, backend))
                },
            ),
        )
        .route(
            "/security/mediapipe/settings",
            get(|State(backend): State<Arc<Backend>>| async move {
                backend.settings_calls.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({
                    "enabled": true,
                    "available": true,
                    "frameInterval": backend.interval.load(Ordering::SeqCst)
                }))
            }),
        )
        .route(
            "/security/mediapipe/interval",
            post(
                |State(backend): State<Arc<Backend>>, Query(query): Query<IntervalQuery>| async move {
                    backend.settings_calls.fetch_add(1, Ordering::SeqCst);
                    backend.interval.store(query.interval, Ordering::SeqCst);
                    StatusCode::OK
                },
            ),
        )
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

struct Answer(bool);

impl LeaveConfirmation for Answer {
    fn confirm_leave(&self, _navigation: &Navigation) -> impl Future<Output = bool> + Send {
        let answer = self.0;
        async move { answer }
    }
}

struct Fixture {
    registry: Arc<DeviceRegistry>,
    session: Arc<MonitoringSession>,
    metrics: Arc<Metrics>,
}

fn fixture(backend_addr: &str) -> Fixture {
    let capture_backend = Arc::new(SyntheticBackend::new(vec![DeviceDescriptor::new(
        "cam1", "",
    )]));
    let registry = Arc::new(DeviceRegistry::new(capture_backend.clone()));
    let capture = Arc::new(CaptureSession::new(
        capture_backend,
        Resolution::new(64, 64),
    ));
    let metrics = Arc::new(Metrics::new().unwrap());
    let session = Arc::new(MonitoringSession::new(
        capture,
        SessionSettings {
            stream_url: format!("ws://{}/security/ws", backend_addr),
            frame_interval: Duration::from_millis(30),
            jpeg_quality: 60,
            display_width: 128,
            display_height: 128,
        },
        metrics.clone(),
    ));
    Fixture {
        registry,
        session,
        metrics,
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

fn stroke_rects(ops: &[DrawOp]) -> Vec<&DrawOp> {
    ops.iter()
        .filter(|op| matches!(op, DrawOp::StrokeRect { .. }))
        .collect()
}

#[tokio::test]
async fn test_end_to_end_monitoring_and_confirmed_leave() {
    let backend = Arc::new(Backend::default());
    let addr = spawn_backend(backend.clone()).await;
    let Fixture {
        registry, session, ..
    } = fixture(&addr);

    let devices = registry.list().await.unwrap();
    assert_eq!(devices, vec![DeviceDescriptor::new("cam1", "")]);
    assert_eq!(devices[0].display_name(0), "Camera 1");
    registry.select("cam1");

    session.start("cam1").await.unwrap();
    eventually("monitoring", || session.state() == SessionState::Monitoring).await;
    assert_eq!(session.status(), SessionStatus::Connected);

    let overlay = session.overlay();
    eventually("annotation", || !stroke_rects(&overlay.ops()).is_empty()).await;

    let ops = overlay.ops();
    let rects = stroke_rects(&ops);
    assert_eq!(rects.len(), 1);
    match rects[0] {
        DrawOp::StrokeRect { rect, dashed, .. } => {
            assert_eq!(rect.corners(), [0.0, 0.0, 20.0, 20.0]);
            assert!(!dashed);
        }
        other => panic!("unexpected op {:?}", other),
    }
    assert_eq!(
        ops.iter()
            .filter(|op| matches!(op, DrawOp::FillRect { .. }))
            .count(),
        1
    );
    assert!(ops
        .iter()
        .any(|op| matches!(op, DrawOp::Text { text, .. } if text == "person 95%")));
    assert!(backend.jpeg_frames.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        backend.jpeg_frames.load(Ordering::SeqCst),
        backend.frames.load(Ordering::SeqCst)
    );

    let outcome = session
        .navigate(
            Navigation::InApp {
                target: "/about".into(),
            },
            &Answer(false),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, NavigationOutcome::Stayed(_)));
    assert_eq!(session.state(), SessionState::Monitoring);

    let outcome = session
        .navigate(
            Navigation::InApp {
                target: "/about".into(),
            },
            &Answer(true),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        NavigationOutcome::Proceed(Navigation::InApp {
            target: "/about".into()
        })
    );
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.status_report().channel.is_none());
    assert!(session.compose_preview(None).is_none());
    eventually("close frame", || backend.closes.load(Ordering::SeqCst) == 1).await;

    let frames = backend.frames.load(Ordering::SeqCst);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.frames.load(Ordering::SeqCst), frames);
}

#[tokio::test]
async fn test_backend_hang_up_closes_session() {
    let backend = Arc::new(Backend::default());
    backend.hang_up.store(true, Ordering::SeqCst);
    let addr = spawn_backend(backend.clone()).await;
    let Fixture { session, .. } = fixture(&addr);

    session.start("cam1").await.unwrap();
    eventually("closed", || session.state() == SessionState::Closed).await;

    assert_eq!(session.status(), SessionStatus::Disconnected);
    assert!(!session.is_armed());
    assert!(session.status_report().channel.is_none());

    let outcome = session.navigate(Navigation::Reload, &Answer(false)).await.unwrap();
    assert_eq!(outcome, NavigationOutcome::Proceed(Navigation::Reload));
}

#[tokio::test]
async fn test_device_change_replaces_session() {
    let backend = Arc::new(Backend::default());
    let addr = spawn_backend(backend.clone()).await;
    let Fixture { session, .. } = fixture(&addr);

    session.start("cam1").await.unwrap();
    eventually("monitoring", || session.state() == SessionState::Monitoring).await;
    session.start("cam1").await.unwrap();
    eventually("monitoring again", || session.state() == SessionState::Monitoring).await;

    eventually("old channel closed", || backend.closes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(session.status_report().device.as_deref(), Some("cam1"));

    session.shutdown();
    assert_eq!(session.state(), SessionState::Closed);
    eventually("second channel closed", || backend.closes.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn test_operator_http_surface() {
    let backend = Arc::new(Backend::default());
    let addr = spawn_backend(backend.clone()).await;
    let Fixture {
        registry,
        session,
        metrics,
    } = fixture(&addr);
    let settings = Arc::new(
        SettingsSync::new(&format!("http://{}/security/mediapipe", addr)).unwrap(),
    );

    let state = SharedState {
        session: session.clone(),
        registry,
        settings,
        metrics,
        font: None,
        preview_delay_ms: 10,
        preview_quality: 60,
    };
    let server = HttpServer::new(state, "127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", server.local_addr().unwrap());
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = server.run(shutdown_tx.subscribe()).await.unwrap();
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "Available");

    let devices: serde_json::Value = client
        .get(format!("{}/devices?refresh=true", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(devices["selected"], "cam1");
    assert_eq!(devices["devices"][0]["display_name"], "Camera 1");

    let selected = client
        .post(format!("{}/devices/select?id=cam1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(selected.status(), StatusCode::OK);
    eventually("monitoring", || session.state() == SessionState::Monitoring).await;

    let status: serde_json::Value = client
        .get(format!("{}/session/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "Monitoring");
    assert_eq!(status["status"], "Connected");

    let held = client
        .post(format!("{}/session/navigate", base))
        .json(&serde_json::json!({ "target": "/cats" }))
        .send()
        .await
        .unwrap();
    assert_eq!(held.status(), StatusCode::CONFLICT);
    let held: serde_json::Value = held.json().await.unwrap();
    assert_eq!(held["outcome"], "confirm");

    let stayed: serde_json::Value = client
        .post(format!("{}/session/navigate/resolve?leave=false", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stayed["outcome"], "stayed");
    assert_eq!(session.state(), SessionState::Monitoring);

    let calls = backend.settings_calls.load(Ordering::SeqCst);
    let rejected = client
        .post(format!("{}/settings/interval?interval=31", base))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(backend.settings_calls.load(Ordering::SeqCst), calls);

    let accepted = client
        .post(format!("{}/settings/interval?interval=15", base))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);
    let settings: serde_json::Value = client
        .get(format!("{}/settings", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settings["frameInterval"], 15);

    let overlay = session.overlay();
    eventually("annotation", || !stroke_rects(&overlay.ops()).is_empty()).await;
    let metrics = client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("annotations"));

    session.shutdown();
    drop(client);
    let _ = shutdown_tx.send(());
    handle.await.unwrap().unwrap();
}
