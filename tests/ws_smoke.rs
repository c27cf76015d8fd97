use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use i4ops_stream::{
    ConnectionState, NoopListener, Severity, StreamClient, StreamConnection, StreamOptions,
    StreamSnapshot, SubscriptionFilters,
};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

const TEST_TOKEN: &str = "ws-session-token";
const WS_PATH: &str = "/api/security-events/ws";

#[derive(Debug)]
struct WsObserved {
    query: Option<String>,
    pongs: usize,
}

#[derive(Clone)]
struct WsState {
    expected_token: String,
    observed_tx: Arc<Mutex<Option<oneshot::Sender<WsObserved>>>>,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ws_text_frames_become_events_and_close_is_a_failure() {
    let (observed_tx, observed_rx) = oneshot::channel();
    let app = Router::new()
        .route(WS_PATH, get(ws_handler))
        .with_state(WsState {
            expected_token: TEST_TOKEN.to_string(),
            observed_tx: Arc::new(Mutex::new(Some(observed_tx))),
        });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = StreamClient::new(&ws_url(addr))
        .expect("client")
        .with_token(SecretString::new(TEST_TOKEN.to_string()))
        .with_options(
            StreamOptions::default()
                .with_auto_reconnect(false)
                .with_filters(SubscriptionFilters::all().with_severity([Severity::Critical])),
        );
    let connection = client.connect(NoopListener).expect("connect");

    let snapshot = wait(&connection, StreamSnapshot::has_error).await;
    assert_eq!(snapshot.events.len(), 1);
    assert_eq!(snapshot.events[0].severity(), Some(Severity::Critical));
    assert_eq!(snapshot.last_heartbeat, Some(9));
    assert_eq!(
        snapshot.last_error.as_deref(),
        Some("stream closed by server")
    );

    let observed = timeout(Duration::from_secs(5), observed_rx)
        .await
        .expect("server observation in time")
        .expect("server observation sent");
    assert_eq!(observed.query.as_deref(), Some("severity=critical"));
    assert!(observed.pongs >= 1, "ping was not answered: {observed:?}");

    let _ = shutdown_tx.send(());
    server_task.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ws_rejected_upgrade_surfaces_status() {
    let app = Router::new()
        .route(WS_PATH, get(ws_handler))
        .with_state(WsState {
            expected_token: TEST_TOKEN.to_string(),
            observed_tx: Arc::new(Mutex::new(None)),
        });
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = StreamClient::new(&ws_url(addr))
        .expect("client")
        .with_options(StreamOptions::default().with_auto_reconnect(false));
    let connection = client.connect(NoopListener).expect("connect");

    let snapshot = wait(&connection, StreamSnapshot::has_error).await;
    assert_eq!(snapshot.state, ConnectionState::Error);
    assert!(snapshot
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("401")));
    assert!(snapshot.events.is_empty());

    let _ = shutdown_tx.send(());
    server_task.abort();
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let expected = format!("Bearer {}", state.expected_token);
    let authorized = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == expected);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| serve_frames(socket, state, query))
}

async fn serve_frames(mut socket: WebSocket, state: WsState, query: Option<String>) {
    socket
        .send(Message::Ping(b"alive".to_vec()))
        .await
        .expect("send ping");

    let mut pongs = 0;
    let answered = timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = socket.recv().await {
            if let Message::Pong(_) = message {
                pongs += 1;
                return;
            }
        }
    })
    .await;
    assert!(answered.is_ok(), "client never answered ping");

    let event = json!({
        "type": "event",
        "data": { "id": 1, "vmId": 4, "severity": "critical", "rule": "egress" },
        "timestamp": 1_700_000_000_000_i64,
    });
    let heartbeat = json!({ "type": "heartbeat", "data": {}, "timestamp": 9 });
    socket
        .send(Message::Binary(vec![0, 1, 2]))
        .await
        .expect("send binary");
    socket
        .send(Message::Text(event.to_string()))
        .await
        .expect("send event");
    socket
        .send(Message::Text(heartbeat.to_string()))
        .await
        .expect("send heartbeat");

    if let Some(tx) = state.observed_tx.lock().await.take() {
        let _ = tx.send(WsObserved { query, pongs });
    }

    let _ = socket.send(Message::Close(None)).await;
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}{WS_PATH}")
}

async fn wait<F>(connection: &StreamConnection, predicate: F) -> StreamSnapshot
where
    F: FnMut(&StreamSnapshot) -> bool,
{
    timeout(Duration::from_secs(5), connection.wait_for(predicate))
        .await
        .expect("condition reached in time")
        .expect("worker running")
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}
