//! End-to-end relay tests: a real axum server on a loopback port, real
//! WebSocket clients and the in-memory broker with fault injection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codevec_core::config::{GatewayConfig, WorkerConfig};
use codevec_core::worker::ProcessOutcome;
use codevec_core::{task, AnswerSource, FragmentStream, Step, StreamEvent, TaskExecutor, WorkerPool};
use codevec_redis::{Broker, MemoryBroker, MemoryTaskQueue};
use codevec_web::{create_router, AppState, RelaySettings, TokenVerifier};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "relay-secret";
const WAIT: Duration = Duration::from_secs(3);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    url: String,
    state: AppState,
    broker: MemoryBroker,
    queue: Arc<MemoryTaskQueue>,
}

fn fast_gateway() -> GatewayConfig {
    GatewayConfig {
        poll_interval_ms: 20,
        inbound_timeout_ms: 100,
        reconnect_initial_ms: 10,
        reconnect_max_ms: 50,
        reconnect_jitter: 0.0,
        ..GatewayConfig::default()
    }
}

async fn start(config: GatewayConfig) -> Harness {
    let broker = MemoryBroker::new();
    let queue = Arc::new(MemoryTaskQueue::new(3));
    let state = AppState::new(
        Arc::new(broker.clone()),
        queue.clone(),
        TokenVerifier::new(Some(SECRET)),
        RelaySettings::from(&config),
    );

    let app = create_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        url: format!("ws://{}", addr),
        state,
        broker,
        queue,
    }
}

fn token() -> String {
    let claims = serde_json::json!({
        "sub": "tester",
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn open(h: &Harness, path: &str) -> Client {
    let (ws, _) = connect_async(format!("{}{}", h.url, path)).await.unwrap();
    ws
}

/// Attach to a session and wait for the handshake, which proves the
/// subscription is live.
async fn attach(h: &Harness, session: &str) -> Client {
    let mut ws = open(h, &format!("/socket/ws/{}?token={}", session, token())).await;
    let first = next_text(&mut ws).await.expect("no handshake");
    assert!(first.contains("Connection established"), "unexpected first frame: {}", first);
    ws
}

/// Next text frame, or `None` if the socket closed or nothing arrived in time.
async fn next_text(ws: &mut Client) -> Option<String> {
    recv_text(ws, WAIT).await
}

async fn recv_text(ws: &mut Client, wait: Duration) -> Option<String> {
    let read = async {
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => return Some(text.as_str().to_string()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    };
    tokio::time::timeout(wait, read).await.ok().flatten()
}

/// Read until the close frame and return its code.
async fn close_code(ws: &mut Client) -> Option<u16> {
    let read = async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Close(frame) = msg {
                return frame.map(|f| u16::from(f.code));
            }
        }
        None
    };
    tokio::time::timeout(WAIT, read).await.ok().flatten()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn decode_event(text: &str) -> Option<StreamEvent> {
    StreamEvent::decode(text).ok()
}

struct Scripted(Vec<&'static str>);

#[async_trait]
impl AnswerSource for Scripted {
    async fn answer(&self, _session_id: &str, _query: &str) -> anyhow::Result<FragmentStream> {
        let items: Vec<anyhow::Result<String>> = self.0.iter().map(|s| Ok(s.to_string())).collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

#[tokio::test]
async fn test_streamed_answer_reaches_attached_client_only() {
    let h = start(fast_gateway()).await;
    let mut early = attach(&h, "s1").await;

    let handle = task::enqueue(h.queue.as_ref(), "why?", "s1").await.unwrap();
    let executor = Arc::new(TaskExecutor::new(
        Arc::new(h.broker.clone()),
        Arc::new(Scripted(vec!["answer", " is 42"])),
    ));
    let pool = WorkerPool::new(h.queue.clone(), executor, &WorkerConfig::default());
    let outcome = pool.process_one(Duration::from_millis(100)).await.unwrap();
    assert_eq!(
        outcome,
        Some(ProcessOutcome::Completed { task_id: handle.to_string(), chunks: 2 })
    );

    let mut events = Vec::new();
    while events.len() < 4 {
        let text = next_text(&mut early).await.expect("stream ended early");
        if let Some(event) = decode_event(&text) {
            events.push(event);
        }
    }
    let steps: Vec<Step> = events.iter().map(|e| e.step).collect();
    assert_eq!(steps, vec![Step::Start, Step::Chunk, Step::Chunk, Step::Complete]);
    assert_eq!(events[1].data, "answer");
    assert_eq!(events[2].data, " is 42");

    // Nothing is replayed to a client that attaches after completion.
    let mut late = attach(&h, "s1").await;
    assert!(recv_text(&mut late, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn test_connection_survives_broker_outage() {
    let h = start(fast_gateway()).await;
    let mut ws = attach(&h, "s2").await;
    assert_eq!(h.broker.subscribe_count(), 1);

    h.broker.refuse_subscribes(2);
    h.broker.sever();
    let broker = h.broker.clone();
    assert!(eventually(|| broker.subscribe_count() == 2).await);

    let event = StreamEvent::chunk("after outage");
    h.broker.publish("stream:s2", &event.to_json().unwrap()).await.unwrap();

    let text = next_text(&mut ws).await.expect("socket closed during outage");
    assert_eq!(decode_event(&text).unwrap().data, "after outage");
    assert_eq!(h.state.registry.listener_count("s2"), 1);
}

#[tokio::test]
async fn test_disconnect_mid_stream_releases_everything() {
    let h = start(fast_gateway()).await;
    let mut ws = attach(&h, "s3").await;
    assert_eq!(h.state.registry.listener_count("s3"), 1);

    for i in 0..20 {
        let chunk = StreamEvent::chunk(format!("part {}", i));
        h.broker.publish("stream:s3", &chunk.to_json().unwrap()).await.unwrap();
    }
    ws.close(None).await.unwrap();
    drop(ws);

    let registry = h.state.registry.clone();
    assert!(eventually(|| registry.is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.broker.unsubscribe_count(), 1);
}

#[tokio::test]
async fn test_abrupt_drop_releases_everything() {
    let h = start(fast_gateway()).await;
    let ws = attach(&h, "s3b").await;
    h.broker
        .publish("stream:s3b", &StreamEvent::chunk("x").to_json().unwrap())
        .await
        .unwrap();
    drop(ws);

    let registry = h.state.registry.clone();
    assert!(eventually(|| registry.is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.broker.unsubscribe_count(), 1);
}

#[tokio::test]
async fn test_unparseable_payload_is_delivered_as_text() {
    let h = start(fast_gateway()).await;
    let mut ws = attach(&h, "s4").await;

    h.broker.publish("stream:s4", "not json at all").await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("not json at all"));
}

#[tokio::test]
async fn test_unknown_fields_reach_the_client_unchanged() {
    let h = start(fast_gateway()).await;
    let mut ws = attach(&h, "s4b").await;

    let event = r#"{"step":"chunk","timestamp":1.5,"data":"x","task_id":"t-1"}"#;
    h.broker.publish("stream:s4b", event).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some(event));

    let chat = r#"{"type":"chat","message":"hi","from":"alice"}"#;
    ws.send(Message::Text(chat.into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some(chat));
}

#[tokio::test]
async fn test_bad_or_missing_token_closes_with_policy_violation() {
    let h = start(fast_gateway()).await;

    let mut ws = open(&h, "/socket/ws/s5?token=not-a-jwt").await;
    assert_eq!(close_code(&mut ws).await, Some(1008));

    let mut ws = open(&h, "/socket/ws/s5").await;
    assert_eq!(close_code(&mut ws).await, Some(1008));

    let mut ws = open(&h, &format!("/socket/ws/?token={}", token())).await;
    assert_eq!(close_code(&mut ws).await, Some(1008));

    let mut ws = open(&h, &format!("/socket/ws/%20?token={}", token())).await;
    assert_eq!(close_code(&mut ws).await, Some(1008));

    assert_eq!(h.broker.subscribe_count(), 0);
    assert!(h.state.registry.is_empty());
}

#[tokio::test]
async fn test_broker_down_at_connect_closes_with_internal_error() {
    let h = start(fast_gateway()).await;
    h.broker.refuse_subscribes(1);

    let mut ws = open(&h, &format!("/socket/ws/s6?token={}", token())).await;
    let text = next_text(&mut ws).await.expect("no error notice");
    let notice: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(notice["type"], "error");
    assert_eq!(notice["message"], "Failed to connect to message server");
    assert_eq!(close_code(&mut ws).await, Some(1011));
    assert!(h.state.registry.is_empty());
}

#[tokio::test]
async fn test_reconnect_ceiling_closes_with_internal_error() {
    let config = GatewayConfig {
        max_reconnect_attempts: Some(2),
        ..fast_gateway()
    };
    let h = start(config).await;
    let mut ws = attach(&h, "s7").await;

    h.broker.refuse_subscribes(10);
    h.broker.sever();
    assert_eq!(close_code(&mut ws).await, Some(1011));

    let registry = h.state.registry.clone();
    assert!(eventually(|| registry.is_empty()).await);
}

#[tokio::test]
async fn test_client_frames_are_published_when_allowed() {
    let h = start(fast_gateway()).await;
    let mut ws = attach(&h, "s8").await;

    ws.send(Message::Text("hello from client".into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("hello from client"));
    assert!(h.broker.published("stream:s8").contains(&"hello from client".to_string()));
}

#[tokio::test]
async fn test_client_frames_are_dropped_when_disallowed() {
    let config = GatewayConfig {
        allow_client_publish: false,
        ..fast_gateway()
    };
    let h = start(config).await;
    let mut ws = attach(&h, "s9").await;

    ws.send(Message::Text("ignored".into())).await.unwrap();
    assert!(recv_text(&mut ws, Duration::from_millis(300)).await.is_none());
    assert!(!h.broker.published("stream:s9").contains(&"ignored".to_string()));
}

#[tokio::test]
async fn test_server_shutdown_tears_down_connections() {
    let h = start(fast_gateway()).await;
    let mut a = attach(&h, "s10").await;
    let mut b = attach(&h, "s10").await;
    assert_eq!(h.state.registry.listener_count("s10"), 2);

    h.state.shutdown.cancel();
    assert_eq!(close_code(&mut a).await, Some(1001));
    assert_eq!(close_code(&mut b).await, Some(1001));
    let registry = h.state.registry.clone();
    assert!(eventually(|| registry.is_empty()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.broker.unsubscribe_count(), 2);
}
