use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cadence_opencode_client::{
    CadenceError, ListSessionsQuery, OpencodeClient, PermissionReply, PromptRequest, ServerEvent,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
    event_senders: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MockState {
    fn record(&self, uri: &Uri) {
        self.requests.lock().expect("requests lock").push(uri.to_string());
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn event_sender(&self, index: usize) -> mpsc::UnboundedSender<Vec<u8>> {
        self.event_senders.lock().expect("senders lock")[index].clone()
    }
}

async fn spawn_mock() -> (String, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    let router = Router::new()
        .route("/config", get(get_config))
        .route("/session", get(list_sessions))
        .route("/session/:id/message", get(get_messages).post(post_prompt))
        .route("/permission/:id/reply", post(post_reply))
        .route("/event", get(get_events))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock server");
    });
    (format!("http://{addr}"), state)
}

async fn get_config(State(state): State<Arc<MockState>>, uri: Uri) -> Json<Value> {
    state.record(&uri);
    Json(json!({"model": "anthropic/claude", "theme": "dark"}))
}

async fn list_sessions(State(state): State<Arc<MockState>>, uri: Uri) -> Json<Value> {
    state.record(&uri);
    Json(json!([
        {"id": "s1", "title": "First", "time": {"created": 1, "updated": 5}},
        {"id": "s2", "title": "Second", "time": {"created": 2, "updated": 3}}
    ]))
}

async fn get_messages(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    uri: Uri,
) -> Response {
    state.record(&uri);
    if id == "missing" {
        return (StatusCode::NOT_FOUND, "session missing").into_response();
    }
    Json(json!([{
        "info": {"id": "m1", "sessionID": id, "role": "user", "time": {"created": 10}},
        "parts": [{"id": "p1", "sessionID": id, "messageID": "m1", "type": "text", "text": "hi"}]
    }]))
    .into_response()
}

async fn post_prompt(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.record(&uri);
    state.bodies.lock().expect("bodies lock").push(body);
    Json(json!({"info": {"id": "m2"}}))
}

async fn post_reply(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    uri: Uri,
    Json(body): Json<Value>,
) -> Response {
    state.record(&uri);
    state.bodies.lock().expect("bodies lock").push(body);
    if id == "gone" {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "unknown request"}))).into_response();
    }
    if id == "stall" {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    Json(json!(true)).into_response()
}

async fn get_events(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
) -> Response {
    state.record(&uri);
    if query.get("directory").map(String::as_str) == Some("/forbidden") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no events for you").into_response();
    }
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.event_senders.lock().expect("senders lock").push(tx);
    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .expect("event response")
}

#[tokio::test]
async fn every_call_carries_the_working_directory() {
    let (base_url, state) = spawn_mock().await;
    let client = OpencodeClient::new(&format!("{base_url}/"), "/work/one");

    let config = client.get_config().await.expect("config");
    assert_eq!(config.model.as_deref(), Some("anthropic/claude"));

    let sessions = client
        .list_sessions(&ListSessionsQuery {
            search: Some("deploy".to_string()),
            limit: Some(200),
            roots: Some(false),
        })
        .await
        .expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].updated_at(), Some(5));

    client.set_working_context("/work/two");
    let messages = client.session_messages("s1", Some(200)).await.expect("messages");
    assert_eq!(messages[0].text(), "hi");

    assert_eq!(
        state.requests(),
        vec![
            "/config?directory=%2Fwork%2Fone".to_string(),
            "/session?directory=%2Fwork%2Fone&search=deploy&limit=200&roots=false".to_string(),
            "/session/s1/message?directory=%2Fwork%2Ftwo&limit=200".to_string(),
        ]
    );
}

#[tokio::test]
async fn non_success_status_carries_code_and_body() {
    let (base_url, _state) = spawn_mock().await;
    let client = OpencodeClient::new(&base_url, "/work");

    let err = client
        .session_messages("missing", None)
        .await
        .expect_err("missing session");
    match err {
        CadenceError::Http { status, body } => {
            assert_eq!(status, 404);
            assert_eq!(body, "session missing");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let err = client
        .reply_permission("gone", PermissionReply::Once, None)
        .await
        .expect_err("unknown request");
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn connection_failure_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = OpencodeClient::new(&format!("http://{addr}"), "/work");
    let err = client.list_agents().await.expect_err("nothing listening");
    assert!(matches!(err, CadenceError::Connection { .. }), "{err:?}");
}

#[tokio::test]
async fn hung_reply_fails_once_the_request_timeout_passes() {
    let (base_url, state) = spawn_mock().await;
    let client =
        OpencodeClient::new(&base_url, "/work").with_request_timeout(Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let err = client
        .reply_permission("stall", PermissionReply::Once, None)
        .await
        .expect_err("server never answers");
    assert!(matches!(err, CadenceError::Connection { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(state.requests().len(), 1);

    // The bound is per call; the client stays usable.
    assert!(client
        .reply_permission("r1", PermissionReply::Once, None)
        .await
        .expect("reply"));
}

#[tokio::test]
async fn prompt_and_reply_bodies_match_the_wire_contract() {
    let (base_url, state) = spawn_mock().await;
    let client = OpencodeClient::new(&base_url, "/work");

    let mut prompt = PromptRequest::text("list files");
    prompt.agent = Some("build".to_string());
    client.prompt("s1", &prompt).await.expect("prompt");
    assert!(client
        .reply_permission("r1", PermissionReply::Always, Some("trusted"))
        .await
        .expect("reply"));

    let bodies = state.bodies.lock().expect("bodies lock").clone();
    assert_eq!(
        bodies[0],
        json!({"agent": "build", "parts": [{"type": "text", "text": "list files"}]})
    );
    assert_eq!(bodies[1], json!({"reply": "always", "message": "trusted"}));
}

#[tokio::test]
async fn event_stream_decodes_chunks_until_server_closes() {
    let (base_url, state) = spawn_mock().await;
    let client = OpencodeClient::new(&base_url, "/work");

    let mut events = client
        .subscribe_events(CancellationToken::new())
        .await
        .expect("subscribe");
    let sender = state.event_sender(0);

    let frame = r#"data: {"type":"message.part.updated","properties":{"part":{"id":"p1","messageID":"m1","sessionID":"s1","type":"text"},"delta":"ünïcode"}}"#;
    let bytes = format!("{frame}\n\ndata: {{broken\n\n").into_bytes();
    // Split inside the two-byte `ü`.
    let split = frame.find('ü').expect("umlaut") + 1;
    sender.send(bytes[..split].to_vec()).expect("send head");
    sender.send(bytes[split..].to_vec()).expect("send tail");
    sender
        .send(b"data: {\"type\":\"session.idle\",\"properties\":{\"sessionID\":\"s1\"}}\n\n".to_vec())
        .expect("send idle");

    let first = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("first event in time")
        .expect("first event")
        .expect("first ok");
    let ServerEvent::MessagePartUpdated(update) = ServerEvent::from_value(first).expect("parse")
    else {
        panic!("expected part update");
    };
    assert_eq!(update.delta.as_deref(), Some("ünïcode"));

    let second = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("second event in time")
        .expect("second event")
        .expect("second ok");
    assert_eq!(second["type"], "session.idle");

    drop(sender);
    state.event_senders.lock().expect("senders lock").clear();
    let end = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("stream end in time");
    assert!(end.is_none());

    assert_eq!(state.requests(), vec!["/event?directory=%2Fwork".to_string()]);
}

#[tokio::test]
async fn cancelling_the_token_ends_the_event_stream() {
    let (base_url, _state) = spawn_mock().await;
    let client = OpencodeClient::new(&base_url, "/work");
    let token = CancellationToken::new();

    let mut events = client.subscribe_events(token.clone()).await.expect("subscribe");
    token.cancel();
    let end = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("cancel observed");
    assert!(end.is_none());
}

#[tokio::test]
async fn event_subscription_rejects_non_success_status() {
    let (base_url, _state) = spawn_mock().await;
    let client = OpencodeClient::new(&base_url, "/forbidden");

    let err = match client.subscribe_events(CancellationToken::new()).await {
        Ok(_) => panic!("expected subscription to fail"),
        Err(err) => err,
    };
    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("no events for you"));
}
