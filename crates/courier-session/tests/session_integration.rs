#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the session engine, driven through a scripted
//! in-memory server speaking the real wire format.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{CourierError, ErrorObject, TransportError};
use courier_session::{CallOptions, RetryPolicy, Session, SessionConfig, SessionState};
use courier_transport::memory::{pair, MemoryTransport};
use courier_transport::{Transport, TransportResult};
use courier_wire::{codec, Envelope, Notification, Request, RequestId};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn recv_frame(server: &MemoryTransport) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(2), server.recv())
        .await
        .expect("server timed out waiting for a frame")
        .unwrap()
        .expect("client closed the transport unexpectedly")
}

async fn expect_request(server: &MemoryTransport) -> Request {
    match codec::decode(&recv_frame(server).await).unwrap() {
        Envelope::Request(req) => req,
        other => panic!("expected request, got {other:?}"),
    }
}

async fn expect_notification(server: &MemoryTransport) -> Notification {
    match codec::decode(&recv_frame(server).await).unwrap() {
        Envelope::Notification(n) => n,
        other => panic!("expected notification, got {other:?}"),
    }
}

async fn respond(server: &MemoryTransport, id: RequestId, result: Value) {
    let frame = codec::encode(&Envelope::response(id, result)).unwrap();
    server.send(frame).await.unwrap();
}

async fn respond_error(server: &MemoryTransport, id: RequestId, code: i64, message: &str) {
    let frame = codec::encode(&Envelope::error_response(id, ErrorObject::new(code, message)))
        .unwrap();
    server.send(frame).await.unwrap();
}

async fn notify(server: &MemoryTransport, method: &str, params: Value) {
    let frame = codec::encode(&Envelope::notification(method, Some(params))).unwrap();
    server.send(frame).await.unwrap();
}

/// Answers one `initialize` request and consumes the follow-up
/// `notifications/initialized`.
async fn run_handshake(server: &MemoryTransport, version: &str, capabilities: Value) {
    let req = expect_request(server).await;
    assert_eq!(req.method, "initialize");
    respond(
        server,
        req.id,
        json!({
            "protocolVersion": version,
            "capabilities": capabilities,
            "serverInfo": {"name": "scripted-server", "version": "0.0.1"}
        }),
    )
    .await;
    let note = expect_notification(server).await;
    assert_eq!(note.method, "notifications/initialized");
}

/// Opens a session against a fresh scripted server and completes the
/// handshake with the given capability set.
async fn connect_ready(capabilities: Value) -> (Session, MemoryTransport) {
    init_logging();
    let (client_end, server_end) = pair();
    let session = Session::open(client_end, SessionConfig::default());
    let (result, ()) = tokio::join!(
        session.initialize(),
        run_handshake(&server_end, "2025-03-26", capabilities)
    );
    result.unwrap();
    (session, server_end)
}

async fn wait_for_state<F>(session: &Session, pred: F)
where
    F: Fn(&SessionState) -> bool,
{
    for _ in 0..200 {
        if pred(&session.state()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never reached the expected state, last: {}", session.state());
}

/// A transport whose next `fail_next` sends fail with a transient error.
struct FlakyTransport {
    inner: MemoryTransport,
    fail_next: Arc<AtomicU32>,
    send_attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn send(&self, frame: Vec<u8>) -> TransportResult<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Timeout);
        }
        self.inner.send(frame).await
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        self.inner.recv().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }
}

// ---------------------------------------------------------------------------
// 1. Handshake: version negotiation and capability adoption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_negotiates_minimum_version() {
    init_logging();
    let (client_end, server_end) = pair();
    let session = Session::open(client_end, SessionConfig::default());

    let driver = async {
        let req = expect_request(&server_end).await;
        assert_eq!(req.method, "initialize");
        let params = req.params.clone().unwrap();
        assert_eq!(params["protocolVersion"], "2025-03-26");
        assert_eq!(params["clientInfo"]["name"], "courier");
        respond(
            &server_end,
            req.id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "older-server", "version": "1.2.0"}
            }),
        )
        .await;
        let note = expect_notification(&server_end).await;
        assert_eq!(note.method, "notifications/initialized");
    };

    let (result, ()) = tokio::join!(session.initialize(), driver);
    let init = result.unwrap();

    // The raw response keeps the server's version; the session adopts
    // the negotiated minimum.
    assert_eq!(init.protocol_version, "2024-11-05");
    assert_eq!(session.protocol_version().unwrap(), "2024-11-05");
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.server_info().unwrap().name, "older-server");

    // The capability set is exactly what the server advertised.
    let caps = session.server_capabilities().unwrap();
    assert!(caps.tools.is_some());
    assert!(caps.resources.is_none());
    assert!(caps.prompts.is_none());
}

#[tokio::test]
async fn handshake_rejects_out_of_range_version() {
    init_logging();
    let (client_end, server_end) = pair();
    let session = Session::open(client_end, SessionConfig::default());

    let driver = async {
        let req = expect_request(&server_end).await;
        respond(
            &server_end,
            req.id,
            json!({"protocolVersion": "2023-01-01", "capabilities": {}}),
        )
        .await;
    };

    let (result, ()) = tokio::join!(session.initialize(), driver);
    let err = result.unwrap_err();
    assert!(matches!(err, CourierError::Handshake(_)));
    // The session never reaches ready.
    assert_ne!(session.state(), SessionState::Ready);
    assert!(matches!(
        session.list_tools().await.unwrap_err(),
        CourierError::Handshake(_)
    ));
}

#[tokio::test]
async fn operations_before_initialize_fail_without_sending() {
    init_logging();
    let (client_end, server_end) = pair();
    let session = Session::open(client_end, SessionConfig::default());

    let err = session.list_tools().await.unwrap_err();
    assert!(matches!(err, CourierError::Handshake(_)));

    // Nothing went out on the wire.
    let nothing = tokio::time::timeout(Duration::from_millis(50), server_end.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn second_initialize_is_rejected() {
    let (session, _server) = connect_ready(json!({"tools": {}})).await;
    let err = session.initialize().await.unwrap_err();
    assert!(matches!(err, CourierError::Handshake(_)));
    assert!(err.to_string().contains("already initialized"));
}

// ---------------------------------------------------------------------------
// 2. Correlation: out-of-order, unknown, and duplicate responses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_calls_resolve_out_of_request_order() {
    let (session, server) = connect_ready(json!({"resources": {}})).await;

    let driver = async {
        let first = expect_request(&server).await;
        let second = expect_request(&server).await;
        // Answer in reverse arrival order.
        for req in [second, first] {
            let uri = req.params.as_ref().unwrap()["uri"].as_str().unwrap().to_string();
            respond(
                &server,
                req.id,
                json!({"contents": [{"uri": uri, "text": format!("body of {uri}")}]}),
            )
            .await;
        }
    };

    let (a, b, ()) = tokio::join!(
        session.read_resource("file:///alpha"),
        session.read_resource("file:///beta"),
        driver
    );

    let a = a.unwrap();
    assert_eq!(a.contents[0].uri, "file:///alpha");
    assert_eq!(a.contents[0].text.as_deref(), Some("body of file:///alpha"));
    let b = b.unwrap();
    assert_eq!(b.contents[0].uri, "file:///beta");
    assert_eq!(session.outstanding_calls(), 0);
}

#[tokio::test]
async fn unknown_response_id_is_ignored() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;

    // Unsolicited response: dropped without failing anything.
    respond(&server, RequestId::Number(9999), json!({"ghost": true})).await;

    let driver = async {
        let req = expect_request(&server).await;
        assert_eq!(req.method, "tools/list");
        respond(&server, req.id, json!({"tools": [{"name": "echo"}]})).await;
    };
    let (tools, ()) = tokio::join!(session.list_tools(), driver);
    let tools = tools.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
}

#[tokio::test]
async fn duplicate_response_is_delivered_exactly_once() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;

    let driver = async {
        let req = expect_request(&server).await;
        respond(&server, req.id.clone(), json!({"tools": [{"name": "first"}]})).await;
        // A misbehaving server repeats itself; the duplicate goes nowhere.
        respond(&server, req.id, json!({"tools": [{"name": "second"}]})).await;
    };
    let (tools, ()) = tokio::join!(session.list_tools(), driver);
    assert_eq!(tools.unwrap()[0].name, "first");

    // The session is still healthy afterwards.
    let driver = async {
        let req = expect_request(&server).await;
        respond(&server, req.id, json!({"tools": []})).await;
    };
    let (tools, ()) = tokio::join!(session.list_tools(), driver);
    assert!(tools.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// 3. Tool calls: results, application errors, progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn call_tool_surfaces_result_content() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;

    let driver = async {
        let req = expect_request(&server).await;
        assert_eq!(req.method, "tools/call");
        let params = req.params.clone().unwrap();
        assert_eq!(params["name"], "search_files");
        assert_eq!(params["arguments"]["query"], "TODO");
        respond(
            &server,
            req.id,
            json!({"content": [{"type": "text", "text": "3 matches"}], "isError": false}),
        )
        .await;
    };
    let (result, ()) = tokio::join!(
        session.call_tool("search_files", json!({"query": "TODO", "path": "/projects"})),
        driver
    );
    let result = result.unwrap();
    assert!(!result.is_error);
    assert_eq!(result.text(), "3 matches");
}

#[tokio::test]
async fn application_error_is_the_calls_result_not_a_fault() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;

    let driver = async {
        let req = expect_request(&server).await;
        respond_error(&server, req.id, -32601, "Method not found").await;
    };
    let (result, ()) = tokio::join!(session.call_tool("nope", json!({})), driver);
    match result.unwrap_err() {
        CourierError::Application(err) => {
            assert_eq!(err.code, -32601);
            assert_eq!(err.message, "Method not found");
        }
        other => panic!("expected application error, got {other}"),
    }
    // One bad call does not take the session down.
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn progress_events_arrive_in_order_and_orphans_are_dropped() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;
    let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let options = CallOptions::new().on_progress(move |event| {
        sink.lock().unwrap().push(event.progress);
    });

    let driver = async {
        let req = expect_request(&server).await;
        let token = req.params.as_ref().unwrap()["_meta"]["progressToken"].clone();
        for step in 1..=3 {
            notify(
                &server,
                "notifications/progress",
                json!({"progressToken": token, "progress": step, "total": 3}),
            )
            .await;
        }
        // An event for a token nobody registered is silently discarded.
        notify(
            &server,
            "notifications/progress",
            json!({"progressToken": "orphan", "progress": 99}),
        )
        .await;
        respond(
            &server,
            req.id,
            json!({"content": [{"type": "text", "text": "done"}]}),
        )
        .await;
    };

    let (result, ()) = tokio::join!(
        session.call_tool_with("index", json!({}), options),
        driver
    );
    assert_eq!(result.unwrap().text(), "done");
    assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0, 3.0]);
}

// ---------------------------------------------------------------------------
// 4. Capability gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operations_outside_negotiated_capabilities_fail_fast() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;

    assert!(matches!(
        session.list_resources().await.unwrap_err(),
        CourierError::Capability(_)
    ));
    assert!(matches!(
        session.read_resource("file:///x").await.unwrap_err(),
        CourierError::Capability(_)
    ));
    assert!(matches!(
        session.list_prompts().await.unwrap_err(),
        CourierError::Capability(_)
    ));
    assert!(matches!(
        session.get_prompt("greet", None).await.unwrap_err(),
        CourierError::Capability(_)
    ));

    // Gating happens before any network interaction.
    let nothing = tokio::time::timeout(Duration::from_millis(50), server.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn prompts_flow_works_when_advertised() {
    let (session, server) = connect_ready(json!({"prompts": {}})).await;

    let driver = async {
        let req = expect_request(&server).await;
        assert_eq!(req.method, "prompts/list");
        respond(&server, req.id, json!({"prompts": [{"name": "summarize"}]})).await;

        let req = expect_request(&server).await;
        assert_eq!(req.method, "prompts/get");
        assert_eq!(req.params.as_ref().unwrap()["arguments"]["path"], "/etc/hosts");
        respond(
            &server,
            req.id,
            json!({"messages": [
                {"role": "user", "content": {"type": "text", "text": "Summarize /etc/hosts"}}
            ]}),
        )
        .await;
    };

    let work = async {
        let prompts = session.list_prompts().await.unwrap();
        assert_eq!(prompts[0].name, "summarize");
        let rendered = session
            .get_prompt("summarize", Some(json!({"path": "/etc/hosts"})))
            .await
            .unwrap();
        assert_eq!(rendered.messages.len(), 1);
    };

    tokio::join!(work, driver);
}

// ---------------------------------------------------------------------------
// 5. Close, fault, and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_fails_every_outstanding_call() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;
    let session = Arc::new(session);

    let mut calls = Vec::new();
    for i in 0..3 {
        let session = Arc::clone(&session);
        calls.push(tokio::spawn(async move {
            session.call_tool("slow", json!({"n": i})).await
        }));
    }

    // Wait until all three are on the wire (and therefore registered).
    for _ in 0..3 {
        let req = expect_request(&server).await;
        assert_eq!(req.method, "tools/call");
    }
    assert_eq!(session.outstanding_calls(), 3);

    session.close().await.unwrap();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CourierError::SessionClosed(_)));
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.outstanding_calls(), 0);

    // Idempotent, and later operations fail with the same kind.
    session.close().await.unwrap();
    assert!(matches!(
        session.call_tool("late", json!({})).await.unwrap_err(),
        CourierError::SessionClosed(_)
    ));
}

#[tokio::test]
async fn transport_loss_faults_the_session() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;
    let session = Arc::new(session);

    let pending = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.call_tool("search_files", json!({})).await })
    };
    let _req = expect_request(&server).await;

    // The server goes away mid-call.
    server.close().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CourierError::SessionClosed(_)));
    assert!(err.to_string().contains("fault"));

    wait_for_state(&session, |s| matches!(s, SessionState::Faulted(_))).await;

    // Operations on a faulted session fail immediately, before any send.
    let err = session
        .call_tool("search_files", json!({"query": "TODO", "path": "/projects"}))
        .await
        .unwrap_err();
    assert!(matches!(err, CourierError::SessionClosed(_)));

    // Close on a faulted session is a clean no-op and keeps the state.
    session.close().await.unwrap();
    assert!(matches!(session.state(), SessionState::Faulted(_)));
}

#[tokio::test]
async fn cancelled_call_drops_its_late_response() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;
    let session = Arc::new(session);
    let token = CancellationToken::new();

    let pending = {
        let session = Arc::clone(&session);
        let options = CallOptions::new().cancel_token(token.clone());
        tokio::spawn(async move { session.call_tool_with("slow", json!({}), options).await })
    };

    let req = expect_request(&server).await;
    token.cancel();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CourierError::Cancelled(_)));

    // Best-effort cancellation notification reaches the server.
    let note = expect_notification(&server).await;
    assert_eq!(note.method, "notifications/cancelled");
    assert_eq!(note.params.as_ref().unwrap()["requestId"], json!(req.id.clone()));

    // The late response finds no slot and is dropped.
    respond(&server, req.id, json!({"content": []})).await;

    let driver = async {
        let req = expect_request(&server).await;
        respond(&server, req.id, json!({"tools": []})).await;
    };
    let (tools, ()) = tokio::join!(session.list_tools(), driver);
    assert!(tools.unwrap().is_empty());
}

#[tokio::test]
async fn timeout_cancels_the_call() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;

    let options = CallOptions::new().timeout(Duration::from_millis(100));
    let (result, req) = tokio::join!(
        session.call_tool_with("stuck", json!({}), options),
        expect_request(&server)
    );

    let err = result.unwrap_err();
    assert!(matches!(err, CourierError::Cancelled(_)));
    assert!(err.to_string().contains("timed out"));

    let note = expect_notification(&server).await;
    assert_eq!(note.method, "notifications/cancelled");
    assert_eq!(note.params.as_ref().unwrap()["requestId"], json!(req.id));
    assert_eq!(session.outstanding_calls(), 0);
}

#[tokio::test]
async fn dropping_the_session_releases_the_transport() {
    init_logging();
    let (client_end, server_end) = pair();
    let session = Session::open(client_end, SessionConfig::default());
    drop(session);

    // The detached dispatch task closes the transport on its way out.
    let end = tokio::time::timeout(Duration::from_secs(2), server_end.recv())
        .await
        .expect("transport was never released")
        .unwrap();
    assert!(end.is_none());
}

// ---------------------------------------------------------------------------
// 6. Retry policy
// ---------------------------------------------------------------------------

async fn connect_flaky() -> (Session, MemoryTransport, Arc<AtomicU32>, Arc<AtomicU32>) {
    init_logging();
    let (client_end, server_end) = pair();
    let fail_next = Arc::new(AtomicU32::new(0));
    let send_attempts = Arc::new(AtomicU32::new(0));
    let transport = FlakyTransport {
        inner: client_end,
        fail_next: Arc::clone(&fail_next),
        send_attempts: Arc::clone(&send_attempts),
    };
    let config = SessionConfig {
        retry: RetryPolicy {
            max_retries: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        },
        ..SessionConfig::default()
    };
    let session = Session::open(transport, config);
    let (result, ()) = tokio::join!(
        session.initialize(),
        run_handshake(&server_end, "2025-03-26", json!({"tools": {}}))
    );
    result.unwrap();
    (session, server_end, fail_next, send_attempts)
}

#[tokio::test]
async fn idempotent_operations_retry_through_transient_failures() {
    let (session, server, fail_next, _) = connect_flaky().await;

    // Two transient failures, then the third attempt reaches the server.
    fail_next.store(2, Ordering::SeqCst);
    let driver = async {
        let req = expect_request(&server).await;
        assert_eq!(req.method, "tools/list");
        respond(&server, req.id, json!({"tools": [{"name": "echo"}]})).await;
    };
    let (tools, ()) = tokio::join!(session.list_tools(), driver);
    assert_eq!(tools.unwrap().len(), 1);
    assert_eq!(session.outstanding_calls(), 0);
}

#[tokio::test]
async fn exhausted_retries_surface_the_final_transport_error() {
    let (session, server, fail_next, send_attempts) = connect_flaky().await;

    // More failures than the budget: one attempt plus three retries.
    fail_next.store(10, Ordering::SeqCst);
    let before = send_attempts.load(Ordering::SeqCst);
    let err = session.list_tools().await.unwrap_err();
    assert!(matches!(
        err,
        CourierError::Transport(TransportError::Timeout)
    ));
    assert_eq!(send_attempts.load(Ordering::SeqCst) - before, 4);

    // The server never saw anything.
    let nothing = tokio::time::timeout(Duration::from_millis(50), server.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn tool_calls_are_never_retried() {
    let (session, server, fail_next, send_attempts) = connect_flaky().await;

    fail_next.store(1, Ordering::SeqCst);
    let before = send_attempts.load(Ordering::SeqCst);
    let err = session.call_tool("write_file", json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        CourierError::Transport(TransportError::Timeout)
    ));
    // Exactly one send attempt: a tool call is not silently duplicated.
    assert_eq!(send_attempts.load(Ordering::SeqCst) - before, 1);

    let nothing = tokio::time::timeout(Duration::from_millis(50), server.recv()).await;
    assert!(nothing.is_err());
}

// ---------------------------------------------------------------------------
// 7. Notification handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registered_notification_handlers_receive_params() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    session.on_notification("notifications/message", move |params| {
        sink.lock().unwrap().push(params["data"].as_str().unwrap_or("").to_string());
    });

    notify(&server, "notifications/message", json!({"data": "hello"})).await;
    // A method without a handler is dropped without consequence.
    notify(&server, "notifications/unknown", json!({"data": "ignored"})).await;
    notify(&server, "notifications/message", json!({"data": "again"})).await;

    // Round-trip a request to be sure the notifications were dispatched.
    let driver = async {
        let req = expect_request(&server).await;
        respond(&server, req.id, json!({"tools": []})).await;
    };
    let (tools, ()) = tokio::join!(session.list_tools(), driver);
    tools.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string(), "again".to_string()]);
}

#[tokio::test]
async fn malformed_messages_are_contained() {
    let (session, server) = connect_ready(json!({"tools": {}})).await;

    // Undecodable junk and a malformed progress payload are both dropped
    // without faulting the session.
    server.send(b"this is not json".to_vec()).await.unwrap();
    notify(&server, "notifications/progress", json!({"no_token": true})).await;

    let driver = async {
        let req = expect_request(&server).await;
        respond(&server, req.id, json!({"tools": []})).await;
    };
    let (tools, ()) = tokio::join!(session.list_tools(), driver);
    tools.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
}
