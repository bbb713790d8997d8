//! HTTP+SSE transport tests.
//!
//! Replies to POSTs travel on the event stream, so these cover endpoint
//! discovery and what happens to waiting requests when that stream is lost.

use std::sync::{Arc, Mutex};

use mcplink_core::{Message, RequestId, SessionState, TransportErrorKind};
use mcplink_testing::{MockServer, eventually, fixtures, init_tracing, with_default_timeout};
use mcplink_transport::customizer::OutboundRequest;
use mcplink_transport::http::HttpTransportBuilder;
use mcplink_transport::{BoxError, SseTransport, Transport, TransportContext, TransportError};
use reqwest::Method;
use serde_json::json;

fn context() -> TransportContext {
    TransportContext::empty().with("test-transport-context-key", "some-value")
}

fn transport(server: &MockServer) -> SseTransport {
    HttpTransportBuilder::new(server.base_url()).build_sse().unwrap()
}

// =============================================================================
// Endpoint discovery
// =============================================================================

#[tokio::test]
async fn test_connect_adopts_announced_endpoint() {
    init_tracing();
    let server = MockServer::start().await;
    let transport = transport(&server);

    let endpoint = transport.connect(&context()).await.unwrap();

    assert_eq!(endpoint.path(), "/message");
    assert!(endpoint.query().unwrap().starts_with("sessionId="));
    assert_eq!(endpoint.origin(), reqwest::Url::parse(&server.base_url()).unwrap().origin());
    assert_eq!(transport.message_endpoint(), Some(endpoint));
    assert_eq!(server.inbound_connections(), 1);
}

#[tokio::test]
async fn test_stream_customizer_sees_get() {
    let server = MockServer::start().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook_seen = seen.clone();

    let transport = HttpTransportBuilder::new(server.base_url())
        .sync_customizer(
            move |request: &mut OutboundRequest, ctx: &TransportContext| -> Result<(), BoxError> {
                hook_seen.lock().unwrap().push((
                    request.method().clone(),
                    request.uri().to_string(),
                    request.body().map(str::to_owned),
                    ctx.clone(),
                ));
                Ok(())
            },
        )
        .build_sse()
        .unwrap();

    transport.connect(&context()).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (method, uri, body, ctx) = &seen[0];
    assert_eq!(*method, Method::GET);
    assert_eq!(uri, &format!("{}/sse", server.base_url()));
    assert!(body.is_none());
    assert_eq!(ctx, &context());
}

#[tokio::test]
async fn test_send_connects_on_demand() {
    let server = MockServer::start().await;
    let transport = transport(&server);

    let response = transport
        .send(fixtures::initialize_request("test-id").into(), &context())
        .await
        .unwrap()
        .into_response()
        .unwrap();

    assert_eq!(response.id, RequestId::string("test-id"));
    assert_eq!(transport.state(), SessionState::Active);
    let posts = server.requests_to(&Method::POST, "/message");
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].rpc_methods(), vec!["initialize"]);
    // The legacy wire has no session token header.
    assert!(transport.session_id().is_none());
}

// =============================================================================
// Messages on the stream
// =============================================================================

#[tokio::test]
async fn test_replies_and_notifications_share_the_stream() {
    let server = MockServer::start().await;
    let transport = transport(&server);
    let received = Arc::new(Mutex::new(Vec::<Message>::new()));
    let sink_received = received.clone();
    transport.set_notification_sink(Arc::new(move |msg: Message, _: &TransportContext| {
        sink_received.lock().unwrap().push(msg);
    }));

    transport
        .send(fixtures::initialize_request("test-id").into(), &context())
        .await
        .unwrap();
    let echoed = transport
        .send(fixtures::echo(2i64, json!({"n": 2})).into(), &context())
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(echoed.result, Some(json!({"n": 2})));

    server.push_legacy_notification("notifications/progress", json!({"progress": 1}));
    eventually(|| !received.lock().unwrap().is_empty()).await;
    assert_eq!(
        received.lock().unwrap()[0].method(),
        Some("notifications/progress")
    );
    assert_eq!(transport.stats().messages_received, 3);
}

// =============================================================================
// Stream loss
// =============================================================================

#[tokio::test]
async fn test_failed_resume_fails_waiting_requests() {
    init_tracing();
    let server = MockServer::start().await;
    let transport = Arc::new(transport(&server));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let observed = errors.clone();
    transport.set_error_observer(Arc::new(move |e: &TransportError| {
        observed.lock().unwrap().push(e.kind());
    }));

    transport
        .send(fixtures::initialize_request("test-id").into(), &context())
        .await
        .unwrap();

    let sender = transport.clone();
    let waiting = tokio::spawn(async move {
        sender
            .send(fixtures::unanswered(4i64).into(), &TransportContext::empty())
            .await
    });
    eventually(|| server.requests_to(&Method::POST, "/message").len() == 2).await;

    server.reject_next_gets(1);
    server.drop_inbound_streams();

    let err = with_default_timeout(waiting).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Connection);
    assert!(transport.message_endpoint().is_none());
    assert_eq!(transport.stats().failed_reconnects, 1);
    eventually(|| errors.lock().unwrap().contains(&TransportErrorKind::Connection)).await;

    // The session survives; the next send opens a fresh stream.
    let pong = transport
        .send(fixtures::ping(5i64).into(), &context())
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(pong.id, RequestId::number(5));
}

#[tokio::test]
async fn test_resumed_stream_announces_new_endpoint() {
    let server = MockServer::start().await;
    let transport = transport(&server);
    let first = transport.connect(&context()).await.unwrap();

    server.drop_inbound_streams();
    eventually(|| {
        transport
            .message_endpoint()
            .is_some_and(|current| current != first)
    })
    .await;

    assert_eq!(server.inbound_connections(), 2);
    assert_eq!(transport.stats().reconnects, 1);
}

#[tokio::test]
async fn test_close_releases_stream() {
    let server = MockServer::start().await;
    let transport = transport(&server);
    transport.connect(&context()).await.unwrap();

    transport.close_gracefully().await.unwrap();

    assert_eq!(transport.state(), SessionState::Closed);
    // Nothing to terminate on the legacy wire.
    assert!(server.requests_to(&Method::DELETE, "/mcp").is_empty());
    let err = transport.connect(&context()).await.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::SessionClosed);
}
