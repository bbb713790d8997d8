//! Streamable HTTP transport tests.
//!
//! Every test runs against a fresh `mcplink-testing` mock server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use mcplink_core::{JsonRpcPayload, Message, RequestId, SessionState, TransportErrorKind, codec};
use mcplink_testing::{MockServer, ReplyMode, eventually, fixtures, init_tracing, with_default_timeout};
use mcplink_transport::customizer::{AsyncRequestCustomizer, OutboundRequest};
use mcplink_transport::http::{HttpTransportBuilder, HttpTransportConfig, InboundStreamMode};
use mcplink_transport::{BoxError, SendOutcome, StreamableHttpTransport, Transport, TransportContext};
use pretty_assertions::assert_eq;
use regex::Regex;
use reqwest::Method;
use serde_json::json;

type Seen = Arc<Mutex<Vec<(String, String, Option<String>, TransportContext)>>>;

fn context() -> TransportContext {
    TransportContext::empty().with("test-transport-context-key", "some-value")
}

fn initialize() -> JsonRpcPayload {
    fixtures::initialize_request("test-id").into()
}

fn record(seen: &Seen, request: &OutboundRequest, ctx: &TransportContext) {
    seen.lock().unwrap().push((
        request.method().to_string(),
        request.uri().to_string(),
        request.body().map(str::to_owned),
        ctx.clone(),
    ));
}

async fn initialized(server: &MockServer) -> StreamableHttpTransport {
    let transport = HttpTransportBuilder::new(server.base_url())
        .inbound_mode(InboundStreamMode::Disabled)
        .build()
        .unwrap();
    transport.send(initialize(), &context()).await.unwrap();
    transport
}

// =============================================================================
// Handshake and lifecycle
// =============================================================================

#[tokio::test]
async fn test_initialize_resolves_its_waiter() {
    init_tracing();
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url()).build().unwrap();

    let outcome = transport.send(initialize(), &context()).await.unwrap();
    let response = outcome.into_response().unwrap();

    assert_eq!(response.id, RequestId::string("test-id"));
    assert!(response.is_success());
    assert_eq!(transport.state(), SessionState::Active);
    assert!(transport.session_id().is_some());

    transport.close_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_close_uninitialized() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url()).build().unwrap();

    transport.close_gracefully().await.unwrap();

    let err = transport.send(initialize(), &context()).await.unwrap_err();
    assert_eq!(err.to_string(), "MCP session has been closed");
    assert_eq!(err.kind(), TransportErrorKind::SessionClosed);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_close_initialized() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url()).build().unwrap();

    transport.send(initialize(), &context()).await.unwrap();
    transport.close_gracefully().await.unwrap();

    let err = transport.send(initialize(), &context()).await.unwrap_err();
    let pattern = Regex::new("^MCP session with ID [a-zA-Z0-9-]* has been closed$").unwrap();
    assert!(pattern.is_match(&err.to_string()), "{err}");
}

#[tokio::test]
async fn test_close_is_idempotent_and_deletes_session() {
    let server = MockServer::start().await;
    let transport = initialized(&server).await;
    let session = transport.session_id().unwrap();

    transport.close_gracefully().await.unwrap();
    transport.close_gracefully().await.unwrap();

    let deletes = server.requests_to(&Method::DELETE, "/mcp");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].header("mcp-session-id"), Some(session.as_str()));
    assert!(!server.session_live(&session));
    assert_eq!(transport.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_concurrent_close_runs_once() {
    let server = MockServer::start().await;
    let transport = initialized(&server).await;

    let (a, b) = tokio::join!(transport.close_gracefully(), transport.close_gracefully());
    a.unwrap();
    b.unwrap();
    assert_eq!(server.requests_to(&Method::DELETE, "/mcp").len(), 1);
}

#[tokio::test]
async fn test_close_fails_outstanding_requests() {
    let server = MockServer::start().await;
    let transport = Arc::new(initialized(&server).await);

    let sender = transport.clone();
    let waiting = tokio::spawn(async move {
        sender
            .send(fixtures::unanswered(7i64).into(), &TransportContext::empty())
            .await
    });
    eventually(|| transport.pending_requests() == 1).await;

    transport.close_gracefully().await.unwrap();
    let err = with_default_timeout(waiting).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::SessionClosed);
}

// =============================================================================
// Session token and headers
// =============================================================================

#[tokio::test]
async fn test_token_attached_after_assignment() {
    let server = MockServer::start().await;
    let transport = initialized(&server).await;
    let session = transport.session_id().unwrap();

    transport
        .send(fixtures::initialized_notification().into(), &context())
        .await
        .unwrap();
    transport.send(fixtures::ping(2i64).into(), &context()).await.unwrap();

    let posts = server.requests_to(&Method::POST, "/mcp");
    assert_eq!(posts.len(), 3);
    assert_eq!(posts[0].header("mcp-session-id"), None);
    for post in &posts[1..] {
        assert_eq!(post.header("mcp-session-id"), Some(session.as_str()));
        assert_eq!(post.header("accept"), Some("application/json, text/event-stream"));
        assert_eq!(post.header("content-type"), Some("application/json"));
    }
}

#[tokio::test]
async fn test_negotiated_version_replaces_configured() {
    let server = MockServer::start().await;
    server.set_protocol_version("2025-03-26");
    let transport = initialized(&server).await;
    assert_eq!(transport.protocol_version(), "2025-03-26");

    transport.send(fixtures::ping(2i64).into(), &context()).await.unwrap();
    let posts = server.requests_to(&Method::POST, "/mcp");
    assert_eq!(posts[0].header("mcp-protocol-version"), Some("2025-06-18"));
    assert_eq!(posts[1].header("mcp-protocol-version"), Some("2025-03-26"));
}

#[tokio::test]
async fn test_notification_is_accepted() {
    let server = MockServer::start().await;
    let transport = initialized(&server).await;

    let outcome = transport
        .send(fixtures::initialized_notification().into(), &context())
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Accepted));
}

#[tokio::test]
async fn test_terminated_session_closes_transport() {
    let server = MockServer::start().await;
    let transport = initialized(&server).await;
    let session = transport.session_id().unwrap();

    // Terminate behind the client's back.
    reqwest::Client::new()
        .delete(format!("{}/mcp", server.base_url()))
        .header("mcp-session-id", &session)
        .send()
        .await
        .unwrap();

    let err = transport.send(fixtures::ping(2i64).into(), &context()).await.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::SessionClosed);
    assert_eq!(transport.state(), SessionState::Closed);
}

// =============================================================================
// Request customizers
// =============================================================================

#[tokio::test]
async fn test_request_customizer() {
    let server = MockServer::start().await;
    let seen: Seen = Arc::default();
    let hook_seen = seen.clone();

    let transport = HttpTransportBuilder::new(server.base_url())
        .inbound_mode(InboundStreamMode::Disabled)
        .sync_customizer(
            move |request: &mut OutboundRequest, ctx: &TransportContext| -> Result<(), BoxError> {
                record(&hook_seen, request, ctx);
                Ok(())
            },
        )
        .build()
        .unwrap();

    let payload = initialize();
    let expected_body = codec::encode(&payload).unwrap();
    transport.send(payload, &context()).await.unwrap();

    let seen = seen.lock().unwrap();
    let (method, uri, body, ctx) = &seen[0];
    assert_eq!(method, "POST");
    assert_eq!(uri, &format!("{}/mcp", server.base_url()));
    assert_eq!(body.as_deref(), Some(expected_body.as_str()));
    assert_eq!(ctx, &context());
}

struct RecordingAsync {
    seen: Seen,
}

impl AsyncRequestCustomizer for RecordingAsync {
    fn customize<'a>(
        &'a self,
        request: &'a mut OutboundRequest,
        ctx: &'a TransportContext,
    ) -> BoxFuture<'a, Result<(), BoxError>> {
        async move {
            tokio::task::yield_now().await;
            record(&self.seen, request, ctx);
            request
                .headers_mut()
                .insert("x-tenant", ctx.get_str("test-transport-context-key").unwrap().parse()?);
            Ok(())
        }
        .boxed()
    }
}

#[tokio::test]
async fn test_async_request_customizer() {
    let server = MockServer::start().await;
    let seen: Seen = Arc::default();

    let config = HttpTransportConfig::new(server.base_url())
        .with_inbound_mode(InboundStreamMode::Disabled)
        .with_async_customizer(RecordingAsync { seen: seen.clone() });
    let transport = StreamableHttpTransport::new(config).unwrap();

    let payload = initialize();
    let expected_body = codec::encode(&payload).unwrap();
    transport.send(payload, &context()).await.unwrap();

    {
        let seen = seen.lock().unwrap();
        let (method, uri, body, ctx) = &seen[0];
        assert_eq!(method, "POST");
        assert_eq!(uri, &format!("{}/mcp", server.base_url()));
        assert_eq!(body.as_deref(), Some(expected_body.as_str()));
        assert_eq!(ctx, &context());
    }
    assert_eq!(server.requests()[0].header("x-tenant"), Some("some-value"));
}

#[tokio::test]
async fn test_customizer_failure_surfaces_unwrapped() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url())
        .sync_customizer(
            |_: &mut OutboundRequest, _: &TransportContext| -> Result<(), BoxError> {
                Err("token expired".into())
            },
        )
        .build()
        .unwrap();

    let err = transport.send(initialize(), &context()).await.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Customization);
    assert_eq!(err.into_customizer_error().unwrap().to_string(), "token expired");
    assert!(server.requests().is_empty());
    // A failed handshake can be retried.
    assert_eq!(transport.state(), SessionState::Uninitialized);
}

// =============================================================================
// Reply channels
// =============================================================================

#[tokio::test]
async fn test_sse_post_response() {
    let server = MockServer::start().await;
    server.set_reply_mode(ReplyMode::Sse);
    let transport = initialized(&server).await;

    let outcome = transport
        .send(fixtures::echo(2i64, json!({"x": 1})).into(), &context())
        .await
        .unwrap();
    assert_eq!(outcome.into_response().unwrap().result, Some(json!({"x": 1})));
}

#[tokio::test]
async fn test_reply_on_inbound_stream_after_accepted() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url()).build().unwrap();
    transport.send(initialize(), &context()).await.unwrap();
    eventually(|| transport.inbound_active()).await;

    server.set_reply_mode(ReplyMode::Inbound);
    let outcome = with_default_timeout(transport.send(fixtures::ping(2i64).into(), &context()))
        .await
        .unwrap();
    assert_eq!(outcome.into_response().unwrap().id, RequestId::number(2));
}

#[tokio::test]
async fn test_batch_resolves_every_request() {
    let server = MockServer::start().await;
    let transport = initialized(&server).await;

    let batch = JsonRpcPayload::from(vec![
        Message::from(fixtures::ping(10i64)),
        Message::from(fixtures::echo(11i64, json!("hi"))),
        Message::from(fixtures::initialized_notification()),
    ]);
    let SendOutcome::Batch(results) = transport.send(batch, &context()).await.unwrap() else {
        panic!("expected batch outcome");
    };
    let ids: Vec<RequestId> = results.into_iter().map(|r| r.unwrap().id).collect();
    assert_eq!(ids, vec![RequestId::number(10), RequestId::number(11)]);
}

#[tokio::test]
async fn test_notifications_reach_sink_with_context() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url()).build().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink_received = received.clone();
    transport.set_notification_sink(Arc::new(move |msg: Message, ctx: &TransportContext| {
        sink_received.lock().unwrap().push((msg, ctx.clone()));
    }));

    transport.send(initialize(), &context()).await.unwrap();
    eventually(|| transport.inbound_active()).await;

    server.push_notification("notifications/message", json!({"level": "info"}));
    eventually(|| !received.lock().unwrap().is_empty()).await;

    let received = received.lock().unwrap();
    assert_eq!(received[0].0.method(), Some("notifications/message"));
    assert_eq!(received[0].1, context());
}

#[tokio::test]
async fn test_inbound_stream_not_supported() {
    let server = MockServer::start().await;
    server.disable_inbound();
    let transport = HttpTransportBuilder::new(server.base_url()).build().unwrap();

    transport.send(initialize(), &context()).await.unwrap();
    eventually(|| transport.inbound_unsupported()).await;

    transport.send(fixtures::ping(2i64).into(), &context()).await.unwrap();
    assert_eq!(server.requests_to(&Method::GET, "/mcp").len(), 1);
    assert!(!transport.inbound_active());
}

#[tokio::test]
async fn test_lazy_inbound_opens_on_next_send() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url())
        .inbound_mode(InboundStreamMode::Lazy)
        .build()
        .unwrap();

    transport.send(initialize(), &context()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.inbound_connections(), 0);

    transport.send(fixtures::ping(2i64).into(), &context()).await.unwrap();
    eventually(|| server.inbound_connections() == 1).await;
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url())
        .inbound_mode(InboundStreamMode::Disabled)
        .request_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    transport.send(initialize(), &context()).await.unwrap();

    let err = transport
        .send(fixtures::unanswered(5i64).into(), &context())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Timeout);
    assert_eq!(transport.pending_requests(), 0);
    assert_eq!(transport.state(), SessionState::Active);
}

#[tokio::test]
async fn test_duplicate_request_id_is_rejected() {
    let server = MockServer::start().await;
    let transport = Arc::new(initialized(&server).await);

    let sender = transport.clone();
    let first = tokio::spawn(async move {
        sender
            .send(fixtures::unanswered(9i64).into(), &TransportContext::empty())
            .await
    });
    eventually(|| transport.pending_requests() == 1).await;

    let err = transport
        .send(fixtures::ping(9i64).into(), &context())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Usage);

    transport.close_gracefully().await.unwrap();
    assert!(first.await.unwrap().is_err());
}
