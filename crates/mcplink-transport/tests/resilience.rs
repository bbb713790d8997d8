//! Stream loss and fault handling.
//!
//! These tests inject failures into the mock server and check that the
//! transport resumes, reports, or fails requests as appropriate while the
//! session itself stays usable.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcplink_core::{Message, RequestId, SessionState, TransportErrorKind};
use mcplink_testing::{MockServer, eventually, fixtures, init_tracing};
use mcplink_transport::http::{HttpTransportBuilder, HttpTransportConfig};
use mcplink_transport::{StreamableHttpTransport, Transport, TransportContext, TransportError};
use reqwest::Method;
use serde_json::json;

#[derive(Default)]
struct Observed {
    messages: Mutex<Vec<Message>>,
    errors: Mutex<Vec<TransportErrorKind>>,
}

impl Observed {
    fn attach(self: &Arc<Self>, transport: &StreamableHttpTransport) {
        let sink = self.clone();
        transport.set_notification_sink(Arc::new(move |msg: Message, _: &TransportContext| {
            sink.messages.lock().unwrap().push(msg);
        }));
        let observer = self.clone();
        transport.set_error_observer(Arc::new(move |e: &TransportError| {
            observer.errors.lock().unwrap().push(e.kind());
        }));
    }

    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn saw_error(&self, kind: TransportErrorKind) -> bool {
        self.errors.lock().unwrap().contains(&kind)
    }
}

async fn connected(
    server: &MockServer,
    config: HttpTransportConfig,
) -> (StreamableHttpTransport, Arc<Observed>) {
    let transport = StreamableHttpTransport::new(config).unwrap();
    let observed = Arc::new(Observed::default());
    observed.attach(&transport);
    transport
        .send(fixtures::initialize_request("test-id").into(), &TransportContext::empty())
        .await
        .unwrap();
    eventually(|| transport.inbound_active()).await;
    assert_eq!(server.inbound_connections(), 1);
    (transport, observed)
}

// =============================================================================
// Inbound stream resumption
// =============================================================================

#[tokio::test]
async fn test_resume_replays_missed_events() {
    init_tracing();
    let server = MockServer::start().await;
    let (transport, observed) = connected(&server, HttpTransportConfig::new(server.base_url())).await;

    let first = server.push_notification("notifications/one", json!({}));
    eventually(|| observed.message_count() == 1).await;
    assert_eq!(transport.last_event_id(), Some(first.to_string()));

    server.drop_inbound_streams();
    let missed = server.push_notification("notifications/two", json!({}));
    eventually(|| observed.message_count() == 2).await;

    let gets = server.requests_to(&Method::GET, "/mcp");
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[0].header("last-event-id"), None);
    assert_eq!(gets[1].header("last-event-id"), Some(first.to_string().as_str()));
    assert_eq!(
        observed.messages.lock().unwrap()[1].method(),
        Some("notifications/two")
    );
    eventually(|| transport.last_event_id() == Some(missed.to_string())).await;
    assert_eq!(transport.stats().reconnects, 1);
    assert!(transport.inbound_active());
}

#[tokio::test]
async fn test_failed_resume_is_reported_and_session_survives() {
    let server = MockServer::start().await;
    let (transport, observed) = connected(&server, HttpTransportConfig::new(server.base_url())).await;

    server.reject_next_gets(1);
    server.drop_inbound_streams();

    eventually(|| observed.saw_error(TransportErrorKind::Connection)).await;
    eventually(|| !transport.inbound_active()).await;
    assert_eq!(transport.stats().failed_reconnects, 1);
    assert_eq!(transport.state(), SessionState::Active);

    // Requests still work, and the next send reopens the stream.
    transport
        .send(fixtures::ping(2i64).into(), &TransportContext::empty())
        .await
        .unwrap();
    eventually(|| server.inbound_connections() == 2).await;
}

#[tokio::test]
async fn test_failed_resume_fails_requests_waiting_on_stream() {
    let server = MockServer::start().await;
    let config = HttpTransportConfig::new(server.base_url()).with_request_timeout(Duration::from_secs(10));
    let (transport, observed) = connected(&server, config).await;

    let ctx = TransportContext::empty();
    let waiting = transport.send(fixtures::unanswered(4i64).into(), &ctx);
    let lose_stream = async {
        eventually(|| server.requests_to(&Method::POST, "/mcp").len() == 2).await;
        // Let the 202 reach the client before the stream goes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.reject_next_gets(1);
        server.drop_inbound_streams();
    };
    let (result, ()) = tokio::join!(waiting, lose_stream);

    let err = result.unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Connection);
    assert_eq!(transport.pending_requests(), 0);
    assert_eq!(transport.stats().failed_reconnects, 1);
    eventually(|| observed.saw_error(TransportErrorKind::Connection)).await;
    assert_eq!(transport.state(), SessionState::Active);
}

#[tokio::test]
async fn test_configured_cursor_is_sent_on_first_get() {
    let server = MockServer::start().await;
    let config = HttpTransportConfig::new(server.base_url()).with_resume_from("41");
    let (transport, _) = connected(&server, config).await;

    let gets = server.requests_to(&Method::GET, "/mcp");
    assert_eq!(gets[0].header("last-event-id"), Some("41"));
    assert_eq!(transport.last_event_id(), Some("41".to_string()));
}

// =============================================================================
// Bad input on the stream
// =============================================================================

#[tokio::test]
async fn test_undecodable_record_is_skipped() {
    let server = MockServer::start().await;
    let (transport, observed) = connected(&server, HttpTransportConfig::new(server.base_url())).await;

    server.push_data("this is not json");
    server.push_notification("notifications/after", json!({}));

    eventually(|| observed.message_count() == 1).await;
    assert!(observed.saw_error(TransportErrorKind::Protocol));
    assert_eq!(transport.stats().protocol_anomalies, 1);
    assert!(transport.inbound_active());
}

#[tokio::test]
async fn test_oversized_record_is_skipped() {
    let server = MockServer::start().await;
    let config = HttpTransportConfig::new(server.base_url()).with_max_message_size(1024);
    let (transport, observed) = connected(&server, config).await;

    let padding = "x".repeat(4096);
    server.push_notification("notifications/huge", json!({ "padding": padding }));
    server.push_notification("notifications/small", json!({}));

    eventually(|| observed.message_count() == 1).await;
    assert_eq!(
        observed.messages.lock().unwrap()[0].method(),
        Some("notifications/small")
    );
    assert_eq!(transport.stats().protocol_anomalies, 1);
    assert_eq!(transport.stats().reconnects, 0);
}

#[tokio::test]
async fn test_unknown_response_id_counts_as_anomaly() {
    let server = MockServer::start().await;
    let (transport, observed) = connected(&server, HttpTransportConfig::new(server.base_url())).await;

    server.push_data(r#"{"jsonrpc":"2.0","id":999,"result":{}}"#);
    eventually(|| transport.stats().protocol_anomalies == 1).await;
    assert_eq!(observed.message_count(), 0);
}

#[tokio::test]
async fn test_server_request_reaches_sink() {
    let server = MockServer::start().await;
    let (_transport, observed) = connected(&server, HttpTransportConfig::new(server.base_url())).await;

    server.push_data(r#"{"jsonrpc":"2.0","id":"srv-1","method":"roots/list"}"#);
    eventually(|| observed.message_count() == 1).await;

    let messages = observed.messages.lock().unwrap();
    let Message::Request(request) = &messages[0] else {
        panic!("expected a request, got {:?}", messages[0]);
    };
    assert_eq!(request.id, RequestId::string("srv-1"));
    assert_eq!(request.method(), "roots/list");
}

// =============================================================================
// POST failures
// =============================================================================

#[tokio::test]
async fn test_broken_post_body_fails_only_that_call() {
    let server = MockServer::start().await;
    let transport = HttpTransportBuilder::new(server.base_url()).build().unwrap();
    transport
        .send(fixtures::initialize_request("test-id").into(), &TransportContext::empty())
        .await
        .unwrap();

    server.fail_next_posts(1);
    let err = transport
        .send(fixtures::ping(2i64).into(), &TransportContext::empty())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Connection);
    assert_eq!(transport.pending_requests(), 0);

    let pong = transport
        .send(fixtures::ping(3i64).into(), &TransportContext::empty())
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(pong.id, RequestId::number(3));
    assert_eq!(transport.state(), SessionState::Active);
}

#[tokio::test]
async fn test_unreachable_server_is_a_connection_error() {
    let server = MockServer::start().await;
    let base = server.base_url();
    server.shutdown();
    drop(server);

    let transport = HttpTransportBuilder::new(base).build().unwrap();
    let err = transport
        .send(fixtures::initialize_request("test-id").into(), &TransportContext::empty())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), TransportErrorKind::Connection);
    assert_eq!(transport.state(), SessionState::Uninitialized);
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_stops_resumption() {
    let server = MockServer::start().await;
    let (transport, _) = connected(&server, HttpTransportConfig::new(server.base_url())).await;

    transport.close_gracefully().await.unwrap();
    assert!(!transport.inbound_active());

    server.drop_inbound_streams();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(server.requests_to(&Method::GET, "/mcp").len(), 1);
    assert_eq!(transport.stats().reconnects, 0);
}
