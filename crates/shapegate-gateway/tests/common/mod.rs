// crates/shapegate-gateway/tests/common/mod.rs
// =============================================================================
// Module: Gateway Test Helpers
// Description: In-process app assembly and HTTP helpers.
// Purpose: Drive the router without a listener and host fake upstreams.
// =============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only helpers.")]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use http_body_util::BodyExt;
use serde_json::Value;
use shapegate_config::UpstreamConfig;
use shapegate_core::InMemoryCommitSequencer;
use shapegate_core::Principal;
use shapegate_core::PrincipalId;
use shapegate_core::SharedCommitSequencer;
use shapegate_gateway::AppState;
use shapegate_gateway::AuditEvent;
use shapegate_gateway::AuditSink;
use shapegate_gateway::ChangeLogSource;
use shapegate_gateway::ConfigPrincipalResolver;
use shapegate_gateway::MutationGateway;
use shapegate_gateway::RetryPolicy;
use shapegate_gateway::ShapeProxy;
use shapegate_gateway::router;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Token of principal 7.
pub const ALICE: &str = "alice-token-0123456789";
/// Token of principal 8.
pub const BOB: &str = "bob-token-0123456789ab";
/// Body limit used by test routers.
pub const MAX_BODY_BYTES: usize = 4 * 1024;

/// Audit sink that keeps events in memory.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<Value>>,
}

impl RecordingAuditSink {
    /// Returns recorded events as JSON.
    pub fn events(&self) -> Vec<Value> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap().push(serde_json::to_value(event).unwrap());
    }
}

/// Assembled application under test.
pub struct TestApp {
    pub router: Router,
    pub store: InMemoryCommitSequencer,
    pub audit: Arc<RecordingAuditSink>,
}

fn principal(id: u64, name: &str) -> Principal {
    Principal {
        id: PrincipalId::from_raw(id).unwrap(),
        name: name.to_string(),
    }
}

/// Builds the app with an in-memory store and the given upstream base URL.
pub fn test_app(upstream_url: &str) -> TestApp {
    assemble(upstream_url, false)
}

/// Builds the app serving shapes from the store's own change log.
pub fn change_log_app() -> TestApp {
    assemble("http://127.0.0.1:9", true)
}

fn assemble(upstream_url: &str, change_log: bool) -> TestApp {
    let store = InMemoryCommitSequencer::new();
    let audit = Arc::new(RecordingAuditSink::default());
    let gateway = MutationGateway::new(
        SharedCommitSequencer::from_sequencer(store.clone()),
        RetryPolicy {
            max_attempts: 2,
            backoff_step: Duration::from_millis(1),
        },
        audit.clone(),
    );
    let upstream = UpstreamConfig {
        url: upstream_url.to_string(),
        connect_timeout_ms: 500,
        ..UpstreamConfig::default()
    };
    let mut proxy = ShapeProxy::from_config(&upstream, audit.clone()).unwrap();
    if change_log {
        let source = ChangeLogSource::new(SharedCommitSequencer::from_sequencer(store.clone()))
            .with_live_wait(Duration::from_millis(200));
        proxy = proxy.with_change_log(source);
    }
    let resolver = ConfigPrincipalResolver::from_pairs([
        (ALICE.to_string(), principal(7, "alice")),
        (BOB.to_string(), principal(8, "bob")),
    ]);
    let state = AppState::new(gateway, proxy, Arc::new(resolver), audit.clone());
    TestApp {
        router: router(Arc::new(state), MAX_BODY_BYTES),
        store,
        audit,
    }
}

/// Response parts collected from the router.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    /// Parses the body as JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// Sends a request with an optional bearer token and JSON body.
pub async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> TestResponse {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    send_request(router, builder.body(body).unwrap()).await
}

/// Sends a prepared request.
pub async fn send_request(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        headers,
        body,
    }
}

/// Serves a router on an ephemeral loopback port.
pub async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Returns a loopback address with nothing listening.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
