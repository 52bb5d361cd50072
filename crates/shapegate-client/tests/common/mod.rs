// crates/shapegate-client/tests/common/mod.rs
// =============================================================================
// Module: Client Test Harness
// Description: In-process gateway plus a change log read straight from the store.
// Purpose: Run the reconciliation engine against real mutation routes.
// =============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]
#![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only helpers.")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shapegate_client::ClientError;
use shapegate_client::HttpEndpoint;
use shapegate_client::HttpMutationTransport;
use shapegate_client::HttpShapeLog;
use shapegate_client::ShapeBatch;
use shapegate_client::ShapeLog;
use shapegate_config::UpstreamConfig;
use shapegate_core::CommitSequencer;
use shapegate_core::InMemoryCommitSequencer;
use shapegate_core::Principal;
use shapegate_core::PrincipalId;
use shapegate_core::ShapeCursor;
use shapegate_core::ShapeMessage;
use shapegate_core::SharedCommitSequencer;
use shapegate_core::Table;
use shapegate_gateway::AppState;
use shapegate_gateway::ChangeLogSource;
use shapegate_gateway::ConfigPrincipalResolver;
use shapegate_gateway::MutationGateway;
use shapegate_gateway::NoopAuditSink;
use shapegate_gateway::RetryPolicy;
use shapegate_gateway::ShapeProxy;
use shapegate_gateway::router;
use tokio::net::TcpListener;

/// Token of principal 7.
pub const ALICE: &str = "alice-token-0123456789";
/// Token of principal 8.
pub const BOB: &str = "bob-token-0123456789ab";

/// Running gateway backed by an in-memory store.
pub struct TestGateway {
    pub base_url: String,
    pub store: InMemoryCommitSequencer,
}

impl TestGateway {
    /// Mutation transport authenticated with `token`.
    pub fn transport(&self, token: &str) -> Arc<HttpMutationTransport> {
        let endpoint = HttpEndpoint::new(&self.base_url, token, Duration::from_secs(2)).unwrap();
        Arc::new(HttpMutationTransport::new(endpoint))
    }

    /// Shape log reached over HTTP through the gateway's shape route.
    pub fn http_log(&self, token: &str) -> Arc<HttpShapeLog> {
        let endpoint = HttpEndpoint::new(&self.base_url, token, Duration::from_secs(2)).unwrap();
        Arc::new(HttpShapeLog::new(endpoint))
    }

    /// Change log of `owner` read from the store.
    pub fn log(&self, owner: u64) -> Arc<StoreShapeLog> {
        Arc::new(StoreShapeLog {
            store: self.store.clone(),
            owner: PrincipalId::from_raw(owner).unwrap(),
        })
    }
}

fn principal(id: u64, name: &str) -> Principal {
    Principal {
        id: PrincipalId::from_raw(id).unwrap(),
        name: name.to_string(),
    }
}

/// Serves the gateway routes on an ephemeral port.
pub async fn spawn_gateway() -> TestGateway {
    spawn(false).await
}

/// Serves the gateway routes with shapes answered from the store's change log.
pub async fn spawn_change_log_gateway() -> TestGateway {
    spawn(true).await
}

async fn spawn(change_log: bool) -> TestGateway {
    let store = InMemoryCommitSequencer::new();
    let audit = Arc::new(NoopAuditSink);
    let gateway = MutationGateway::new(
        SharedCommitSequencer::from_sequencer(store.clone()),
        RetryPolicy::default(),
        audit.clone(),
    );
    let mut proxy = ShapeProxy::from_config(&UpstreamConfig::default(), audit.clone()).unwrap();
    if change_log {
        let source = ChangeLogSource::new(SharedCommitSequencer::from_sequencer(store.clone()))
            .with_live_wait(Duration::from_millis(100));
        proxy = proxy.with_change_log(source);
    }
    let resolver = ConfigPrincipalResolver::from_pairs([
        (ALICE.to_string(), principal(7, "alice")),
        (BOB.to_string(), principal(8, "bob")),
    ]);
    let state = AppState::new(gateway, proxy, Arc::new(resolver), audit);
    let app = router(Arc::new(state), 64 * 1024);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestGateway {
        base_url: format!("http://{addr}"),
        store,
    }
}

/// Shape log serving one owner's committed changes, tagged with commit markers.
pub struct StoreShapeLog {
    store: InMemoryCommitSequencer,
    owner: PrincipalId,
}

#[async_trait]
impl ShapeLog for StoreShapeLog {
    async fn poll(
        &self,
        table: Table,
        cursor: &ShapeCursor,
        _filter: Option<&str>,
    ) -> Result<ShapeBatch, ClientError> {
        let after = if cursor.is_initial() { 0 } else { cursor.offset.parse::<u64>().unwrap() };
        let changes = self
            .store
            .changes_since(after, 100)
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        if changes.is_empty() && cursor.live {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let next = changes.last().map_or(after, |change| change.offset);
        let mut messages: Vec<ShapeMessage> = changes
            .into_iter()
            .filter(|change| change.table == table && change.owner == self.owner)
            .map(|change| ShapeMessage::Change(change.entry))
            .collect();
        messages.push(ShapeMessage::up_to_date());
        Ok(ShapeBatch {
            messages,
            next: ShapeCursor {
                offset: next.to_string(),
                handle: Some("store".to_string()),
                cursor: None,
                live: true,
            },
        })
    }
}
