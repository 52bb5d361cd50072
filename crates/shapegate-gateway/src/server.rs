// crates/shapegate-gateway/src/server.rs
// ============================================================================
// Module: Shapegate HTTP Server
// Description: Axum routes for mutations, reads, and shape subscriptions.
// Purpose: Authenticate every request and map the error taxonomy to HTTP.
// Dependencies: shapegate-core, shapegate-config, shapegate-store-sqlite, axum, tokio
// ============================================================================

//! ## Overview
//! The server exposes the mutation gateway under `/api/todos` and
//! `/api/labels` and the shape proxy under `/api/shape/{table}`. Every route
//! authenticates first; an unauthenticated request never reaches the store or
//! the upstream source. Mutating responses carry `commit_id` as a decimal
//! string so clients can correlate the write with the change stream.
//! Security posture: request bodies, paths, and query strings are untrusted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::extract::Path;
use axum::extract::RawQuery;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::put;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;
use shapegate_config::ShapeSource;
use shapegate_config::ShapegateConfig;
use shapegate_config::StoreType;
use shapegate_core::Applied;
use shapegate_core::CommitResult;
use shapegate_core::EntityId;
use shapegate_core::InMemoryCommitSequencer;
use shapegate_core::LabelIntent;
use shapegate_core::LabelSetIntent;
use shapegate_core::Principal;
use shapegate_core::PrincipalResolver;
use shapegate_core::Record;
use shapegate_core::SharedCommitSequencer;
use shapegate_core::SyncError;
use shapegate_core::Table;
use shapegate_core::TodoIntent;
use shapegate_core::field_error;
use shapegate_store_sqlite::SqliteCommitSequencer;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::info;
use tracing::warn;

use crate::audit::AuditEvent;
use crate::audit::AuditSink;
use crate::audit::AuthAuditEvent;
use crate::audit::sink_from_config;
use crate::auth::ConfigPrincipalResolver;
use crate::auth::authenticate;
use crate::change_log::ChangeLogSource;
use crate::gateway::CreateIntent;
use crate::gateway::MutationGateway;
use crate::gateway::Resource;
use crate::gateway::RetryPolicy;
use crate::gateway::UpdateIntent;
use crate::proxy::ShapeProxy;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Server lifecycle errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),
    /// Initialization errors.
    #[error("init error: {0}")]
    Init(String),
    /// Transport errors.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Request failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.0 {
            SyncError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({ "message": errors.summary(), "errors": errors }),
            ),
            SyncError::NotFound => {
                (StatusCode::NOT_FOUND, serde_json::json!({ "message": "Not found" }))
            }
            SyncError::Unauthorized(_) => {
                (StatusCode::UNAUTHORIZED, serde_json::json!({ "message": "Unauthenticated." }))
            }
            SyncError::ConstraintViolation(_) => (
                StatusCode::CONFLICT,
                serde_json::json!({ "message": "The change conflicts with stored data." }),
            ),
            SyncError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "message": "Store unavailable, retry later." }),
            ),
            SyncError::UpstreamStream {
                status,
                message,
            } => (
                status
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::BAD_GATEWAY),
                serde_json::json!({ "message": message }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// SECTION: Application State
// ============================================================================

/// Shared state for all routes.
pub struct AppState {
    /// Mutation gateway.
    gateway: MutationGateway,
    /// Shape filter proxy.
    proxy: ShapeProxy,
    /// Bearer token resolver.
    resolver: Arc<dyn PrincipalResolver + Send + Sync>,
    /// Audit sink.
    audit: Arc<dyn AuditSink>,
}

impl AppState {
    /// Assembles state from its parts.
    #[must_use]
    pub fn new(
        gateway: MutationGateway,
        proxy: ShapeProxy,
        resolver: Arc<dyn PrincipalResolver + Send + Sync>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            gateway,
            proxy,
            resolver,
            audit,
        }
    }

    /// Authenticates the caller and records the decision.
    fn authenticate(&self, headers: &HeaderMap, route: &str) -> Result<Principal, ApiError> {
        let header = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
        match authenticate(self.resolver.as_ref(), header) {
            Ok(caller) => {
                self.audit.record(&AuditEvent::Auth(AuthAuditEvent::allowed(
                    route,
                    caller.principal.id.get(),
                    &caller.token_fingerprint,
                )));
                Ok(caller.principal)
            }
            Err(error) => {
                self.audit.record(&AuditEvent::Auth(AuthAuditEvent::denied(route, &error.to_string())));
                Err(ApiError(SyncError::Unauthorized(error.to_string())))
            }
        }
    }
}

/// Builds the application router.
pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/api/user", get(current_user))
        .route("/api/todos", get(list_todos).post(create_todo))
        .route(
            "/api/todos/{id}",
            get(show_todo).put(update_todo).patch(update_todo).delete(delete_todo),
        )
        .route("/api/todos/{id}/labels", put(replace_todo_labels))
        .route("/api/labels", get(list_labels).post(create_label))
        .route(
            "/api/labels/{id}",
            get(show_label).put(update_label).patch(update_label).delete(delete_label),
        )
        .route("/api/shape/{table}", get(shape))
        .layer(ServiceBuilder::new().layer(DefaultBodyLimit::max(max_body_bytes)))
        .with_state(state)
}

// ============================================================================
// SECTION: Server
// ============================================================================

/// Configured Shapegate server.
pub struct ShapegateServer {
    /// Listener bind address.
    bind: SocketAddr,
    /// Maximum request body size.
    max_body_bytes: usize,
    /// Shared route state.
    state: Arc<AppState>,
}

impl ShapegateServer {
    /// Builds a server from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when configuration is invalid or a backend
    /// cannot be initialized.
    pub fn from_config(config: &ShapegateConfig) -> Result<Self, ServerError> {
        config.validate().map_err(|err| ServerError::Config(err.to_string()))?;
        let bind = config.server.bind_addr().map_err(|err| ServerError::Config(err.to_string()))?;
        let audit = sink_from_config(&config.audit).map_err(|err| ServerError::Init(err.to_string()))?;
        let sequencer = build_sequencer(config)?;
        let resolver = ConfigPrincipalResolver::from_config(&config.auth)
            .map_err(|err| ServerError::Config(err.to_string()))?;
        if resolver.is_empty() {
            warn!("no principals configured; every request will be rejected");
        }
        let mut proxy = ShapeProxy::from_config(&config.upstream, Arc::clone(&audit))
            .map_err(|err| ServerError::Init(err.to_string()))?;
        if config.upstream.source == ShapeSource::ChangeLog {
            info!("serving shapes from the local change log");
            proxy = proxy.with_change_log(ChangeLogSource::new(sequencer.clone()));
        }
        let gateway = MutationGateway::new(
            sequencer,
            RetryPolicy::from_config(&config.gateway),
            Arc::clone(&audit),
        );
        let state = AppState::new(gateway, proxy, Arc::new(resolver), audit);
        Ok(Self {
            bind,
            max_body_bytes: config.server.max_body_bytes,
            state: Arc::new(state),
        })
    }

    /// Returns the router for this server.
    #[must_use]
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state), self.max_body_bytes)
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Transport`] when binding or serving fails.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.bind)
            .await
            .map_err(|err| ServerError::Transport(format!("http bind failed: {err}")))?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Transport`] when serving fails.
    pub async fn serve_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener
            .local_addr()
            .map_err(|err| ServerError::Transport(format!("listener address unavailable: {err}")))?;
        info!(addr = %local, "shapegate listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|err| ServerError::Transport(format!("http server failed: {err}")))?;
        info!("shapegate stopped");
        Ok(())
    }
}

/// Builds the commit sequencer selected by configuration.
fn build_sequencer(config: &ShapegateConfig) -> Result<SharedCommitSequencer, ServerError> {
    match config.store.store_type {
        StoreType::Memory => Ok(SharedCommitSequencer::from_sequencer(InMemoryCommitSequencer::new())),
        StoreType::Sqlite => {
            let sqlite = config
                .store
                .sqlite()
                .ok_or_else(|| ServerError::Config("sqlite store requires path".to_string()))?;
            let store =
                SqliteCommitSequencer::new(&sqlite).map_err(|err| ServerError::Init(err.to_string()))?;
            Ok(SharedCommitSequencer::from_sequencer(store))
        }
    }
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

type Shared = State<Arc<AppState>>;

async fn current_user(State(state): Shared, headers: HeaderMap) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/user")?;
    Ok(Json(principal).into_response())
}

async fn list_todos(State(state): Shared, headers: HeaderMap) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/todos")?;
    let records = state.gateway.list(&principal, Resource::Todos).await?;
    let mut todos = Vec::with_capacity(records.len());
    for record in records {
        todos.push(todo_with_labels(&state, &principal, record).await?);
    }
    Ok(Json(Value::Array(todos)).into_response())
}

async fn show_todo(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/todos/{id}")?;
    let record = state.gateway.show(&principal, Resource::Todos, parse_id(&id)?).await?;
    Ok(Json(todo_with_labels(&state, &principal, record).await?).into_response())
}

async fn create_todo(
    State(state): Shared,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/todos")?;
    let intent: TodoIntent = parse_body(&body)?;
    let result = state.gateway.create(&principal, CreateIntent::Todo(intent)).await?;
    Ok((StatusCode::CREATED, Json(commit_body(Resource::Todos, result)?)).into_response())
}

async fn update_todo(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/todos/{id}")?;
    let id = parse_id(&id)?;
    let intent: TodoIntent = parse_body(&body)?;
    let result = state
        .gateway
        .update(
            &principal,
            UpdateIntent::Todo {
                id,
                intent,
            },
        )
        .await?;
    Ok(Json(commit_body(Resource::Todos, result)?).into_response())
}

async fn delete_todo(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/todos/{id}")?;
    let result = state.gateway.delete(&principal, Resource::Todos, parse_id(&id)?).await?;
    Ok(Json(commit_body(Resource::Todos, result)?).into_response())
}

async fn replace_todo_labels(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/todos/{id}/labels")?;
    let id = parse_id(&id)?;
    let intent: LabelSetIntent = parse_body(&body)?;
    let result = state.gateway.replace_associations(&principal, id, intent).await?;
    Ok(Json(commit_body(Resource::Todos, result)?).into_response())
}

async fn list_labels(State(state): Shared, headers: HeaderMap) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/labels")?;
    let labels = state.gateway.list(&principal, Resource::Labels).await?;
    Ok(Json(labels).into_response())
}

async fn show_label(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/labels/{id}")?;
    let label = state.gateway.show(&principal, Resource::Labels, parse_id(&id)?).await?;
    Ok(Json(label).into_response())
}

async fn create_label(
    State(state): Shared,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/labels")?;
    let intent: LabelIntent = parse_body(&body)?;
    let result = state.gateway.create(&principal, CreateIntent::Label(intent)).await?;
    Ok((StatusCode::CREATED, Json(commit_body(Resource::Labels, result)?)).into_response())
}

async fn update_label(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/labels/{id}")?;
    let id = parse_id(&id)?;
    let intent: LabelIntent = parse_body(&body)?;
    let result = state
        .gateway
        .update(
            &principal,
            UpdateIntent::Label {
                id,
                intent,
            },
        )
        .await?;
    Ok(Json(commit_body(Resource::Labels, result)?).into_response())
}

async fn delete_label(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/labels/{id}")?;
    let result = state.gateway.delete(&principal, Resource::Labels, parse_id(&id)?).await?;
    Ok(Json(commit_body(Resource::Labels, result)?).into_response())
}

async fn shape(
    State(state): Shared,
    headers: HeaderMap,
    Path(route): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let principal = state.authenticate(&headers, "/api/shape/{table}")?;
    let table = Table::from_route(&route).ok_or(SyncError::NotFound)?;
    Ok(state.proxy.relay(&principal, table, query.as_deref()).await?)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses a path id; anything that is not an id is simply not found.
fn parse_id(raw: &str) -> Result<EntityId, SyncError> {
    raw.parse::<u64>().map(EntityId::new).map_err(|_| SyncError::NotFound)
}

/// Parses a JSON body; an empty body is an empty object.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, SyncError> {
    let bytes: &[u8] = if body.iter().all(u8::is_ascii_whitespace) { b"{}" } else { body.as_ref() };
    serde_json::from_slice(bytes).map_err(|err| field_error("body", format!("Invalid JSON body: {err}")))
}

/// Renders a todo with its label ids.
async fn todo_with_labels(
    state: &AppState,
    principal: &Principal,
    record: Record,
) -> Result<Value, SyncError> {
    let label_ids = state.gateway.label_ids(principal, record.id()).await?;
    let mut value = to_object(&record)?;
    value.insert("label_ids".to_string(), to_json(&label_ids)?);
    Ok(Value::Object(value))
}

/// Renders a mutation response with its commit marker.
fn commit_body(resource: Resource, result: CommitResult) -> Result<Value, SyncError> {
    let mut body = Map::new();
    match result.applied {
        Applied::Written {
            record,
            label_ids,
        } => {
            let key = match resource {
                Resource::Todos => "todo",
                Resource::Labels => "label",
            };
            body.insert(key.to_string(), to_json(&record)?);
            if let Some(label_ids) = label_ids {
                body.insert("label_ids".to_string(), to_json(&label_ids)?);
            }
        }
        Applied::Deleted {
            table, ..
        } => {
            let noun = match table {
                Table::Labels => "Label",
                Table::Todos | Table::TodoLabels => "Todo",
            };
            body.insert("message".to_string(), Value::String(format!("{noun} deleted successfully")));
        }
    }
    body.insert("commit_id".to_string(), Value::String(result.commit_id.to_string()));
    Ok(Value::Object(body))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value)
        .map_err(|err| SyncError::StoreUnavailable(format!("response encoding failed: {err}")))
}

fn to_object<T: serde::Serialize>(value: &T) -> Result<Map<String, Value>, SyncError> {
    match to_json(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(SyncError::StoreUnavailable("response encoding failed".to_string())),
    }
}
