// crates/shapegate-gateway/src/lib.rs
// ============================================================================
// Module: Shapegate Gateway Library
// Description: HTTP server for mutations and tenant-scoped shape streams.
// Purpose: Expose the mutation gateway and the shape filter proxy.
// Dependencies: shapegate-core, shapegate-config, axum, reqwest, tokio
// ============================================================================

//! ## Overview
//! `shapegate-gateway` hosts the server side of Shapegate:
//! - [`auth`]: bearer token resolution at the edge.
//! - [`gateway`]: validated, principal-scoped writes with commit markers.
//! - [`proxy`]: scope injection and streaming relay of shape requests.
//! - [`change_log`]: shapes served from the local commit log.
//! - [`server`]: axum routes and lifecycle.
//! - [`audit`]: JSON-line audit events.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod audit;
pub mod auth;
pub mod change_log;
pub mod gateway;
pub mod proxy;
pub mod server;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use audit::AuditEvent;
pub use audit::AuditSink;
pub use audit::FileAuditSink;
pub use audit::NoopAuditSink;
pub use audit::StderrAuditSink;
pub use auth::AuthError;
pub use auth::ConfigPrincipalResolver;
pub use change_log::ChangeLogSource;
pub use gateway::CreateIntent;
pub use gateway::MutationGateway;
pub use gateway::Resource;
pub use gateway::RetryPolicy;
pub use gateway::UpdateIntent;
pub use proxy::ProxyError;
pub use proxy::ShapeProxy;
pub use server::ApiError;
pub use server::AppState;
pub use server::ServerError;
pub use server::ShapegateServer;
pub use server::router;
