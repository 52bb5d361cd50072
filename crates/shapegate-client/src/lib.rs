// crates/shapegate-client/src/lib.rs
// ============================================================================
// Module: Shapegate Client
// Description: Client reconciliation engine for tenant-scoped shapes.
// Purpose: Optimistic local writes reconciled against the change stream.
// Dependencies: shapegate-core, reqwest, tokio, tracing
// ============================================================================

//! ## Overview
//! One [`ShapeHandle`] per subscribed shape holds a [`ShapeCollection`]: the
//! authoritative rows from the stream plus an overlay of pending mutations.
//! Mutations go through a [`MutationTransport`] and are correlated with the
//! stream by the commit marker the gateway returns. A [`ShapeSubscription`]
//! feeds the collection from a [`ShapeLog`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod collection;
pub mod engine;
pub mod error;
pub mod http;
pub mod subscription;
pub mod transport;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use collection::BatchOutcome;
pub use collection::ShapeCollection;
pub use collection::Snapshot;
pub use collection::provisional_key;
pub use engine::ShapeHandle;
pub use error::ClientError;
pub use http::HttpEndpoint;
pub use http::HttpMutationTransport;
pub use http::HttpShapeLog;
pub use subscription::Backoff;
pub use subscription::ShapeSubscription;
pub use subscription::SubscriptionTask;
pub use transport::MutationReceipt;
pub use transport::MutationRequest;
pub use transport::MutationTransport;
pub use transport::Row;
pub use transport::RowIntent;
pub use transport::ShapeBatch;
pub use transport::ShapeLog;
