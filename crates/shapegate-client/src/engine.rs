// crates/shapegate-client/src/engine.rs
// ============================================================================
// Module: Reconciliation Engine
// Description: Optimistic mutation dispatch and snapshot publication per shape.
// Purpose: Show writes immediately and converge on the authoritative stream.
// Dependencies: tokio, tracing, shapegate-core
// ============================================================================

//! ## Overview
//! A [`ShapeHandle`] owns one [`ShapeCollection`] behind a mutex and publishes
//! an [`Arc<Snapshot>`] through a `watch` channel after every change. The
//! mutex is never held across a network call: a mutation overlays its change,
//! releases the lock, waits for the gateway, then re-locks to confirm or roll
//! back. Handles of different shapes share nothing.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use shapegate_core::EntityId;
use shapegate_core::MutationId;
use shapegate_core::ShapeCursor;
use shapegate_core::Table;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;
use tracing::warn;

use crate::collection::BatchOutcome;
use crate::collection::ShapeCollection;
use crate::collection::Snapshot;
use crate::error::ClientError;
use crate::transport::MutationReceipt;
use crate::transport::MutationRequest;
use crate::transport::MutationTransport;
use crate::transport::RowIntent;
use crate::transport::ShapeBatch;

// ============================================================================
// SECTION: Handle
// ============================================================================

/// Shared handle to one shape's collection.
#[derive(Clone)]
pub struct ShapeHandle {
    /// Table of the shape.
    table: Table,
    /// Single-writer collection state.
    collection: Arc<Mutex<ShapeCollection>>,
    /// Published snapshots.
    snapshots: Arc<watch::Sender<Arc<Snapshot>>>,
    /// Gateway transport.
    transport: Arc<dyn MutationTransport>,
    /// Next client-local mutation id.
    next_mutation: Arc<AtomicU64>,
}

impl ShapeHandle {
    /// Creates a handle with an empty collection.
    #[must_use]
    pub fn new(table: Table, transport: Arc<dyn MutationTransport>) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(Snapshot::empty(table)));
        Self {
            table,
            collection: Arc::new(Mutex::new(ShapeCollection::new(table))),
            snapshots: Arc::new(snapshots),
            transport,
            next_mutation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Table of the shape.
    #[must_use]
    pub const fn table(&self) -> Table {
        self.table
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.borrow().clone()
    }

    /// Subscribes to snapshot updates.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    /// Cursor the next poll resumes from.
    pub async fn cursor(&self) -> ShapeCursor {
        self.collection.lock().await.cursor().clone()
    }

    /// Applies a polled batch and publishes the result.
    pub async fn apply(&self, batch: ShapeBatch) -> BatchOutcome {
        let mut collection = self.collection.lock().await;
        let outcome = collection.apply_batch(batch);
        self.publish(&collection);
        drop(collection);
        debug!(
            table = self.table.as_str(),
            applied = outcome.applied,
            ignored = outcome.ignored,
            retired = outcome.retired,
            up_to_date = outcome.up_to_date,
            must_refetch = outcome.must_refetch,
            "shape batch applied"
        );
        outcome
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Creates a row optimistically.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the gateway rejects the write; the local
    /// change is rolled back first.
    pub async fn insert(&self, intent: RowIntent) -> Result<MutationReceipt, ClientError> {
        self.dispatch(MutationRequest::Create(intent)).await
    }

    /// Updates a row optimistically.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the gateway rejects the write; the local
    /// change is rolled back first.
    pub async fn update(&self, id: EntityId, intent: RowIntent) -> Result<MutationReceipt, ClientError> {
        self.dispatch(MutationRequest::Update {
            id,
            intent,
        })
        .await
    }

    /// Deletes a row of this shape's table optimistically.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the gateway rejects the write; the local
    /// change is rolled back first.
    pub async fn delete(&self, id: EntityId) -> Result<MutationReceipt, ClientError> {
        self.dispatch(MutationRequest::Delete {
            table: self.table,
            id,
        })
        .await
    }

    /// Replaces the label set of a todo optimistically.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the gateway rejects the write; the local
    /// change is rolled back first.
    pub async fn replace_labels(
        &self,
        todo_id: EntityId,
        label_ids: Vec<EntityId>,
    ) -> Result<MutationReceipt, ClientError> {
        self.dispatch(MutationRequest::ReplaceLabels {
            todo_id,
            label_ids,
        })
        .await
    }

    /// Overlays, sends, then confirms or rolls back one mutation.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] from the transport.
    pub async fn dispatch(&self, request: MutationRequest) -> Result<MutationReceipt, ClientError> {
        let mutation = MutationId::new(self.next_mutation.fetch_add(1, Ordering::Relaxed));
        {
            let mut collection = self.collection.lock().await;
            let changes = collection.optimistic_changes(mutation, &request);
            collection.begin(mutation, changes);
            self.publish(&collection);
        }
        debug!(table = self.table.as_str(), mutation = mutation.get(), "mutation overlaid");

        match self.transport.send(&request).await {
            Ok(receipt) => {
                let mut collection = self.collection.lock().await;
                let changes = collection.confirmed_changes(mutation, &request, &receipt);
                let retired = collection.confirm(mutation, receipt.commit_id, changes);
                self.publish(&collection);
                drop(collection);
                debug!(
                    table = self.table.as_str(),
                    mutation = mutation.get(),
                    commit_id = receipt.commit_id.get(),
                    retired,
                    "mutation confirmed"
                );
                Ok(receipt)
            }
            Err(error) => {
                let mut collection = self.collection.lock().await;
                collection.rollback(mutation);
                self.publish(&collection);
                drop(collection);
                warn!(table = self.table.as_str(), mutation = mutation.get(), error = %error, "mutation rolled back");
                Err(error)
            }
        }
    }

    /// Publishes the collection's current view.
    fn publish(&self, collection: &ShapeCollection) {
        self.snapshots.send_replace(Arc::new(collection.snapshot()));
    }
}
