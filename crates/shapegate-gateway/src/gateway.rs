// crates/shapegate-gateway/src/gateway.rs
// ============================================================================
// Module: Mutation Gateway
// Description: Validates, scopes, and commits CRUD intents.
// Purpose: Turn an intent plus the acting principal into one committed effect.
// Dependencies: shapegate-core, tokio, tracing
// ============================================================================

//! ## Overview
//! The gateway is the only write path. Each operation validates its intent
//! before any transaction begins, binds the effect to the acting principal,
//! and hands it to the [`CommitSequencer`]. Ownership is re-verified by the
//! sequencer inside the transaction that mutates, so a foreign row is
//! indistinguishable from a missing one.
//!
//! `StoreUnavailable` is retried up to the configured attempt count with a
//! linear backoff. Every other failure is returned unchanged on the first
//! attempt.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use shapegate_config::GatewayConfig;
use shapegate_core::CommitError;
use shapegate_core::CommitResult;
use shapegate_core::CommitSequencer;
use shapegate_core::Effect;
use shapegate_core::EntityId;
use shapegate_core::LabelIntent;
use shapegate_core::LabelSetIntent;
use shapegate_core::Principal;
use shapegate_core::Record;
use shapegate_core::ScopedEffect;
use shapegate_core::SharedCommitSequencer;
use shapegate_core::SyncError;
use shapegate_core::Table;
use shapegate_core::TodoIntent;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::audit::AuditEvent;
use crate::audit::AuditSink;
use crate::audit::MutationAuditEvent;

// ============================================================================
// SECTION: Intents
// ============================================================================

/// Mutable resource collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// `/api/todos`.
    Todos,
    /// `/api/labels`.
    Labels,
}

impl Resource {
    /// Returns the backing table.
    #[must_use]
    pub const fn table(self) -> Table {
        match self {
            Self::Todos => Table::Todos,
            Self::Labels => Table::Labels,
        }
    }
}

/// Create request for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateIntent {
    /// New todo.
    Todo(TodoIntent),
    /// New label.
    Label(LabelIntent),
}

impl CreateIntent {
    /// Validates the intent into an effect.
    fn into_effect(self) -> Result<Effect, SyncError> {
        Ok(match self {
            Self::Todo(intent) => Effect::InsertTodo(intent.validate_create()?),
            Self::Label(intent) => Effect::InsertLabel(intent.validate_create()?),
        })
    }
}

/// Partial update of one existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateIntent {
    /// Todo update.
    Todo {
        /// Target row.
        id: EntityId,
        /// Fields to change.
        intent: TodoIntent,
    },
    /// Label update.
    Label {
        /// Target row.
        id: EntityId,
        /// Fields to change.
        intent: LabelIntent,
    },
}

impl UpdateIntent {
    /// Validates the intent into an effect.
    fn into_effect(self) -> Result<Effect, SyncError> {
        Ok(match self {
            Self::Todo {
                id,
                intent,
            } => Effect::UpdateTodo {
                id,
                patch: intent.validate_update()?,
            },
            Self::Label {
                id,
                intent,
            } => Effect::UpdateLabel {
                id,
                patch: intent.validate_update()?,
            },
        })
    }
}

// ============================================================================
// SECTION: Retry Policy
// ============================================================================

/// Retry policy for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff step; attempt `n` waits `n * step`.
    pub backoff_step: Duration,
}

impl RetryPolicy {
    /// Builds a policy from gateway configuration.
    #[must_use]
    pub const fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_step: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

// ============================================================================
// SECTION: Gateway
// ============================================================================

/// Mutation gateway over a shared commit sequencer.
#[derive(Clone)]
pub struct MutationGateway {
    /// Commit sequencer.
    sequencer: SharedCommitSequencer,
    /// Retry policy.
    policy: RetryPolicy,
    /// Audit sink.
    audit: Arc<dyn AuditSink>,
}

impl MutationGateway {
    /// Creates a gateway.
    #[must_use]
    pub fn new(
        sequencer: SharedCommitSequencer,
        policy: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sequencer,
            policy,
            audit,
        }
    }

    /// Creates a todo or label owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] before any transaction when the
    /// intent is invalid, otherwise the sequencer failure.
    pub async fn create(
        &self,
        principal: &Principal,
        intent: CreateIntent,
    ) -> Result<CommitResult, SyncError> {
        let effect = intent.into_effect()?;
        self.execute(principal, effect).await
    }

    /// Updates a row owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] when the row is absent or foreign.
    pub async fn update(
        &self,
        principal: &Principal,
        intent: UpdateIntent,
    ) -> Result<CommitResult, SyncError> {
        let effect = intent.into_effect()?;
        self.execute(principal, effect).await
    }

    /// Deletes a row owned by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] when the row is absent or foreign.
    pub async fn delete(
        &self,
        principal: &Principal,
        resource: Resource,
        id: EntityId,
    ) -> Result<CommitResult, SyncError> {
        let effect = match resource {
            Resource::Todos => Effect::DeleteTodo {
                id,
            },
            Resource::Labels => Effect::DeleteLabel {
                id,
            },
        };
        self.execute(principal, effect).await
    }

    /// Replaces the full label set of a todo owned by the caller.
    ///
    /// Label ids the caller does not own are dropped without error.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] when `label_ids` is missing and
    /// [`SyncError::NotFound`] when the todo is absent or foreign.
    pub async fn replace_associations(
        &self,
        principal: &Principal,
        todo_id: EntityId,
        intent: LabelSetIntent,
    ) -> Result<CommitResult, SyncError> {
        let label_ids = intent.validate()?;
        self.execute(
            principal,
            Effect::ReplaceTodoLabels {
                todo_id,
                label_ids,
            },
        )
        .await
    }

    /// Lists the caller's rows.
    ///
    /// # Errors
    ///
    /// Returns the sequencer failure.
    pub async fn list(
        &self,
        principal: &Principal,
        resource: Resource,
    ) -> Result<Vec<Record>, SyncError> {
        let owner = principal.id;
        self.read(move |sequencer| sequencer.list(owner, resource.table())).await
    }

    /// Loads one of the caller's rows.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] when the row is absent or foreign.
    pub async fn show(
        &self,
        principal: &Principal,
        resource: Resource,
        id: EntityId,
    ) -> Result<Record, SyncError> {
        let owner = principal.id;
        self.read(move |sequencer| sequencer.fetch(owner, resource.table(), id))
            .await?
            .ok_or(SyncError::NotFound)
    }

    /// Returns the label ids of one of the caller's todos.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] when the todo is absent or foreign.
    pub async fn label_ids(
        &self,
        principal: &Principal,
        todo_id: EntityId,
    ) -> Result<Vec<EntityId>, SyncError> {
        let owner = principal.id;
        self.read(move |sequencer| sequencer.label_ids(owner, todo_id)).await
    }

    /// Commits an effect with retries on transient failures.
    async fn execute(
        &self,
        principal: &Principal,
        effect: Effect,
    ) -> Result<CommitResult, SyncError> {
        let action = effect.label();
        let scoped = ScopedEffect {
            owner: principal.id,
            effect,
        };
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.commit_blocking(scoped.clone()).await {
                Ok(result) => {
                    info!(
                        principal = principal.id.get(),
                        action,
                        commit_id = result.commit_id.get(),
                        attempt,
                        "mutation committed"
                    );
                    self.audit.record(&AuditEvent::Mutation(MutationAuditEvent::new(
                        principal.id.get(),
                        action,
                        Ok(result.commit_id.to_string()),
                        attempt,
                    )));
                    return Ok(result);
                }
                Err(CommitError::StoreUnavailable(message)) if attempt < max_attempts => {
                    warn!(principal = principal.id.get(), action, attempt, %message, "store unavailable, retrying");
                    tokio::time::sleep(self.policy.backoff_step * attempt).await;
                    attempt += 1;
                }
                Err(error) => {
                    let error = SyncError::from(error);
                    debug!(principal = principal.id.get(), action, attempt, kind = error.kind(), "mutation rejected");
                    self.audit.record(&AuditEvent::Mutation(MutationAuditEvent::new(
                        principal.id.get(),
                        action,
                        Err(error.kind()),
                        attempt,
                    )));
                    return Err(error);
                }
            }
        }
    }

    /// Runs one commit on the blocking pool.
    async fn commit_blocking(&self, scoped: ScopedEffect) -> Result<CommitResult, CommitError> {
        let sequencer = self.sequencer.clone();
        tokio::task::spawn_blocking(move || sequencer.commit(&scoped))
            .await
            .map_err(|err| CommitError::StoreUnavailable(format!("commit task failed: {err}")))?
    }

    /// Runs a scoped read on the blocking pool.
    async fn read<T, F>(&self, read: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&SharedCommitSequencer) -> Result<T, CommitError> + Send + 'static,
    {
        let sequencer = self.sequencer.clone();
        tokio::task::spawn_blocking(move || read(&sequencer))
            .await
            .map_err(|err| SyncError::StoreUnavailable(format!("read task failed: {err}")))?
            .map_err(SyncError::from)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
