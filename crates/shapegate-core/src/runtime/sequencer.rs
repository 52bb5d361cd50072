// crates/shapegate-core/src/runtime/sequencer.rs
// ============================================================================
// Module: Shapegate In-Memory Sequencer
// Description: In-memory commit sequencer for tests and local runs.
// Purpose: Provide a deterministic sequencer with the same contract as SQLite.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`InMemoryCommitSequencer`] applies each effect to a copy of its state and
//! swaps the copy in only when the whole effect succeeded, so a failed effect
//! leaves no trace. Commit markers start at 1 and increase by one per commit.
//! Failures can be injected to exercise retry paths.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use crate::core::Applied;
use crate::core::CommitId;
use crate::core::CommitResult;
use crate::core::Effect;
use crate::core::EntityId;
use crate::core::Label;
use crate::core::PrincipalId;
use crate::core::Record;
use crate::core::ScopedEffect;
use crate::core::Table;
use crate::core::Todo;
use crate::core::TodoLabel;
use crate::core::now_rfc3339;
use crate::core::stream::Operation;
use crate::interfaces::CommitError;
use crate::interfaces::CommitSequencer;
use crate::interfaces::LoggedChange;
use crate::runtime::changes::row_change;

// ============================================================================
// SECTION: State
// ============================================================================

/// Store contents.
#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Last allocated commit marker.
    last_commit: u64,
    /// Last allocated todo id.
    last_todo: u64,
    /// Last allocated label id.
    last_label: u64,
    /// Todo rows.
    todos: BTreeMap<EntityId, Todo>,
    /// Label rows.
    labels: BTreeMap<EntityId, Label>,
    /// Junction rows.
    links: BTreeSet<TodoLabel>,
    /// Change log.
    log: Vec<LoggedChange>,
}

/// Mutable view of one in-flight commit.
struct MemoryTx<'a> {
    /// Working copy.
    state: &'a mut MemoryState,
    /// Acting principal.
    owner: PrincipalId,
    /// Marker of this commit.
    commit_id: CommitId,
    /// Timestamp applied to written rows.
    now: String,
}

impl MemoryTx<'_> {
    /// Appends a change-log entry.
    fn log<R>(&mut self, table: Table, row: &R, operation: Operation) -> Result<(), CommitError>
    where
        R: crate::core::KeyedRow + serde::Serialize,
    {
        let entry = row_change(table, row, operation, self.commit_id)?;
        let offset = self.state.log.last().map_or(1, |last| last.offset + 1);
        self.state.log.push(LoggedChange {
            offset,
            table,
            owner: self.owner,
            entry,
        });
        Ok(())
    }

    /// Returns an owned todo or `NotFound`.
    fn owned_todo(&self, id: EntityId) -> Result<Todo, CommitError> {
        self.state
            .todos
            .get(&id)
            .filter(|todo| todo.user_id == self.owner)
            .cloned()
            .ok_or(CommitError::NotFound)
    }

    /// Returns an owned label or `NotFound`.
    fn owned_label(&self, id: EntityId) -> Result<Label, CommitError> {
        self.state
            .labels
            .get(&id)
            .filter(|label| label.user_id == self.owner)
            .cloned()
            .ok_or(CommitError::NotFound)
    }

    /// Replaces the label set of a todo, dropping labels the owner does not hold.
    fn replace_links(
        &mut self,
        todo_id: EntityId,
        requested: &BTreeSet<EntityId>,
    ) -> Result<Vec<EntityId>, CommitError> {
        let wanted: BTreeSet<EntityId> = requested
            .iter()
            .copied()
            .filter(|id| self.state.labels.get(id).is_some_and(|label| label.user_id == self.owner))
            .collect();
        let current: Vec<TodoLabel> =
            self.state.links.iter().copied().filter(|link| link.todo_id == todo_id).collect();
        for link in current {
            if !wanted.contains(&link.label_id) {
                self.state.links.remove(&link);
                self.log(Table::TodoLabels, &link, Operation::Delete)?;
            }
        }
        for label_id in &wanted {
            let link = TodoLabel {
                label_id: *label_id,
                todo_id,
            };
            if self.state.links.insert(link) {
                self.log(Table::TodoLabels, &link, Operation::Insert)?;
            }
        }
        Ok(wanted.into_iter().collect())
    }

    /// Removes every junction row matching the predicate.
    fn unlink(&mut self, matches: impl Fn(&TodoLabel) -> bool) -> Result<(), CommitError> {
        let doomed: Vec<TodoLabel> = self.state.links.iter().copied().filter(|l| matches(l)).collect();
        for link in doomed {
            self.state.links.remove(&link);
            self.log(Table::TodoLabels, &link, Operation::Delete)?;
        }
        Ok(())
    }

    /// Applies one effect.
    fn apply(&mut self, effect: &Effect) -> Result<Applied, CommitError> {
        match effect {
            Effect::InsertTodo(draft) => {
                self.state.last_todo += 1;
                let todo = Todo {
                    id: EntityId::new(self.state.last_todo),
                    user_id: self.owner,
                    title: draft.title.clone(),
                    description: draft.description.clone(),
                    completed: draft.completed,
                    created_at: self.now.clone(),
                    updated_at: self.now.clone(),
                };
                self.state.todos.insert(todo.id, todo.clone());
                self.log(Table::Todos, &todo, Operation::Insert)?;
                let label_ids = match &draft.label_ids {
                    Some(ids) => Some(self.replace_links(todo.id, ids)?),
                    None => None,
                };
                Ok(Applied::Written {
                    record: Record::Todo(todo),
                    label_ids,
                })
            }
            Effect::UpdateTodo {
                id,
                patch,
            } => {
                let mut todo = self.owned_todo(*id)?;
                if let Some(title) = &patch.title {
                    todo.title.clone_from(title);
                }
                if let Some(description) = &patch.description {
                    todo.description.clone_from(description);
                }
                if let Some(completed) = patch.completed {
                    todo.completed = completed;
                }
                todo.updated_at.clone_from(&self.now);
                self.state.todos.insert(todo.id, todo.clone());
                self.log(Table::Todos, &todo, Operation::Update)?;
                let label_ids = match &patch.label_ids {
                    Some(ids) => Some(self.replace_links(todo.id, ids)?),
                    None => None,
                };
                Ok(Applied::Written {
                    record: Record::Todo(todo),
                    label_ids,
                })
            }
            Effect::DeleteTodo {
                id,
            } => {
                let todo = self.owned_todo(*id)?;
                self.unlink(|link| link.todo_id == todo.id)?;
                self.state.todos.remove(&todo.id);
                self.log(Table::Todos, &todo, Operation::Delete)?;
                Ok(Applied::Deleted {
                    table: Table::Todos,
                    id: todo.id,
                })
            }
            Effect::InsertLabel(draft) => {
                self.state.last_label += 1;
                let label = Label {
                    id: EntityId::new(self.state.last_label),
                    user_id: self.owner,
                    name: draft.name.clone(),
                    color: draft.color.clone(),
                    created_at: self.now.clone(),
                    updated_at: self.now.clone(),
                };
                self.state.labels.insert(label.id, label.clone());
                self.log(Table::Labels, &label, Operation::Insert)?;
                Ok(Applied::Written {
                    record: Record::Label(label),
                    label_ids: None,
                })
            }
            Effect::UpdateLabel {
                id,
                patch,
            } => {
                let mut label = self.owned_label(*id)?;
                if let Some(name) = &patch.name {
                    label.name.clone_from(name);
                }
                if let Some(color) = &patch.color {
                    label.color.clone_from(color);
                }
                label.updated_at.clone_from(&self.now);
                self.state.labels.insert(label.id, label.clone());
                self.log(Table::Labels, &label, Operation::Update)?;
                Ok(Applied::Written {
                    record: Record::Label(label),
                    label_ids: None,
                })
            }
            Effect::DeleteLabel {
                id,
            } => {
                let label = self.owned_label(*id)?;
                self.unlink(|link| link.label_id == label.id)?;
                self.state.labels.remove(&label.id);
                self.log(Table::Labels, &label, Operation::Delete)?;
                Ok(Applied::Deleted {
                    table: Table::Labels,
                    id: label.id,
                })
            }
            Effect::ReplaceTodoLabels {
                todo_id,
                label_ids,
            } => {
                let todo = self.owned_todo(*todo_id)?;
                let applied = self.replace_links(todo.id, label_ids)?;
                Ok(Applied::Written {
                    record: Record::Todo(todo),
                    label_ids: Some(applied),
                })
            }
        }
    }
}

// ============================================================================
// SECTION: Sequencer
// ============================================================================

/// In-memory commit sequencer for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCommitSequencer {
    /// Store contents.
    state: Arc<Mutex<MemoryState>>,
    /// Failures returned by upcoming commits, in order.
    injected: Arc<Mutex<VecDeque<CommitError>>>,
}

impl InMemoryCommitSequencer {
    /// Creates an empty sequencer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure returned by the next commit instead of applying it.
    pub fn inject_failure(&self, error: CommitError) {
        if let Ok(mut injected) = self.injected.lock() {
            injected.push_back(error);
        }
    }

    /// Returns the number of committed effects.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.lock().map_or(0, |state| state.last_commit)
    }

    /// Locks the state, mapping poisoning to a store error.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, CommitError> {
        self.state
            .lock()
            .map_err(|_| CommitError::StoreUnavailable("in-memory store mutex poisoned".to_string()))
    }
}

impl CommitSequencer for InMemoryCommitSequencer {
    fn commit(&self, effect: &ScopedEffect) -> Result<CommitResult, CommitError> {
        if let Some(error) = self.injected.lock().ok().and_then(|mut queue| queue.pop_front()) {
            return Err(error);
        }
        let mut guard = self.lock()?;
        let mut working = guard.clone();
        working.last_commit += 1;
        let commit_id = CommitId::new(working.last_commit);
        let applied = MemoryTx {
            state: &mut working,
            owner: effect.owner,
            commit_id,
            now: now_rfc3339(),
        }
        .apply(&effect.effect)?;
        *guard = working;
        drop(guard);
        Ok(CommitResult {
            applied,
            commit_id,
        })
    }

    fn fetch(
        &self,
        owner: PrincipalId,
        table: Table,
        id: EntityId,
    ) -> Result<Option<Record>, CommitError> {
        let state = self.lock()?;
        Ok(match table {
            Table::Todos => state
                .todos
                .get(&id)
                .filter(|todo| todo.user_id == owner)
                .cloned()
                .map(Record::Todo),
            Table::Labels => state
                .labels
                .get(&id)
                .filter(|label| label.user_id == owner)
                .cloned()
                .map(Record::Label),
            Table::TodoLabels => None,
        })
    }

    fn list(&self, owner: PrincipalId, table: Table) -> Result<Vec<Record>, CommitError> {
        let state = self.lock()?;
        Ok(match table {
            Table::Todos => state
                .todos
                .values()
                .rev()
                .filter(|todo| todo.user_id == owner)
                .cloned()
                .map(Record::Todo)
                .collect(),
            Table::Labels => {
                let mut labels: Vec<Label> =
                    state.labels.values().filter(|label| label.user_id == owner).cloned().collect();
                labels.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
                labels.into_iter().map(Record::Label).collect()
            }
            Table::TodoLabels => Vec::new(),
        })
    }

    fn label_ids(
        &self,
        owner: PrincipalId,
        todo_id: EntityId,
    ) -> Result<Vec<EntityId>, CommitError> {
        let state = self.lock()?;
        if !state.todos.get(&todo_id).is_some_and(|todo| todo.user_id == owner) {
            return Err(CommitError::NotFound);
        }
        Ok(state
            .links
            .iter()
            .filter(|link| link.todo_id == todo_id)
            .map(|link| link.label_id)
            .collect())
    }

    fn changes_since(&self, after: u64, limit: usize) -> Result<Vec<LoggedChange>, CommitError> {
        let state = self.lock()?;
        Ok(state.log.iter().filter(|change| change.offset > after).take(limit).cloned().collect())
    }
}

// ============================================================================
// SECTION: Shared Sequencer
// ============================================================================

/// Shared commit sequencer backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedCommitSequencer {
    /// Inner sequencer implementation.
    inner: Arc<dyn CommitSequencer + Send + Sync>,
}

impl SharedCommitSequencer {
    /// Wraps a sequencer in a shared, clonable wrapper.
    #[must_use]
    pub fn from_sequencer(sequencer: impl CommitSequencer + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(sequencer),
        }
    }

    /// Wraps an existing shared sequencer.
    #[must_use]
    pub const fn new(sequencer: Arc<dyn CommitSequencer + Send + Sync>) -> Self {
        Self {
            inner: sequencer,
        }
    }
}

impl CommitSequencer for SharedCommitSequencer {
    fn commit(&self, effect: &ScopedEffect) -> Result<CommitResult, CommitError> {
        self.inner.commit(effect)
    }

    fn fetch(
        &self,
        owner: PrincipalId,
        table: Table,
        id: EntityId,
    ) -> Result<Option<Record>, CommitError> {
        self.inner.fetch(owner, table, id)
    }

    fn list(&self, owner: PrincipalId, table: Table) -> Result<Vec<Record>, CommitError> {
        self.inner.list(owner, table)
    }

    fn label_ids(
        &self,
        owner: PrincipalId,
        todo_id: EntityId,
    ) -> Result<Vec<EntityId>, CommitError> {
        self.inner.label_ids(owner, todo_id)
    }

    fn changes_since(&self, after: u64, limit: usize) -> Result<Vec<LoggedChange>, CommitError> {
        self.inner.changes_since(after, limit)
    }
}
