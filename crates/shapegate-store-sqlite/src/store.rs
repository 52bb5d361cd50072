// crates/shapegate-store-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Commit Sequencer
// Description: Durable CommitSequencer backed by SQLite.
// Purpose: Apply one effect per transaction and report its commit marker.
// Dependencies: shapegate-core, rusqlite, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! This module implements [`CommitSequencer`] over `SQLite`. Each effect runs
//! in one `IMMEDIATE` transaction that:
//! 1. allocates a commit marker from the `commits` table (`AUTOINCREMENT`),
//! 2. re-verifies ownership of every touched row,
//! 3. applies the write and appends one `change_log` row per changed row.
//!
//! The marker therefore identifies the exact commit that persisted the
//! effect, and markers increase in commit order. Busy, locked, and I/O
//! failures surface as `StoreUnavailable`; integrity failures surface as
//! `ConstraintViolation`.
//! Security posture: database contents are untrusted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use serde::Deserialize;
use serde::Serialize;
use shapegate_core::Applied;
use shapegate_core::ChangeEntry;
use shapegate_core::CommitError;
use shapegate_core::CommitId;
use shapegate_core::CommitResult;
use shapegate_core::CommitSequencer;
use shapegate_core::Effect;
use shapegate_core::EntityId;
use shapegate_core::KeyedRow;
use shapegate_core::Label;
use shapegate_core::LoggedChange;
use shapegate_core::Operation;
use shapegate_core::PrincipalId;
use shapegate_core::Record;
use shapegate_core::ScopedEffect;
use shapegate_core::Table;
use shapegate_core::Todo;
use shapegate_core::TodoLabel;
use shapegate_core::now_rfc3339;
use shapegate_core::runtime::row_change;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Column list for todo reads.
const TODO_COLUMNS: &str = "id, user_id, title, description, completed, created_at, updated_at";
/// Column list for label reads.
const LABEL_COLUMNS: &str = "id, user_id, name, color, created_at, updated_at";

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteStoreMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode.
    Delete,
}

impl SqliteStoreMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode.
    #[default]
    Full,
    /// Normal synchronous mode.
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` commit sequencer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteStoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStoreConfig {
    /// Builds a config with default pragmas for a database path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
#[must_use]
pub const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` store errors.
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Store I/O error.
    #[error("sqlite store io error: {0}")]
    Io(String),
    /// Database busy, locked, or unreachable.
    #[error("sqlite store unavailable: {0}")]
    Unavailable(String),
    /// Integrity constraint failure.
    #[error("sqlite store constraint violation: {0}")]
    Constraint(String),
    /// Other `SQLite` engine error.
    #[error("sqlite store db error: {0}")]
    Db(String),
    /// Store schema version mismatch.
    #[error("sqlite store version mismatch: {0}")]
    VersionMismatch(String),
    /// Invalid store data or configuration.
    #[error("sqlite store invalid data: {0}")]
    Invalid(String),
    /// Target row absent or owned by another principal.
    #[error("sqlite store row not found")]
    NotFound,
}

impl From<rusqlite::Error> for SqliteStoreError {
    fn from(error: rusqlite::Error) -> Self {
        if matches!(
            error,
            rusqlite::Error::ToSqlConversionFailure(_)
                | rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::IntegralValueOutOfRange(..)
        ) {
            return Self::Invalid(error.to_string());
        }
        match error.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen
                | ErrorCode::DiskFull,
            ) => Self::Unavailable(error.to_string()),
            Some(ErrorCode::ConstraintViolation) => Self::Constraint(error.to_string()),
            _ => Self::Db(error.to_string()),
        }
    }
}

impl From<CommitError> for SqliteStoreError {
    fn from(error: CommitError) -> Self {
        match error {
            CommitError::NotFound => Self::NotFound,
            CommitError::StoreUnavailable(message) => Self::Unavailable(message),
            CommitError::ConstraintViolation(message) => Self::Constraint(message),
            CommitError::Invalid(message) => Self::Invalid(message),
        }
    }
}

impl From<SqliteStoreError> for CommitError {
    fn from(error: SqliteStoreError) -> Self {
        match error {
            SqliteStoreError::NotFound => Self::NotFound,
            SqliteStoreError::Io(message) | SqliteStoreError::Unavailable(message) => {
                Self::StoreUnavailable(message)
            }
            SqliteStoreError::Constraint(message) => Self::ConstraintViolation(message),
            SqliteStoreError::Db(message)
            | SqliteStoreError::VersionMismatch(message)
            | SqliteStoreError::Invalid(message) => Self::Invalid(message),
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// `SQLite`-backed commit sequencer.
#[derive(Clone)]
pub struct SqliteCommitSequencer {
    /// Shared `SQLite` connection guarded by a mutex.
    connection: Arc<Mutex<Connection>>,
}

impl SqliteCommitSequencer {
    /// Opens an `SQLite`-backed commit sequencer.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStoreError`] when the database cannot be opened or
    /// initialized.
    pub fn new(config: &SqliteStoreConfig) -> Result<Self, SqliteStoreError> {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        let mut connection = open_connection(config)?;
        initialize_schema(&mut connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    /// Locks the shared connection.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SqliteStoreError> {
        self.connection.lock().map_err(|_| SqliteStoreError::Db("mutex poisoned".to_string()))
    }

    /// Applies an effect in one transaction.
    fn commit_effect(&self, effect: &ScopedEffect) -> Result<CommitResult, SqliteStoreError> {
        let now = now_rfc3339();
        let mut guard = self.lock()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO commits (principal_id, effect, committed_at) VALUES (?1, ?2, ?3)",
            params![effect.owner.get(), effect.effect.label(), now],
        )?;
        let commit_id = u64::try_from(tx.last_insert_rowid())
            .map(CommitId::new)
            .map_err(|_| SqliteStoreError::Invalid("negative commit id".to_string()))?;
        let applied = SqliteTx {
            tx: &tx,
            owner: effect.owner,
            commit_id,
            now,
        }
        .apply(&effect.effect)?;
        tx.commit()?;
        drop(guard);
        Ok(CommitResult {
            applied,
            commit_id,
        })
    }

    /// Loads one owned row.
    fn fetch_row(
        &self,
        owner: PrincipalId,
        table: Table,
        id: EntityId,
    ) -> Result<Option<Record>, SqliteStoreError> {
        let guard = self.lock()?;
        let record = match table {
            Table::Todos => guard
                .query_row(
                    &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1 AND user_id = ?2"),
                    params![id.get(), owner.get()],
                    todo_from_row,
                )
                .optional()?
                .map(Record::Todo),
            Table::Labels => guard
                .query_row(
                    &format!("SELECT {LABEL_COLUMNS} FROM labels WHERE id = ?1 AND user_id = ?2"),
                    params![id.get(), owner.get()],
                    label_from_row,
                )
                .optional()?
                .map(Record::Label),
            Table::TodoLabels => None,
        };
        drop(guard);
        Ok(record)
    }

    /// Lists owned rows in presentation order.
    fn list_rows(&self, owner: PrincipalId, table: Table) -> Result<Vec<Record>, SqliteStoreError> {
        let guard = self.lock()?;
        let records = match table {
            Table::Todos => {
                let mut stmt = guard.prepare(&format!(
                    "SELECT {TODO_COLUMNS} FROM todos WHERE user_id = ?1 ORDER BY id DESC"
                ))?;
                stmt.query_map(params![owner.get()], todo_from_row)?
                    .map(|row| row.map(Record::Todo))
                    .collect::<Result<Vec<_>, _>>()?
            }
            Table::Labels => {
                let mut stmt = guard.prepare(&format!(
                    "SELECT {LABEL_COLUMNS} FROM labels WHERE user_id = ?1 ORDER BY name, id"
                ))?;
                stmt.query_map(params![owner.get()], label_from_row)?
                    .map(|row| row.map(Record::Label))
                    .collect::<Result<Vec<_>, _>>()?
            }
            Table::TodoLabels => Vec::new(),
        };
        drop(guard);
        Ok(records)
    }

    /// Returns the label ids attached to an owned todo.
    fn todo_label_ids(
        &self,
        owner: PrincipalId,
        todo_id: EntityId,
    ) -> Result<Vec<EntityId>, SqliteStoreError> {
        let guard = self.lock()?;
        let owned: Option<u64> = guard
            .query_row(
                "SELECT id FROM todos WHERE id = ?1 AND user_id = ?2",
                params![todo_id.get(), owner.get()],
                |row| row.get(0),
            )
            .optional()?;
        if owned.is_none() {
            return Err(SqliteStoreError::NotFound);
        }
        let ids = linked_labels(&guard, todo_id)?;
        drop(guard);
        Ok(ids)
    }

    /// Reads change-log rows after an offset.
    fn read_changes(&self, after: u64, limit: usize) -> Result<Vec<LoggedChange>, SqliteStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let guard = self.lock()?;
        let mut stmt = guard.prepare(
            "SELECT seq, table_name, owner_id, entry_json FROM change_log WHERE seq > ?1 ORDER BY \
             seq LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![after, limit], |row| {
                let seq: u64 = row.get(0)?;
                let table: String = row.get(1)?;
                let owner: u64 = row.get(2)?;
                let entry: String = row.get(3)?;
                Ok((seq, table, owner, entry))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(guard);
        rows.into_iter()
            .map(|(offset, table, owner, entry)| {
                let table = Table::from_name(&table).ok_or_else(|| {
                    SqliteStoreError::Invalid(format!("unknown change-log table: {table}"))
                })?;
                let owner = PrincipalId::from_raw(owner)
                    .ok_or_else(|| SqliteStoreError::Invalid("zero change-log owner".to_string()))?;
                let entry: ChangeEntry = serde_json::from_str(&entry)
                    .map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
                Ok(LoggedChange {
                    offset,
                    table,
                    owner,
                    entry,
                })
            })
            .collect()
    }
}

impl CommitSequencer for SqliteCommitSequencer {
    fn commit(&self, effect: &ScopedEffect) -> Result<CommitResult, CommitError> {
        self.commit_effect(effect).map_err(CommitError::from)
    }

    fn fetch(
        &self,
        owner: PrincipalId,
        table: Table,
        id: EntityId,
    ) -> Result<Option<Record>, CommitError> {
        self.fetch_row(owner, table, id).map_err(CommitError::from)
    }

    fn list(&self, owner: PrincipalId, table: Table) -> Result<Vec<Record>, CommitError> {
        self.list_rows(owner, table).map_err(CommitError::from)
    }

    fn label_ids(
        &self,
        owner: PrincipalId,
        todo_id: EntityId,
    ) -> Result<Vec<EntityId>, CommitError> {
        self.todo_label_ids(owner, todo_id).map_err(CommitError::from)
    }

    fn changes_since(&self, after: u64, limit: usize) -> Result<Vec<LoggedChange>, CommitError> {
        self.read_changes(after, limit).map_err(CommitError::from)
    }
}

// ============================================================================
// SECTION: Transaction
// ============================================================================

/// One in-flight commit.
struct SqliteTx<'a, 'conn> {
    /// Open transaction.
    tx: &'a Transaction<'conn>,
    /// Acting principal.
    owner: PrincipalId,
    /// Marker of this commit.
    commit_id: CommitId,
    /// Timestamp applied to written rows.
    now: String,
}

impl SqliteTx<'_, '_> {
    /// Appends a change-log row.
    fn log<R>(&self, table: Table, row: &R, operation: Operation) -> Result<(), SqliteStoreError>
    where
        R: KeyedRow + Serialize,
    {
        let entry = row_change(table, row, operation, self.commit_id)?;
        let json =
            serde_json::to_string(&entry).map_err(|err| SqliteStoreError::Invalid(err.to_string()))?;
        self.tx.execute(
            "INSERT INTO change_log (commit_id, table_name, owner_id, entry_json) VALUES (?1, ?2, \
             ?3, ?4)",
            params![self.commit_id.get(), table.as_str(), self.owner.get(), json],
        )?;
        Ok(())
    }

    /// Loads an owned todo or fails with `NotFound`.
    fn owned_todo(&self, id: EntityId) -> Result<Todo, SqliteStoreError> {
        self.tx
            .query_row(
                &format!("SELECT {TODO_COLUMNS} FROM todos WHERE id = ?1 AND user_id = ?2"),
                params![id.get(), self.owner.get()],
                todo_from_row,
            )
            .optional()?
            .ok_or(SqliteStoreError::NotFound)
    }

    /// Loads an owned label or fails with `NotFound`.
    fn owned_label(&self, id: EntityId) -> Result<Label, SqliteStoreError> {
        self.tx
            .query_row(
                &format!("SELECT {LABEL_COLUMNS} FROM labels WHERE id = ?1 AND user_id = ?2"),
                params![id.get(), self.owner.get()],
                label_from_row,
            )
            .optional()?
            .ok_or(SqliteStoreError::NotFound)
    }

    /// Replaces the label set of a todo, dropping labels the owner does not hold.
    fn replace_links(
        &self,
        todo_id: EntityId,
        requested: &BTreeSet<EntityId>,
    ) -> Result<Vec<EntityId>, SqliteStoreError> {
        let mut wanted = BTreeSet::new();
        for label_id in requested {
            let owned: Option<u64> = self
                .tx
                .query_row(
                    "SELECT id FROM labels WHERE id = ?1 AND user_id = ?2",
                    params![label_id.get(), self.owner.get()],
                    |row| row.get(0),
                )
                .optional()?;
            if owned.is_some() {
                wanted.insert(*label_id);
            }
        }
        for label_id in linked_labels(self.tx, todo_id)? {
            if !wanted.contains(&label_id) {
                self.unlink(TodoLabel {
                    label_id,
                    todo_id,
                })?;
            }
        }
        for label_id in &wanted {
            let link = TodoLabel {
                label_id: *label_id,
                todo_id,
            };
            let inserted = self.tx.execute(
                "INSERT OR IGNORE INTO label_todo (label_id, todo_id) VALUES (?1, ?2)",
                params![label_id.get(), todo_id.get()],
            )?;
            if inserted > 0 {
                self.log(Table::TodoLabels, &link, Operation::Insert)?;
            }
        }
        Ok(wanted.into_iter().collect())
    }

    /// Deletes one junction row and logs it.
    fn unlink(&self, link: TodoLabel) -> Result<(), SqliteStoreError> {
        self.tx.execute(
            "DELETE FROM label_todo WHERE label_id = ?1 AND todo_id = ?2",
            params![link.label_id.get(), link.todo_id.get()],
        )?;
        self.log(Table::TodoLabels, &link, Operation::Delete)
    }

    /// Inserts a todo.
    fn insert_todo(&self, todo: &Todo) -> Result<EntityId, SqliteStoreError> {
        self.tx.execute(
            "INSERT INTO todos (user_id, title, description, completed, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                todo.user_id.get(),
                todo.title,
                todo.description,
                todo.completed,
                todo.created_at,
                todo.updated_at
            ],
        )?;
        row_id(self.tx)
    }

    /// Applies one effect.
    fn apply(&self, effect: &Effect) -> Result<Applied, SqliteStoreError> {
        match effect {
            Effect::InsertTodo(draft) => {
                let mut todo = Todo {
                    id: EntityId::new(0),
                    user_id: self.owner,
                    title: draft.title.clone(),
                    description: draft.description.clone(),
                    completed: draft.completed,
                    created_at: self.now.clone(),
                    updated_at: self.now.clone(),
                };
                todo.id = self.insert_todo(&todo)?;
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
                let changed = self.tx.execute(
                    "UPDATE todos SET title = ?1, description = ?2, completed = ?3, updated_at = \
                     ?4 WHERE id = ?5 AND user_id = ?6",
                    params![
                        todo.title,
                        todo.description,
                        todo.completed,
                        todo.updated_at,
                        todo.id.get(),
                        self.owner.get()
                    ],
                )?;
                if changed != 1 {
                    return Err(SqliteStoreError::NotFound);
                }
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
                for label_id in linked_labels(self.tx, todo.id)? {
                    self.unlink(TodoLabel {
                        label_id,
                        todo_id: todo.id,
                    })?;
                }
                self.tx.execute(
                    "DELETE FROM todos WHERE id = ?1 AND user_id = ?2",
                    params![todo.id.get(), self.owner.get()],
                )?;
                self.log(Table::Todos, &todo, Operation::Delete)?;
                Ok(Applied::Deleted {
                    table: Table::Todos,
                    id: todo.id,
                })
            }
            Effect::InsertLabel(draft) => {
                self.tx.execute(
                    "INSERT INTO labels (user_id, name, color, created_at, updated_at) VALUES \
                     (?1, ?2, ?3, ?4, ?5)",
                    params![self.owner.get(), draft.name, draft.color, self.now, self.now],
                )?;
                let label = Label {
                    id: row_id(self.tx)?,
                    user_id: self.owner,
                    name: draft.name.clone(),
                    color: draft.color.clone(),
                    created_at: self.now.clone(),
                    updated_at: self.now.clone(),
                };
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
                self.tx.execute(
                    "UPDATE labels SET name = ?1, color = ?2, updated_at = ?3 WHERE id = ?4 AND \
                     user_id = ?5",
                    params![label.name, label.color, label.updated_at, label.id.get(), self.owner.get()],
                )?;
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
                let todo_ids: Vec<u64> = {
                    let mut stmt =
                        self.tx.prepare("SELECT todo_id FROM label_todo WHERE label_id = ?1")?;
                    stmt.query_map(params![label.id.get()], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                for todo_id in todo_ids {
                    self.unlink(TodoLabel {
                        label_id: label.id,
                        todo_id: EntityId::new(todo_id),
                    })?;
                }
                self.tx.execute(
                    "DELETE FROM labels WHERE id = ?1 AND user_id = ?2",
                    params![label.id.get(), self.owner.get()],
                )?;
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
// SECTION: Row Mapping
// ============================================================================

/// Decodes a principal column, rejecting zero.
fn principal_column(row: &Row<'_>, index: usize) -> rusqlite::Result<PrincipalId> {
    let raw: u64 = row.get(index)?;
    PrincipalId::from_raw(raw).ok_or(rusqlite::Error::IntegralValueOutOfRange(index, 0))
}

/// Maps a todo row.
fn todo_from_row(row: &Row<'_>) -> rusqlite::Result<Todo> {
    Ok(Todo {
        id: EntityId::new(row.get(0)?),
        user_id: principal_column(row, 1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        completed: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Maps a label row.
fn label_from_row(row: &Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        id: EntityId::new(row.get(0)?),
        user_id: principal_column(row, 1)?,
        name: row.get(2)?,
        color: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Returns the id assigned by the last insert.
fn row_id(connection: &Connection) -> Result<EntityId, SqliteStoreError> {
    u64::try_from(connection.last_insert_rowid())
        .map(EntityId::new)
        .map_err(|_| SqliteStoreError::Invalid("negative row id".to_string()))
}

/// Returns the label ids linked to a todo in ascending order.
fn linked_labels(connection: &Connection, todo_id: EntityId) -> Result<Vec<EntityId>, SqliteStoreError> {
    let mut stmt =
        connection.prepare("SELECT label_id FROM label_todo WHERE todo_id = ?1 ORDER BY label_id")?;
    let ids = stmt
        .query_map(params![todo_id.get()], |row| row.get::<_, u64>(0))?
        .map(|id| id.map(EntityId::new))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Opens an `SQLite` connection and applies pragmas.
fn open_connection(config: &SqliteStoreConfig) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))?;
    connection.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
    Ok(connection)
}

/// Initializes the `SQLite` schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let tx = connection.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", params![], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS commits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    principal_id INTEGER NOT NULL,
                    effect TEXT NOT NULL,
                    committed_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS todos (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL CHECK (user_id > 0),
                    title TEXT NOT NULL CHECK (length(title) BETWEEN 1 AND 255),
                    description TEXT,
                    completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_todos_user_id ON todos (user_id);
                CREATE TABLE IF NOT EXISTS labels (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL CHECK (user_id > 0),
                    name TEXT NOT NULL CHECK (length(name) BETWEEN 1 AND 255),
                    color TEXT NOT NULL CHECK (length(color) = 7),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_labels_user_id ON labels (user_id);
                CREATE TABLE IF NOT EXISTS label_todo (
                    label_id INTEGER NOT NULL,
                    todo_id INTEGER NOT NULL,
                    PRIMARY KEY (label_id, todo_id),
                    FOREIGN KEY (label_id) REFERENCES labels(id) ON DELETE CASCADE,
                    FOREIGN KEY (todo_id) REFERENCES todos(id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_label_todo_todo_id ON label_todo (todo_id);
                CREATE TABLE IF NOT EXISTS change_log (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    commit_id INTEGER NOT NULL,
                    table_name TEXT NOT NULL,
                    owner_id INTEGER NOT NULL,
                    entry_json TEXT NOT NULL,
                    FOREIGN KEY (commit_id) REFERENCES commits(id)
                );",
            )?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SqliteStoreError::VersionMismatch(format!(
                "unsupported schema version: {value}"
            )));
        }
    }
    tx.commit()?;
    Ok(())
}
