// crates/shapegate-core/src/core/scope.rs
// ============================================================================
// Module: Shapegate Tenant Scope
// Description: Typed tenant scope and client predicate model for shape requests.
// Purpose: Author the scoping predicate server-side and never from client text.
// Dependencies: crate::core::{model, identifiers, errors}
// ============================================================================

//! ## Overview
//! A shape request carries two predicates:
//! - [`TenantScope`]: computed from the authenticated principal only. It is a
//!   separate type so it cannot be built from request input.
//! - [`ClientPredicate`]: the client's `where` text parsed into a conjunction
//!   of typed column filters. Filters on the tenant column are dropped, and
//!   unknown columns or malformed input are rejected.
//!
//! [`ScopedWhere::build`] renders the scope first and conjoins the client
//! filters after it. Every value is emitted as a positional parameter
//! (`$1`, `$2`, ...); literal text never reaches the rendered clause.
//!
//! Security posture: the `where` text is untrusted input.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::cmp::Ordering;
use std::fmt;

use serde_json::Map;
use serde_json::Value;

use crate::core::errors::SyncError;
use crate::core::errors::field_error;
use crate::core::identifiers::PrincipalId;
use crate::core::model::ColumnKind;
use crate::core::model::OwnerScope;
use crate::core::model::Table;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum accepted length of a client `where` parameter.
pub const MAX_WHERE_BYTES: usize = 4096;

/// Maximum number of conjoined client filters.
pub const MAX_CLIENT_FILTERS: usize = 16;

// ============================================================================
// SECTION: Tenant Scope
// ============================================================================

/// Server-authored predicate restricting a table to one principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantScope {
    /// Table being scoped.
    table: Table,
    /// Owning principal.
    owner: PrincipalId,
}

impl TenantScope {
    /// Builds the scope for a table and principal.
    #[must_use]
    pub const fn new(table: Table, owner: PrincipalId) -> Self {
        Self {
            table,
            owner,
        }
    }

    /// Returns the scoped table.
    #[must_use]
    pub const fn table(&self) -> Table {
        self.table
    }

    /// Returns the owning principal.
    #[must_use]
    pub const fn owner(&self) -> PrincipalId {
        self.owner
    }

    /// Renders the scope, pushing the owner id onto `params`.
    fn render(&self, params: &mut Vec<String>) -> String {
        params.push(self.owner.to_string());
        let slot = params.len();
        match self.table.owner_scope() {
            OwnerScope::Column(column) => format!("\"{column}\" = ${slot}"),
            OwnerScope::Parent {
                column,
                parent,
            } => {
                let owner_column = match parent.owner_scope() {
                    OwnerScope::Column(owner_column) => owner_column,
                    OwnerScope::Parent {
                        ..
                    } => "user_id",
                };
                format!(
                    "\"{column}\" IN (SELECT \"id\" FROM \"{}\" WHERE \"{owner_column}\" = ${slot})",
                    parent.as_str()
                )
            }
        }
    }
}

// ============================================================================
// SECTION: Client Predicate
// ============================================================================

/// Literal value in a client filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    /// Integer literal.
    Integer(i64),
    /// Boolean literal.
    Boolean(bool),
    /// Single-quoted string literal.
    Text(String),
}

impl Literal {
    /// Returns the parameter encoding for the literal.
    fn to_param(&self) -> String {
        match self {
            Self::Integer(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }

    /// Orders a typed row value against the literal; `None` when the types
    /// differ.
    fn order_of(&self, value: &Value) -> Option<Ordering> {
        match (self, value) {
            (Self::Integer(literal), Value::Number(number)) => number.as_i64().map(|number| number.cmp(literal)),
            (Self::Boolean(literal), Value::Bool(flag)) => Some(flag.cmp(literal)),
            (Self::Text(literal), Value::String(text)) => Some(text.as_str().cmp(literal.as_str())),
            _ => None,
        }
    }

    /// Returns true when the literal fits the column domain.
    const fn fits(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (Self::Integer(_), ColumnKind::Integer)
                | (Self::Boolean(_), ColumnKind::Boolean)
                | (Self::Text(_), ColumnKind::Text)
        )
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>` or `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// Returns the SQL token.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Returns true when `ordering` (row value against literal) satisfies
    /// the operator.
    #[must_use]
    pub const fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering.is_eq(),
            Self::NotEq => ordering.is_ne(),
            Self::Lt => ordering.is_lt(),
            Self::Le => ordering.is_le(),
            Self::Gt => ordering.is_gt(),
            Self::Ge => ordering.is_ge(),
        }
    }
}

/// Condition applied to one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `column op literal`
    Compare {
        /// Operator.
        op: CompareOp,
        /// Right-hand value.
        value: Literal,
    },
    /// `column IS NULL`
    IsNull,
    /// `column IS NOT NULL`
    IsNotNull,
}

/// One conjunct of a client predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    /// Column name, validated against the table catalog.
    pub column: String,
    /// Condition on the column.
    pub condition: Condition,
}

impl ColumnFilter {
    /// Evaluates the filter against a typed row. A comparison against a
    /// missing or null value is false, as in SQL.
    #[must_use]
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        let value = row.get(&self.column).filter(|value| !value.is_null());
        match &self.condition {
            Condition::IsNull => value.is_none(),
            Condition::IsNotNull => value.is_some(),
            Condition::Compare {
                op,
                value: literal,
            } => value.and_then(|value| literal.order_of(value)).is_some_and(|ordering| op.accepts(ordering)),
        }
    }
}

/// Parsed client `where` clause: a conjunction of column filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientPredicate {
    /// Retained filters, in input order.
    filters: Vec<ColumnFilter>,
    /// Filters dropped because they named the tenant column.
    dropped: usize,
}

impl ClientPredicate {
    /// Parses and validates a client `where` clause for a table.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] on malformed input, unknown columns,
    /// or literals that do not fit the column.
    pub fn parse(table: Table, input: &str) -> Result<Self, SyncError> {
        if input.len() > MAX_WHERE_BYTES {
            return Err(field_error("where", "The where clause is too long."));
        }
        let tokens = tokenize(input).map_err(|message| field_error("where", message))?;
        let parsed = Parser::new(tokens).conjunction().map_err(|message| field_error("where", message))?;
        if parsed.len() > MAX_CLIENT_FILTERS {
            return Err(field_error("where", "The where clause has too many conditions."));
        }
        let mut predicate = Self::default();
        for filter in parsed {
            if table.is_identity_column(&filter.column) {
                predicate.dropped += 1;
                continue;
            }
            let Some(kind) = table.column_kind(&filter.column) else {
                return Err(field_error("where", format!("Unknown column {}.", filter.column)));
            };
            if let Condition::Compare {
                value, ..
            } = &filter.condition
                && !value.fits(kind)
            {
                return Err(field_error(
                    "where",
                    format!("Value does not match the type of column {}.", filter.column),
                ));
            }
            predicate.filters.push(filter);
        }
        Ok(predicate)
    }

    /// Returns the retained filters.
    #[must_use]
    pub fn filters(&self) -> &[ColumnFilter] {
        &self.filters
    }

    /// Returns true when a typed row satisfies every retained filter.
    #[must_use]
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }

    /// Returns how many tenant-column filters were dropped.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }
}

// ============================================================================
// SECTION: Rendered Where
// ============================================================================

/// Final `where` clause and its positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedWhere {
    /// Clause text containing only identifiers, operators and `$n` slots.
    pub clause: String,
    /// Parameter values; `params[0]` binds `$1`.
    pub params: Vec<String>,
}

impl ScopedWhere {
    /// Renders the tenant scope conjoined with the client predicate.
    #[must_use]
    pub fn build(scope: &TenantScope, predicate: &ClientPredicate) -> Self {
        let mut params = Vec::new();
        let mut clause = scope.render(&mut params);
        for filter in &predicate.filters {
            clause.push_str(" AND ");
            let column = &filter.column;
            match &filter.condition {
                Condition::Compare {
                    op,
                    value,
                } => {
                    params.push(value.to_param());
                    clause.push_str(&format!("\"{column}\" {} ${}", op.as_sql(), params.len()));
                }
                Condition::IsNull => {
                    clause.push_str(&format!("\"{column}\" IS NULL"));
                }
                Condition::IsNotNull => {
                    clause.push_str(&format!("\"{column}\" IS NOT NULL"));
                }
            }
        }
        Self {
            clause,
            params,
        }
    }
}

impl fmt::Display for ScopedWhere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clause)
    }
}

// ============================================================================
// SECTION: Column Selection
// ============================================================================

/// Validates a client `columns` list, adding missing key columns.
///
/// # Errors
///
/// Returns [`SyncError::Validation`] when a column is unknown or the list is empty.
pub fn parse_columns(table: Table, input: &str) -> Result<Vec<String>, SyncError> {
    let mut columns: Vec<String> = Vec::new();
    for raw in input.split(',') {
        let name = raw.trim().trim_matches('"');
        if name.is_empty() {
            continue;
        }
        if !table.has_column(name) {
            return Err(field_error("columns", format!("Unknown column {name}.")));
        }
        if !columns.iter().any(|existing| existing == name) {
            columns.push(name.to_string());
        }
    }
    if columns.is_empty() {
        return Err(field_error("columns", "The columns list is empty."));
    }
    for key in table.key_columns() {
        if !columns.iter().any(|existing| existing == key) {
            columns.insert(0, (*key).to_string());
        }
    }
    Ok(columns)
}

// ============================================================================
// SECTION: Tokenizer
// ============================================================================

/// Lexical token of the predicate grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare or double-quoted identifier.
    Ident(String),
    /// Comparison operator.
    Op(CompareOp),
    /// Integer literal.
    Integer(i64),
    /// Single-quoted string literal.
    Text(String),
    /// `AND`
    And,
    /// `IS`
    Is,
    /// `NOT`
    Not,
    /// `NULL`
    Null,
    /// `TRUE` or `FALSE`
    Boolean(bool),
}

/// Splits predicate text into tokens.
fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0;
    while let Some(&ch) = chars.get(index) {
        match ch {
            c if c.is_whitespace() => index += 1,
            '\'' => {
                let (text, next) = read_quoted(&chars, index, '\'')?;
                tokens.push(Token::Text(text));
                index = next;
            }
            '"' => {
                let (text, next) = read_quoted(&chars, index, '"')?;
                tokens.push(Token::Ident(text));
                index = next;
            }
            '=' | '<' | '>' | '!' => {
                let following = chars.get(index + 1).copied();
                let (op, width) = match (ch, following) {
                    ('=', _) => (CompareOp::Eq, 1),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    ('<', Some('>')) | ('!', Some('=')) => (CompareOp::NotEq, 2),
                    ('<', _) => (CompareOp::Lt, 1),
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('>', _) => (CompareOp::Gt, 1),
                    _ => return Err("Unsupported operator.".to_string()),
                };
                tokens.push(Token::Op(op));
                index += width;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = index;
                index += 1;
                while chars.get(index).is_some_and(char::is_ascii_digit) {
                    index += 1;
                }
                let text: String = chars[start .. index].iter().collect();
                let value =
                    text.parse::<i64>().map_err(|_| format!("Invalid number {text}."))?;
                tokens.push(Token::Integer(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = index;
                while chars.get(index).is_some_and(|c| c.is_ascii_alphanumeric() || *c == '_') {
                    index += 1;
                }
                let word: String = chars[start .. index].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "IS" => Token::Is,
                    "NOT" => Token::Not,
                    "NULL" => Token::Null,
                    "TRUE" => Token::Boolean(true),
                    "FALSE" => Token::Boolean(false),
                    "OR" | "IN" | "LIKE" | "ILIKE" | "SELECT" => {
                        return Err(format!("Unsupported keyword {word}."));
                    }
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("Unexpected character {other}.")),
        }
    }
    Ok(tokens)
}

/// Reads a quoted run starting at `start`; a doubled quote escapes itself.
fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize), String> {
    let mut text = String::new();
    let mut index = start + 1;
    loop {
        match chars.get(index) {
            None => return Err("Unterminated quoted value.".to_string()),
            Some(&c) if c == quote => {
                if chars.get(index + 1) == Some(&quote) {
                    text.push(quote);
                    index += 2;
                } else {
                    return Ok((text, index + 1));
                }
            }
            Some(&c) => {
                text.push(c);
                index += 1;
            }
        }
    }
}

// ============================================================================
// SECTION: Parser
// ============================================================================

/// Recursive-descent parser for `filter (AND filter)*`.
struct Parser {
    /// Remaining tokens.
    tokens: std::vec::IntoIter<Token>,
}

impl Parser {
    /// Creates a parser over tokens.
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter(),
        }
    }

    /// Parses the full input as a conjunction; empty input yields no filters.
    fn conjunction(&mut self) -> Result<Vec<ColumnFilter>, String> {
        let mut filters = Vec::new();
        let Some(first) = self.tokens.next() else {
            return Ok(filters);
        };
        filters.push(self.filter(first)?);
        while let Some(token) = self.tokens.next() {
            if token != Token::And {
                return Err("Expected AND between conditions.".to_string());
            }
            let next = self.tokens.next().ok_or_else(|| "Dangling AND.".to_string())?;
            filters.push(self.filter(next)?);
        }
        Ok(filters)
    }

    /// Parses one filter whose first token is `head`.
    fn filter(&mut self, head: Token) -> Result<ColumnFilter, String> {
        let Token::Ident(column) = head else {
            return Err("Expected a column name.".to_string());
        };
        let condition = match self.tokens.next() {
            Some(Token::Op(op)) => {
                let value = match self.tokens.next() {
                    Some(Token::Integer(value)) => Literal::Integer(value),
                    Some(Token::Boolean(value)) => Literal::Boolean(value),
                    Some(Token::Text(value)) => Literal::Text(value),
                    _ => return Err(format!("Expected a value after {column}.")),
                };
                Condition::Compare {
                    op,
                    value,
                }
            }
            Some(Token::Is) => match self.tokens.next() {
                Some(Token::Null) => Condition::IsNull,
                Some(Token::Not) if self.tokens.next() == Some(Token::Null) => {
                    Condition::IsNotNull
                }
                _ => return Err("Expected NULL or NOT NULL after IS.".to_string()),
            },
            _ => return Err(format!("Expected an operator after {column}.")),
        };
        Ok(ColumnFilter {
            column,
            condition,
        })
    }
}

#[cfg(test)]
mod tests;
