// crates/shapegate-config/src/config.rs
// ============================================================================
// Module: Shapegate Configuration
// Description: Configuration loading and validation for Shapegate.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: shapegate-core, shapegate-store-sqlite, serde, toml, url
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits.
//! Every section has defaults so an empty file parses; validation then
//! rejects anything that would weaken tenant isolation or make the server
//! unreachable.
//! Security posture: config inputs are untrusted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use shapegate_core::Principal;
use shapegate_core::PrincipalId;
use shapegate_store_sqlite::SqliteStoreConfig;
use shapegate_store_sqlite::SqliteStoreMode;
use shapegate_store_sqlite::SqliteSyncMode;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "shapegate.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "SHAPEGATE_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum number of configured principals.
pub const MAX_PRINCIPALS: usize = 1024;
/// Maximum length of a bearer token.
pub const MAX_TOKEN_LENGTH: usize = 256;
/// Minimum length of a bearer token.
pub const MIN_TOKEN_LENGTH: usize = 16;
/// Maximum allowed request body size.
const MAX_BODY_BYTES_LIMIT: usize = 16 * 1024 * 1024;
/// Minimum upstream connect timeout in milliseconds.
const MIN_CONNECT_TIMEOUT_MS: u64 = 100;
/// Maximum upstream connect timeout in milliseconds.
const MAX_CONNECT_TIMEOUT_MS: u64 = 30_000;
/// Maximum mutation attempts.
const MAX_ATTEMPTS_LIMIT: u32 = 10;
/// Maximum retry backoff step in milliseconds.
const MAX_RETRY_BACKOFF_MS: u64 = 5_000;

// ============================================================================
// SECTION: Configuration Types
// ============================================================================

/// Shapegate server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShapegateConfig {
    /// HTTP listener configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Change-stream source configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Commit sequencer backend configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Mutation gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Principal registry.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Audit sink configuration.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl ShapegateConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.upstream.validate()?;
        self.store.validate()?;
        self.gateway.validate()?;
        self.auth.validate()?;
        self.audit.validate()?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Server
// ============================================================================

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ServerConfig {
    /// Returns the parsed bind address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the bind address does not parse.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid("invalid bind address".to_string()))
    }

    /// Validates listener configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_body_bytes > MAX_BODY_BYTES_LIMIT {
            return Err(ConfigError::Invalid("max_body_bytes exceeds limit".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Upstream
// ============================================================================

/// Where shape subscriptions are served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShapeSource {
    /// Forward to the external change-stream source at `url`.
    #[default]
    Remote,
    /// Serve the commit sequencer's own change log.
    ChangeLog,
}

/// Change-stream source configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Shape source selection.
    #[serde(default)]
    pub source: ShapeSource,
    /// Base URL of the change-stream source.
    #[serde(default = "default_upstream_url")]
    pub url: String,
    /// Path of the shape endpoint on the source.
    #[serde(default = "default_shape_path")]
    pub shape_path: String,
    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Request full rows on every update.
    #[serde(default = "default_true")]
    pub replica_full: bool,
    /// Optional source secret appended to every upstream request.
    #[serde(default)]
    pub secret: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            source: ShapeSource::Remote,
            url: default_upstream_url(),
            shape_path: default_shape_path(),
            connect_timeout_ms: default_connect_timeout_ms(),
            replica_full: true,
            secret: None,
        }
    }
}

impl UpstreamConfig {
    /// Returns the full shape endpoint URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the URL is not a valid http(s) URL.
    pub fn shape_url(&self) -> Result<Url, ConfigError> {
        let base = Url::parse(self.url.trim())
            .map_err(|err| ConfigError::Invalid(format!("invalid upstream.url: {err}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid("upstream.url must be http or https".to_string()));
        }
        if base.query().is_some() || base.fragment().is_some() {
            return Err(ConfigError::Invalid(
                "upstream.url must not carry a query or fragment".to_string(),
            ));
        }
        let path = self.shape_path.trim();
        if !path.starts_with('/') {
            return Err(ConfigError::Invalid("upstream.shape_path must start with /".to_string()));
        }
        base.join(path)
            .map_err(|err| ConfigError::Invalid(format!("invalid upstream.shape_path: {err}")))
    }

    /// Returns the connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validates upstream configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        self.shape_url()?;
        if !(MIN_CONNECT_TIMEOUT_MS ..= MAX_CONNECT_TIMEOUT_MS).contains(&self.connect_timeout_ms)
        {
            return Err(ConfigError::Invalid(format!(
                "upstream.connect_timeout_ms must be between {MIN_CONNECT_TIMEOUT_MS} and \
                 {MAX_CONNECT_TIMEOUT_MS}"
            )));
        }
        if self.secret.as_deref().is_some_and(|secret| secret.trim().is_empty()) {
            return Err(ConfigError::Invalid("upstream.secret must be non-empty".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Commit sequencer backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// In-memory sequencer; contents are lost on exit.
    #[default]
    Memory,
    /// `SQLite` sequencer.
    Sqlite,
}

/// Commit sequencer backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Backend type.
    #[serde(rename = "type", default)]
    pub store_type: StoreType,
    /// `SQLite` database path.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    #[serde(default = "shapegate_store_sqlite::default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteStoreMode,
    /// `SQLite` synchronous mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            path: None,
            busy_timeout_ms: shapegate_store_sqlite::default_busy_timeout_ms(),
            journal_mode: SqliteStoreMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

impl StoreConfig {
    /// Returns the `SQLite` configuration when the sqlite backend is selected.
    #[must_use]
    pub fn sqlite(&self) -> Option<SqliteStoreConfig> {
        match (self.store_type, &self.path) {
            (StoreType::Sqlite, Some(path)) => Some(SqliteStoreConfig {
                path: path.clone(),
                busy_timeout_ms: self.busy_timeout_ms,
                journal_mode: self.journal_mode,
                sync_mode: self.sync_mode,
            }),
            _ => None,
        }
    }

    /// Validates store configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        match self.store_type {
            StoreType::Memory => {
                if self.path.is_some() {
                    return Err(ConfigError::Invalid("memory store must not set path".to_string()));
                }
                Ok(())
            }
            StoreType::Sqlite => {
                let path = self.path.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("sqlite store requires path".to_string())
                })?;
                validate_path_string("store.path", &path.to_string_lossy())
            }
        }
    }
}

// ============================================================================
// SECTION: Gateway
// ============================================================================

/// Mutation gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Attempts per mutation when the store is unavailable.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff step between attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl GatewayConfig {
    /// Validates gateway configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1 ..= MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(ConfigError::Invalid(format!(
                "gateway.max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        if self.retry_backoff_ms > MAX_RETRY_BACKOFF_MS {
            return Err(ConfigError::Invalid(format!(
                "gateway.retry_backoff_ms must not exceed {MAX_RETRY_BACKOFF_MS}"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Auth
// ============================================================================

/// Principal registry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Principals and their bearer tokens.
    #[serde(default)]
    pub principals: Vec<PrincipalConfig>,
}

/// One principal and its bearer token.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalConfig {
    /// Bearer token accepted for this principal.
    pub token: String,
    /// Principal identifier; must be non-zero.
    pub principal_id: u64,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
}

impl std::fmt::Debug for PrincipalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalConfig")
            .field("token", &"<redacted>")
            .field("principal_id", &self.principal_id)
            .field("name", &self.name)
            .finish()
    }
}

impl PrincipalConfig {
    /// Returns the principal described by this entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the principal id is zero.
    pub fn principal(&self) -> Result<Principal, ConfigError> {
        let id = PrincipalId::from_raw(self.principal_id).ok_or_else(|| {
            ConfigError::Invalid("auth.principals principal_id must be non-zero".to_string())
        })?;
        Ok(Principal {
            id,
            name: self.name.clone().unwrap_or_else(|| format!("principal-{id}")),
        })
    }
}

impl AuthConfig {
    /// Validates the principal registry.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.principals.len() > MAX_PRINCIPALS {
            return Err(ConfigError::Invalid("auth.principals exceeds max entries".to_string()));
        }
        let mut tokens = BTreeSet::new();
        let mut ids = BTreeSet::new();
        for entry in &self.principals {
            let principal = entry.principal()?;
            let token = entry.token.trim();
            if token.is_empty() {
                return Err(ConfigError::Invalid("auth.principals token must be non-empty".to_string()));
            }
            if token.len() != entry.token.len() || token.chars().any(char::is_whitespace) {
                return Err(ConfigError::Invalid(
                    "auth.principals token must not contain whitespace".to_string(),
                ));
            }
            if !(MIN_TOKEN_LENGTH ..= MAX_TOKEN_LENGTH).contains(&token.len()) {
                return Err(ConfigError::Invalid(format!(
                    "auth.principals token length must be between {MIN_TOKEN_LENGTH} and \
                     {MAX_TOKEN_LENGTH}"
                )));
            }
            if !tokens.insert(token) {
                return Err(ConfigError::Invalid("auth.principals token is duplicated".to_string()));
            }
            if !ids.insert(principal.id) {
                return Err(ConfigError::Invalid(
                    "auth.principals principal_id is duplicated".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Audit
// ============================================================================

/// Audit sink type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditSinkType {
    /// JSON lines on stderr.
    #[default]
    Stderr,
    /// JSON lines appended to a file.
    File,
    /// Audit disabled.
    None,
}

/// Audit sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Sink type.
    #[serde(default)]
    pub sink: AuditSinkType,
    /// Log file path for the file sink.
    #[serde(default)]
    pub path: Option<String>,
}

impl AuditConfig {
    /// Validates audit configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.sink, &self.path) {
            (AuditSinkType::File, Some(path)) => validate_path_string("audit.path", path),
            (AuditSinkType::File, None) => {
                Err(ConfigError::Invalid("file audit sink requires path".to_string()))
            }
            (_, Some(_)) => {
                Err(ConfigError::Invalid("audit.path is only valid for the file sink".to_string()))
            }
            (_, None) => Ok(()),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

/// Default bind address.
fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Default maximum request body size.
const fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Default change-stream source URL.
fn default_upstream_url() -> String {
    "http://localhost:3000".to_string()
}

/// Default shape endpoint path.
fn default_shape_path() -> String {
    "/v1/shape".to_string()
}

/// Default upstream connect timeout.
const fn default_connect_timeout_ms() -> u64 {
    2_000
}

/// Serde default helper for `true`.
const fn default_true() -> bool {
    true
}

/// Default mutation attempts.
const fn default_max_attempts() -> u32 {
    3
}

/// Default retry backoff step.
const fn default_retry_backoff_ms() -> u64 {
    50
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from CLI or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against security limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    validate_path_string("config path", &path.to_string_lossy())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}
