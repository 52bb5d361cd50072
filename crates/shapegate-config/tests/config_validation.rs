// crates/shapegate-config/tests/config_validation.rs
// ============================================================================
// Module: Config Validation Tests
// Description: Fail-closed validation of shapegate.toml.
// Purpose: Ensure invalid listener, upstream, store, auth, and audit settings
//          are rejected before the server starts.
// Dependencies: shapegate-config, tempfile, toml
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::io::Write;

use common::TestResult;
use common::assert_invalid;
use common::config_from_toml;
use common::minimal_config;
use common::principal;
use shapegate_config::AuditSinkType;
use shapegate_config::ConfigError;
use shapegate_config::ShapeSource;
use shapegate_config::ShapegateConfig;
use shapegate_config::StoreType;
use tempfile::NamedTempFile;

// ============================================================================
// SECTION: Defaults
// ============================================================================

#[test]
fn empty_config_applies_defaults_and_validates() -> TestResult {
    let config = minimal_config().map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    assert_eq!(config.server.bind, "127.0.0.1:8080");
    assert_eq!(config.server.max_body_bytes, 1024 * 1024);
    assert_eq!(config.store.store_type, StoreType::Memory);
    assert_eq!(config.gateway.max_attempts, 3);
    assert_eq!(config.audit.sink, AuditSinkType::Stderr);
    assert!(config.upstream.replica_full);
    assert_eq!(config.upstream.source, ShapeSource::Remote);
    assert!(config.auth.principals.is_empty());
    let url = config.upstream.shape_url().map_err(|err| err.to_string())?;
    assert_eq!(url.as_str(), "http://localhost:3000/v1/shape");
    Ok(())
}

#[test]
fn load_reads_and_validates_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
bind = "127.0.0.1:9090"

[store]
type = "sqlite"
path = "shapegate.db"

[[auth.principals]]
token = "alice-token-0123456789"
principal_id = 7
name = "alice"
"#
    )
    .unwrap();
    let config = ShapegateConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.server.bind_addr().unwrap().port(), 9090);
    let sqlite = config.store.sqlite().unwrap();
    assert!(sqlite.path.ends_with("shapegate.db"));
    let alice = config.auth.principals[0].principal().unwrap();
    assert_eq!(alice.id.get(), 7);
    assert_eq!(alice.name, "alice");
}

#[test]
fn load_rejects_oversized_file() {
    let mut file = NamedTempFile::new().unwrap();
    let padding = "#".repeat(shapegate_config::MAX_CONFIG_FILE_SIZE + 1);
    file.write_all(padding.as_bytes()).unwrap();
    let result = ShapegateConfig::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn load_reports_missing_file_as_io() {
    let dir = tempfile::tempdir().unwrap();
    let result = ShapegateConfig::load(Some(&dir.path().join("absent.toml")));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn unknown_fields_are_rejected() {
    assert!(config_from_toml("[server]\nport = 80\n").is_err());
    assert!(config_from_toml("[surprise]\n").is_err());
}

// ============================================================================
// SECTION: Server and Upstream
// ============================================================================

#[test]
fn bad_bind_address_is_rejected() -> TestResult {
    let config = config_from_toml("[server]\nbind = \"not-an-address\"\n").unwrap();
    assert_invalid(config.validate(), "bind address")
}

#[test]
fn zero_body_limit_is_rejected() -> TestResult {
    let config = config_from_toml("[server]\nmax_body_bytes = 0\n").unwrap();
    assert_invalid(config.validate(), "max_body_bytes")
}

#[test]
fn non_http_upstream_is_rejected() -> TestResult {
    let config = config_from_toml("[upstream]\nurl = \"ftp://example.com\"\n").unwrap();
    assert_invalid(config.validate(), "http or https")
}

#[test]
fn upstream_with_query_is_rejected() -> TestResult {
    let config = config_from_toml("[upstream]\nurl = \"http://example.com/?table=todos\"\n").unwrap();
    assert_invalid(config.validate(), "query")
}

#[test]
fn connect_timeout_outside_range_is_rejected() -> TestResult {
    let config = config_from_toml("[upstream]\nconnect_timeout_ms = 5\n").unwrap();
    assert_invalid(config.validate(), "connect_timeout_ms")
}

#[test]
fn change_log_source_is_selectable() -> TestResult {
    let config = config_from_toml("[upstream]\nsource = \"change_log\"\n").unwrap();
    config.validate().map_err(|err| err.to_string())?;
    assert_eq!(config.upstream.source, ShapeSource::ChangeLog);
    assert!(config_from_toml("[upstream]\nsource = \"replica\"\n").is_err());
    Ok(())
}

#[test]
fn blank_upstream_secret_is_rejected() -> TestResult {
    let config = config_from_toml("[upstream]\nsecret = \"  \"\n").unwrap();
    assert_invalid(config.validate(), "secret")
}

// ============================================================================
// SECTION: Store and Gateway
// ============================================================================

#[test]
fn sqlite_without_path_is_rejected() -> TestResult {
    let config = config_from_toml("[store]\ntype = \"sqlite\"\n").unwrap();
    assert_invalid(config.validate(), "requires path")
}

#[test]
fn memory_with_path_is_rejected() -> TestResult {
    let config = config_from_toml("[store]\ntype = \"memory\"\npath = \"x.db\"\n").unwrap();
    assert_invalid(config.validate(), "must not set path")
}

#[test]
fn memory_store_has_no_sqlite_config() {
    let config = minimal_config().unwrap();
    assert!(config.store.sqlite().is_none());
}

#[test]
fn max_attempts_bounds_are_enforced() -> TestResult {
    let zero = config_from_toml("[gateway]\nmax_attempts = 0\n").unwrap();
    assert_invalid(zero.validate(), "max_attempts")?;
    let eleven = config_from_toml("[gateway]\nmax_attempts = 11\n").unwrap();
    assert_invalid(eleven.validate(), "max_attempts")
}

// ============================================================================
// SECTION: Auth
// ============================================================================

#[test]
fn duplicate_tokens_are_rejected() -> TestResult {
    let mut config = minimal_config().unwrap();
    config.auth.principals =
        vec![principal("shared-token-0123456", 7), principal("shared-token-0123456", 8)];
    assert_invalid(config.validate(), "token is duplicated")
}

#[test]
fn duplicate_principal_ids_are_rejected() -> TestResult {
    let mut config = minimal_config().unwrap();
    config.auth.principals =
        vec![principal("first-token-01234567", 7), principal("second-token-0123456", 7)];
    assert_invalid(config.validate(), "principal_id is duplicated")
}

#[test]
fn short_or_spaced_tokens_are_rejected() -> TestResult {
    let mut config = minimal_config().unwrap();
    config.auth.principals = vec![principal("short", 7)];
    assert_invalid(config.validate(), "token length")?;
    config.auth.principals = vec![principal("has a space in the token", 7)];
    assert_invalid(config.validate(), "whitespace")
}

#[test]
fn zero_principal_id_is_rejected() -> TestResult {
    let mut config = minimal_config().unwrap();
    config.auth.principals = vec![principal("zero-token-012345678", 0)];
    assert_invalid(config.validate(), "non-zero")
}

#[test]
fn principal_debug_redacts_token() {
    let entry = principal("super-secret-token-value", 7);
    let rendered = format!("{entry:?}");
    assert!(!rendered.contains("super-secret"));
    assert!(rendered.contains("redacted"));
}

// ============================================================================
// SECTION: Audit
// ============================================================================

#[test]
fn file_sink_requires_path() -> TestResult {
    let config = config_from_toml("[audit]\nsink = \"file\"\n").unwrap();
    assert_invalid(config.validate(), "requires path")
}

#[test]
fn path_without_file_sink_is_rejected() -> TestResult {
    let config = config_from_toml("[audit]\nsink = \"none\"\npath = \"audit.log\"\n").unwrap();
    assert_invalid(config.validate(), "only valid for the file sink")
}
