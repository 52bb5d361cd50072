// crates/shapegate-config/tests/common/mod.rs
// =============================================================================
// Module: Config Test Helpers
// Description: Shared helpers for config validation tests.
// Purpose: Reduce duplication across integration tests for shapegate-config.
// =============================================================================

#![allow(dead_code, reason = "Test helpers are selectively used across suites.")]

use shapegate_config::ConfigError;
use shapegate_config::PrincipalConfig;
use shapegate_config::ShapegateConfig;

/// Result type for config tests.
pub type TestResult = Result<(), String>;

/// Parses a TOML string into a `ShapegateConfig` for tests.
pub fn config_from_toml(toml_str: &str) -> Result<ShapegateConfig, toml::de::Error> {
    toml::from_str(toml_str)
}

/// Returns a minimal config with all defaults applied.
pub fn minimal_config() -> Result<ShapegateConfig, toml::de::Error> {
    config_from_toml("")
}

/// Builds a principal entry.
pub fn principal(token: &str, id: u64) -> PrincipalConfig {
    PrincipalConfig {
        token: token.to_string(),
        principal_id: id,
        name: None,
    }
}

/// Asserts that validation fails with a message containing `needle`.
pub fn assert_invalid(result: Result<(), ConfigError>, needle: &str) -> TestResult {
    match result {
        Err(error) => {
            let message = error.to_string();
            if message.contains(needle) {
                Ok(())
            } else {
                Err(format!("error {message} did not contain {needle}"))
            }
        }
        Ok(()) => Err("expected invalid config".to_string()),
    }
}
