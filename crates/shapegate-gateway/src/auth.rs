// crates/shapegate-gateway/src/auth.rs
// ============================================================================
// Module: Bearer Authentication
// Description: Resolves bearer tokens to principals at the HTTP edge.
// Purpose: Reject unauthenticated requests before any store or upstream call.
// Dependencies: shapegate-core, shapegate-config, sha2, subtle
// ============================================================================

//! ## Overview
//! Every `/api` route resolves its caller through a [`PrincipalResolver`]
//! before doing anything else. The configured resolver keeps only SHA-256
//! digests of tokens and compares them in constant time; the raw token is
//! never stored past the request and never logged. Audit events carry a
//! token fingerprint instead.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt::Write;

use sha2::Digest;
use sha2::Sha256;
use shapegate_config::AuthConfig;
use shapegate_config::ConfigError;
use shapegate_core::Principal;
use shapegate_core::PrincipalResolver;
use subtle::ConstantTimeEq;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

const MAX_AUTH_HEADER_BYTES: usize = 8 * 1024;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Missing or invalid credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

// ============================================================================
// SECTION: Authenticated Caller
// ============================================================================

/// Caller resolved from a valid bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// Acting principal.
    pub principal: Principal,
    /// SHA-256 fingerprint of the presented token.
    pub token_fingerprint: String,
}

/// Authenticates an `Authorization` header value.
///
/// # Errors
///
/// Returns [`AuthError::Unauthenticated`] when the header is missing,
/// malformed, or carries an unknown token.
pub fn authenticate(
    resolver: &dyn PrincipalResolver,
    auth_header: Option<&str>,
) -> Result<Authenticated, AuthError> {
    let token = parse_bearer_token(auth_header)?;
    let principal = resolver
        .resolve(&token)
        .ok_or_else(|| AuthError::Unauthenticated("invalid bearer token".to_string()))?;
    Ok(Authenticated {
        principal,
        token_fingerprint: token_fingerprint(&token),
    })
}

// ============================================================================
// SECTION: Config Resolver
// ============================================================================

/// Digest of one accepted token and the principal it maps to.
struct TokenEntry {
    /// SHA-256 digest of the token.
    digest: [u8; 32],
    /// Principal granted by the token.
    principal: Principal,
}

/// Resolver backed by the `[[auth.principals]]` registry.
pub struct ConfigPrincipalResolver {
    /// Accepted tokens.
    entries: Vec<TokenEntry>,
}

impl ConfigPrincipalResolver {
    /// Builds a resolver from validated auth configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an entry has an invalid principal id.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(config.principals.len());
        for entry in &config.principals {
            entries.push(TokenEntry {
                digest: digest(&entry.token),
                principal: entry.principal()?,
            });
        }
        Ok(Self {
            entries,
        })
    }

    /// Builds a resolver from token and principal pairs.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Principal)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(token, principal)| TokenEntry {
                    digest: digest(&token),
                    principal,
                })
                .collect(),
        }
    }

    /// Returns the number of registered tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no token is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PrincipalResolver for ConfigPrincipalResolver {
    fn resolve(&self, token: &str) -> Option<Principal> {
        let presented = digest(token);
        let mut found = None;
        // Every entry is compared so timing does not depend on the match position.
        for entry in &self.entries {
            if bool::from(entry.digest.ct_eq(&presented)) {
                found = Some(&entry.principal);
            }
        }
        found.cloned()
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the hex SHA-256 fingerprint of a token.
#[must_use]
pub fn token_fingerprint(token: &str) -> String {
    digest(token).iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Extracts the token from a `Bearer` authorization header.
///
/// # Errors
///
/// Returns [`AuthError::Unauthenticated`] when the header is missing,
/// oversized, or not a bearer credential.
pub fn parse_bearer_token(auth_header: Option<&str>) -> Result<String, AuthError> {
    let header = auth_header
        .ok_or_else(|| AuthError::Unauthenticated("missing authorization".to_string()))?;
    if header.len() > MAX_AUTH_HEADER_BYTES {
        return Err(AuthError::Unauthenticated("authorization header too large".to_string()));
    }
    let mut parts = header.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::Unauthenticated("invalid authorization header".to_string()));
    }
    Ok(token.to_string())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
