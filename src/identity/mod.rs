//! Organization identity for inbound requests.
//!
//! The host application authenticates its users and forwards the caller's
//! organization in the `X-Organization-Id` header. This module only checks
//! that the value is present and well-formed; it is used as a key into the
//! credential store and the limiter, never trusted for anything else.

use axum::http::HeaderMap;
use thiserror::Error;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";

const MAX_ORGANIZATION_ID_LEN: usize = 128;

/// Extract the organization id from request headers
///
/// # Returns
/// * `Ok(String)` - Trimmed organization id
/// * `Err(IdentityError)` - Header missing, empty or malformed
pub fn extract_organization_id(headers: &HeaderMap) -> Result<String, IdentityError> {
    let value = headers
        .get(ORGANIZATION_HEADER)
        .ok_or(IdentityError::Missing)?
        .to_str()
        .map_err(|_| IdentityError::InvalidFormat)?;

    parse_organization_id(value)
}

/// Validate a raw organization id value
pub fn parse_organization_id(value: &str) -> Result<String, IdentityError> {
    let id = value.trim();
    if id.is_empty() {
        return Err(IdentityError::Empty);
    }

    let valid = id.len() <= MAX_ORGANIZATION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid {
        return Err(IdentityError::InvalidFormat);
    }

    Ok(id.to_string())
}

/// Organization identity errors
#[derive(Debug, PartialEq, Clone, Error)]
pub enum IdentityError {
    /// X-Organization-Id header not present
    #[error("Organization id not provided")]
    Missing,
    /// Header value is not valid ASCII or has unexpected characters
    #[error("Invalid organization id format")]
    InvalidFormat,
    /// Header present but blank
    #[error("Organization id is empty")]
    Empty,
}
