//! Token claim types and pre-parse validation.
//!
//! Signing and signature verification live in the signaling service; this
//! module holds what every consumer of a token needs to agree on:
//! - the claim set and its token kinds
//! - the size limit checked before any parsing
//! - `iat` validation with clock skew tolerance
//!
//! The `sub` claim is redacted in `Debug` output.

use crate::types::RoomId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum accepted token size in bytes (8KB).
///
/// Oversized tokens are rejected before base64 decoding or HMAC work.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Tolerance for `iat` timestamps issued slightly in the future.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Errors raised before a token reaches signature verification.
///
/// Messages are deliberately identical so a caller learns nothing about
/// which check failed. Details go to the debug log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    #[error("The token is invalid or expired")]
    TokenTooLarge,

    #[error("The token is invalid or expired")]
    MalformedToken,

    #[error("The token is invalid or expired")]
    IatTooFarInFuture,
}

/// What a token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// General API and relay access.
    Access,
    /// Relay access restricted to joining a single room.
    RoomJoin,
    /// Long-lived token exchangeable only for a new access token.
    Refresh,
}

impl TokenKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::RoomJoin => "room_join",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim set carried by every signed token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject identity - redacted in Debug output.
    pub sub: String,

    /// Issued-at (Unix epoch seconds).
    pub iat: i64,

    /// Expiry (Unix epoch seconds).
    pub exp: i64,

    pub kind: TokenKind,

    /// Unique token id.
    pub jti: String,

    /// Room the token is scoped to; set only for `room_join` tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,

    /// Display name of the subject, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Agent avatar chosen at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,

    /// Agent accent colour chosen at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl fmt::Debug for TokenClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenClaims")
            .field("sub", &"[REDACTED]")
            .field("iat", &self.iat)
            .field("exp", &self.exp)
            .field("kind", &self.kind)
            .field("jti", &self.jti)
            .field("room_id", &self.room_id)
            .field("name", &self.name)
            .field("emoji", &self.emoji)
            .field("color", &self.color)
            .finish()
    }
}

impl TokenClaims {
    /// Whether the token has expired at `now` (Unix seconds).
    ///
    /// A token is valid up to but excluding its `exp` second.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }

    /// Seconds remaining until expiry at `now`, zero once expired.
    #[must_use]
    pub fn expires_in_at(&self, now: i64) -> u64 {
        u64::try_from(self.exp.saturating_sub(now)).unwrap_or(0)
    }
}

/// Reject tokens that are oversized or not three dot-separated segments.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` if the token does not have the `a.b.c` shape
pub fn check_token_shape(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let segments = token.split('.').count();
    if segments != 3 || token.split('.').any(str::is_empty) {
        tracing::debug!(
            target: "common.jwt",
            segments,
            "Token rejected: invalid JWT format"
        );
        return Err(JwtValidationError::MalformedToken);
    }

    Ok(())
}

/// Validate `iat` against an explicit `now`.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` if `iat` lies more than `clock_skew` past `now`.
pub fn validate_iat_at(iat: i64, clock_skew: Duration, now: i64) -> Result<(), JwtValidationError> {
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX);
    let max_iat = now.saturating_add(skew);

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat,
            now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}
