//! HS256 token issuance and verification.
//!
//! Verification failures of any kind (size, shape, signature, expiry, `iat`)
//! collapse to [`CredentialError::InvalidToken`]; the specific reason is
//! logged at debug level only.

use super::policy::{SecretPolicy, SecretPolicyViolation};
use crate::errors::SignalingError;
use crate::observability::metrics;
use common::jwt::{check_token_shape, validate_iat_at, TokenClaims, TokenKind, DEFAULT_CLOCK_SKEW};
use common::secret::{ExposeSecret, SecretString};
use common::types::RoomId;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("The token is invalid or expired")]
    InvalidToken,

    /// Token is valid but of a kind this operation does not accept.
    #[error("A {actual} token cannot be used here")]
    WrongKind { expected: TokenKind, actual: TokenKind },

    #[error("Insecure signing secret: {0}")]
    InsecureSecret(#[from] SecretPolicyViolation),

    #[error("Token signing failed: {0}")]
    Signing(String),
}

impl From<CredentialError> for SignalingError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::InvalidToken | CredentialError::WrongKind { .. } => {
                SignalingError::Unauthenticated(err.to_string())
            }
            CredentialError::InsecureSecret(_) | CredentialError::Signing(_) => {
                SignalingError::Internal(err.to_string())
            }
        }
    }
}

/// Lifetimes per token kind.
#[derive(Debug, Clone, Copy)]
pub struct TokenTtls {
    pub access: Duration,
    pub room_join: Duration,
    pub refresh: Duration,
}

impl TokenTtls {
    #[must_use]
    pub fn for_kind(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Access => self.access,
            TokenKind::RoomJoin => self.room_join,
            TokenKind::Refresh => self.refresh,
        }
    }
}

/// Display attributes an agent chose at registration. Carried in its access
/// and refresh tokens so the profile survives refresh without a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentProfile {
    pub name: Option<String>,
    pub emoji: Option<String>,
    pub color: Option<String>,
}

impl AgentProfile {
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_claims(claims: &TokenClaims) -> Self {
        Self {
            name: claims.name.clone(),
            emoji: claims.emoji.clone(),
            color: claims.color.clone(),
        }
    }
}

/// A freshly signed token with its decoded claims.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
    pub claims: TokenClaims,
}

/// Issues and verifies signed identity tokens.
///
/// Constructed once at startup and shared behind an `Arc`.
pub struct CredentialService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttls: TokenTtls,
}

impl CredentialService {
    /// Build the service, validating the secret against `policy`.
    ///
    /// # Errors
    ///
    /// Returns `InsecureSecret` if the secret violates the policy. Callers
    /// treat this as fatal.
    pub fn new(
        secret: &SecretString,
        policy: &SecretPolicy,
        ttls: TokenTtls,
    ) -> Result<Self, CredentialError> {
        let raw = secret.expose_secret();
        policy.validate(raw)?;

        // Expiry is checked against an explicit clock in `verify_at`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(raw.as_bytes()),
            decoding_key: DecodingKey::from_secret(raw.as_bytes()),
            validation,
            ttls,
        })
    }

    #[must_use]
    pub fn ttls(&self) -> TokenTtls {
        self.ttls
    }

    /// Sign a token of `kind` for `subject`, valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `Signing` if encoding fails.
    pub fn issue(
        &self,
        subject: &str,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<IssuedToken, CredentialError> {
        self.issue_at(subject, None, kind, None, ttl, now())
    }

    /// Access token carrying the agent's profile.
    pub fn issue_access(&self, subject: &str, profile: &AgentProfile) -> Result<IssuedToken, CredentialError> {
        self.issue_profile_at(subject, profile, TokenKind::Access, self.ttls.access, now())
    }

    pub fn issue_refresh(&self, subject: &str, profile: &AgentProfile) -> Result<IssuedToken, CredentialError> {
        self.issue_profile_at(subject, profile, TokenKind::Refresh, self.ttls.refresh, now())
    }

    /// Token that only permits joining `room_id` on the relay.
    pub fn issue_room_join(
        &self,
        subject: &str,
        name: Option<&str>,
        room_id: RoomId,
    ) -> Result<IssuedToken, CredentialError> {
        self.issue_at(
            subject,
            name,
            TokenKind::RoomJoin,
            Some(room_id),
            self.ttls.room_join,
            now(),
        )
    }

    #[instrument(skip_all, fields(kind = %kind))]
    pub fn issue_at(
        &self,
        subject: &str,
        name: Option<&str>,
        kind: TokenKind,
        room_id: Option<RoomId>,
        ttl: Duration,
        now: i64,
    ) -> Result<IssuedToken, CredentialError> {
        let mut claims = build_claims(subject, kind, ttl, now)?;
        claims.room_id = room_id;
        claims.name = name.map(ToString::to_string);
        self.sign(claims, ttl)
    }

    #[instrument(skip_all, fields(kind = %kind))]
    pub fn issue_profile_at(
        &self,
        subject: &str,
        profile: &AgentProfile,
        kind: TokenKind,
        ttl: Duration,
        now: i64,
    ) -> Result<IssuedToken, CredentialError> {
        let mut claims = build_claims(subject, kind, ttl, now)?;
        claims.name.clone_from(&profile.name);
        claims.emoji.clone_from(&profile.emoji);
        claims.color.clone_from(&profile.color);
        self.sign(claims, ttl)
    }

    fn sign(&self, claims: TokenClaims, ttl: Duration) -> Result<IssuedToken, CredentialError> {
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some("JWT".to_string());

        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_in: ttl.as_secs(),
            claims,
        })
    }

    /// Verify signature, shape and expiry against the wall clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` for every failure.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, CredentialError> {
        self.verify_at(token, now())
    }

    /// Verify against an explicit `now` (Unix seconds).
    pub fn verify_at(&self, token: &str, now: i64) -> Result<TokenClaims, CredentialError> {
        let result = self.verify_inner(token, now);
        metrics::record_token_verification(if result.is_ok() { "success" } else { "invalid" });
        result
    }

    fn verify_inner(&self, token: &str, now: i64) -> Result<TokenClaims, CredentialError> {
        check_token_shape(token).map_err(|_| CredentialError::InvalidToken)?;

        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(target: "sig.auth", error = %e, "Token verification failed");
            CredentialError::InvalidToken
        })?;
        let claims = data.claims;

        validate_iat_at(claims.iat, DEFAULT_CLOCK_SKEW, now)
            .map_err(|_| CredentialError::InvalidToken)?;

        if claims.is_expired_at(now) {
            debug!(target: "sig.auth", exp = claims.exp, now, "Token rejected: expired");
            return Err(CredentialError::InvalidToken);
        }

        // Kind and room scope must agree.
        if (claims.kind == TokenKind::RoomJoin) != claims.room_id.is_some() {
            debug!(target: "sig.auth", kind = %claims.kind, "Token rejected: room scope mismatch");
            return Err(CredentialError::InvalidToken);
        }

        Ok(claims)
    }

    /// Verify and additionally require one of `accepted` kinds.
    ///
    /// # Errors
    ///
    /// `InvalidToken` on any verification failure, `WrongKind` when the
    /// token is valid but its kind is not accepted.
    pub fn verify_kind(
        &self,
        token: &str,
        accepted: &[TokenKind],
    ) -> Result<TokenClaims, CredentialError> {
        let claims = self.verify(token)?;
        ensure_kind(&claims, accepted)?;
        Ok(claims)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// # Errors
    ///
    /// `WrongKind` for any non-refresh token even when otherwise valid;
    /// `InvalidToken` when signature or expiry checks fail.
    pub fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, CredentialError> {
        self.refresh_at(refresh_token, now())
    }

    pub fn refresh_at(&self, refresh_token: &str, now: i64) -> Result<IssuedToken, CredentialError> {
        let claims = self.verify_at(refresh_token, now)?;
        ensure_kind(&claims, &[TokenKind::Refresh])?;

        self.issue_profile_at(
            &claims.sub,
            &AgentProfile::from_claims(&claims),
            TokenKind::Access,
            self.ttls.access,
            now,
        )
    }
}

fn build_claims(
    subject: &str,
    kind: TokenKind,
    ttl: Duration,
    now: i64,
) -> Result<TokenClaims, CredentialError> {
    let ttl_secs = i64::try_from(ttl.as_secs())
        .map_err(|_| CredentialError::Signing("ttl out of range".to_string()))?;

    Ok(TokenClaims {
        sub: subject.to_string(),
        iat: now,
        exp: now.saturating_add(ttl_secs),
        kind,
        jti: uuid::Uuid::new_v4().to_string(),
        room_id: None,
        name: None,
        emoji: None,
        color: None,
    })
}

fn ensure_kind(claims: &TokenClaims, accepted: &[TokenKind]) -> Result<(), CredentialError> {
    if accepted.contains(&claims.kind) {
        return Ok(());
    }

    debug!(target: "sig.auth", kind = %claims.kind, "Token rejected: kind not accepted");
    Err(CredentialError::WrongKind {
        expected: accepted.first().copied().unwrap_or(TokenKind::Access),
        actual: claims.kind,
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::jwt::MAX_JWT_SIZE_BYTES;

    const SECRET: &str = "k3Jd8s0aQz1Lr7Vx2Mn5Bc9Tg4Hy6Wp0";
    const T0: i64 = 1_700_000_000;

    fn ttls() -> TokenTtls {
        TokenTtls {
            access: Duration::from_secs(900),
            room_join: Duration::from_secs(300),
            refresh: Duration::from_secs(86_400),
        }
    }

    fn service_with(secret: &str) -> CredentialService {
        CredentialService::new(
            &SecretString::from(secret.to_string()),
            &SecretPolicy::new(&["password".to_string()]),
            ttls(),
        )
        .unwrap()
    }

    fn service() -> CredentialService {
        service_with(SECRET)
    }

    #[test]
    fn test_insecure_secret_refuses_construction() {
        let result = CredentialService::new(
            &SecretString::from("short".to_string()),
            &SecretPolicy::new(&[]),
            ttls(),
        );
        assert!(matches!(result, Err(CredentialError::InsecureSecret(_))));
    }

    #[test]
    fn test_access_round_trip_before_expiry() {
        let svc = service();
        let issued = svc
            .issue_at("agent-1", None, TokenKind::Access, None, Duration::from_secs(60), T0)
            .unwrap();

        let claims = svc.verify_at(&issued.token, T0 + 59).unwrap();
        assert_eq!(claims.sub, "agent-1");
        assert_eq!(claims.kind, TokenKind::Access);
        assert_eq!(issued.expires_in, 60);
    }

    #[test]
    fn test_access_invalid_after_expiry() {
        let svc = service();
        let issued = svc
            .issue_at("agent-1", None, TokenKind::Access, None, Duration::from_secs(60), T0)
            .unwrap();

        assert!(matches!(
            svc.verify_at(&issued.token, T0 + 60),
            Err(CredentialError::InvalidToken)
        ));
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let issued = service_with("Zz9Yy8Xx7Ww6Vv5Uu4Tt3Ss2Rr1Qq0Pp")
            .issue_at("agent-1", None, TokenKind::Access, None, Duration::from_secs(60), T0)
            .unwrap();

        assert!(matches!(
            service().verify_at(&issued.token, T0),
            Err(CredentialError::InvalidToken)
        ));
    }

    #[test]
    fn test_malformed_and_oversized_rejected() {
        let svc = service();
        assert!(svc.verify_at("not-a-token", T0).is_err());
        assert!(svc.verify_at("a.b.c", T0).is_err());
        assert!(svc
            .verify_at(&"x".repeat(MAX_JWT_SIZE_BYTES + 1), T0)
            .is_err());
    }

    #[test]
    fn test_future_iat_rejected() {
        let svc = service();
        let issued = svc
            .issue_at("agent-1", None, TokenKind::Access, None, Duration::from_secs(3600), T0 + 600)
            .unwrap();

        assert!(svc.verify_at(&issued.token, T0).is_err());
    }

    #[test]
    fn test_refresh_rejects_unexpired_access_token() {
        let svc = service();
        let access = svc
            .issue_at("agent-1", None, TokenKind::Access, None, Duration::from_secs(900), T0)
            .unwrap();

        let result = svc.refresh_at(&access.token, T0 + 1);
        assert!(matches!(
            result,
            Err(CredentialError::WrongKind {
                expected: TokenKind::Refresh,
                actual: TokenKind::Access
            })
        ));
    }

    #[test]
    fn test_refresh_rejects_room_join_token() {
        let svc = service();
        let join = svc
            .issue_at("agent-1", None, TokenKind::RoomJoin, Some(RoomId::new()), Duration::from_secs(300), T0)
            .unwrap();

        assert!(matches!(
            svc.refresh_at(&join.token, T0 + 1),
            Err(CredentialError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_refresh_rejects_expired_refresh_token() {
        let svc = service();
        let refresh = svc
            .issue_at("agent-1", None, TokenKind::Refresh, None, Duration::from_secs(100), T0)
            .unwrap();

        assert!(matches!(
            svc.refresh_at(&refresh.token, T0 + 100),
            Err(CredentialError::InvalidToken)
        ));
    }

    #[test]
    fn test_refresh_issues_access_for_same_subject() {
        let svc = service();
        let refresh = svc
            .issue_at("agent-1", Some("Scribe"), TokenKind::Refresh, None, Duration::from_secs(86_400), T0)
            .unwrap();

        let access = svc.refresh_at(&refresh.token, T0 + 10).unwrap();
        assert_eq!(access.claims.kind, TokenKind::Access);
        assert_eq!(access.claims.sub, "agent-1");
        assert_eq!(access.claims.name.as_deref(), Some("Scribe"));
        assert_eq!(access.claims.exp, T0 + 10 + 900);
    }

    #[test]
    fn test_refresh_keeps_agent_profile() {
        let svc = service();
        let profile = AgentProfile {
            name: Some("Scout".to_string()),
            emoji: Some("🔍".to_string()),
            color: Some("#667eea".to_string()),
        };
        let refresh = svc
            .issue_profile_at("agent-1", &profile, TokenKind::Refresh, Duration::from_secs(86_400), T0)
            .unwrap();

        let access = svc.refresh_at(&refresh.token, T0 + 10).unwrap();
        let claims = svc.verify_at(&access.token, T0 + 11).unwrap();
        assert_eq!(AgentProfile::from_claims(&claims), profile);
    }

    #[test]
    fn test_room_join_token_carries_room() {
        let svc = service();
        let room_id = RoomId::new();
        let issued = svc.issue_room_join("agent-2", None, room_id).unwrap();

        let claims = svc.verify(&issued.token).unwrap();
        assert_eq!(claims.kind, TokenKind::RoomJoin);
        assert_eq!(claims.room_id, Some(room_id));
    }

    #[test]
    fn test_verify_kind_filters() {
        let svc = service();
        let refresh = svc.issue_refresh("agent-1", &AgentProfile::default()).unwrap();

        assert!(matches!(
            svc.verify_kind(&refresh.token, &[TokenKind::Access, TokenKind::RoomJoin]),
            Err(CredentialError::WrongKind { .. })
        ));
        assert!(svc.verify_kind(&refresh.token, &[TokenKind::Refresh]).is_ok());
    }

    #[test]
    fn test_wrong_kind_maps_to_unauthenticated() {
        let err: SignalingError = CredentialError::WrongKind {
            expected: TokenKind::Refresh,
            actual: TokenKind::Access,
        }
        .into();
        assert_eq!(err.error_code(), "UNAUTHENTICATED");
    }
}
