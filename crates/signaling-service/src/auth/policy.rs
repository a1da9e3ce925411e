//! Signing secret policy.
//!
//! A secret that fails any check is a fatal startup error: the process
//! refuses to serve rather than issue forgeable tokens.

use thiserror::Error;

/// Value shipped in sample environment files. Never acceptable.
pub const PLACEHOLDER_SECRET: &str = "your-secret-key-change-in-production";

/// Minimum secret length in bytes (256 bits for HS256).
pub const MIN_SECRET_LENGTH: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretPolicyViolation {
    #[error("signing secret is the documented placeholder value")]
    Placeholder,

    #[error("signing secret is {actual} bytes, minimum is {min}")]
    TooShort { actual: usize, min: usize },

    #[error("signing secret contains low-entropy pattern '{0}'")]
    WeakPattern(String),
}

/// Checks applied to the signing secret at startup.
#[derive(Debug, Clone)]
pub struct SecretPolicy {
    min_length: usize,
    /// Lowercased substrings.
    weak_patterns: Vec<String>,
}

impl SecretPolicy {
    #[must_use]
    pub fn new(weak_patterns: &[String]) -> Self {
        Self {
            min_length: MIN_SECRET_LENGTH,
            weak_patterns: weak_patterns.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Validate a candidate secret.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule: placeholder, then length, then patterns.
    pub fn validate(&self, secret: &str) -> Result<(), SecretPolicyViolation> {
        if secret == PLACEHOLDER_SECRET {
            return Err(SecretPolicyViolation::Placeholder);
        }

        if secret.len() < self.min_length {
            return Err(SecretPolicyViolation::TooShort {
                actual: secret.len(),
                min: self.min_length,
            });
        }

        let lowered = secret.to_lowercase();
        if let Some(pattern) = self
            .weak_patterns
            .iter()
            .find(|p| !p.is_empty() && lowered.contains(p.as_str()))
        {
            return Err(SecretPolicyViolation::WeakPattern(pattern.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_WEAK_SECRET_PATTERNS;

    fn default_policy() -> SecretPolicy {
        let patterns: Vec<String> = DEFAULT_WEAK_SECRET_PATTERNS
            .iter()
            .map(ToString::to_string)
            .collect();
        SecretPolicy::new(&patterns)
    }

    #[test]
    fn test_strong_secret_accepted() {
        assert!(default_policy()
            .validate("k3Jd8s0aQz1Lr7Vx2Mn5Bc9Tg4Hy6Wp0")
            .is_ok());
    }

    #[test]
    fn test_placeholder_rejected() {
        assert_eq!(
            default_policy().validate(PLACEHOLDER_SECRET),
            Err(SecretPolicyViolation::Placeholder)
        );
    }

    #[test]
    fn test_short_secret_rejected() {
        assert_eq!(
            default_policy().validate("tooShort9"),
            Err(SecretPolicyViolation::TooShort { actual: 9, min: 32 })
        );
    }

    #[test]
    fn test_weak_pattern_is_case_insensitive() {
        let result = default_policy().validate("xQ7vPaSsWoRd-k3Jd8s0aQz1Lr7Vx2Mn5");
        assert_eq!(
            result,
            Err(SecretPolicyViolation::WeakPattern("password".to_string()))
        );
    }

    #[test]
    fn test_custom_patterns_replace_defaults() {
        let policy = SecretPolicy::new(&["ACME".to_string()]);

        assert!(policy.validate("password-but-long-enough-to-pass-00").is_ok());
        assert!(matches!(
            policy.validate("zz-acme-zz-k3Jd8s0aQz1Lr7Vx2Mn5Bc"),
            Err(SecretPolicyViolation::WeakPattern(p)) if p == "acme"
        ));
    }
}
