//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] crate. `SecretString` implements `Debug` with
//! redaction, so any struct deriving `Debug` that holds one is safe to log.
//! The value is zeroized on drop.
//!
//! Use `SecretString` for:
//! - The token signing secret
//! - The agent registration secret
//! - Shared store URLs that may embed credentials
//! - Bearer tokens held past the request boundary
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct Registration {
//!     name: String,
//!     secret: SecretString,
//! }
//!
//! let reg = Registration {
//!     name: "scribe".to_string(),
//!     secret: SecretString::from("s3cr3t"),
//! };
//! assert!(!format!("{reg:?}").contains("s3cr3t"));
//! assert_eq!(reg.secret.expose_secret(), "s3cr3t");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_output_is_redacted() {
        let secret = SecretString::from("signing-key-material");
        let debug = format!("{secret:?}");

        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("signing-key-material"));
    }

    #[test]
    fn test_expose_secret_returns_value() {
        let secret = SecretString::from("abc");
        assert_eq!(secret.expose_secret(), "abc");
    }

    #[test]
    fn test_deserialized_secret_stays_redacted() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct RefreshBody {
            refresh_token: SecretString,
        }

        let body: RefreshBody =
            serde_json::from_str(r#"{"refresh_token": "eyJhbGciOi.payload.sig"}"#).unwrap();

        assert_eq!(body.refresh_token.expose_secret(), "eyJhbGciOi.payload.sig");
        assert!(!format!("{body:?}").contains("payload"));
    }
}
