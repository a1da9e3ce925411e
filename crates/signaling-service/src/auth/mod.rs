//! Credential Service: signed, time-bound identity tokens.
//!
//! - `policy` - startup validation of the signing secret
//! - `credentials` - issue, verify and refresh HS256 tokens

pub mod credentials;
pub mod policy;

pub use credentials::{AgentProfile, CredentialError, CredentialService, IssuedToken, TokenTtls};
pub use policy::{SecretPolicy, SecretPolicyViolation};
