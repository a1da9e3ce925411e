//! Signaling service configuration.
//!
//! Configuration is loaded from environment variables. Secrets and the
//! shared store URL are redacted in Debug output. Numeric values are
//! validated strictly: a present but unparsable value is a startup error,
//! never a silent fallback to the default.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_CORS_ORIGIN: &str = "*";

pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 25;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 60;

/// Rooms with zero participants for longer than this are reaped.
pub const DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_REAPER_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_MAX_PARTICIPANTS_PER_ROOM: usize = 10;

pub const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: u64 = 900;
pub const DEFAULT_JOIN_TOKEN_TTL_SECONDS: u64 = 300;
pub const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: u64 = 7 * 24 * 3600;

pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_SESSION_CLEANUP_INTERVAL_SECONDS: u64 = 300;

pub const DEFAULT_INSTANCE_ANNOUNCE_INTERVAL_SECONDS: u64 = 15;

/// Missed announcements before a peer's rooms are dropped from the directory.
pub const DIRECTORY_STALE_ANNOUNCEMENTS: u32 = 3;

pub const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_RATE_LIMIT_AUTH: u64 = 10;
pub const DEFAULT_RATE_LIMIT_WRITE: u64 = 30;
pub const DEFAULT_RATE_LIMIT_READ: u64 = 120;
pub const DEFAULT_RATE_LIMIT_RELAY: u64 = 600;

/// Substrings that mark a signing secret as low-entropy.
pub const DEFAULT_WEAK_SECRET_PATTERNS: &[&str] = &[
    "changeme",
    "password",
    "secret",
    "default",
    "example",
    "placeholder",
    "123456",
    "qwerty",
    "letmein",
];

/// Instance id prefix used when `INSTANCE_ID` is unset.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sig";

/// Per-class request limits for one rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub auth: u64,
    pub write: u64,
    pub read: u64,
    pub relay: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            auth: DEFAULT_RATE_LIMIT_AUTH,
            write: DEFAULT_RATE_LIMIT_WRITE,
            read: DEFAULT_RATE_LIMIT_READ,
            relay: DEFAULT_RATE_LIMIT_RELAY,
        }
    }
}

/// Signaling service configuration.
#[derive(Clone)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,

    /// HMAC signing secret. Validated by the credential service at startup.
    pub jwt_secret: SecretString,

    /// Case-insensitive substrings rejected in `jwt_secret`.
    pub weak_secret_patterns: Vec<String>,

    /// Value for `Access-Control-Allow-Origin` (`*` allows any origin).
    pub cors_origin: String,

    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,

    pub room_idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub max_participants_per_room: usize,

    pub access_token_ttl: Duration,
    pub join_token_ttl: Duration,
    pub refresh_token_ttl: Duration,

    /// Shared store URL. `None` runs the process in single-instance mode.
    /// May embed credentials, hence `SecretString`.
    pub redis_url: Option<SecretString>,

    /// Identifier tagging this process on the event bus.
    pub instance_id: String,

    /// How often this instance announces its rooms to peers.
    pub instance_announce_interval: Duration,

    pub session_ttl: Duration,
    pub session_cleanup_interval: Duration,

    pub rate_limits: RateLimitConfig,

    /// When set, agent registration requires a matching `X-Registration-Secret`.
    pub agent_registration_secret: Option<SecretString>,

    /// Key anonymous rate limits on `X-Forwarded-For` instead of the peer
    /// address. Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("jwt_secret", &"[REDACTED]")
            .field("weak_secret_patterns", &self.weak_secret_patterns.len())
            .field("cors_origin", &self.cors_origin)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("room_idle_timeout", &self.room_idle_timeout)
            .field("reaper_interval", &self.reaper_interval)
            .field("max_participants_per_room", &self.max_participants_per_room)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("join_token_ttl", &self.join_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("instance_id", &self.instance_id)
            .field("instance_announce_interval", &self.instance_announce_interval)
            .field("session_ttl", &self.session_ttl)
            .field("session_cleanup_interval", &self.session_cleanup_interval)
            .field("rate_limits", &self.rate_limits)
            .field(
                "agent_registration_secret",
                &self.agent_registration_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = SecretString::from(
            vars.get("JWT_SECRET")
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar("JWT_SECRET".to_string()))?
                .clone(),
        );

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let port: u16 = parse_positive(vars, "PORT", DEFAULT_PORT)?;

        let weak_secret_patterns = match vars.get("JWT_WEAK_PATTERNS") {
            Some(list) => list
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            None => DEFAULT_WEAK_SECRET_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
        };

        let cors_origin = vars
            .get("CORS_ORIGIN")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CORS_ORIGIN.to_string());

        let heartbeat_interval = seconds(vars, "HEARTBEAT_INTERVAL_SECONDS", DEFAULT_HEARTBEAT_INTERVAL_SECONDS)?;
        let heartbeat_timeout = seconds(vars, "HEARTBEAT_TIMEOUT_SECONDS", DEFAULT_HEARTBEAT_TIMEOUT_SECONDS)?;
        if heartbeat_timeout <= heartbeat_interval {
            return Err(ConfigError::InvalidValue(format!(
                "HEARTBEAT_TIMEOUT_SECONDS ({}) must exceed HEARTBEAT_INTERVAL_SECONDS ({})",
                heartbeat_timeout.as_secs(),
                heartbeat_interval.as_secs()
            )));
        }

        let room_idle_timeout = seconds(vars, "ROOM_IDLE_TIMEOUT_SECONDS", DEFAULT_ROOM_IDLE_TIMEOUT_SECONDS)?;
        let reaper_interval = seconds(vars, "REAPER_INTERVAL_SECONDS", DEFAULT_REAPER_INTERVAL_SECONDS)?;
        let max_participants_per_room = parse_positive(
            vars,
            "MAX_PARTICIPANTS_PER_ROOM",
            DEFAULT_MAX_PARTICIPANTS_PER_ROOM,
        )?;

        let access_token_ttl = seconds(vars, "ACCESS_TOKEN_TTL_SECONDS", DEFAULT_ACCESS_TOKEN_TTL_SECONDS)?;
        let join_token_ttl = seconds(vars, "JOIN_TOKEN_TTL_SECONDS", DEFAULT_JOIN_TOKEN_TTL_SECONDS)?;
        let refresh_token_ttl = seconds(vars, "REFRESH_TOKEN_TTL_SECONDS", DEFAULT_REFRESH_TOKEN_TTL_SECONDS)?;

        let redis_url = vars
            .get("REDIS_URL")
            .filter(|s| !s.trim().is_empty())
            .map(|s| SecretString::from(s.clone()));

        let instance_id = vars
            .get("INSTANCE_ID")
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| {
                let uuid_suffix = uuid::Uuid::new_v4().to_string();
                let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
                format!("{DEFAULT_INSTANCE_ID_PREFIX}-{short_suffix}")
            });

        let instance_announce_interval = seconds(
            vars,
            "INSTANCE_ANNOUNCE_INTERVAL_SECONDS",
            DEFAULT_INSTANCE_ANNOUNCE_INTERVAL_SECONDS,
        )?;

        let session_ttl = seconds(vars, "SESSION_TTL_SECONDS", DEFAULT_SESSION_TTL_SECONDS)?;
        let session_cleanup_interval = seconds(
            vars,
            "SESSION_CLEANUP_INTERVAL_SECONDS",
            DEFAULT_SESSION_CLEANUP_INTERVAL_SECONDS,
        )?;

        let rate_limits = RateLimitConfig {
            window_seconds: parse_positive(
                vars,
                "RATE_LIMIT_WINDOW_SECONDS",
                DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            )?,
            auth: parse_positive(vars, "RATE_LIMIT_AUTH", DEFAULT_RATE_LIMIT_AUTH)?,
            write: parse_positive(vars, "RATE_LIMIT_WRITE", DEFAULT_RATE_LIMIT_WRITE)?,
            read: parse_positive(vars, "RATE_LIMIT_READ", DEFAULT_RATE_LIMIT_READ)?,
            relay: parse_positive(vars, "RATE_LIMIT_RELAY", DEFAULT_RATE_LIMIT_RELAY)?,
        };

        let agent_registration_secret = vars
            .get("AGENT_REGISTRATION_SECRET")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let trust_forwarded_for = parse_flag(vars, "TRUST_FORWARDED_FOR")?;

        Ok(Config {
            bind_address,
            port,
            jwt_secret,
            weak_secret_patterns,
            cors_origin,
            heartbeat_interval,
            heartbeat_timeout,
            room_idle_timeout,
            reaper_interval,
            max_participants_per_room,
            access_token_ttl,
            join_token_ttl,
            refresh_token_ttl,
            redis_url,
            instance_id,
            instance_announce_interval,
            session_ttl,
            session_cleanup_interval,
            rate_limits,
            agent_registration_secret,
            trust_forwarded_for,
        })
    }

    /// Age after which a silent peer's rooms leave the directory.
    #[must_use]
    pub fn directory_stale_after(&self) -> Duration {
        self.instance_announce_interval * DIRECTORY_STALE_ANNOUNCEMENTS
    }

    /// Socket address string the HTTP listener binds to.
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Parse an optional variable that must be a non-zero number when present.
fn parse_positive<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: fmt::Display,
{
    let Some(value_str) = vars.get(key) else {
        return Ok(default);
    };

    let value: T = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{key} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{key} must be greater than 0"
        )));
    }

    Ok(value)
}

fn parse_flag(vars: &HashMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    match vars.get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("" | "false" | "0") => Ok(false),
        Some("true" | "1") => Ok(true),
        Some(other) => Err(ConfigError::InvalidValue(format!(
            "{key} must be true or false, got '{other}'"
        ))),
    }
}

fn seconds(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<Duration, ConfigError> {
    parse_positive(vars, key, default).map(Duration::from_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    const TEST_SECRET: &str = "k3Jd8s0aQz1Lr7Vx2Mn5Bc9Tg4Hy6Wp0";

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([("JWT_SECRET".to_string(), TEST_SECRET.to_string())])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.jwt_secret.expose_secret(), TEST_SECRET);
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.cors_origin, "*");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.room_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.max_participants_per_room, 10);
        assert!(config.redis_url.is_none());
        assert!(config.agent_registration_secret.is_none());
        assert_eq!(config.rate_limits, RateLimitConfig::default());
        assert_eq!(
            config.weak_secret_patterns.len(),
            DEFAULT_WEAK_SECRET_PATTERNS.len()
        );
        assert!(config.instance_id.starts_with("sig-"));
        assert_eq!(config.listen_address(), "0.0.0.0:3001");
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("BIND_ADDRESS".to_string(), "127.0.0.1".to_string());
        vars.insert("PORT".to_string(), "8443".to_string());
        vars.insert("CORS_ORIGIN".to_string(), "https://app.example.org".to_string());
        vars.insert("HEARTBEAT_INTERVAL_SECONDS".to_string(), "10".to_string());
        vars.insert("HEARTBEAT_TIMEOUT_SECONDS".to_string(), "30".to_string());
        vars.insert("ROOM_IDLE_TIMEOUT_SECONDS".to_string(), "120".to_string());
        vars.insert("MAX_PARTICIPANTS_PER_ROOM".to_string(), "4".to_string());
        vars.insert("REDIS_URL".to_string(), "redis://:pw@cache:6379".to_string());
        vars.insert("INSTANCE_ID".to_string(), "sig-west-1".to_string());
        vars.insert("RATE_LIMIT_AUTH".to_string(), "3".to_string());
        vars.insert("JWT_WEAK_PATTERNS".to_string(), " Foo, bar ,,".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.listen_address(), "127.0.0.1:8443");
        assert_eq!(config.cors_origin, "https://app.example.org");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.room_idle_timeout, Duration::from_secs(120));
        assert_eq!(config.max_participants_per_room, 4);
        assert_eq!(
            config.redis_url.as_ref().map(|u| u.expose_secret().to_string()),
            Some("redis://:pw@cache:6379".to_string())
        );
        assert_eq!(config.instance_id, "sig-west-1");
        assert_eq!(config.rate_limits.auth, 3);
        assert_eq!(config.rate_limits.read, DEFAULT_RATE_LIMIT_READ);
        assert_eq!(config.weak_secret_patterns, vec!["foo", "bar"]);
    }

    #[test]
    fn test_missing_jwt_secret() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "JWT_SECRET"));
    }

    #[test]
    fn test_empty_jwt_secret_treated_as_missing() {
        let vars = HashMap::from([("JWT_SECRET".to_string(), String::new())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn test_invalid_port_rejected() {
        for bad in ["abc", "70000", "-1", "0"] {
            let mut vars = base_vars();
            vars.insert("PORT".to_string(), bad.to_string());
            assert!(
                matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(msg)) if msg.contains("PORT")),
                "port {bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut vars = base_vars();
        vars.insert("MAX_PARTICIPANTS_PER_ROOM".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("greater than 0")
        ));
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let mut vars = base_vars();
        vars.insert("HEARTBEAT_INTERVAL_SECONDS".to_string(), "30".to_string());
        vars.insert("HEARTBEAT_TIMEOUT_SECONDS".to_string(), "30".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("HEARTBEAT_TIMEOUT_SECONDS")
        ));
    }

    #[test]
    fn test_blank_redis_url_means_single_instance() {
        let mut vars = base_vars();
        vars.insert("REDIS_URL".to_string(), "  ".to_string());
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut vars = base_vars();
        vars.insert("REDIS_URL".to_string(), "redis://:hunter2@cache".to_string());
        vars.insert("AGENT_REGISTRATION_SECRET".to_string(), "reg-s3cret".to_string());
        let config = Config::from_vars(&vars).unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains(TEST_SECRET));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("reg-s3cret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_directory_staleness_follows_announce_interval() {
        let config = Config::from_vars(&base_vars()).unwrap();
        assert_eq!(config.instance_announce_interval, Duration::from_secs(15));
        assert_eq!(config.directory_stale_after(), Duration::from_secs(45));

        let mut vars = base_vars();
        vars.insert("INSTANCE_ANNOUNCE_INTERVAL_SECONDS".to_string(), "2".to_string());
        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.directory_stale_after(), Duration::from_secs(6));
    }

    #[test]
    fn test_forwarded_for_trust_is_opt_in() {
        let config = Config::from_vars(&base_vars()).unwrap();
        assert!(!config.trust_forwarded_for);

        let mut vars = base_vars();
        vars.insert("TRUST_FORWARDED_FOR".to_string(), "true".to_string());
        assert!(Config::from_vars(&vars).unwrap().trust_forwarded_for);

        vars.insert("TRUST_FORWARDED_FOR".to_string(), "maybe".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
