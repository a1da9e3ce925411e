//! Configuration and token fixtures.

use signaling_service::config::Config;
use std::collections::HashMap;

/// Signing secret accepted by the secret policy.
pub const TEST_JWT_SECRET: &str = "k3Jd8s0aQz1Lr7Vx2Mn5Bc9Tg4Hy6Wp0";

/// Environment for a test instance, before overrides.
pub fn test_config_vars(instance_id: &str) -> HashMap<String, String> {
    HashMap::from([
        ("BIND_ADDRESS".to_string(), "127.0.0.1".to_string()),
        ("JWT_SECRET".to_string(), TEST_JWT_SECRET.to_string()),
        ("INSTANCE_ID".to_string(), instance_id.to_string()),
        ("MAX_PARTICIPANTS_PER_ROOM".to_string(), "4".to_string()),
        ("HEARTBEAT_INTERVAL_SECONDS".to_string(), "5".to_string()),
        ("HEARTBEAT_TIMEOUT_SECONDS".to_string(), "15".to_string()),
    ])
}

/// Config for a test instance with `overrides` applied on top.
pub fn test_config(instance_id: &str, overrides: &[(&str, &str)]) -> Result<Config, anyhow::Error> {
    let mut vars = test_config_vars(instance_id);
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }
    Config::from_vars(&vars).map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_applies_overrides() {
        let config = test_config("sig-test", &[("MAX_PARTICIPANTS_PER_ROOM", "2")]).unwrap();
        assert_eq!(config.instance_id, "sig-test");
        assert_eq!(config.max_participants_per_room, 2);
        assert!(config.redis_url.is_none());
    }
}
