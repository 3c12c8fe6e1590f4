use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

const LOCAL_ENV: &str = "local";

/// Enables the function container health reconciler. Overrides the config
/// file when set.
pub const HEALTHINESS_ENV: &str = "NUCLIO_CHECK_FUNCTION_CONTAINERS_HEALTHINESS";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon address. Supports:
    /// - Unix socket: `unix:///var/run/docker.sock` or
    ///   `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    /// - HTTPS: `https://localhost:2376`
    ///
    /// If not specified, uses Docker's default socket location.
    #[serde(default)]
    pub address: Option<String>,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthinessConfig {
    /// Health checking is disabled by default.
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between sweeps.
    #[serde_inline_default(30)]
    pub interval_secs: u64,
    /// Per-container health wait during a sweep.
    #[serde_inline_default(5)]
    pub timeout_secs: u64,
}

impl Default for HealthinessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

/// Configuration for the local platform.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Environment name (e.g., "local", "staging", "production").
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde(default)]
    pub docker: DockerConfig,
    /// Path of the function/project/event record store.
    #[serde_inline_default("./nuclio-local-store.json".to_string())]
    pub store_path: String,
    #[serde(default)]
    pub healthiness: HealthinessConfig,
    /// Addresses invocations should use; resolved lazily when empty.
    #[serde(default)]
    pub external_ip_addresses: Vec<String>,
    /// Readiness wait applied when a function spec does not set one.
    #[serde_inline_default(60)]
    pub default_readiness_timeout_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            env: LOCAL_ENV.to_string(),
            docker: DockerConfig::default(),
            store_path: "./nuclio-local-store.json".to_string(),
            healthiness: HealthinessConfig::default(),
            external_ip_addresses: Vec::new(),
            default_readiness_timeout_secs: 60,
        }
    }
}

impl PlatformConfig {
    /// Load the configuration for the running process: the given file or
    /// defaults, with environment overrides applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(HEALTHINESS_ENV) {
            self.healthiness.enabled = parse_bool(&value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_readiness_timeout_secs == 0 {
            anyhow::bail!("default_readiness_timeout_secs must be greater than zero");
        }
        if self.healthiness.interval_secs == 0 || self.healthiness.timeout_secs == 0 {
            anyhow::bail!("healthiness interval and timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "True" | "TRUE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlatformConfig::default();
        assert_eq!(config.env, "local");
        assert!(!config.healthiness.enabled);
        assert_eq!(config.healthiness.interval_secs, 30);
        assert_eq!(config.healthiness.timeout_secs, 5);
        assert_eq!(config.default_readiness_timeout_secs, 60);
        assert!(!config.structured_logging());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
env: production
docker:
  address: "unix:///var/run/docker.sock"
store_path: "/var/lib/nuclio/store.json"
healthiness:
  enabled: true
  interval_secs: 10
"#;
        let config = PlatformConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.env, "production");
        assert!(config.structured_logging());
        assert_eq!(
            config.docker.address.as_deref(),
            Some("unix:///var/run/docker.sock")
        );
        assert!(config.healthiness.enabled);
        assert_eq!(config.healthiness.interval_secs, 10);
        // unset fields keep their inline defaults
        assert_eq!(config.healthiness.timeout_secs, 5);
        assert_eq!(config.default_readiness_timeout_secs, 60);
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let yaml = r#"
default_readiness_timeout_secs: 0
"#;
        assert!(PlatformConfig::from_yaml_str(yaml).is_err());

        let yaml = r#"
healthiness:
  interval_secs: 0
"#;
        assert!(PlatformConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_env_override_enables_healthiness() {
        std::env::set_var(HEALTHINESS_ENV, "true");
        let config = PlatformConfig::load(None).unwrap();
        std::env::remove_var(HEALTHINESS_ENV);
        assert!(config.healthiness.enabled);
    }

    #[test]
    fn test_parse_bool() {
        for truthy in ["1", "true", "True", "TRUE", " true "] {
            assert!(parse_bool(truthy), "{:?}", truthy);
        }
        for falsy in ["", "0", "false", "no", "yes"] {
            assert!(!parse_bool(falsy), "{:?}", falsy);
        }
    }
}
