use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    /// PKCS#8 PEM private key shared by every partner; generated on first start
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Maximum time since the last check-in before a record is evicted
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Base URLs of partner directories; empty disables replication
    #[serde(default)]
    pub partners: Vec<Url>,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_signing_key_path() -> PathBuf {
    PathBuf::from("/var/lib/relay-directory/authority.pem")
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/lib/relay-directory/records.json")
}

fn default_max_age() -> u64 {
    60 * 60
}

fn default_grace_period() -> u64 {
    60
}

fn default_verify_timeout() -> u64 {
    10
}

fn default_workers() -> usize {
    2
}

fn default_listen() -> String {
    "[::]:7888".to_string()
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            signing_key_path: default_signing_key_path(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            max_age_secs: default_max_age(),
            grace_period_secs: default_grace_period(),
            verify_timeout_secs: default_verify_timeout(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            partners: Vec::new(),
            workers: default_workers(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl RegistryConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Eviction runs four times per maximum age
    pub fn eviction_period(&self) -> Duration {
        Duration::from_secs((self.max_age_secs / 4).max(1))
    }
}

impl CoordinationConfig {
    /// Outbound delivery uses one or two workers
    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, 2)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.registry.max_age_secs, 3600);
        assert_eq!(config.registry.grace_period_secs, 60);
        assert_eq!(config.registry.verify_timeout(), Duration::from_secs(10));
        assert_eq!(config.registry.eviction_period(), Duration::from_secs(900));
        assert!(config.coordination.partners.is_empty());
        assert_eq!(config.api.listen, "[::]:7888");
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [registry]
            max_age_secs = 8

            [coordination]
            partners = ["http://dir2.example.net:7888"]
            workers = 9
            "#,
        )
        .unwrap();

        assert_eq!(config.registry.eviction_period(), Duration::from_secs(2));
        assert_eq!(config.registry.grace_period_secs, 60);
        assert_eq!(config.coordination.partners.len(), 1);
        assert_eq!(config.coordination.worker_count(), 2);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = Config::load("/nonexistent/directoryd.toml");
        assert!(result.is_err());
    }
}
