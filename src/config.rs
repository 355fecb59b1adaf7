use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_dimension_items")]
    pub max_dimension_items: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_request_deadline_secs() -> u64 {
    120
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_dimension_items() -> usize {
    50
}
fn default_page_size() -> usize {
    1000
}

impl UpstreamConfig {
    /// Base URL without trailing slash.
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_version")]
    pub version: String,
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_cache_version() -> String {
    "v1".to_string()
}
fn default_persist() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: default_cache_version(),
            persist: default_persist(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatasetConfig {
    /// Mark the `period` column temporal in dataset metadata.
    #[serde(default)]
    pub temporal_period: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8089".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate upstream
    let base = config.upstream.base_url.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        anyhow::bail!(
            "upstream.base_url must start with http:// or https:// (got '{}')",
            config.upstream.base_url
        );
    }
    if config.upstream.max_concurrency < 1 {
        anyhow::bail!("upstream.max_concurrency must be >= 1");
    }
    if config.upstream.max_dimension_items < 1 {
        anyhow::bail!("upstream.max_dimension_items must be >= 1");
    }
    if config.upstream.page_size < 1 {
        anyhow::bail!("upstream.page_size must be >= 1");
    }
    if config.upstream.timeout_secs == 0 {
        anyhow::bail!("upstream.timeout_secs must be > 0");
    }
    if config.upstream.request_deadline_secs == 0 {
        anyhow::bail!("upstream.request_deadline_secs must be > 0");
    }
    if config.upstream.password_env.is_some() && config.upstream.username.is_none() {
        anyhow::bail!("upstream.password_env requires upstream.username");
    }

    // Validate cache
    if config.cache.version.trim().is_empty() {
        anyhow::bail!("cache.version must not be empty");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
[upstream]
base_url = "https://play.dhis2.org/40/"

[db]
path = "./data/d2b.sqlite"
"#;

    #[test]
    fn test_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.upstream.base(), "https://play.dhis2.org/40");
        assert_eq!(config.upstream.max_concurrency, 4);
        assert_eq!(config.upstream.max_dimension_items, 50);
        assert_eq!(config.cache.version, "v1");
        assert!(config.cache.persist);
        assert!(!config.dataset.temporal_period);
        assert_eq!(config.server.bind, "127.0.0.1:8089");
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let err = parse(
            r#"
[upstream]
base_url = "ftp://example.org"
[db]
path = "x.sqlite"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = parse(
            r#"
[upstream]
base_url = "http://localhost:8080"
max_concurrency = 0
[db]
path = "x.sqlite"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_rejects_empty_cache_version() {
        let err = parse(
            r#"
[upstream]
base_url = "http://localhost:8080"
[cache]
version = " "
[db]
path = "x.sqlite"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cache.version"));
    }

    #[test]
    fn test_password_without_username() {
        let err = parse(
            r#"
[upstream]
base_url = "http://localhost:8080"
password_env = "DHIS2_PASSWORD"
[db]
path = "x.sqlite"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("username"));
    }
}
