use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub etl: EtlConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dependencies: DependencyConfig,
}

/// Connection settings for the remote table API.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Instance host (`acme.service-now.com`) or a full base URL
    /// (`http://127.0.0.1:9000`) for local mocks.
    pub instance: String,
    #[serde(default = "default_username_env")]
    pub username_env: String,
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_source_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

fn default_username_env() -> String {
    "CISUG_USERNAME".to_string()
}
fn default_password_env() -> String {
    "CISUG_PASSWORD".to_string()
}
fn default_page_size() -> usize {
    1000
}
fn default_source_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    60
}
fn default_source_timeout() -> u64 {
    180
}

impl SourceConfig {
    /// Base URL of the REST API, always ending in `/api`.
    pub fn api_base(&self) -> String {
        let host = self.instance.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}/api", host)
        } else {
            format!("https://{}/api", host)
        }
    }

    /// Read the basic-auth credentials from the configured environment variables.
    pub fn credentials(&self) -> Result<(String, String)> {
        let username = std::env::var(&self.username_env)
            .with_context(|| format!("{} environment variable not set", self.username_env))?;
        let password = std::env::var(&self.password_env)
            .with_context(|| format!("{} environment variable not set", self.password_env))?;
        Ok((username, password))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EtlConfig {
    #[serde(default = "default_ci_table")]
    pub ci_table: String,
    #[serde(default = "default_change_table")]
    pub change_table: String,
    #[serde(default = "default_days_back")]
    pub days_back: i64,
    #[serde(default = "default_max_changes")]
    pub max_changes_per_ci: usize,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    /// Request display values for CI fields (reference fields come back as
    /// names instead of sys_ids).
    #[serde(default)]
    pub display_values: bool,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            ci_table: default_ci_table(),
            change_table: default_change_table(),
            days_back: default_days_back(),
            max_changes_per_ci: default_max_changes(),
            progress_every: default_progress_every(),
            display_values: false,
        }
    }
}

fn default_ci_table() -> String {
    "cmdb_ci_service".to_string()
}
fn default_change_table() -> String {
    "change_request".to_string()
}
fn default_days_back() -> i64 {
    365
}
fn default_max_changes() -> usize {
    50
}
fn default_progress_every() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Endpoint override (Ollama only).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_k")]
    pub default_k: i64,
    #[serde(default = "default_max_k")]
    pub max_k: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_k: default_k(),
            max_k: default_max_k(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_k() -> i64 {
    10
}
fn default_max_k() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Forward milestone events to the instance's log endpoint.
    #[serde(default)]
    pub forward: bool,
    #[serde(default = "default_level")]
    pub forward_level: String,
    #[serde(default = "default_forward_path")]
    pub forward_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            forward: false,
            forward_level: default_level(),
            forward_path: default_forward_path(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_forward_path() -> String {
    "x_ci_suggester/integration/log".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DependencyConfig {
    #[serde(default)]
    pub fail_on_error: bool,
    /// Application name → minimum dotted version.
    #[serde(default)]
    pub applications: BTreeMap<String, String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.source.instance.trim().is_empty() {
        bail!("source.instance must not be empty");
    }
    if config.source.page_size == 0 {
        bail!("source.page_size must be > 0");
    }
    if config.source.max_retries == 0 {
        bail!("source.max_retries must be >= 1");
    }

    if config.etl.ci_table.trim().is_empty() {
        bail!("etl.ci_table must not be empty");
    }
    if config.etl.days_back < 0 {
        bail!("etl.days_back must be >= 0");
    }
    if chrono::TimeDelta::try_days(config.etl.days_back).is_none() {
        bail!("etl.days_back is too large: {}", config.etl.days_back);
    }
    if config.etl.progress_every == 0 {
        bail!("etl.progress_every must be > 0");
    }

    match config.embedding.provider.as_str() {
        "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be local, openai, or ollama.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    if config.server.default_k < 1 {
        bail!("server.default_k must be >= 1");
    }
    if config.server.max_k < config.server.default_k {
        bail!("server.max_k must be >= server.default_k");
    }

    for (name, version) in &config.dependencies.applications {
        if crate::deps::parse_version(version).is_err() {
            bail!(
                "dependencies.applications.{}: '{}' is not a dotted numeric version",
                name,
                version
            );
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[source]
instance = "acme.service-now.com"

[storage]
data_dir = "./data"
"#;

    #[test]
    fn huge_days_back_is_rejected() {
        let toml = format!("{}\n[etl]\ndays_back = 1000000000\n", MINIMAL);
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("days_back"));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.source.page_size, 1000);
        assert_eq!(config.source.max_retries, 5);
        assert_eq!(config.source.retry_delay_secs, 60);
        assert_eq!(config.etl.ci_table, "cmdb_ci_service");
        assert_eq!(config.etl.change_table, "change_request");
        assert_eq!(config.etl.days_back, 365);
        assert_eq!(config.etl.max_changes_per_ci, 50);
        assert_eq!(config.embedding.provider, "local");
        assert_eq!(config.server.default_k, 10);
        assert!(!config.logging.forward);
        assert!(config.dependencies.applications.is_empty());
    }

    #[test]
    fn api_base_accepts_host_or_url() {
        let mut config = parse_config(MINIMAL).unwrap();
        assert_eq!(
            config.source.api_base(),
            "https://acme.service-now.com/api"
        );
        config.source.instance = "http://127.0.0.1:9000/".to_string();
        assert_eq!(config.source.api_base(), "http://127.0.0.1:9000/api");
    }

    #[test]
    fn rejects_zero_page_size() {
        let doc = MINIMAL.replace(
            "instance = \"acme.service-now.com\"",
            "instance = \"acme.service-now.com\"\npage_size = 0",
        );
        let err = parse_config(&doc).unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn remote_provider_requires_model_and_dims() {
        let doc = format!("{}\n[embedding]\nprovider = \"openai\"\n", MINIMAL);
        let err = parse_config(&doc).unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let doc = format!("{}\n[embedding]\nprovider = \"word2vec\"\n", MINIMAL);
        assert!(parse_config(&doc).is_err());
    }

    #[test]
    fn rejects_non_numeric_dependency_version() {
        let doc = format!(
            "{}\n[dependencies.applications]\n\"CMDB Integration\" = \"1.x\"\n",
            MINIMAL
        );
        let err = parse_config(&doc).unwrap_err();
        assert!(err.to_string().contains("CMDB Integration"));
    }
}
