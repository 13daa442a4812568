use crate::error::{GatewayError, Result};
use crate::mapping::ModelMapping;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub model_mapping: ModelMapping,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub authentication: AuthConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub response: ResponseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Largest accepted request body. Unlimited when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower values are tried first. Defaults to the backend's position in the list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// Environment variable holding a bearer token for this backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl BackendConfig {
    pub fn effective_priority(&self, position: usize) -> u32 {
        self.priority
            .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub valid_api_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Estimate `usage` when a backend leaves it out of a completion.
    #[serde(default = "default_true")]
    pub add_usage_stats: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub include_request_body: bool,
    #[serde(default)]
    pub include_response_body: bool,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    32
}

fn default_backends() -> Vec<BackendConfig> {
    vec![BackendConfig {
        name: "primary".to_string(),
        url: "http://localhost:1234".to_string(),
        timeout_secs: None,
        enabled: true,
        priority: None,
        api_key_env: None,
    }]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            max_body_bytes: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            add_usage_stats: true,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backends: default_backends(),
            model_mapping: ModelMapping::default(),
            default_model: default_model(),
            default_timeout_secs: default_timeout_secs(),
            authentication: AuthConfig::default(),
            health: HealthConfig::default(),
            relay: RelayConfig::default(),
            logging: LoggingConfig::default(),
            response: ResponseConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir > built-in defaults
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::warn!(
            searched = %candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "No config file found, using built-in defaults"
        );
        Ok(Self::default())
    }

    /// Reject configurations the gateway cannot serve from.
    pub fn validate(&self) -> Result<()> {
        if !self.backends.iter().any(|b| b.enabled) {
            return Err(GatewayError::config(
                "At least one backend must be enabled",
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(GatewayError::config(format!(
                    "Duplicate backend name '{}'",
                    backend.name
                )));
            }
            if !(backend.url.starts_with("http://") || backend.url.starts_with("https://")) {
                return Err(GatewayError::config(format!(
                    "Backend '{}' has invalid url '{}': expected http:// or https://",
                    backend.name, backend.url
                )));
            }
            if backend.timeout_secs == Some(0) {
                return Err(GatewayError::config(format!(
                    "Backend '{}' has timeout_secs = 0: must be at least 1",
                    backend.name
                )));
            }
        }

        if self.default_timeout_secs == 0 {
            return Err(GatewayError::config("default_timeout_secs must be at least 1"));
        }
        if self.server.max_body_bytes == Some(0) {
            return Err(GatewayError::config("server.max_body_bytes must be at least 1"));
        }

        if self.health.failure_threshold == 0 {
            return Err(GatewayError::config("health.failure_threshold must be at least 1"));
        }
        if self.relay.channel_capacity == 0 {
            return Err(GatewayError::config("relay.channel_capacity must be at least 1"));
        }
        if self.default_model.trim().is_empty() {
            return Err(GatewayError::config("default_model must not be empty"));
        }

        Ok(())
    }

    pub fn backend_timeout(&self, backend: &BackendConfig) -> Duration {
        Duration::from_secs(backend.timeout_secs.unwrap_or(self.default_timeout_secs))
    }

    /// Replace the URL of the backend that would be tried first.
    pub fn override_primary_backend_url(&mut self, url: &str) {
        let primary = self
            .backends
            .iter_mut()
            .enumerate()
            .filter(|(_, b)| b.enabled)
            .min_by_key(|(idx, b)| (b.effective_priority(*idx), *idx))
            .map(|(_, b)| b);
        if let Some(backend) = primary {
            backend.url = url.to_string();
        }
    }
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("openai-relay.toml"));

    // XDG / platform config dir
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs_path() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("openai-relay")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("openai-relay").join("config.toml"));
        }
        if let Some(home) = dirs_path() {
            paths.push(home.join(".config").join("openai-relay").join("config.toml"));
        }
    }

    // Home directory fallback
    if let Some(home) = dirs_path() {
        paths.push(home.join(".openai-relay.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn backend(name: &str, url: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            url: url.to_string(),
            timeout_secs: None,
            enabled: true,
            priority: None,
            api_key_env: None,
        }
    }

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
default_model = "gpt-4"

[server]
port = 5000

[[backends]]
name = "lm-studio"
url = "http://10.0.0.5:1234"
timeout_secs = 60
priority = 2

[[backends]]
name = "ollama"
url = "http://localhost:11434"
enabled = false

[model_mapping]
"gpt-4" = "llama-3.1-instruct-13b"

[authentication]
enabled = true
valid_api_keys = ["sk-local"]
"#
        )
        .unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].priority, Some(2));
        assert!(!config.backends[1].enabled);
        assert_eq!(config.backend_timeout(&config.backends[0]), Duration::from_secs(60));
        assert_eq!(config.backend_timeout(&config.backends[1]), Duration::from_secs(300));
        assert_eq!(
            config.model_mapping.map_forward("gpt-4"),
            "llama-3.1-instruct-13b"
        );
        assert!(config.authentication.enabled);
        assert_eq!(config.health.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].url, "http://localhost:1234");
        assert_eq!(config.default_model, "gpt-3.5-turbo");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config: GatewayConfig =
            toml::from_str(include_str!("../openai-relay.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.model_mapping.len(), 3);
        assert_eq!(
            config.model_mapping.external_ids().collect::<Vec<_>>(),
            vec!["gpt-3.5-turbo", "gpt-4", "text-embedding-ada-002"]
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = GatewayConfig::find_and_load(Some(Path::new("/nonexistent/relay.toml")))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_validate_requires_enabled_backend() {
        let mut config = GatewayConfig::default();
        config.backends[0].enabled = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("At least one backend"));
    }

    #[test]
    fn test_validate_rejects_duplicate_names_and_bad_urls() {
        let mut config = GatewayConfig::default();
        config.backends = vec![backend("a", "http://x"), backend("a", "http://y")];
        assert!(config.validate().is_err());

        config.backends = vec![backend("a", "localhost:1234")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = GatewayConfig::default();
        config.backends[0].timeout_secs = Some(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_secs = 0"));

        let mut config = GatewayConfig::default();
        config.default_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default_timeout_secs"));

        let mut config = GatewayConfig::default();
        config.server.max_body_bytes = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_response_and_body_limit_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert!(config.response.add_usage_stats);
        assert_eq!(config.server.max_body_bytes, None);

        let config: GatewayConfig = toml::from_str(
            "[server]\nmax_body_bytes = 1024\n[response]\nadd_usage_stats = false\n",
        )
        .unwrap();
        assert!(!config.response.add_usage_stats);
        assert_eq!(config.server.max_body_bytes, Some(1024));
    }

    #[test]
    fn test_override_primary_backend_url() {
        let mut config = GatewayConfig::default();
        config.backends[0].priority = Some(5);
        let mut second = backend("second", "http://second");
        second.priority = Some(1);
        config.backends.push(second);

        config.override_primary_backend_url("http://override:9000");
        assert_eq!(config.backends[0].url, "http://localhost:1234");
        assert_eq!(config.backends[1].url, "http://override:9000");
    }
}
