//! Configuration parsing and validation for llm-router.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::providers::ProviderKind;
use crate::router::RoutingStrategy;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub external_providers: Vec<ExternalProviderConfig>,
    #[serde(default)]
    pub demo: DemoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration. Timeouts are whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_io_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_io_timeout")]
    pub write_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_io_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }
}

/// Routing policy and polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    /// Maximum $/1K tokens at which a cluster is preferred by the hybrid policy.
    #[serde(default = "default_cluster_cost_threshold")]
    pub cluster_cost_threshold: f64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: u32,
    /// Multiplier applied to raw cluster cost for idle headroom.
    #[serde(default = "default_overhead_factor")]
    pub overhead_factor: f64,
    /// Seconds between health-poll ticks.
    #[serde(default = "default_interval")]
    pub health_check_interval: u64,
    /// Seconds between gauge refreshes.
    #[serde(default = "default_interval")]
    pub metrics_update_interval: u64,
    /// When false, external providers are never routing candidates.
    #[serde(default = "default_true")]
    pub enable_external_fallback: bool,
}

fn default_cluster_cost_threshold() -> f64 {
    0.01
}

fn default_max_latency_ms() -> u64 {
    5000
}

fn default_max_queue_depth() -> u32 {
    10
}

fn default_overhead_factor() -> f64 {
    1.1
}

fn default_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routing_strategy: RoutingStrategy::default(),
            cluster_cost_threshold: default_cluster_cost_threshold(),
            max_latency_ms: default_max_latency_ms(),
            max_queue_depth: default_max_queue_depth(),
            overhead_factor: default_overhead_factor(),
            health_check_interval: default_interval(),
            metrics_update_interval: default_interval(),
            enable_external_fallback: true,
        }
    }
}

impl RouterConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn metrics_update_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_update_interval)
    }
}

/// Secret value wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct Secret(SecretString);

impl Secret {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| Secret(SecretString::from(s)))
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Secret(SecretString::from(s))
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Secret(SecretString::from(s))
    }
}

/// Outbound authentication scheme for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Hmac,
    Mtls,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::Hmac => "hmac",
            AuthType::Mtls => "mtls",
        }
    }
}

/// A self-hosted inference cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    /// Base URL, e.g. "https://llm.aws.internal:8443"
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    /// Cloud provider label, used only for metrics.
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub cost_per_hour: f64,
    /// Absent means requests are forwarded without credentials.
    pub auth_type: Option<AuthType>,
    pub shared_secret: Option<Secret>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Extra PEM roots trusted when verifying an mTLS cluster's certificate.
    pub ca_file: Option<PathBuf>,
}

/// An external hosted-model provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub api_key: Option<Secret>,
    #[serde(rename = "baseURL")]
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Demo front-end support.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoConfig {
    #[serde(default)]
    pub enabled: bool,
    pub password: Option<Secret>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// How a secret value was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in config (no ${} references)
    Literal,
    /// Contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Auto-discovered from the convention env var (holds var name)
    Convention(String),
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{owner}': {message}")]
    EnvVar {
        var: String,
        owner: String,
        message: String,
    },

    #[error("Invalid TLS material for cluster '{cluster}': {message}")]
    Tls { cluster: String, message: String },
}

impl Config {
    /// Load configuration from a TOML file, expanding `${VAR}` references.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string using the process environment.
    pub fn parse_str(content: &str) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::parse_str_with(content, |name| std::env::var(name).ok())
    }

    /// Parse configuration with a custom environment lookup.
    pub fn parse_str_with<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(content)?;
        let key_sources = config.resolve_secrets(&lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Expand `${VAR}` references in provider keys and cluster secrets.
    ///
    /// Providers without an `apiKey` fall back to `LLM_ROUTER_<NAME>_API_KEY`.
    fn resolve_secrets<F>(&mut self, lookup: &F) -> Result<Vec<(String, KeySource)>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut key_sources = Vec::with_capacity(self.external_providers.len());

        for provider in &mut self.external_providers {
            let source = match provider.api_key.take() {
                Some(raw) if raw.expose_secret().contains("${") => {
                    let expanded =
                        expand_env_vars_with(raw.expose_secret(), &provider.name, lookup)?;
                    provider.api_key = Some(Secret::from(expanded));
                    KeySource::EnvExpanded
                }
                Some(raw) => {
                    provider.api_key = Some(raw);
                    KeySource::Literal
                }
                None => {
                    let var_name = convention_env_var_name(&provider.name);
                    match lookup(&var_name) {
                        Some(value) => {
                            provider.api_key = Some(Secret::from(value));
                            KeySource::Convention(var_name)
                        }
                        None => KeySource::None,
                    }
                }
            };
            key_sources.push((provider.name.clone(), source));
        }

        for cluster in &mut self.clusters {
            if let Some(raw) = cluster.shared_secret.take() {
                let value = expand_env_vars_with(raw.expose_secret(), &cluster.name, lookup)?;
                cluster.shared_secret = Some(Secret::from(value));
            }
        }

        if let Some(raw) = self.demo.password.take() {
            let value = expand_env_vars_with(raw.expose_secret(), "demo", lookup)?;
            self.demo.password = Some(Secret::from(value));
        }

        Ok(key_sources)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.clusters.is_empty() && self.external_providers.iter().all(|p| !p.enabled) {
            tracing::warn!("No targets configured - router will reject all requests");
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate target name '{}'",
                    cluster.name
                )));
            }
            if cluster.endpoint.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Cluster '{}' has empty endpoint",
                    cluster.name
                )));
            }
            if cluster.cost_per_hour < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Cluster '{}' has negative costPerHour",
                    cluster.name
                )));
            }
            match cluster.auth_type {
                Some(AuthType::Hmac) if cluster.shared_secret.is_none() => {
                    return Err(ConfigError::Validation(format!(
                        "Cluster '{}' uses hmac auth but has no sharedSecret",
                        cluster.name
                    )));
                }
                Some(AuthType::Mtls)
                    if cluster.cert_file.is_none() || cluster.key_file.is_none() =>
                {
                    return Err(ConfigError::Validation(format!(
                        "Cluster '{}' uses mtls auth but is missing certFile or keyFile",
                        cluster.name
                    )));
                }
                _ => {}
            }
        }

        for provider in &self.external_providers {
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate target name '{}'",
                    provider.name
                )));
            }
            if provider.enabled && provider.api_key.is_none() {
                tracing::warn!(provider = %provider.name, "External provider has no API key");
            }
        }

        if self.router.overhead_factor <= 0.0 {
            return Err(ConfigError::Validation(
                "router.overheadFactor must be positive".to_string(),
            ));
        }
        if self.router.health_check_interval == 0 || self.router.metrics_update_interval == 0 {
            return Err(ConfigError::Validation(
                "router.healthCheckInterval and router.metricsUpdateInterval must be positive"
                    .to_string(),
            ));
        }
        if self.demo.enabled && self.demo.password.is_none() {
            return Err(ConfigError::Validation(
                "demo.enabled requires demo.password".to_string(),
            ));
        }

        Ok(())
    }

    /// Look up a cluster by name.
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, owner: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            owner: owner.to_string(),
            message: "Unclosed '${' in config value".to_string(),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                owner: owner.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            owner: owner.to_string(),
            message: format!("Environment variable '{}' is not set", var_name),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Derive the convention-based env var name for a provider.
///
/// - "openai" -> "LLM_ROUTER_OPENAI_API_KEY"
/// - "claude-main" -> "LLM_ROUTER_CLAUDE_MAIN_API_KEY"
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' '], "_");
    format!("LLM_ROUTER_{}_API_KEY", upper_snake)
}
