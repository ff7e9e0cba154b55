use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub tenant: TenantConfig,
    /// Optional observability configuration
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen: String,
    /// Base URL of the upstream Prometheus/Alertmanager-compatible server
    pub upstream: String,
}

/// Tenancy enforcement configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    /// Name of the label every request is scoped to (e.g. "tenant_id")
    pub label: String,
    /// When set, the tenant value is fixed for all requests and the request
    /// parameter must be absent.
    #[serde(default)]
    pub value: Option<String>,
    /// Return 400 instead of silently replacing a conflicting matcher that is
    /// already present in a query.
    #[serde(default)]
    pub error_on_replace: bool,
    /// Register /api/v1/labels and /api/v1/label/ routes. Off by default;
    /// unregistered paths answer 501.
    #[serde(default)]
    pub enable_label_apis: bool,
    /// Exact paths forwarded without rewriting (the tenant parameter is still
    /// required and stripped). Validated at startup.
    #[serde(default)]
    pub passthrough_paths: Vec<String>,
}

/// Observability configuration for the internal metrics endpoint.
#[derive(Debug, Deserialize)]
pub struct ObservabilityConfig {
    /// Plain HTTP endpoint serving /metrics (e.g. "127.0.0.1:9091")
    pub metrics_listen: Option<String>,
}

pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "failed to parse config file")?;
    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.tenant.label.is_empty() {
        bail!("tenant.label must not be empty");
    }
    if !is_valid_label_name(&config.tenant.label) {
        bail!("tenant.label {:?} is not a valid label name", config.tenant.label);
    }
    url::Url::parse(&config.proxy.upstream)
        .with_context(|| format!("proxy.upstream {:?} is not a valid URL", config.proxy.upstream))?;
    Ok(())
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
