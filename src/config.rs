// TOML configuration: remote API access, endpoints, refresh/update-check/stack-update tuning

use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::models::{Endpoint, EndpointId};
use crate::remote::Credentials;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub portainer: PortainerConfig,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default)]
    pub update_checks: UpdateCheckSettings,
    #[serde(default)]
    pub stack_update: StackUpdateSettings,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortainerConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl PortainerConfig {
    /// Resolved credentials. Only valid after `AppConfig::validate`.
    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        match (&self.api_key, &self.username, &self.password) {
            (Some(key), None, None) => Ok(Credentials::ApiKey(key.clone())),
            (None, Some(username), Some(password)) => Ok(Credentials::Password {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => anyhow::bail!(
                "portainer: set either api_key or username and password, not both"
            ),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub id: EndpointId,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshSettings {
    #[serde(default = "default_refresh_interval_secs")]
    pub interval_secs: u64,
    /// Refresh cycles an absent container stays `missing` before it is marked removed.
    #[serde(default = "default_removal_grace_cycles")]
    pub removal_grace_cycles: u32,
    #[serde(default = "default_true")]
    pub collect_metrics: bool,
    /// Snapshot events kept in the broadcast channel for /ws/events (slow clients may lag).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// How often to log app stats (refreshes, budget use, ws clients) at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval_secs(),
            removal_grace_cycles: default_removal_grace_cycles(),
            collect_metrics: true,
            event_capacity: default_event_capacity(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    #[serde(default = "default_rate_limit_checks")]
    pub rate_limit_checks: u32,
    #[serde(default = "default_rate_limit_period_hours")]
    pub rate_limit_period_hours: u64,
    /// Run update checks for every image after each scheduled refresh.
    #[serde(default = "default_true")]
    pub check_on_refresh: bool,
}

impl Default for UpdateCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_hours: default_cache_ttl_hours(),
            rate_limit_checks: default_rate_limit_checks(),
            rate_limit_period_hours: default_rate_limit_period_hours(),
            check_on_refresh: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackUpdateSettings {
    #[serde(default = "default_stack_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_retry_backoff_secs")]
    pub redeploy_retry_backoff_secs: u64,
}

impl Default for StackUpdateSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_stack_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            redeploy_retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_db_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_removal_grace_cycles() -> u32 {
    1
}

fn default_event_capacity() -> usize {
    64
}

fn default_stats_log_interval_secs() -> u64 {
    600
}

fn default_cache_ttl_hours() -> u64 {
    6
}

fn default_rate_limit_checks() -> u32 {
    50
}

fn default_rate_limit_period_hours() -> u64 {
    6
}

fn default_stack_timeout_secs() -> u64 {
    90
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_retry_backoff_secs() -> u64 {
    5
}

fn default_db_path() -> String {
    "data/stackpilot.db".into()
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Configured endpoints, reached through the configured API URL.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .map(|e| Endpoint::new(e.id, e.name.as_deref(), &self.portainer.url))
            .collect()
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );

        let url = url::Url::parse(&self.portainer.url)
            .map_err(|e| anyhow::anyhow!("portainer.url is not a valid URL: {e}"))?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "portainer.url must use http or https, got {}",
            url.scheme()
        );
        let has_key = self.portainer.api_key.as_ref().is_some_and(|k| !k.is_empty());
        let has_user = self.portainer.username.as_ref().is_some_and(|u| !u.is_empty());
        let has_password = self.portainer.password.is_some();
        anyhow::ensure!(
            has_key != (has_user || has_password),
            "portainer: set either api_key or username and password, not both"
        );
        anyhow::ensure!(
            has_key || (has_user && has_password),
            "portainer.username and portainer.password must be set together"
        );
        anyhow::ensure!(
            self.portainer.timeout_secs > 0,
            "portainer.timeout_secs must be > 0, got {}",
            self.portainer.timeout_secs
        );

        anyhow::ensure!(
            !self.endpoints.is_empty(),
            "endpoints must list at least one endpoint"
        );
        let mut seen = HashSet::new();
        for e in &self.endpoints {
            anyhow::ensure!(seen.insert(e.id), "endpoints: duplicate id {}", e.id);
        }

        anyhow::ensure!(
            (60..=3600).contains(&self.refresh.interval_secs),
            "refresh.interval_secs must be between 60 and 3600, got {}",
            self.refresh.interval_secs
        );
        anyhow::ensure!(
            self.refresh.event_capacity > 0,
            "refresh.event_capacity must be > 0, got {}",
            self.refresh.event_capacity
        );
        anyhow::ensure!(
            self.refresh.stats_log_interval_secs > 0,
            "refresh.stats_log_interval_secs must be > 0, got {}",
            self.refresh.stats_log_interval_secs
        );

        anyhow::ensure!(
            (1..=24).contains(&self.update_checks.cache_ttl_hours),
            "update_checks.cache_ttl_hours must be between 1 and 24, got {}",
            self.update_checks.cache_ttl_hours
        );
        anyhow::ensure!(
            self.update_checks.rate_limit_checks >= 1,
            "update_checks.rate_limit_checks must be >= 1, got {}",
            self.update_checks.rate_limit_checks
        );
        anyhow::ensure!(
            self.update_checks.rate_limit_period_hours >= 1,
            "update_checks.rate_limit_period_hours must be >= 1, got {}",
            self.update_checks.rate_limit_period_hours
        );

        anyhow::ensure!(
            self.stack_update.default_timeout_secs > 0,
            "stack_update.default_timeout_secs must be > 0, got {}",
            self.stack_update.default_timeout_secs
        );
        anyhow::ensure!(
            self.stack_update.poll_interval_secs > 0,
            "stack_update.poll_interval_secs must be > 0, got {}",
            self.stack_update.poll_interval_secs
        );
        anyhow::ensure!(
            self.stack_update.poll_interval_secs < self.stack_update.default_timeout_secs,
            "stack_update.poll_interval_secs must be < default_timeout_secs, got {} >= {}",
            self.stack_update.poll_interval_secs,
            self.stack_update.default_timeout_secs
        );
        anyhow::ensure!(
            self.stack_update.redeploy_retry_backoff_secs > 0,
            "stack_update.redeploy_retry_backoff_secs must be > 0, got {}",
            self.stack_update.redeploy_retry_backoff_secs
        );

        anyhow::ensure!(
            !self.persistence.enabled || !self.persistence.path.is_empty(),
            "persistence.path must be non-empty"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_resolve_from_api_key() {
        let c = PortainerConfig {
            url: "http://localhost:9000".into(),
            api_key: Some("ptr_abc".into()),
            username: None,
            password: None,
            ssl_verify: true,
            timeout_secs: 30,
        };
        assert!(matches!(c.credentials().unwrap(), Credentials::ApiKey(k) if k == "ptr_abc"));
    }

    #[test]
    fn credentials_reject_mixed_kinds() {
        let c = PortainerConfig {
            url: "http://localhost:9000".into(),
            api_key: Some("ptr_abc".into()),
            username: Some("admin".into()),
            password: Some("pw".into()),
            ssl_verify: true,
            timeout_secs: 30,
        };
        assert!(c.credentials().is_err());
    }
}
