//! One shared limiter per rate limited host.
//!
//! Every call site that talks to the same host must draw from the same
//! admission ledger, otherwise the host sees the sum of several budgets.
//! [`LimiterRegistry`] keys limiters by host name and builds them lazily from
//! a [`RegistryConfig`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Limiter;
use crate::config::LimiterSettings;
use crate::error::ConfigError;
use crate::error::LimitError;
use crate::error::Result;
use crate::metrics::MetricsSnapshot;

/// Registry settings: a default for unknown hosts plus per-host overrides.
///
/// ```yaml
/// default:
///   kind: rolling
///   limit: 60
///   window_secs: 60
/// hosts:
///   api.example.com:
///     kind: fixed
///     limit: 10
///     window_secs: 1
///     alignment: clock_aligned
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Settings for hosts without an entry in `hosts`
    #[serde(default)]
    pub default: LimiterSettings,

    /// Per-host settings, keyed by host name
    #[serde(default)]
    pub hosts: HashMap<String, LimiterSettings>,
}

impl RegistryConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading rate limit configuration");

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Settings that apply to `host`.
    pub fn settings_for(&self, host: &str) -> &LimiterSettings {
        self.hosts.get(host).unwrap_or(&self.default)
    }
}

fn normalize(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}

/// Hands out one shared limiter per host.
///
/// Host names are compared case-insensitively and without surrounding
/// whitespace.
#[derive(Debug)]
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<dyn Limiter>>,
    config: RegistryConfig,
}

impl LimiterRegistry {
    /// Creates an empty registry, validating every settings entry up front.
    pub fn new(config: RegistryConfig) -> Result<Self, ConfigError> {
        config.default.to_config()?;
        let mut hosts = HashMap::with_capacity(config.hosts.len());
        for (host, settings) in config.hosts {
            settings.to_config()?;
            hosts.insert(normalize(&host), settings);
        }

        Ok(Self {
            limiters: DashMap::new(),
            config: RegistryConfig {
                default: config.default,
                hosts,
            },
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns the limiter for `host`, building it on first use.
    ///
    /// Concurrent first calls for the same host all receive the same
    /// instance.
    pub fn get_or_create(&self, host: &str) -> Result<Arc<dyn Limiter>, ConfigError> {
        let key = normalize(host);
        let settings = self.config.settings_for(&key);
        let entry = self.limiters.entry(key.clone()).or_try_insert_with(|| {
            let limiter = settings.build()?;
            debug!(
                host = %key,
                kind = settings.kind.as_str(),
                limit = settings.limit,
                window_secs = settings.window_secs,
                "created limiter"
            );
            Ok::<_, ConfigError>(limiter)
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Registers an externally built limiter, returning the one it replaced.
    pub fn insert(&self, host: &str, limiter: Arc<dyn Limiter>) -> Option<Arc<dyn Limiter>> {
        self.limiters.insert(normalize(host), limiter)
    }

    pub fn get(&self, host: &str) -> Option<Arc<dyn Limiter>> {
        self.limiters
            .get(&normalize(host))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Forgets the limiter for `host`. Holders of the instance keep using it.
    pub fn remove(&self, host: &str) -> Option<Arc<dyn Limiter>> {
        self.limiters
            .remove(&normalize(host))
            .map(|(_, limiter)| limiter)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Registered host names, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .limiters
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        hosts.sort();
        hosts
    }

    /// A metrics snapshot for every registered host, sorted by host.
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        let mut snapshots: Vec<(String, MetricsSnapshot)> = self
            .limiters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }

    /// Shuts down every registered limiter within a shared `timeout`.
    ///
    /// The limiters stay registered and reject further callers.
    pub async fn shutdown_all(&self, timeout: Duration) -> Result<()> {
        // No map guard may be held across an await.
        let limiters: Vec<(String, Arc<dyn Limiter>)> = self
            .limiters
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let started = Instant::now();
        let mut pending = 0;
        for (host, limiter) in limiters {
            let remaining = timeout.saturating_sub(started.elapsed());
            match limiter.shutdown(remaining).await {
                Ok(()) => {}
                Err(LimitError::ShutdownTimeout { pending: left, .. }) => {
                    warn!(%host, pending = left, "limiter did not shut down in time");
                    pending += left;
                }
                Err(err) => return Err(err),
            }
        }

        if pending > 0 {
            return Err(LimitError::ShutdownTimeout { timeout, pending });
        }
        info!(limiters = self.len(), "all limiters shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::LimiterKind;

    const CONFIG: &str = "
default:
  limit: 3
  window_secs: 1
hosts:
  Api.Example.com:
    kind: fixed
    limit: 1
    window_secs: 0.5
";

    fn registry() -> LimiterRegistry {
        LimiterRegistry::new(RegistryConfig::from_yaml(CONFIG).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn it_shares_one_limiter_per_host() {
        let registry = registry();
        let first = registry.get_or_create("search.example.com").unwrap();
        let second = registry.get_or_create("  SEARCH.example.com ").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.kind(), LimiterKind::Rolling);
        assert_eq!(first.config().capacity(), 3);
    }

    #[tokio::test]
    async fn it_applies_per_host_settings() {
        let registry = registry();
        let limiter = registry.get_or_create("api.example.com").unwrap();

        assert_eq!(limiter.kind(), LimiterKind::Fixed);
        assert_eq!(limiter.config().capacity(), 1);
        assert_eq!(limiter.config().window(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn shared_limiters_share_a_budget() {
        let registry = registry();
        let a = registry.get_or_create("api.example.com").unwrap();
        let b = registry.get_or_create("api.example.com").unwrap();

        a.acquire().await.unwrap();
        assert!(!b.can_acquire());
        assert_eq!(b.metrics().successful_requests, 1);
    }

    #[tokio::test]
    async fn get_and_remove_do_not_create() {
        let registry = registry();
        assert!(registry.get("nowhere.example.com").is_none());
        assert!(registry.is_empty());

        registry.get_or_create("b.example.com").unwrap();
        registry.get_or_create("a.example.com").unwrap();
        assert_eq!(registry.hosts(), vec!["a.example.com", "b.example.com"]);

        assert!(registry.remove("A.example.com").is_some());
        assert!(registry.remove("A.example.com").is_none());
        assert_eq!(registry.hosts(), vec!["b.example.com"]);
    }

    #[tokio::test]
    async fn metrics_cover_every_host() {
        let registry = registry();
        registry
            .get_or_create("b.example.com")
            .unwrap()
            .acquire()
            .await
            .unwrap();
        registry.get_or_create("a.example.com").unwrap();

        let metrics = registry.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].0, "a.example.com");
        assert_eq!(metrics[0].1.total_requests, 0);
        assert_eq!(metrics[1].1.successful_requests, 1);
    }

    #[tokio::test]
    async fn shutdown_all_stops_every_limiter() {
        let registry = registry();
        let rolling = registry.get_or_create("a.example.com").unwrap();
        let fixed = registry.get_or_create("api.example.com").unwrap();

        registry.shutdown_all(Duration::from_secs(1)).await.unwrap();
        assert_eq!(rolling.acquire().await, Err(LimitError::Cancelled));
        assert_eq!(fixed.acquire().await, Err(LimitError::Cancelled));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn it_rejects_invalid_settings_up_front() {
        let config =
            RegistryConfig::from_yaml("hosts:\n  bad.example.com:\n    limit: 0\n").unwrap();
        assert_eq!(
            LimiterRegistry::new(config).unwrap_err(),
            ConfigError::InvalidLimit
        );

        let config = RegistryConfig::from_yaml("default:\n  window_secs: -1\n").unwrap();
        assert_eq!(
            LimiterRegistry::new(config).unwrap_err(),
            ConfigError::InvalidWindow
        );
    }

    #[test]
    fn it_reports_unreadable_configuration() {
        assert!(matches!(
            RegistryConfig::from_yaml("default: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RegistryConfig::from_file("/nonexistent/limits.yaml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn empty_configuration_uses_defaults() {
        let config = RegistryConfig::from_yaml("{}").unwrap();
        assert_eq!(config, RegistryConfig::default());
        assert_eq!(config.settings_for("anything").limit, 60);
    }
}
