//! Orchestrator settings and per-command options.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default grace period before a stopping container is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the [`Orchestrator`](super::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Grace period given to `stop` before the container is killed.
    pub stop_timeout: Duration,

    /// Extra labels added to every container created.
    pub labels: BTreeMap<String, String>,

    /// Remove anonymous volumes together with containers.
    pub remove_volumes: bool,

    /// Always pull newer base images when building.
    pub pull: bool,

    /// Build without the cache.
    pub no_cache: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            labels: BTreeMap::new(),
            remove_volumes: false,
            pull: false,
            no_cache: false,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Sets the stop timeout.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Adds a container label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.labels.insert(key.into(), value.into());
        self
    }

    /// Replaces all container labels.
    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.config.labels = labels;
        self
    }

    /// Removes anonymous volumes with their containers.
    pub fn remove_volumes(mut self, remove: bool) -> Self {
        self.config.remove_volumes = remove;
        self
    }

    /// Pulls newer base images when building.
    pub fn pull(mut self, pull: bool) -> Self {
        self.config.pull = pull;
        self
    }

    /// Disables the build cache.
    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.config.no_cache = no_cache;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

/// Options for [`Orchestrator::deploy`](super::Orchestrator::deploy).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Recreate accessories even when they are running.
    pub force: bool,

    /// Use the configured image as is instead of building it.
    pub skip_build: bool,

    /// Leave accessories alone.
    pub skip_accessories: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = OrchestratorConfig::builder()
            .stop_timeout(Duration::from_secs(3))
            .label("team", "platform")
            .remove_volumes(true)
            .build();

        assert_eq!(config.stop_timeout, Duration::from_secs(3));
        assert_eq!(config.labels["team"], "platform");
        assert!(config.remove_volumes);
        assert!(!config.pull);
    }

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert!(config.labels.is_empty());
        assert_eq!(DeployOptions::default(), DeployOptions {
            force: false,
            skip_build: false,
            skip_accessories: false,
        });
    }
}
