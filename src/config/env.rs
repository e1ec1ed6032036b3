//! Environment variable configuration
//!
//! Provides environment variable overrides for the stack file.

use std::env;

use super::StackConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "KEEL";

/// Overrides read from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Project from KEEL_PROJECT_ID
    pub project_id: Option<String>,
    /// Region from KEEL_REGION
    pub region: Option<String>,
    /// Stack from KEEL_STACK
    pub stack: Option<String>,
    /// Cluster name from KEEL_CLUSTER_NAME
    pub cluster_name: Option<String>,
    /// Comma-separated CIDR blocks from KEEL_AUTHORIZED_NETWORKS
    pub authorized_networks: Option<Vec<String>>,
}

impl EnvConfig {
    /// Load overrides from the process environment
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load overrides through a lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}_{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        Self {
            project_id: get("PROJECT_ID"),
            region: get("REGION"),
            stack: get("STACK"),
            cluster_name: get("CLUSTER_NAME"),
            authorized_networks: get("AUTHORIZED_NETWORKS").map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }),
        }
    }

    /// Check if any override is set
    pub fn has_any(&self) -> bool {
        self.project_id.is_some()
            || self.region.is_some()
            || self.stack.is_some()
            || self.cluster_name.is_some()
            || self.authorized_networks.is_some()
    }

    /// Apply overrides on top of a loaded configuration
    pub fn apply(&self, config: &mut StackConfig) {
        if !self.has_any() {
            return;
        }
        tracing::debug!("Applying {}_* environment overrides", ENV_PREFIX);

        if let Some(project_id) = &self.project_id {
            config.project_id = project_id.clone();
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(stack) = &self.stack {
            config.stack = stack.clone();
        }
        if let Some(name) = &self.cluster_name {
            config.cluster.name = name.clone();
        }
        if let Some(networks) = &self.authorized_networks {
            config.cluster.authorized_networks = networks.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterVariant;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_environment() {
        let env = EnvConfig::from_lookup(lookup(&[]));
        assert!(!env.has_any());
    }

    #[test]
    fn test_overrides_apply() {
        let env = EnvConfig::from_lookup(lookup(&[
            ("KEEL_PROJECT_ID", "go-gke-gsm-pulumi"),
            ("KEEL_STACK", "prod"),
            ("KEEL_AUTHORIZED_NETWORKS", "198.51.100.7/32, 203.0.113.0/24,"),
            ("KEEL_REGION", "  "),
        ]));

        let mut config =
            StackConfig::example(ClusterVariant::default(), vec!["10.0.0.0/8".to_string()]);
        env.apply(&mut config);

        assert_eq!(config.project_id, "go-gke-gsm-pulumi");
        assert_eq!(config.stack, "prod");
        assert_eq!(config.region, "us-central1");
        assert_eq!(
            config.cluster.authorized_networks,
            vec!["198.51.100.7/32", "203.0.113.0/24"]
        );
    }
}
