/// Configuration management for Keel - declarative GKE stacks
pub mod env;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

use crate::declare::ReleaseChannel;

pub use env::EnvConfig;

/// Main stack configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Google Cloud project ID
    pub project_id: String,

    /// Region for the cluster (e.g., "us-central1")
    pub region: String,

    /// Engine stack name
    #[serde(default = "default_stack")]
    pub stack: String,

    /// GKE cluster configuration
    pub cluster: ClusterConfig,

    /// How namespaces reach the cluster
    #[serde(default)]
    pub access_context: AccessContext,

    /// Namespaces to create in the cluster
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Service account and the role bound to it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountConfig>,
}

/// GKE cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    pub name: String,

    /// Cluster location; defaults to the stack region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// VPC network
    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default)]
    pub release_channel: ReleaseChannel,

    #[serde(default)]
    pub issue_client_certificate: bool,

    #[serde(default)]
    pub enable_kubernetes_alpha: bool,

    /// CIDR blocks allowed to reach the control plane. Required, there is
    /// no default.
    pub authorized_networks: Vec<String>,

    #[serde(default)]
    pub variant: ClusterVariant,
}

/// Standard or Autopilot cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClusterVariant {
    Standard {
        #[serde(default = "default_one")]
        initial_node_count: u32,

        /// Enable workload identity (`<project>.svc.id.goog`)
        #[serde(default = "default_true")]
        workload_identity: bool,
    },
    Autopilot,
}

impl Default for ClusterVariant {
    fn default() -> Self {
        ClusterVariant::Standard {
            initial_node_count: 1,
            workload_identity: true,
        }
    }
}

/// Access context for Kubernetes resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AccessContext {
    /// Kubeconfig built from the declared cluster's endpoint
    #[default]
    FromCluster,

    /// A kubeconfig that already exists outside this stack
    External { kubeconfig: String },
}

/// Service account configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAccountConfig {
    /// Account ID (the part before `@`)
    pub account_id: String,

    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Project role granted to the account
    pub role: String,
}

fn default_stack() -> String {
    "dev".to_string()
}

fn default_network() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

impl StackConfig {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        EnvConfig::load().apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration without validating it
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Cluster location (explicit location or the region)
    pub fn location(&self) -> &str {
        self.cluster.location.as_deref().unwrap_or(&self.region)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_project_id(&self.project_id)?;
        if self.region.is_empty() {
            anyhow::bail!("region cannot be empty");
        }
        if self.stack.is_empty() {
            anyhow::bail!("stack cannot be empty");
        }

        validate_cluster_name(&self.cluster.name)?;

        if self.cluster.authorized_networks.is_empty() {
            anyhow::bail!(
                "cluster.authorized_networks must list at least one CIDR block allowed to reach the control plane"
            );
        }
        for cidr in &self.cluster.authorized_networks {
            validate_cidr(cidr)?;
            if is_world_open(cidr) {
                warn!(
                    "Control plane of {} is reachable from anywhere ({})",
                    self.cluster.name, cidr
                );
            }
        }

        match self.cluster.variant {
            ClusterVariant::Standard {
                initial_node_count, ..
            } => {
                if initial_node_count == 0 {
                    anyhow::bail!("initial_node_count must be at least 1");
                }
            }
            ClusterVariant::Autopilot => {
                if is_zone(self.location()) {
                    anyhow::bail!(
                        "Autopilot clusters are regional, {} is a zone",
                        self.location()
                    );
                }
            }
        }

        if let AccessContext::External { kubeconfig } = &self.access_context {
            if kubeconfig.is_empty() {
                anyhow::bail!("access_context.kubeconfig cannot be empty");
            }
        }

        let mut seen = HashSet::new();
        for namespace in &self.namespaces {
            validate_namespace(namespace)?;
            if !seen.insert(namespace.as_str()) {
                anyhow::bail!("Namespace {} is listed more than once", namespace);
            }
        }

        if let Some(account) = &self.service_account {
            validate_account_id(&account.account_id)?;
            if !account.role.starts_with("roles/") {
                anyhow::bail!("Invalid role {}: roles start with \"roles/\"", account.role);
            }
        }

        Ok(())
    }

    /// Generate an example configuration
    pub fn example(variant: ClusterVariant, authorized_networks: Vec<String>) -> Self {
        let autopilot = variant == ClusterVariant::Autopilot;

        Self {
            project_id: "my-gcp-project".to_string(),
            region: "us-central1".to_string(),
            stack: default_stack(),
            cluster: ClusterConfig {
                name: if autopilot {
                    "keel-autopilot-gke".to_string()
                } else {
                    "keel-standard-gke".to_string()
                },
                location: None,
                network: default_network(),
                release_channel: ReleaseChannel::Regular,
                issue_client_certificate: false,
                enable_kubernetes_alpha: false,
                authorized_networks,
                variant,
            },
            access_context: AccessContext::FromCluster,
            namespaces: if autopilot {
                vec![]
            } else {
                vec!["goodluck".to_string(), "gsm-secrets".to_string()]
            },
            service_account: Some(ServiceAccountConfig {
                account_id: "secret-accessor-sa".to_string(),
                display_name: "secret accessor service account".to_string(),
                description: "This service account has the secret accessor role".to_string(),
                role: "roles/secretmanager.secretAccessor".to_string(),
            }),
        }
    }
}

/// Validate CIDR notation
pub fn validate_cidr(cidr: &str) -> anyhow::Result<()> {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        anyhow::bail!("Invalid CIDR notation: {}", cidr);
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid address in CIDR block: {}", cidr))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid prefix length in CIDR block: {}", cidr))?;

    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        anyhow::bail!("Prefix length /{} is too long for {}", prefix, addr);
    }
    Ok(())
}

/// A /0 block matches every address, whatever its base address
fn is_world_open(cidr: &str) -> bool {
    cidr.split_once('/')
        .and_then(|(_, prefix)| prefix.parse::<u8>().ok())
        == Some(0)
}

/// Zones end in a single letter (`us-central1-a`), regions do not
fn is_zone(location: &str) -> bool {
    location
        .rsplit_once('-')
        .is_some_and(|(_, suffix)| suffix.len() == 1 && suffix.chars().all(|c| c.is_ascii_lowercase()))
}

/// GKE cluster names: lowercase letter first, then lowercase letters, digits
/// or hyphens, at most 40 characters, no trailing hyphen
fn validate_cluster_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("cluster.name cannot be empty");
    }
    if name.len() > 40 {
        anyhow::bail!("Cluster name {} is longer than 40 characters", name);
    }
    if !is_dns_label(name) {
        anyhow::bail!(
            "Invalid cluster name {}: use lowercase letters, digits and hyphens, starting with a letter",
            name
        );
    }
    Ok(())
}

/// Project IDs: 6 to 30 characters, lowercase letter first, then lowercase
/// letters, digits or hyphens, no trailing hyphen
fn validate_project_id(project_id: &str) -> anyhow::Result<()> {
    if project_id.is_empty() {
        anyhow::bail!("project_id cannot be empty");
    }
    if !(6..=30).contains(&project_id.len()) || !is_dns_label(project_id) {
        anyhow::bail!(
            "Invalid project_id {}: 6-30 lowercase letters, digits and hyphens, starting with a letter",
            project_id
        );
    }
    Ok(())
}

/// Service account IDs are 6 to 30 characters
fn validate_account_id(account_id: &str) -> anyhow::Result<()> {
    if !(6..=30).contains(&account_id.len()) || !is_dns_label(account_id) {
        anyhow::bail!(
            "Invalid service account id {}: 6-30 lowercase letters, digits and hyphens, starting with a letter",
            account_id
        );
    }
    Ok(())
}

fn validate_namespace(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > 63 || !is_dns_label(name) {
        anyhow::bail!("Invalid namespace name: {:?}", name);
    }
    Ok(())
}

fn is_dns_label(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
