/// Resource specifications and the handles returned when they are declared
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::output::{Output, OutputError};

/// API that must be active before a GKE cluster can be created
pub const CONTAINER_API: &str = "container.googleapis.com";

/// GKE release channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseChannel {
    Rapid,
    #[default]
    Regular,
    Stable,
}

impl ReleaseChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseChannel::Rapid => "RAPID",
            ReleaseChannel::Regular => "REGULAR",
            ReleaseChannel::Stable => "STABLE",
        }
    }
}

/// Enables a Google Cloud API for a project
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceActivationSpec {
    pub service: String,
    pub project: String,
}

/// A GKE cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub name: String,
    pub location: String,
    pub project: String,
    pub network: String,
    pub release_channel: ReleaseChannel,
    pub enable_kubernetes_alpha: bool,
    pub issue_client_certificate: bool,
    /// Networks allowed to reach the control plane, in order
    pub authorized_networks: Vec<String>,
    pub mode: ClusterMode,
}

/// Standard and Autopilot clusters are mutually exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum ClusterMode {
    #[serde(rename_all = "camelCase")]
    Standard {
        initial_node_count: u32,
        workload_pool: Option<String>,
    },
    Autopilot,
}

/// Kubernetes provider bound to an access context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSpec {
    /// Kubeconfig contents, or a path to one
    pub kubeconfig: Output<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceSpec {
    pub name: String,
}

/// A Google Cloud service account
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSpec {
    pub account_id: String,
    pub project: String,
    pub display_name: String,
    pub description: String,
}

/// Grants a project role to a service account
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IamMemberSpec {
    pub role: String,
    pub member: Output<String>,
    pub project: String,
}

impl IamMemberSpec {
    /// Bind `role` to the principal of a declared service account
    pub fn for_account(
        role: &str,
        account: &ServiceAccountHandle,
        project: &str,
    ) -> Result<Self, OutputError> {
        Ok(Self {
            role: role.to_string(),
            member: account.member()?,
            project: project.to_string(),
        })
    }
}

/// Every kind of resource a stack can declare
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "spec", rename_all = "camelCase")]
pub enum ResourceKind {
    ServiceActivation(ServiceActivationSpec),
    Cluster(ClusterSpec),
    KubernetesProvider(ProviderSpec),
    Namespace(NamespaceSpec),
    ServiceAccount(ServiceAccountSpec),
    IamMember(IamMemberSpec),
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::ServiceActivation(_) => "service activation",
            ResourceKind::Cluster(_) => "cluster",
            ResourceKind::KubernetesProvider(_) => "kubernetes provider",
            ResourceKind::Namespace(_) => "namespace",
            ResourceKind::ServiceAccount(_) => "service account",
            ResourceKind::IamMember(_) => "IAM member",
        }
    }

    /// Resources whose outputs feed this resource's inputs
    pub fn input_sources(&self) -> BTreeSet<String> {
        match self {
            ResourceKind::KubernetesProvider(spec) => spec.kubeconfig.depends_on(),
            ResourceKind::IamMember(spec) => spec.member.depends_on(),
            _ => BTreeSet::new(),
        }
    }
}

/// Reference to a declared resource by logical name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    name: String,
}

impl ResourceRef {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Anything that can be named as a dependency
pub trait Resource {
    fn resource_ref(&self) -> &ResourceRef;
}

#[derive(Debug, Clone)]
pub struct ServiceHandle {
    pub(crate) reference: ResourceRef,
}

#[derive(Debug, Clone)]
pub struct ClusterHandle {
    pub(crate) reference: ResourceRef,
    pub name: Output<String>,
    /// Control plane IP, assigned on creation
    pub endpoint: Output<String>,
    /// Base64 cluster CA certificate, assigned on creation
    pub ca_certificate: Output<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub(crate) reference: ResourceRef,
}

#[derive(Debug, Clone)]
pub struct NamespaceHandle {
    pub(crate) reference: ResourceRef,
    pub name: Output<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceAccountHandle {
    pub(crate) reference: ResourceRef,
    /// Assigned by Google Cloud when the account is created
    pub email: Output<String>,
}

impl ServiceAccountHandle {
    /// IAM principal for this account, `serviceAccount:<email>`
    pub fn member(&self) -> Result<Output<String>, OutputError> {
        Output::interpolate("serviceAccount:{}", vec![self.email.clone()])
    }
}

#[derive(Debug, Clone)]
pub struct IamMemberHandle {
    pub(crate) reference: ResourceRef,
    pub role: String,
    pub member: Output<String>,
}

macro_rules! impl_resource {
    ($($handle:ty),*) => {
        $(
            impl Resource for $handle {
                fn resource_ref(&self) -> &ResourceRef {
                    &self.reference
                }
            }
        )*
    };
}

impl_resource!(
    ServiceHandle,
    ClusterHandle,
    ProviderHandle,
    NamespaceHandle,
    ServiceAccountHandle,
    IamMemberHandle
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Expr;

    #[test]
    fn test_release_channel_serialization() {
        let yaml = serde_yaml::to_string(&ReleaseChannel::Regular).unwrap();
        assert_eq!(yaml.trim(), "REGULAR");

        let channel: ReleaseChannel = serde_yaml::from_str("STABLE").unwrap();
        assert_eq!(channel, ReleaseChannel::Stable);
        assert_eq!(channel.as_str(), "STABLE");
    }

    #[test]
    fn test_member_derives_from_email() {
        let (email, _resolver) = Output::<String>::deferred("serviceAccount", "email");
        let account = ServiceAccountHandle {
            reference: ResourceRef::new("serviceAccount"),
            email,
        };

        let spec =
            IamMemberSpec::for_account("roles/secretmanager.secretAccessor", &account, "p").unwrap();
        assert!(!matches!(spec.member.expr(), Expr::Literal { .. }));
        assert_eq!(
            ResourceKind::IamMember(spec).input_sources(),
            BTreeSet::from(["serviceAccount".to_string()])
        );
    }
}
