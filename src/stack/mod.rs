/// The GKE stack: cluster, namespaces, service account and IAM binding
pub mod kubeconfig;

use tracing::{info, warn};

use crate::config::{AccessContext, ClusterVariant, StackConfig};
use crate::declare::*;
use crate::output::Output;

pub const SERVICE_RESOURCE: &str = "containerEngine";
pub const CLUSTER_RESOURCE: &str = "gkeCluster";
pub const PROVIDER_RESOURCE: &str = "gkeProvider";
pub const ACCOUNT_RESOURCE: &str = "serviceAccount";
pub const BINDING_RESOURCE: &str = "serviceAccountRole";

/// Handles to everything the stack declared
#[derive(Debug, Clone)]
pub struct StackHandles {
    pub cluster: ClusterHandle,
    /// Kubeconfig derived from the cluster, when the access context is
    /// built from it
    pub kubeconfig: Option<Output<String>>,
    pub namespaces: Vec<NamespaceHandle>,
    pub account: Option<ServiceAccountHandle>,
    pub binding: Option<IamMemberHandle>,
}

/// Declare the stack described by `config`
pub fn build(config: &StackConfig) -> Result<(Declaration, StackHandles), DeclarationError> {
    let mut ctx = Context::new();
    let handles = declare(&mut ctx, config)?;
    Ok((ctx.finish(), handles))
}

/// Declare every resource of the stack in order, stopping at the first error
pub fn declare(ctx: &mut Context, config: &StackConfig) -> Result<StackHandles, DeclarationError> {
    let project = config.project_id.as_str();
    let location = config.location();
    info!(
        "Declaring stack {} for cluster {} in {}",
        config.stack, config.cluster.name, project
    );

    let service = ctx.enable_service(
        SERVICE_RESOURCE,
        ServiceActivationSpec {
            service: CONTAINER_API.to_string(),
            project: project.to_string(),
        },
        ResourceOptions::new(),
    )?;

    let cluster = ctx.cluster(
        CLUSTER_RESOURCE,
        cluster_spec(config),
        ResourceOptions::new().depends_on(&service),
    )?;

    let kubeconfig = match &config.access_context {
        AccessContext::FromCluster => Some(kubeconfig::for_cluster(
            project,
            location,
            &config.cluster.name,
            &cluster,
        )?),
        AccessContext::External { .. } => None,
    };

    let mut namespaces = Vec::new();
    if !config.namespaces.is_empty() {
        let access = match (&config.access_context, &kubeconfig) {
            (AccessContext::External { kubeconfig: path }, _) => {
                warn!(
                    "Namespaces use external kubeconfig {}; they are not bound to cluster {}",
                    path, config.cluster.name
                );
                Output::known(path.clone())
            }
            (AccessContext::FromCluster, Some(derived)) => derived.clone(),
            (AccessContext::FromCluster, None) => {
                return Err(DeclarationError::InvalidSpec {
                    kind: "kubernetes provider",
                    name: PROVIDER_RESOURCE.to_string(),
                    reason: "no kubeconfig was derived from the cluster".to_string(),
                })
            }
        };

        let gke_provider = ctx.kubernetes_provider(
            PROVIDER_RESOURCE,
            ProviderSpec { kubeconfig: access },
            ResourceOptions::new(),
        )?;

        for name in &config.namespaces {
            let namespace = ctx.namespace(
                &namespace_resource_name(name),
                NamespaceSpec { name: name.clone() },
                ResourceOptions::new().provider(&gke_provider),
            )?;
            namespaces.push(namespace);
        }
    }

    let mut account = None;
    let mut binding = None;
    if let Some(sa) = &config.service_account {
        let handle = ctx.service_account(
            ACCOUNT_RESOURCE,
            ServiceAccountSpec {
                account_id: sa.account_id.clone(),
                project: project.to_string(),
                display_name: sa.display_name.clone(),
                description: sa.description.clone(),
            },
            ResourceOptions::new(),
        )?;

        binding = Some(ctx.iam_member(
            BINDING_RESOURCE,
            IamMemberSpec::for_account(&sa.role, &handle, project)?,
            ResourceOptions::new(),
        )?);
        account = Some(handle);
    }

    ctx.export("clusterName", Output::known(config.cluster.name.clone()))?;
    ctx.export("clusterEndpoint", cluster.endpoint.clone())?;
    ctx.export("clusterCaCertificate", cluster.ca_certificate.clone())?;
    if let Some(account) = &account {
        ctx.export("serviceAccountEmail", account.email.clone())?;
    }

    Ok(StackHandles {
        cluster,
        kubeconfig,
        namespaces,
        account,
        binding,
    })
}

fn cluster_spec(config: &StackConfig) -> ClusterSpec {
    let cluster = &config.cluster;
    let mode = match cluster.variant {
        ClusterVariant::Standard {
            initial_node_count,
            workload_identity,
        } => ClusterMode::Standard {
            initial_node_count,
            workload_pool: workload_identity.then(|| format!("{}.svc.id.goog", config.project_id)),
        },
        ClusterVariant::Autopilot => ClusterMode::Autopilot,
    };

    ClusterSpec {
        name: cluster.name.clone(),
        location: config.location().to_string(),
        project: config.project_id.clone(),
        network: cluster.network.clone(),
        release_channel: cluster.release_channel,
        enable_kubernetes_alpha: cluster.enable_kubernetes_alpha,
        issue_client_certificate: cluster.issue_client_certificate,
        authorized_networks: cluster.authorized_networks.clone(),
        mode,
    }
}

/// Logical name of a namespace resource: `gsm-secrets` becomes
/// `namespaceGsmSecrets`
///
/// A hyphen followed by a letter capitalizes that letter; every other hyphen
/// becomes `_`. Namespace names are lowercase, so distinct names never share
/// a logical name (`a-b` is `namespaceAB`, `a--b` is `namespaceA_B`).
pub fn namespace_resource_name(namespace: &str) -> String {
    let mut name = String::from("namespace");
    let mut capitalize = true;
    let mut chars = namespace.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '-' {
            match chars.peek() {
                Some(next) if next.is_ascii_alphabetic() => capitalize = true,
                _ => name.push('_'),
            }
            continue;
        }
        if capitalize {
            name.push(c.to_ascii_uppercase());
            capitalize = false;
        } else {
            name.push(c);
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Expr, Part};
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn standard() -> StackConfig {
        let mut config = StackConfig::example(
            ClusterVariant::default(),
            vec!["203.0.113.0/24".to_string()],
        );
        config.project_id = "go-gke-gsm-pulumi".to_string();
        config.cluster.name = "goodluck-standard-gke".to_string();
        config
    }

    #[test]
    fn test_declaration_is_deterministic() {
        let config = standard();
        let (first, _) = build(&config).unwrap();
        let (second, _) = build(&config).unwrap();

        assert_eq!(first.plan(), second.plan());
        assert_eq!(
            first.plan().to_yaml().unwrap(),
            second.plan().to_yaml().unwrap()
        );
    }

    #[test]
    fn test_resource_order() {
        let (declaration, _) = build(&standard()).unwrap();
        assert_eq!(
            declaration.plan().names(),
            vec![
                "containerEngine",
                "gkeCluster",
                "gkeProvider",
                "namespaceGoodluck",
                "namespaceGsmSecrets",
                "serviceAccount",
                "serviceAccountRole",
            ]
        );
    }

    #[test]
    fn test_cluster_depends_on_activation() {
        let (declaration, _) = build(&standard()).unwrap();
        let cluster = declaration.plan().resource(CLUSTER_RESOURCE).unwrap();
        assert_eq!(cluster.depends_on, vec![SERVICE_RESOURCE.to_string()]);

        match &declaration.plan().resource(SERVICE_RESOURCE).unwrap().resource {
            ResourceKind::ServiceActivation(spec) => {
                assert_eq!(spec.service, "container.googleapis.com");
                assert_eq!(spec.project, "go-gke-gsm-pulumi");
            }
            other => panic!("unexpected resource {:?}", other),
        }
    }

    #[test]
    fn test_standard_cluster_spec() {
        let (declaration, _) = build(&standard()).unwrap();
        let ResourceKind::Cluster(spec) =
            &declaration.plan().resource(CLUSTER_RESOURCE).unwrap().resource
        else {
            panic!("gkeCluster is not a cluster");
        };

        assert_eq!(spec.release_channel, ReleaseChannel::Regular);
        assert!(!spec.issue_client_certificate);
        assert_eq!(spec.authorized_networks, vec!["203.0.113.0/24"]);
        assert_eq!(
            spec.mode,
            ClusterMode::Standard {
                initial_node_count: 1,
                workload_pool: Some("go-gke-gsm-pulumi.svc.id.goog".to_string()),
            }
        );
    }

    #[test]
    fn test_autopilot_variant() {
        let mut config = standard();
        config.cluster.variant = ClusterVariant::Autopilot;
        config.namespaces.clear();
        config.service_account = None;

        let (declaration, handles) = build(&config).unwrap();
        assert_eq!(
            declaration.plan().names(),
            vec!["containerEngine", "gkeCluster"]
        );
        assert!(handles.namespaces.is_empty());
        assert!(handles.account.is_none());
        assert!(declaration.export("serviceAccountEmail").is_none());

        let ResourceKind::Cluster(spec) =
            &declaration.plan().resource(CLUSTER_RESOURCE).unwrap().resource
        else {
            panic!("gkeCluster is not a cluster");
        };
        assert_eq!(spec.mode, ClusterMode::Autopilot);
    }

    #[test]
    fn test_iam_member_derives_from_account_email() {
        let (declaration, handles) = build(&standard()).unwrap();
        let binding = handles.binding.unwrap();

        assert_eq!(binding.role, "roles/secretmanager.secretAccessor");
        assert_eq!(
            binding.member.expr(),
            &Expr::Interpolate {
                parts: vec![
                    Part::Text {
                        text: "serviceAccount:".to_string()
                    },
                    Part::Value {
                        expr: handles.account.as_ref().unwrap().email.expr().clone()
                    },
                ]
            }
        );

        declaration
            .resolve(
                ACCOUNT_RESOURCE,
                "email",
                "secret-accessor-sa@go-gke-gsm-pulumi.iam.gserviceaccount.com".to_string(),
            )
            .unwrap();
        assert_eq!(
            binding.member.peek().as_deref(),
            Some("serviceAccount:secret-accessor-sa@go-gke-gsm-pulumi.iam.gserviceaccount.com")
        );
    }

    #[test]
    fn test_namespaces_trace_to_cluster() {
        let mut config = standard();
        config.cluster.name = "c1".to_string();
        config.namespaces = vec!["ns1".to_string()];

        let (declaration, handles) = build(&config).unwrap();
        let namespace = declaration.plan().resource("namespaceNs1").unwrap();
        assert_eq!(namespace.provider.as_deref(), Some(PROVIDER_RESOURCE));

        let provider = declaration.plan().resource(PROVIDER_RESOURCE).unwrap();
        let ResourceKind::KubernetesProvider(spec) = &provider.resource else {
            panic!("gkeProvider is not a provider");
        };
        assert!(spec.kubeconfig.depends_on().contains(CLUSTER_RESOURCE));
        assert_eq!(
            Some(&spec.kubeconfig),
            handles.kubeconfig.as_ref()
        );
    }

    #[test]
    fn test_external_access_context_is_not_traceable() {
        let mut config = standard();
        config.access_context = AccessContext::External {
            kubeconfig: "~/.kube/config".to_string(),
        };

        let (declaration, handles) = build(&config).unwrap();
        assert!(handles.kubeconfig.is_none());

        let provider = declaration.plan().resource(PROVIDER_RESOURCE).unwrap();
        let ResourceKind::KubernetesProvider(spec) = &provider.resource else {
            panic!("gkeProvider is not a provider");
        };
        assert!(spec.kubeconfig.depends_on().is_empty());
        assert_eq!(spec.kubeconfig.peek().as_deref(), Some("~/.kube/config"));
    }

    #[test]
    fn test_exports() {
        let (declaration, handles) = build(&standard()).unwrap();

        let cluster_name = declaration.export("clusterName").unwrap();
        assert_eq!(cluster_name.peek().as_deref(), Some("goodluck-standard-gke"));

        let email = declaration.export("serviceAccountEmail").unwrap();
        assert!(email.peek().is_none());
        assert_eq!(email, &handles.account.as_ref().unwrap().email);

        let outputs = BTreeMap::from([
            (
                "clusterName".to_string(),
                Value::String("goodluck-standard-gke".to_string()),
            ),
            (
                "clusterEndpoint".to_string(),
                Value::String("34.1.2.3".to_string()),
            ),
            (
                "serviceAccountEmail".to_string(),
                Value::String(
                    "secret-accessor-sa@go-gke-gsm-pulumi.iam.gserviceaccount.com".to_string(),
                ),
            ),
        ]);
        assert_eq!(declaration.resolve_exports(&outputs).unwrap(), 2);
        assert_eq!(
            email.peek().as_deref(),
            Some("secret-accessor-sa@go-gke-gsm-pulumi.iam.gserviceaccount.com")
        );

        // The CA certificate was not reported, so the kubeconfig stays unknown
        assert!(handles.kubeconfig.unwrap().peek().is_none());
    }

    #[test]
    fn test_namespace_resource_name() {
        assert_eq!(namespace_resource_name("goodluck"), "namespaceGoodluck");
        assert_eq!(namespace_resource_name("gsm-secrets"), "namespaceGsmSecrets");
        assert_eq!(namespace_resource_name("team-a1"), "namespaceTeamA1");
        assert_eq!(namespace_resource_name("a-b"), "namespaceAB");
        assert_eq!(namespace_resource_name("a--b"), "namespaceA_B");
        assert_eq!(namespace_resource_name("a-1"), "namespaceA_1");
        assert_eq!(namespace_resource_name("a1"), "namespaceA1");
    }

    #[test]
    fn test_similar_namespaces_get_distinct_resources() {
        let mut config = standard();
        config.namespaces = ["a-b", "a--b", "a-1", "a1", "ab"]
            .iter()
            .map(|ns| ns.to_string())
            .collect();
        config.validate().unwrap();

        let (declaration, handles) = build(&config).unwrap();
        assert_eq!(handles.namespaces.len(), 5);
        for name in [
            "namespaceAB",
            "namespaceA_B",
            "namespaceA_1",
            "namespaceA1",
            "namespaceAb",
        ] {
            assert!(declaration.plan().resource(name).is_some(), "{}", name);
        }
    }
}
