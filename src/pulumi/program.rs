/// Render a plan as a Pulumi YAML program
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::declare::{ClusterMode, Plan, ResourceIntent, ResourceKind};
use crate::output::{Expr, Output, Part};

/// Program file name expected by the Pulumi CLI
pub const PROGRAM_FILE: &str = "Pulumi.yaml";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("{0} is computed by a function and cannot be expressed in the program")]
    OpaqueOutput(String),

    #[error("failed to serialize program: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Render the program for `plan` under the Pulumi project `project`
pub fn render(plan: &Plan, project: &str, description: &str) -> Result<String, RenderError> {
    let mut resources = Mapping::new();
    for intent in &plan.resources {
        resources.insert(intent.name.clone().into(), render_resource(intent)?);
    }

    let mut outputs = Mapping::new();
    for export in &plan.outputs {
        outputs.insert(
            export.name.clone().into(),
            render_output(&export.name, &export.value)?,
        );
    }

    let program = mapping([
        ("name", project.into()),
        ("runtime", "yaml".into()),
        ("description", description.into()),
        ("resources", Value::Mapping(resources)),
        ("outputs", Value::Mapping(outputs)),
    ]);

    Ok(serde_yaml::to_string(&program)?)
}

/// Pulumi type token for a resource kind
pub fn type_token(kind: &ResourceKind) -> &'static str {
    match kind {
        ResourceKind::ServiceActivation(_) => "gcp:projects:Service",
        ResourceKind::Cluster(_) => "gcp:container:Cluster",
        ResourceKind::KubernetesProvider(_) => "pulumi:providers:kubernetes",
        ResourceKind::Namespace(_) => "kubernetes:core/v1:Namespace",
        ResourceKind::ServiceAccount(_) => "gcp:serviceaccount:Account",
        ResourceKind::IamMember(_) => "gcp:projects:IAMMember",
    }
}

fn render_resource(intent: &ResourceIntent) -> Result<Value, RenderError> {
    let name = intent.name.as_str();
    let properties = match &intent.resource {
        ResourceKind::ServiceActivation(spec) => mapping([
            ("service", literal(&spec.service)),
            ("project", literal(&spec.project)),
        ]),
        ResourceKind::Cluster(spec) => {
            let cidr_blocks = spec
                .authorized_networks
                .iter()
                .map(|cidr| mapping([("cidrBlock", literal(cidr))]))
                .collect();

            let mut props = mapping([
                ("name", literal(&spec.name)),
                ("location", literal(&spec.location)),
                ("project", literal(&spec.project)),
                ("network", literal(&spec.network)),
                ("enableKubernetesAlpha", spec.enable_kubernetes_alpha.into()),
                (
                    "releaseChannel",
                    mapping([("channel", spec.release_channel.as_str().into())]),
                ),
                (
                    "masterAuth",
                    mapping([(
                        "clientCertificateConfig",
                        mapping([(
                            "issueClientCertificate",
                            spec.issue_client_certificate.into(),
                        )]),
                    )]),
                ),
                (
                    "masterAuthorizedNetworksConfig",
                    mapping([("cidrBlocks", Value::Sequence(cidr_blocks))]),
                ),
            ]);

            if let Value::Mapping(props) = &mut props {
                match &spec.mode {
                    ClusterMode::Standard {
                        initial_node_count,
                        workload_pool,
                    } => {
                        props.insert("initialNodeCount".into(), (*initial_node_count).into());
                        if let Some(pool) = workload_pool {
                            props.insert(
                                "workloadIdentityConfig".into(),
                                mapping([("workloadPool", literal(pool))]),
                            );
                        }
                    }
                    ClusterMode::Autopilot => {
                        props.insert("enableAutopilot".into(), true.into());
                    }
                }
            }
            props
        }
        ResourceKind::KubernetesProvider(spec) => mapping([(
            "kubeconfig",
            render_output(&format!("{}.kubeconfig", name), &spec.kubeconfig)?,
        )]),
        ResourceKind::Namespace(spec) => {
            mapping([("metadata", mapping([("name", literal(&spec.name))]))])
        }
        ResourceKind::ServiceAccount(spec) => mapping([
            ("project", literal(&spec.project)),
            ("accountId", literal(&spec.account_id)),
            ("displayName", literal(&spec.display_name)),
            ("description", literal(&spec.description)),
        ]),
        ResourceKind::IamMember(spec) => mapping([
            ("role", literal(&spec.role)),
            (
                "member",
                render_output(&format!("{}.member", name), &spec.member)?,
            ),
            ("project", literal(&spec.project)),
        ]),
    };

    let mut resource = Mapping::new();
    resource.insert("type".into(), type_token(&intent.resource).into());
    resource.insert("properties".into(), properties);

    let mut options = Mapping::new();
    if !intent.depends_on.is_empty() {
        let deps = intent
            .depends_on
            .iter()
            .map(|dep| Value::String(reference(dep)))
            .collect();
        options.insert("dependsOn".into(), Value::Sequence(deps));
    }
    if let Some(provider) = &intent.provider {
        options.insert("provider".into(), Value::String(reference(provider)));
    }
    if !options.is_empty() {
        resource.insert("options".into(), Value::Mapping(options));
    }

    Ok(Value::Mapping(resource))
}

fn render_output(field: &str, output: &Output<String>) -> Result<Value, RenderError> {
    match output.expr() {
        Expr::Literal { value } => Ok(json_literal(value)),
        expr => Ok(Value::String(inline(field, expr)?)),
    }
}

/// Render an expression as an interpolated string
fn inline(field: &str, expr: &Expr) -> Result<String, RenderError> {
    match expr {
        Expr::Literal { value } => Ok(match value {
            serde_json::Value::String(s) => escape(s),
            other => other.to_string(),
        }),
        Expr::Property { resource, property } => Ok(format!("${{{}.{}}}", resource, property)),
        Expr::Interpolate { parts } => {
            let mut out = String::new();
            for part in parts {
                match part {
                    Part::Text { text } => out.push_str(&escape(text)),
                    Part::Value { expr } => out.push_str(&inline(field, expr)?),
                }
            }
            Ok(out)
        }
        Expr::Apply { .. } => Err(RenderError::OpaqueOutput(field.to_string())),
    }
}

fn json_literal(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::String(s) => Value::String(escape(s)),
        other => serde_yaml::to_value(other).unwrap_or(Value::Null),
    }
}

fn literal(value: &str) -> Value {
    Value::String(escape(value))
}

/// `${` starts an interpolation in Pulumi YAML; `$${` is a literal
fn escape(text: &str) -> String {
    text.replace("${", "$${")
}

fn reference(resource: &str) -> String {
    format!("${{{}}}", resource)
}

fn mapping<const N: usize>(entries: [(&str, Value); N]) -> Value {
    let mut map = Mapping::new();
    for (key, value) in entries {
        map.insert(key.into(), value);
    }
    Value::Mapping(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessContext, ClusterVariant, StackConfig};
    use crate::declare::{Context, ResourceOptions, ServiceAccountSpec};
    use crate::stack;

    fn program(config: &StackConfig) -> Value {
        let (declaration, _) = stack::build(config).unwrap();
        let text = render(declaration.plan(), "keel-test", "test stack").unwrap();
        serde_yaml::from_str(&text).unwrap()
    }

    fn standard() -> StackConfig {
        let mut config = StackConfig::example(
            ClusterVariant::default(),
            vec!["203.0.113.0/24".to_string()],
        );
        config.project_id = "go-gke-gsm-pulumi".to_string();
        config
    }

    #[test]
    fn test_program_header() {
        let program = program(&standard());
        assert_eq!(program["name"], Value::from("keel-test"));
        assert_eq!(program["runtime"], Value::from("yaml"));
    }

    #[test]
    fn test_cluster_resource() {
        let program = program(&standard());
        let cluster = &program["resources"]["gkeCluster"];

        assert_eq!(cluster["type"], Value::from("gcp:container:Cluster"));
        assert_eq!(
            cluster["options"]["dependsOn"][0],
            Value::from("${containerEngine}")
        );

        let props = &cluster["properties"];
        assert_eq!(props["initialNodeCount"], Value::from(1u32));
        assert_eq!(props["releaseChannel"]["channel"], Value::from("REGULAR"));
        assert_eq!(
            props["masterAuthorizedNetworksConfig"]["cidrBlocks"][0]["cidrBlock"],
            Value::from("203.0.113.0/24")
        );
        assert_eq!(
            props["workloadIdentityConfig"]["workloadPool"],
            Value::from("go-gke-gsm-pulumi.svc.id.goog")
        );
        assert_eq!(
            props["masterAuth"]["clientCertificateConfig"]["issueClientCertificate"],
            Value::from(false)
        );
        assert!(props.get("enableAutopilot").is_none());
    }

    #[test]
    fn test_autopilot_resource() {
        let mut config = standard();
        config.cluster.variant = ClusterVariant::Autopilot;

        let program = program(&config);
        let props = &program["resources"]["gkeCluster"]["properties"];
        assert_eq!(props["enableAutopilot"], Value::from(true));
        assert!(props.get("initialNodeCount").is_none());
        assert!(props.get("workloadIdentityConfig").is_none());
    }

    #[test]
    fn test_deferred_values_become_interpolations() {
        let program = program(&standard());

        assert_eq!(
            program["resources"]["serviceAccountRole"]["properties"]["member"],
            Value::from("serviceAccount:${serviceAccount.email}")
        );
        assert_eq!(
            program["outputs"]["serviceAccountEmail"],
            Value::from("${serviceAccount.email}")
        );
        assert_eq!(
            program["outputs"]["clusterName"],
            Value::from("keel-standard-gke")
        );

        let kubeconfig = program["resources"]["gkeProvider"]["properties"]["kubeconfig"]
            .as_str()
            .unwrap();
        assert!(kubeconfig.contains("server: https://${gkeCluster.endpoint}"));
        assert!(kubeconfig
            .contains("certificate-authority-data: ${gkeCluster.masterAuth.clusterCaCertificate}"));

        let namespace = &program["resources"]["namespaceGsmSecrets"];
        assert_eq!(namespace["type"], Value::from("kubernetes:core/v1:Namespace"));
        assert_eq!(namespace["options"]["provider"], Value::from("${gkeProvider}"));
        assert_eq!(
            namespace["properties"]["metadata"]["name"],
            Value::from("gsm-secrets")
        );
    }

    #[test]
    fn test_external_kubeconfig_is_literal() {
        let mut config = standard();
        config.access_context = AccessContext::External {
            kubeconfig: "~/.kube/config".to_string(),
        };

        let program = program(&config);
        assert_eq!(
            program["resources"]["gkeProvider"]["properties"]["kubeconfig"],
            Value::from("~/.kube/config")
        );
    }

    #[test]
    fn test_literals_are_escaped() {
        let mut ctx = Context::new();
        ctx.service_account(
            "serviceAccount",
            ServiceAccountSpec {
                account_id: "secret-accessor-sa".to_string(),
                project: "p".to_string(),
                display_name: "costs ${5}".to_string(),
                description: String::new(),
            },
            ResourceOptions::new(),
        )
        .unwrap();

        let text = render(ctx.finish().plan(), "keel-test", "").unwrap();
        let program: Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(
            program["resources"]["serviceAccount"]["properties"]["displayName"],
            Value::from("costs $${5}")
        );
    }

    #[test]
    fn test_opaque_outputs_are_rejected() {
        let mut ctx = Context::new();
        let account = ctx
            .service_account(
                "serviceAccount",
                ServiceAccountSpec {
                    account_id: "secret-accessor-sa".to_string(),
                    project: "p".to_string(),
                    display_name: "sa".to_string(),
                    description: String::new(),
                },
                ResourceOptions::new(),
            )
            .unwrap();
        ctx.export("upper", account.email.map(|e| e.to_uppercase()))
            .unwrap();

        let err = render(ctx.finish().plan(), "keel-test", "").unwrap_err();
        assert!(matches!(err, RenderError::OpaqueOutput(ref field) if field == "upper"));
    }
}
