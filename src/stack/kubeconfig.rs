/// Kubeconfig derived from a declared cluster
use handlebars::Handlebars;
use serde_json::json;

use crate::declare::{ClusterHandle, DeclarationError};
use crate::output::Output;

/// `{{ca}}` and `{{endpoint}}` are rendered as `{}` placeholders, which
/// [`Output::interpolate`] fills with the cluster's deferred CA certificate
/// and endpoint; `{{context}}` is rendered with the context name
const KUBECONFIG_TEMPLATE: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: {{ca}}
    server: https://{{endpoint}}
  name: {{context}}
contexts:
- context:
    cluster: {{context}}
    user: {{context}}
  name: {{context}}
current-context: {{context}}
users:
- name: {{context}}
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: gke-gcloud-auth-plugin
      installHint: Install gke-gcloud-auth-plugin for use with kubectl
      provideClusterInfo: true
"#;

/// Context name used by `gcloud container clusters get-credentials`
pub fn context_name(project: &str, location: &str, cluster_name: &str) -> String {
    format!("gke_{}_{}_{}", project, location, cluster_name)
}

/// Build a kubeconfig that stays unknown until the cluster exists
pub fn for_cluster(
    project: &str,
    location: &str,
    cluster_name: &str,
    cluster: &ClusterHandle,
) -> Result<Output<String>, DeclarationError> {
    let context = context_name(project, location, cluster_name)
        .replace('{', "{{")
        .replace('}', "}}");

    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.set_strict_mode(true);

    let template = handlebars
        .render_template(
            KUBECONFIG_TEMPLATE,
            &json!({
                "ca": "{}",
                "endpoint": "{}",
                "context": context,
            }),
        )
        .map_err(|e| DeclarationError::Template("kubeconfig", e.to_string()))?;

    Ok(Output::interpolate(
        &template,
        vec![cluster.ca_certificate.clone(), cluster.endpoint.clone()],
    )?)
}
