/// Declaration context: one operation per resource kind
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use super::plan::{Export, Plan, ResourceIntent};
use super::resources::*;
use crate::output::{Expr, Output, OutputError, Resolver};

/// Errors raised while declaring resources
#[derive(Error, Debug)]
pub enum DeclarationError {
    #[error("resource {0} is declared more than once")]
    DuplicateResource(String),

    #[error("output {0} is exported more than once")]
    DuplicateExport(String),

    #[error("{resource} depends on undeclared resource {dependency}")]
    UnknownDependency {
        resource: String,
        dependency: String,
    },

    #[error("invalid {kind} {name}: {reason}")]
    InvalidSpec {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("cluster {0} must depend on an activation of container.googleapis.com")]
    MissingServiceActivation(String),

    #[error("no deferred output {0}")]
    UnknownOutput(String),

    #[error("failed to render {0}: {1}")]
    Template(&'static str, String),

    #[error(transparent)]
    Output(#[from] OutputError),
}

type DeclResult<T> = Result<T, DeclarationError>;

/// Options shared by every resource operation
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    depends_on: Vec<String>,
    provider: Option<String>,
}

impl ResourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an explicit ordering dependency
    pub fn depends_on(mut self, resource: &impl Resource) -> Self {
        self.depends_on
            .push(resource.resource_ref().name().to_string());
        self
    }

    /// Apply the resource through a Kubernetes provider
    pub fn provider(mut self, provider: &ProviderHandle) -> Self {
        self.provider = Some(provider.resource_ref().name().to_string());
        self
    }
}

/// Collects resource intents in declaration order
#[derive(Default)]
pub struct Context {
    plan: Plan,
    resolvers: BTreeMap<String, Resolver<String>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a Google Cloud API
    pub fn enable_service(
        &mut self,
        name: &str,
        spec: ServiceActivationSpec,
        options: ResourceOptions,
    ) -> DeclResult<ServiceHandle> {
        require("service activation", name, "service", &spec.service)?;
        require("service activation", name, "project", &spec.project)?;

        let reference = self.register(name, ResourceKind::ServiceActivation(spec), options)?;

        Ok(ServiceHandle { reference })
    }

    /// Declare a GKE cluster
    ///
    /// The cluster must list an activation of `container.googleapis.com` for
    /// its project among its dependencies.
    pub fn cluster(
        &mut self,
        name: &str,
        spec: ClusterSpec,
        options: ResourceOptions,
    ) -> DeclResult<ClusterHandle> {
        require("cluster", name, "name", &spec.name)?;
        require("cluster", name, "location", &spec.location)?;
        require("cluster", name, "project", &spec.project)?;

        if spec.authorized_networks.is_empty() {
            return Err(invalid(
                "cluster",
                name,
                "at least one authorized network is required",
            ));
        }
        if let ClusterMode::Standard {
            initial_node_count, ..
        } = spec.mode
        {
            if initial_node_count == 0 {
                return Err(invalid(
                    "cluster",
                    name,
                    "initial node count must be at least 1",
                ));
            }
        }

        let activated = options.depends_on.iter().any(|dep| {
            matches!(
                self.find(dep).map(|r| &r.resource),
                Some(ResourceKind::ServiceActivation(activation))
                    if activation.service == CONTAINER_API && activation.project == spec.project
            )
        });
        if !activated {
            return Err(DeclarationError::MissingServiceActivation(name.to_string()));
        }

        let cluster_name = spec.name.clone();
        let reference = self.register(name, ResourceKind::Cluster(spec), options)?;

        Ok(ClusterHandle {
            name: Output::known(cluster_name),
            endpoint: self.deferred(name, "endpoint"),
            ca_certificate: self.deferred(name, "masterAuth.clusterCaCertificate"),
            reference,
        })
    }

    /// Declare a Kubernetes provider for a cluster access context
    pub fn kubernetes_provider(
        &mut self,
        name: &str,
        spec: ProviderSpec,
        options: ResourceOptions,
    ) -> DeclResult<ProviderHandle> {
        let reference = self.register(name, ResourceKind::KubernetesProvider(spec), options)?;

        Ok(ProviderHandle { reference })
    }

    /// Declare a namespace; it must be applied through a provider
    pub fn namespace(
        &mut self,
        name: &str,
        spec: NamespaceSpec,
        options: ResourceOptions,
    ) -> DeclResult<NamespaceHandle> {
        require("namespace", name, "name", &spec.name)?;

        let provider = options
            .provider
            .as_deref()
            .ok_or_else(|| invalid("namespace", name, "a Kubernetes provider is required"))?;
        match self.find(provider).map(|r| &r.resource) {
            Some(ResourceKind::KubernetesProvider(_)) => {}
            Some(other) => {
                return Err(invalid(
                    "namespace",
                    name,
                    &format!("{} is a {}, not a Kubernetes provider", provider, other.label()),
                ))
            }
            None => {
                return Err(DeclarationError::UnknownDependency {
                    resource: name.to_string(),
                    dependency: provider.to_string(),
                })
            }
        }

        let namespace = spec.name.clone();
        let reference = self.register(name, ResourceKind::Namespace(spec), options)?;

        Ok(NamespaceHandle {
            reference,
            name: Output::known(namespace),
        })
    }

    /// Declare a service account
    pub fn service_account(
        &mut self,
        name: &str,
        spec: ServiceAccountSpec,
        options: ResourceOptions,
    ) -> DeclResult<ServiceAccountHandle> {
        require("service account", name, "account id", &spec.account_id)?;
        require("service account", name, "project", &spec.project)?;

        let reference = self.register(name, ResourceKind::ServiceAccount(spec), options)?;

        Ok(ServiceAccountHandle {
            email: self.deferred(name, "email"),
            reference,
        })
    }

    /// Bind a project role to a declared service account
    pub fn iam_member(
        &mut self,
        name: &str,
        spec: IamMemberSpec,
        options: ResourceOptions,
    ) -> DeclResult<IamMemberHandle> {
        require("IAM member", name, "role", &spec.role)?;
        require("IAM member", name, "project", &spec.project)?;

        let from_account = spec.member.depends_on().iter().any(|source| {
            matches!(
                self.find(source).map(|r| &r.resource),
                Some(ResourceKind::ServiceAccount(_))
            )
        });
        if !from_account {
            return Err(invalid(
                "IAM member",
                name,
                "member must derive from a declared service account",
            ));
        }

        let role = spec.role.clone();
        let member = spec.member.clone();
        let reference = self.register(name, ResourceKind::IamMember(spec), options)?;

        Ok(IamMemberHandle {
            reference,
            role,
            member,
        })
    }

    /// Record a named stack output
    pub fn export(&mut self, name: &str, value: Output<String>) -> DeclResult<()> {
        if self.plan.export(name).is_some() {
            return Err(DeclarationError::DuplicateExport(name.to_string()));
        }
        self.check_sources(name, value.depends_on())?;

        debug!("Exporting {}", name);
        self.plan.outputs.push(Export {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    /// Finish the declaration
    pub fn finish(self) -> Declaration {
        info!(
            "Declared {} resources and {} outputs",
            self.plan.resources.len(),
            self.plan.outputs.len()
        );

        Declaration {
            plan: self.plan,
            resolvers: self.resolvers,
        }
    }

    fn find(&self, name: &str) -> Option<&ResourceIntent> {
        self.plan.resource(name)
    }

    fn register(
        &mut self,
        name: &str,
        resource: ResourceKind,
        options: ResourceOptions,
    ) -> DeclResult<ResourceRef> {
        validate_logical_name(resource.label(), name)?;

        if self.find(name).is_some() {
            return Err(DeclarationError::DuplicateResource(name.to_string()));
        }

        let explicit = options.depends_on.iter().chain(options.provider.iter());
        for dependency in explicit {
            if self.find(dependency).is_none() {
                return Err(DeclarationError::UnknownDependency {
                    resource: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
        self.check_sources(name, resource.input_sources())?;

        debug!("Declaring {} {}", resource.label(), name);
        self.plan.resources.push(ResourceIntent {
            name: name.to_string(),
            resource,
            depends_on: options.depends_on,
            provider: options.provider,
        });

        Ok(ResourceRef::new(name))
    }

    fn check_sources(
        &self,
        name: &str,
        sources: impl IntoIterator<Item = String>,
    ) -> DeclResult<()> {
        for source in sources {
            if self.find(&source).is_none() {
                return Err(DeclarationError::UnknownDependency {
                    resource: name.to_string(),
                    dependency: source,
                });
            }
        }
        Ok(())
    }

    fn deferred(&mut self, resource: &str, property: &str) -> Output<String> {
        let (output, resolver) = Output::deferred(resource, property);
        self.resolvers
            .insert(resolver.label().to_string(), resolver);
        output
    }
}

/// A finished declaration: the plan plus the write side of its deferred values
pub struct Declaration {
    plan: Plan,
    resolvers: BTreeMap<String, Resolver<String>>,
}

impl Declaration {
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn export(&self, name: &str) -> Option<&Output<String>> {
        self.plan.export(name).map(|e| &e.value)
    }

    /// Resolve a resource property reported by the engine
    pub fn resolve(&self, resource: &str, property: &str, value: String) -> DeclResult<()> {
        let label = format!("{}.{}", resource, property);
        let resolver = self
            .resolvers
            .get(&label)
            .ok_or(DeclarationError::UnknownOutput(label))?;
        resolver.resolve(value)?;
        Ok(())
    }

    /// Resolve deferred properties from the engine's stack outputs
    ///
    /// Only exports that read a resource property directly can be traced
    /// back to a resolver. Returns how many were resolved.
    pub fn resolve_exports(&self, outputs: &BTreeMap<String, Value>) -> DeclResult<usize> {
        let mut resolved = 0;

        for export in &self.plan.outputs {
            let Expr::Property { resource, property } = export.value.expr() else {
                continue;
            };
            let Some(value) = outputs.get(&export.name) else {
                debug!("Stack output {} not reported", export.name);
                continue;
            };
            let label = format!("{}.{}", resource, property);
            if self.resolvers.get(&label).is_some_and(|r| r.is_resolved()) {
                continue;
            }

            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.resolve(resource, property, value)?;
            resolved += 1;
        }

        Ok(resolved)
    }
}

fn invalid(kind: &'static str, name: &str, reason: &str) -> DeclarationError {
    DeclarationError::InvalidSpec {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn require(kind: &'static str, name: &str, field: &str, value: &str) -> DeclResult<()> {
    if value.trim().is_empty() {
        return Err(invalid(kind, name, &format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Logical names become identifiers in the engine program
fn validate_logical_name(kind: &'static str, name: &str) -> DeclResult<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(invalid(
            kind,
            name,
            "logical names must start with a letter and contain only letters, digits and underscores",
        ));
    }
    Ok(())
}
