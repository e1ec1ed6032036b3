/// Keel - declarative GKE stacks
///
/// Declares a GKE cluster, its namespaces, a service account and an IAM
/// binding as a desired-state plan, and hands it to Pulumi to reconcile.
mod config;
mod declare;
mod output;
mod pulumi;
mod stack;
mod utils;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AccessContext, ClusterVariant, StackConfig};
use crate::declare::Declaration;
use crate::pulumi::{PulumiCli, StackOutputs};
use crate::stack::StackHandles;

/// Placeholder allow-list written by `init` when the caller's IP is not detected
const DOCUMENTATION_CIDR: &str = "203.0.113.0/24";

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Declare GKE stacks and reconcile them with Pulumi", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "stack.yaml")]
    config: PathBuf,

    /// Output directory for the generated program and files
    #[arg(short, long, default_value = "./output")]
    output: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate example configuration file
    Init {
        /// Cluster variant
        #[arg(long, value_enum, default_value_t = Variant::Standard)]
        variant: Variant,

        /// Allow only this machine's public IP to reach the control plane
        #[arg(long)]
        detect_ip: bool,
    },

    /// Print the ordered resource plan
    Plan {
        #[arg(long, value_enum, default_value_t = PlanFormat::Yaml)]
        format: PlanFormat,
    },

    /// Write the Pulumi program without running it
    Render,

    /// Preview changes
    Preview,

    /// Create or update the stack
    Up,

    /// Destroy the stack
    Destroy,

    /// Show stack outputs
    Outputs,
}

#[derive(Clone, Copy, ValueEnum)]
enum Variant {
    Standard,
    Autopilot,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlanFormat {
    Yaml,
    Json,
}

/// Record of the last `up`, written next to the program
#[derive(Serialize)]
struct RunRecord {
    stack: String,
    project_id: String,
    cluster: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outputs: StackOutputs,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keel={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Init { variant, detect_ip } => init_config(&cli, variant, detect_ip).await,
        Commands::Plan { format } => show_plan(&cli, format),
        Commands::Render => render_program(&cli).await.map(|_| ()),
        Commands::Preview => preview_stack(&cli).await,
        Commands::Up => up_stack(&cli).await,
        Commands::Destroy => destroy_stack(&cli).await,
        Commands::Outputs => show_outputs(&cli).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &Path) -> Result<StackConfig> {
    StackConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn declare_stack(config: &StackConfig) -> Result<(Declaration, StackHandles)> {
    stack::build(config).context("Failed to declare stack")
}

fn project_name(config: &StackConfig) -> String {
    format!("keel-{}", config.cluster.name)
}

/// Write a configuration file to start from
async fn init_config(cli: &Cli, variant: Variant, detect_ip: bool) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!(
            "Configuration file already exists: {}",
            cli.config.display()
        );
    }

    let authorized = if detect_ip {
        let ip = utils::net::get_current_ip().await?;
        info!("Detected current IP address: {}", ip);
        utils::net::host_cidr(ip)
    } else {
        DOCUMENTATION_CIDR.to_string()
    };

    let variant = match variant {
        Variant::Standard => ClusterVariant::default(),
        Variant::Autopilot => ClusterVariant::Autopilot,
    };
    let example_config = StackConfig::example(variant, vec![authorized]);
    let yaml = serde_yaml::to_string(&example_config)?;

    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Set project_id and review the resources in the file");
    if !detect_ip {
        info!(
            "  2. Replace {} in cluster.authorized_networks with the networks allowed to reach the control plane",
            DOCUMENTATION_CIDR
        );
    }
    info!("  3. Review the plan:");
    info!("     keel plan");
    info!("  4. Create the stack:");
    info!("     keel up");

    Ok(())
}

/// Print the resource plan
fn show_plan(cli: &Cli, format: PlanFormat) -> Result<()> {
    let config = load_config(&cli.config)?;
    let (declaration, _) = declare_stack(&config)?;
    info!("Resources: {}", declaration.plan().names().join(", "));

    let text = match format {
        PlanFormat::Yaml => declaration.plan().to_yaml()?,
        PlanFormat::Json => declaration.plan().to_json()?,
    };
    println!("{}", text);

    Ok(())
}

/// Render the Pulumi program into the output directory
async fn render_program(cli: &Cli) -> Result<(StackConfig, Declaration, StackHandles, PulumiCli)> {
    let config = load_config(&cli.config)?;
    let (declaration, handles) = declare_stack(&config)?;

    let description = format!(
        "GKE cluster {} in project {}",
        config.cluster.name, config.project_id
    );
    let program = pulumi::render(declaration.plan(), &project_name(&config), &description)
        .context("Failed to render Pulumi program")?;

    let pulumi_cli = PulumiCli::new(cli.output.clone(), config.stack.clone());
    pulumi_cli.write_program(&program).await?;

    Ok((config, declaration, handles, pulumi_cli))
}

/// Render, check the CLI and select the stack
async fn prepare(cli: &Cli) -> Result<(StackConfig, Declaration, StackHandles, PulumiCli)> {
    PulumiCli::check_installed()
        .await
        .context("pulumi is required")?;

    let prepared = render_program(cli).await?;
    prepared.3.select_stack().await?;
    Ok(prepared)
}

async fn preview_stack(cli: &Cli) -> Result<()> {
    let (_, _, _, pulumi_cli) = prepare(cli).await?;
    let preview = pulumi_cli.preview().await?;
    println!("{}", preview);
    Ok(())
}

/// Create or update the stack
async fn up_stack(cli: &Cli) -> Result<()> {
    info!("Starting stack update...");

    let (config, declaration, handles, pulumi_cli) = prepare(cli).await?;
    info!("Cluster name: {}", config.cluster.name);

    let started_at = Utc::now();
    pulumi_cli.up().await?;
    let finished_at = Utc::now();

    let outputs = pulumi_cli.stack_outputs().await?;
    let resolved = declaration
        .resolve_exports(&outputs)
        .context("Failed to resolve stack outputs")?;
    info!("Resolved {} deferred outputs", resolved);

    let kubeconfig_path = cli.output.join("kubeconfig");
    let wrote_kubeconfig = match (&config.access_context, &handles.kubeconfig) {
        (AccessContext::FromCluster, Some(kubeconfig)) => match kubeconfig.peek() {
            Some(text) => {
                tokio::fs::write(&kubeconfig_path, text)
                    .await
                    .context("Failed to write kubeconfig")?;
                true
            }
            None => {
                warn!("Cluster endpoint was not reported; kubeconfig not written");
                false
            }
        },
        _ => false,
    };

    let record = RunRecord {
        stack: config.stack.clone(),
        project_id: config.project_id.clone(),
        cluster: config.cluster.name.clone(),
        started_at,
        finished_at,
        outputs,
    };
    let record_path = pulumi_cli.workdir().join("last-run.json");
    tokio::fs::write(&record_path, serde_json::to_string_pretty(&record)?)
        .await
        .context("Failed to write run record")?;

    info!("✓ Stack update completed successfully!");
    info!("");
    info!("Stack details:");
    info!("  Stack: {}", config.stack);
    if let Some(name) = handles.cluster.name.peek() {
        info!("  Cluster: {}", name);
    }
    if let Some(endpoint) = declaration.export("clusterEndpoint") {
        let server = endpoint.map(|ip| format!("https://{}", ip));
        if let Some(server) = server.peek() {
            info!("  API server: {}", server);
        }
    }
    if let Some(email) = handles.account.as_ref().and_then(|a| a.email.peek()) {
        info!("  Service account: {}", email);
    }
    if let Some(binding) = &handles.binding {
        if let Some(member) = binding.member.peek() {
            info!("  Role: {} granted to {}", binding.role, member);
        }
    }
    let namespaces: Vec<String> = handles
        .namespaces
        .iter()
        .filter_map(|namespace| namespace.name.peek())
        .collect();
    info!("  Namespaces: {}", namespaces.join(", "));
    info!(
        "  Duration: {}s",
        (finished_at - started_at).num_seconds()
    );
    if wrote_kubeconfig {
        info!("");
        info!("To access your cluster:");
        info!("  export KUBECONFIG={}", kubeconfig_path.display());
        info!("  kubectl get namespaces");
    }

    Ok(())
}

/// Destroy the stack
async fn destroy_stack(cli: &Cli) -> Result<()> {
    info!("Starting stack destruction...");

    let (config, _, _, pulumi_cli) = prepare(cli).await?;
    pulumi_cli.destroy().await?;

    info!("✓ Stack {} destroyed successfully", config.stack);
    Ok(())
}

/// Show stack outputs
async fn show_outputs(cli: &Cli) -> Result<()> {
    let (_, _, _, pulumi_cli) = prepare(cli).await?;
    let outputs = pulumi_cli.stack_outputs().await?;

    if outputs.is_empty() {
        info!("Stack has no outputs yet");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}
