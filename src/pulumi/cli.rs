/// Pulumi CLI operations
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use super::program::PROGRAM_FILE;
use crate::utils::command::{check_tool_installed, CommandBuilder};

/// Stack outputs as reported by `pulumi stack output --json`
pub type StackOutputs = BTreeMap<String, Value>;

/// Runs the Pulumi CLI against a rendered program directory
pub struct PulumiCli {
    workdir: PathBuf,
    stack: String,
}

impl PulumiCli {
    pub fn new(workdir: PathBuf, stack: String) -> Self {
        Self { workdir, stack }
    }

    /// Check if pulumi is installed
    pub async fn check_installed() -> Result<()> {
        check_tool_installed("pulumi", &["version"], "https://www.pulumi.com/docs/install/").await
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Write the program file into the working directory
    pub async fn write_program(&self, program: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .context("Failed to create program directory")?;

        let path = self.workdir.join(PROGRAM_FILE);
        tokio::fs::write(&path, program)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Program written to {}", path.display());
        Ok(path)
    }

    /// Select the stack, creating it if needed
    pub async fn select_stack(&self) -> Result<()> {
        info!("Selecting stack {}...", self.stack);

        self.command()
            .args(["stack", "select", "--create", self.stack.as_str(), "--non-interactive"])
            .context("Failed to select stack")
            .run_silent()
            .await
    }

    /// Show the changes an update would make
    pub async fn preview(&self) -> Result<String> {
        info!("Previewing stack {}...", self.stack);

        self.command()
            .args(["preview", "--non-interactive", "--stack", self.stack.as_str()])
            .context("pulumi preview failed")
            .run()
            .await
    }

    /// Apply the program
    pub async fn up(&self) -> Result<String> {
        info!("Updating stack {}...", self.stack);

        self.command()
            .args([
                "up",
                "--yes",
                "--skip-preview",
                "--non-interactive",
                "--stack",
                self.stack.as_str(),
            ])
            .context("pulumi up failed")
            .run()
            .await
    }

    /// Destroy every resource in the stack
    pub async fn destroy(&self) -> Result<()> {
        info!("Destroying stack {}...", self.stack);

        self.command()
            .args([
                "destroy",
                "--yes",
                "--non-interactive",
                "--stack",
                self.stack.as_str(),
            ])
            .context("pulumi destroy failed")
            .run_silent()
            .await
    }

    /// Read the stack's exported outputs
    pub async fn stack_outputs(&self) -> Result<StackOutputs> {
        let stdout = self
            .command()
            .args(["stack", "output", "--json", "--stack", self.stack.as_str()])
            .context("Failed to read stack outputs")
            .run()
            .await?;

        parse_stack_outputs(&stdout)
    }

    fn command(&self) -> CommandBuilder {
        CommandBuilder::new("pulumi")
            .current_dir(&self.workdir)
            .env("PULUMI_SKIP_UPDATE_CHECK", "true")
    }
}

/// Parse `pulumi stack output --json`
pub fn parse_stack_outputs(json: &str) -> Result<StackOutputs> {
    if json.trim().is_empty() {
        return Ok(StackOutputs::new());
    }
    serde_json::from_str(json).context("Failed to parse stack outputs")
}
