//! kiln CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kiln_common::config::RuntimeConfig;
use kiln_common::telemetry::LogConfig;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// kiln - self-managed Kubernetes clusters on cloud VMs
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Skip SSH and shrink every wait; the local provider serves all clouds
    #[arg(long, global = true)]
    pub fake: bool,

    /// Store state under this directory instead of the home directory
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true, env = "KILN_LOG_JSON")]
    pub json_logs: bool,

    /// Debug logging for kiln crates
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a cluster, or resume a failed create
    Create(commands::create::CreateArgs),
    /// List clusters
    Get(commands::get::GetArgs),
    /// Delete a cluster and every cloud resource it owns
    Delete(commands::delete::DeleteArgs),
    /// Add workers to a cluster
    AddWorkers(commands::workers::AddWorkersArgs),
    /// Remove workers from a cluster
    DelWorkers(commands::workers::DelWorkersArgs),
    /// Save provider credentials from the environment
    Credentials(commands::credentials::CredentialsArgs),
    /// Write clusters and credentials to a bundle
    Export(commands::transfer::ExportArgs),
    /// Load a bundle written by export
    Import(commands::transfer::ImportArgs),
    /// Print or save the admin kubeconfig of a cluster
    Kubeconfig(commands::kubeconfig::KubeconfigArgs),
}

impl Cli {
    /// Logging options from the global flags
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            verbose: self.verbose,
            json: self.json_logs,
        }
    }

    /// Environment settings overridden by the global flags
    pub fn runtime(&self) -> RuntimeConfig {
        let mut runtime = RuntimeConfig::from_env();
        runtime.fake |= self.fake;
        if let Some(dir) = &self.state_dir {
            runtime.state_dir = Some(dir.clone());
        }
        runtime
    }

    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let watcher = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping after the current step");
                watcher.cancel();
            }
        });

        let ctx = commands::Context::new(&self.runtime(), cancel)?;
        match self.command {
            Commands::Create(args) => commands::create::run(&ctx, args).await,
            Commands::Get(args) => commands::get::run(&ctx, args).await,
            Commands::Delete(args) => commands::delete::run(&ctx, args).await,
            Commands::AddWorkers(args) => commands::workers::add(&ctx, args).await,
            Commands::DelWorkers(args) => commands::workers::del(&ctx, args).await,
            Commands::Credentials(args) => commands::credentials::run(&ctx, args).await,
            Commands::Export(args) => commands::transfer::export(&ctx, args).await,
            Commands::Import(args) => commands::transfer::import(&ctx, args).await,
            Commands::Kubeconfig(args) => commands::kubeconfig::run(&ctx, args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("kiln").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn global_flags_apply_after_the_subcommand() {
        let cli = parse(&["get", "--fake", "--state-dir", "/tmp/kiln", "-v"]);
        assert!(cli.fake);
        assert!(cli.verbose);
        let runtime = cli.runtime();
        assert!(runtime.fake);
        assert_eq!(runtime.state_dir, Some(PathBuf::from("/tmp/kiln")));
    }

    #[test]
    fn unknown_subcommands_are_rejected() {
        assert!(Cli::try_parse_from(["kiln", "upgrade"]).is_err());
    }

    async fn kiln(state_dir: &std::path::Path, args: &[&str]) -> Result<()> {
        let mut full = vec!["kiln".to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        full.extend(["--fake".to_string(), "--state-dir".to_string()]);
        full.push(state_dir.display().to_string());
        Cli::try_parse_from(full).unwrap().run().await
    }

    const CLUSTER: [&str; 6] = ["--provider", "local", "--name", "demo", "--region", "local"];

    #[tokio::test]
    async fn fake_cluster_lifecycle_through_the_cli() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path();

        let create = [&["create"][..], &CLUSTER, &["--vm-size", "small", "--wp", "0"]].concat();
        kiln(state, &create).await.unwrap();

        let path = state.join("demo.yaml");
        let path_arg = path.display().to_string();
        let fetch = [&["kubeconfig"][..], &CLUSTER, &["--write", path_arg.as_str()]].concat();
        kiln(state, &fetch).await.unwrap();
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("current-context"));

        kiln(state, &[&["delete"][..], &CLUSTER].concat()).await.unwrap();
        assert!(kiln(state, &[&["kubeconfig"][..], &CLUSTER].concat())
            .await
            .is_err());
    }
}
