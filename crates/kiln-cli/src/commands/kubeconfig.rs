//! `kiln kubeconfig` - print or save a cluster's admin kubeconfig

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use super::{ClusterArgs, Context};
use crate::Result;

/// Fetch a kubeconfig
#[derive(Args, Debug)]
pub struct KubeconfigArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Write to this file instead of stdout
    #[arg(long)]
    pub write: Option<PathBuf>,
}

pub async fn run(ctx: &Context, args: KubeconfigArgs) -> Result<()> {
    let (context, kubeconfig) = ctx.controller.kubeconfig(&args.cluster.key()).await?;
    match args.write {
        Some(path) => {
            tokio::fs::write(&path, kubeconfig).await?;
            info!(context = %context, path = %path.display(), "kubeconfig written");
        }
        None => print!("{}", kubeconfig),
    }
    Ok(())
}
