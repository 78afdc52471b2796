//! `kiln export` / `kiln import` - move state between machines

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use kiln_common::storage::{ClusterFilter, StorageExport};
use kiln_common::CloudProvider;

use super::Context;
use crate::Result;

/// Export clusters and credentials as JSON
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Only this provider
    #[arg(long)]
    pub provider: Option<CloudProvider>,

    /// Write to this file instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

/// Import a bundle
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Bundle written by `kiln export`
    #[arg(long)]
    pub input: PathBuf,
}

pub async fn export(ctx: &Context, args: ExportArgs) -> Result<()> {
    let filter = ClusterFilter {
        provider: args.provider,
        ..Default::default()
    };
    let bundle = ctx.controller.export(&filter).await?;
    let json = serde_json::to_string_pretty(&bundle)?;
    match args.output {
        Some(path) => {
            tokio::fs::write(&path, json).await?;
            info!(
                clusters = bundle.clusters.len(),
                path = %path.display(),
                "export written"
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub async fn import(ctx: &Context, args: ImportArgs) -> Result<()> {
    let raw = tokio::fs::read(&args.input).await?;
    let bundle: StorageExport = serde_json::from_slice(&raw)?;
    ctx.controller.import(&bundle).await?;
    Ok(())
}
