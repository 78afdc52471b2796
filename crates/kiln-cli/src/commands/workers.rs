//! `kiln add-workers` / `kiln del-workers`

use clap::Args;
use tracing::info;

use super::{ClusterArgs, Context};
use crate::Result;

/// Add workers
#[derive(Args, Debug)]
pub struct AddWorkersArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// How many workers to add
    #[arg(long, default_value_t = 1)]
    pub count: usize,

    /// Instance size (default: same as the existing workers)
    #[arg(long)]
    pub vm_size: Option<String>,
}

/// Remove the most recently added workers
#[derive(Args, Debug)]
pub struct DelWorkersArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// How many workers to remove
    #[arg(long, default_value_t = 1)]
    pub count: usize,
}

pub async fn add(ctx: &Context, args: AddWorkersArgs) -> Result<()> {
    let doc = ctx
        .controller
        .add_workers(&args.cluster.key(), args.count, args.vm_size)
        .await?;
    info!(cluster = %doc.cluster_name, workers = doc.cloud_infra.worker_planes.len(), "done");
    Ok(())
}

pub async fn del(ctx: &Context, args: DelWorkersArgs) -> Result<()> {
    let doc = ctx
        .controller
        .del_workers(&args.cluster.key(), args.count)
        .await?;
    info!(cluster = %doc.cluster_name, workers = doc.cloud_infra.worker_planes.len(), "done");
    Ok(())
}
