//! `kiln delete` - tear a cluster down

use clap::Args;

use super::{ClusterArgs, Context};
use crate::Result;

/// Delete a cluster
#[derive(Args, Debug)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,
}

pub async fn run(ctx: &Context, args: DeleteArgs) -> Result<()> {
    ctx.controller.delete(&args.cluster.key()).await?;
    Ok(())
}
