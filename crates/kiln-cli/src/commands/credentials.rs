//! `kiln credentials` - persist provider credentials
//!
//! Reads the provider's environment variables (for example `CIVO_TOKEN`) and
//! stores them so later commands work without the environment.

use clap::Args;

use kiln_common::CloudProvider;

use super::Context;
use crate::Result;

/// Save credentials
#[derive(Args, Debug)]
pub struct CredentialsArgs {
    /// Cloud provider
    #[arg(long)]
    pub provider: CloudProvider,
}

pub async fn run(ctx: &Context, args: CredentialsArgs) -> Result<()> {
    ctx.controller.save_credentials(args.provider).await?;
    Ok(())
}
