//! kiln CLI
//!
//! Provisions self-managed Kubernetes clusters on cloud VMs.

use clap::Parser;

use kiln_cli::{Cli, Result};
use kiln_common::telemetry::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_config())?;
    cli.run().await
}
