//! `kiln get` - list stored clusters

use clap::Args;

use kiln_cluster::ClusterSummary;
use kiln_common::storage::ClusterFilter;
use kiln_common::CloudProvider;

use super::{print_table, Context, OutputFormat};
use crate::Result;

/// List clusters
#[derive(Args, Debug)]
pub struct GetArgs {
    /// Only this provider
    #[arg(long)]
    pub provider: Option<CloudProvider>,

    /// Only this cluster name (needs --region)
    #[arg(long, requires = "region")]
    pub name: Option<String>,

    /// Only this region (needs --name)
    #[arg(long, requires = "name")]
    pub region: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub output: OutputFormat,
}

pub async fn run(ctx: &Context, args: GetArgs) -> Result<()> {
    let filter = ClusterFilter {
        provider: args.provider,
        cluster_type: None,
        name: args.name,
        region: args.region,
    };
    let clusters = ctx.controller.get(&filter).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&clusters)?),
        OutputFormat::Table if clusters.is_empty() => println!("No clusters found."),
        OutputFormat::Table => print_table(
            &[
                "NAME", "PROVIDER", "REGION", "DISTRO", "VERSION", "CP", "DS", "WORKERS", "READY",
            ],
            &rows(&clusters),
        ),
    }
    Ok(())
}

fn rows(clusters: &[ClusterSummary]) -> Vec<Vec<String>> {
    clusters
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                c.provider.to_string(),
                c.region.clone(),
                c.bootstrap.to_string(),
                if c.version.is_empty() {
                    "-".to_string()
                } else {
                    c.version.clone()
                },
                c.control_planes.to_string(),
                c.data_stores.to_string(),
                c.worker_planes.to_string(),
                if c.ready { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect()
}
