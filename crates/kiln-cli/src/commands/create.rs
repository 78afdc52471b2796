//! `kiln create` - provision and bootstrap an HA cluster

use clap::Args;
use tracing::info;

use kiln_cloud::VmSizes;
use kiln_cluster::ClusterRequest;
use kiln_common::BootstrapProvider;

use super::{ClusterArgs, Context};
use crate::{Error, Result};

/// Create a cluster
#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Kubernetes distribution (k3s, kubeadm)
    #[arg(long, default_value = "k3s")]
    pub distro: BootstrapProvider,

    /// Control plane count (odd, at least 3)
    #[arg(long = "cp", default_value_t = 3)]
    pub control_planes: usize,

    /// Worker count
    #[arg(long = "wp", default_value_t = 1)]
    pub worker_planes: usize,

    /// Etcd member count (odd, at least 3)
    #[arg(long = "ds", default_value_t = 3)]
    pub data_stores: usize,

    /// Instance size for every role
    #[arg(long)]
    pub vm_size: Option<String>,

    /// Control plane instance size
    #[arg(long)]
    pub cp_size: Option<String>,

    /// Worker instance size
    #[arg(long)]
    pub wp_size: Option<String>,

    /// Etcd instance size
    #[arg(long)]
    pub ds_size: Option<String>,

    /// Load balancer instance size
    #[arg(long)]
    pub lb_size: Option<String>,

    /// Distribution release (default: newest supported)
    #[arg(long, default_value = "")]
    pub version: String,

    /// Network plugin (default: the distribution's own)
    #[arg(long, default_value = "")]
    pub cni: String,
}

impl CreateArgs {
    fn sizes(&self) -> Result<VmSizes> {
        let pick = |role: &Option<String>, flag: &str| {
            role.clone()
                .or_else(|| self.vm_size.clone())
                .ok_or_else(|| Error::validation(format!("set --{} or --vm-size", flag)))
        };
        Ok(VmSizes {
            control_plane: pick(&self.cp_size, "cp-size")?,
            worker_plane: pick(&self.wp_size, "wp-size")?,
            data_store: pick(&self.ds_size, "ds-size")?,
            load_balancer: pick(&self.lb_size, "lb-size")?,
        })
    }

    pub fn request(&self) -> Result<ClusterRequest> {
        Ok(ClusterRequest {
            provider: self.cluster.provider,
            name: self.cluster.name.clone(),
            region: self.cluster.region.clone(),
            bootstrap: self.distro,
            control_planes: self.control_planes,
            worker_planes: self.worker_planes,
            data_stores: self.data_stores,
            sizes: self.sizes()?,
            version: self.version.clone(),
            cni: self.cni.clone(),
        })
    }
}

pub async fn run(ctx: &Context, args: CreateArgs) -> Result<()> {
    let request = args.request()?;
    let doc = ctx.controller.create(&request).await?;
    info!(
        cluster = %doc.cluster_name,
        context = %doc.cluster_kubeconfig_context,
        "cluster ready; run `kiln kubeconfig` to fetch its admin kubeconfig"
    );
    println!("{}", doc.cluster_kubeconfig_context);
    Ok(())
}
