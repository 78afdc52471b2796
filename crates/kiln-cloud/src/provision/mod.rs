//! Idempotent provisioning steps over any [`CloudClient`].
//!
//! One [`Provisioner`] serves one cluster. Each step consults the state
//! document, calls the provider only for what is missing, and persists the
//! result through the shared [`StateHandle`] before returning.

mod firewall;
mod network;
mod ssh_key;
mod vm;

pub use vm::all_required_ready;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kiln_common::config::Timing;
use kiln_common::{BootstrapProvider, Error, ErrorKind, Result, Role, StateHandle};

use crate::client::CloudClient;
use crate::factory::CloudFactory;

/// Instance size per role
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmSizes {
    /// Control planes
    pub control_plane: String,
    /// Workers
    pub worker_plane: String,
    /// Datastores
    pub data_store: String,
    /// Load balancer
    pub load_balancer: String,
}

impl VmSizes {
    /// The same size for every role
    pub fn uniform(size: impl Into<String>) -> Self {
        let size = size.into();
        Self {
            control_plane: size.clone(),
            worker_plane: size.clone(),
            data_store: size.clone(),
            load_balancer: size,
        }
    }

    /// Size for a role
    pub fn get(&self, role: Role) -> &str {
        match role {
            Role::ControlPlane => &self.control_plane,
            Role::WorkerPlane => &self.worker_plane,
            Role::DataStore => &self.data_store,
            Role::LoadBalancer => &self.load_balancer,
        }
    }
}

/// Provider resource name of a VM: `<cluster>-<role>-<index>`, or
/// `<cluster>-lb` for the single load balancer
pub fn vm_name(cluster: &str, role: Role, index: usize) -> String {
    match role {
        Role::LoadBalancer => format!("{}-{}", cluster, role.short()),
        _ => format!("{}-{}-{}", cluster, role.short(), index),
    }
}

/// Treat "already gone" as success when deleting
pub(crate) fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// [`CloudFactory`] implementation generic over the provider client
pub struct Provisioner {
    client: Arc<dyn CloudClient>,
    state: StateHandle,
    sizes: VmSizes,
    timing: Timing,
    cancel: CancellationToken,
}

impl Provisioner {
    /// Provisioner for the cluster behind `state`
    pub fn new(client: Arc<dyn CloudClient>, state: StateHandle, timing: Timing) -> Self {
        Self {
            client,
            state,
            sizes: VmSizes::default(),
            timing,
            cancel: CancellationToken::new(),
        }
    }

    /// Instance sizes used when creating VMs
    pub fn with_sizes(mut self, sizes: VmSizes) -> Self {
        self.sizes = sizes;
        self
    }

    /// Abort polling loops when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn provider(&self) -> &'static str {
        self.client.provider().as_str()
    }

    async fn cluster_name(&self) -> String {
        self.state.read(|d| d.cluster_name.clone()).await
    }
}

#[async_trait]
impl CloudFactory for Provisioner {
    async fn init_client(&self) -> Result<()> {
        self.client.verify_credentials().await.map_err(|e| match e {
            Error::CloudAuth { .. } => e,
            other => Error::cloud_auth(self.provider(), other.to_string()),
        })?;
        info!(provider = %self.provider(), "cloud client initialised");
        Ok(())
    }

    async fn new_network(&self) -> Result<()> {
        self.create_network().await
    }

    async fn del_network(&self) -> Result<()> {
        self.delete_network().await
    }

    async fn new_firewall(&self, role: Role) -> Result<()> {
        self.create_firewall(role).await
    }

    async fn del_firewall(&self, role: Role) -> Result<()> {
        self.delete_firewall(role).await
    }

    async fn new_vm(&self, role: Role, index: usize) -> Result<()> {
        self.create_vm(role, index).await
    }

    async fn del_vm(&self, role: Role, index: usize) -> Result<()> {
        self.delete_vm(role, index).await
    }

    async fn create_upload_ssh_key_pair(&self) -> Result<()> {
        self.create_ssh_key().await
    }

    async fn del_ssh_key_pair(&self) -> Result<()> {
        self.delete_ssh_key().await
    }

    async fn is_valid_region(&self, region: &str) -> Result<()> {
        let regions = self.client.list_regions().await?;
        if regions.iter().any(|r| r == region) {
            return Ok(());
        }
        Err(Error::validation_for_field(
            "region",
            format!(
                "{} has no region '{}' (available: {})",
                self.provider(),
                region,
                regions.join(", ")
            ),
        ))
    }

    async fn is_valid_vm_size(&self, size: &str) -> Result<()> {
        let sizes = self.client.list_vm_sizes().await?;
        if sizes.iter().any(|s| s == size) {
            return Ok(());
        }
        Err(Error::validation_for_field(
            "vm_size",
            format!("{} has no instance size '{}'", self.provider(), size),
        ))
    }

    fn is_valid_version(&self, bootstrap: BootstrapProvider, version: &str) -> Result<()> {
        bootstrap.validate_version(version)
    }
}
