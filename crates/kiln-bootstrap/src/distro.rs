//! The contract every Kubernetes distribution implements.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use kiln_common::{BootstrapProvider, Error, Operation, Result, StateHandle};

use crate::k3s::K3s;
use crate::kubeadm::Kubeadm;
use crate::prebootstrap::PreBootstrap;
use crate::remote::Remote;

/// Turns provisioned VMs into a Kubernetes cluster.
///
/// Steps are called in order: base, datastores and load balancer, distribution
/// setup, CNI and version selection, control plane 0, then the remaining
/// control planes and the workers. Each step persists its results before
/// returning so a later run resumes from there.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Bootstrap: Send + Sync {
    /// Record certificates, node addresses and SSH identity
    async fn setup_base(&self, op: Operation) -> Result<()>;

    /// Install etcd on one datastore node
    async fn configure_datastore(&self, index: usize) -> Result<()>;

    /// Install HAProxy on the load balancer
    async fn configure_loadbalancer(&self) -> Result<()>;

    /// Initialise the distribution's own state record
    async fn setup(&self, op: Operation) -> Result<()>;

    /// Select and record the distribution version
    ///
    /// # Arguments
    /// * `version` - Requested release; empty keeps the recorded or default one
    async fn k8s_version(&self, version: &str) -> Result<()>;

    /// Select the network plugin; returns true when it is installed externally
    async fn cni(&self, name: &str) -> Result<bool>;

    /// Configure control plane `index`; index 0 creates the cluster
    async fn configure_control_plane(&self, index: usize) -> Result<()>;

    /// Join worker `index`
    async fn join_worker_plane(&self, index: usize) -> Result<()>;

    /// Drain and remove nodes from the cluster; best effort
    async fn remove_worker_planes(&self, hostnames: &[String]) -> Result<()>;
}

/// Distribution selected by the state document
pub fn distribution(
    provider: BootstrapProvider,
    state: StateHandle,
    remote: Remote,
) -> Result<Box<dyn Bootstrap>> {
    let pre = PreBootstrap::new(state, remote);
    match provider {
        BootstrapProvider::K3s => Ok(Box::new(K3s::new(pre))),
        BootstrapProvider::Kubeadm => Ok(Box::new(Kubeadm::new(pre))),
        BootstrapProvider::Managed => Err(Error::validation_for_field(
            "distribution",
            "managed clusters are bootstrapped by the provider",
        )),
    }
}
