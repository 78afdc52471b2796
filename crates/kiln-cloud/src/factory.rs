//! The contract the orchestrator provisions through.

use async_trait::async_trait;

use kiln_common::{BootstrapProvider, Result, Role};

#[cfg(test)]
use mockall::automock;

/// Idempotent cloud provisioning for one cluster.
///
/// Every create step checks the state document first and does nothing when
/// the resource id is already recorded; every delete step clears exactly the
/// fields it owns. Implementations are bound to one cluster's state handle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudFactory: Send + Sync {
    /// Verify the provider credentials
    async fn init_client(&self) -> Result<()>;

    /// Create the cluster network and wait for it to become active
    async fn new_network(&self) -> Result<()>;

    /// Delete the network, then remove the cluster record from the store
    async fn del_network(&self) -> Result<()>;

    /// Create the firewall for a role
    ///
    /// # Arguments
    /// * `role` - Which role's rule set to apply
    async fn new_firewall(&self, role: Role) -> Result<()>;

    /// Delete the firewall of a role
    async fn del_firewall(&self, role: Role) -> Result<()>;

    /// Create one VM and wait until it has both addresses
    ///
    /// # Arguments
    /// * `role` - Node class
    /// * `index` - Slot in the role's VM arrays (ignored for the load balancer)
    async fn new_vm(&self, role: Role, index: usize) -> Result<()>;

    /// Delete one VM and clear its slot
    async fn del_vm(&self, role: Role, index: usize) -> Result<()>;

    /// Generate the cluster key pair once and upload its public half
    async fn create_upload_ssh_key_pair(&self) -> Result<()>;

    /// Delete the uploaded key and erase the key material
    async fn del_ssh_key_pair(&self) -> Result<()>;

    /// Reject regions the provider does not offer
    async fn is_valid_region(&self, region: &str) -> Result<()>;

    /// Reject instance sizes the provider does not offer
    async fn is_valid_vm_size(&self, size: &str) -> Result<()>;

    /// Reject Kubernetes versions the distribution cannot install
    fn is_valid_version(&self, bootstrap: BootstrapProvider, version: &str) -> Result<()>;
}
