//! Provider SDK seam.
//!
//! A [`CloudClient`] is the thin wrapper around one provider's API. It knows
//! nothing about the state document; the provisioning steps in
//! [`crate::provision`] decide when to call it. Implementations map their
//! native errors onto the kiln taxonomy (`DuplicateRecords`, `Validation`,
//! `CloudAuth`, `NoMatchingRecords`, `Provider`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiln_common::{CloudProvider, Result};

use crate::rules::FirewallRule;

#[cfg(test)]
use mockall::automock;

/// Provisioning status reported by the provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Being built
    #[default]
    Pending,
    /// Ready for use
    Active,
    /// Provider gave up on the resource
    Failed,
}

/// Network to create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Resource name
    pub name: String,
    /// Region to create it in
    pub region: String,
}

/// Network as reported by the provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Network {
    /// Provider id
    pub id: String,
    /// Address range, once allocated
    pub cidr: String,
    /// Provisioning status
    pub status: ResourceStatus,
}

/// Firewall to create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallSpec {
    /// Resource name
    pub name: String,
    /// Network the firewall is attached to
    pub network_id: String,
    /// Ordered rules
    pub rules: Vec<FirewallRule>,
}

/// Instance to create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Resource name, also used as hostname
    pub name: String,
    /// Region
    pub region: String,
    /// Instance size
    pub size: String,
    /// Network to attach to
    pub network_id: String,
    /// Firewall applied to the instance
    pub firewall_id: String,
    /// Uploaded SSH key authorised for the login user
    pub ssh_key_id: String,
}

/// Instance as reported by the provider
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instance {
    /// Provider id
    pub id: String,
    /// Provisioning status
    pub status: ResourceStatus,
    /// Public IPv4 address, once assigned
    pub public_ip: String,
    /// Private IPv4 address, once assigned
    pub private_ip: String,
    /// Hostname
    pub hostname: String,
}

impl Instance {
    /// Active with both addresses assigned
    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Active
            && !self.public_ip.is_empty()
            && !self.private_ip.is_empty()
    }
}

/// One provider's API.
///
/// Calls are independent and may be issued concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Provider this client talks to
    fn provider(&self) -> CloudProvider;

    /// Check the configured credentials against the provider
    async fn verify_credentials(&self) -> Result<()>;

    /// Regions resources can be created in
    async fn list_regions(&self) -> Result<Vec<String>>;

    /// Instance sizes available
    async fn list_vm_sizes(&self) -> Result<Vec<String>>;

    /// Create a network
    async fn create_network(&self, spec: &NetworkSpec) -> Result<Network>;

    /// Current view of a network
    async fn get_network(&self, id: &str) -> Result<Network>;

    /// Delete a network; fails while resources still use it
    async fn delete_network(&self, id: &str) -> Result<()>;

    /// Create a firewall, returning its id
    async fn create_firewall(&self, spec: &FirewallSpec) -> Result<String>;

    /// Delete a firewall
    async fn delete_firewall(&self, id: &str) -> Result<()>;

    /// Upload an authorized_keys formatted public key, returning its id
    async fn import_ssh_key(&self, name: &str, public_key: &str) -> Result<String>;

    /// Delete an uploaded key
    async fn delete_ssh_key(&self, id: &str) -> Result<()>;

    /// Start creating an instance; addresses arrive once it is active
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;

    /// Current view of an instance
    async fn get_instance(&self, id: &str) -> Result<Instance>;

    /// Delete an instance
    async fn delete_instance(&self, id: &str) -> Result<()>;
}
