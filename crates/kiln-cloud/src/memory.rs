//! In-memory provider.
//!
//! Backs the `local` provider and fake runs of every other provider. Instances
//! report `pending` for a configurable number of polls before becoming active,
//! and networks refuse deletion while instances still use them, so the
//! provisioning steps' polling paths are exercised for real.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;
use uuid::Uuid;

use kiln_common::{CloudProvider, Error, Result};

use crate::client::{
    CloudClient, FirewallSpec, Instance, InstanceSpec, Network, NetworkSpec, ResourceStatus,
};
use crate::rules::PortRange;

/// CIDR every simulated network is allocated
pub const MEMORY_NETWORK_CIDR: &str = "10.0.0.0/16";

/// Regions and sizes a provider offers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catalog {
    /// Region identifiers
    pub regions: Vec<String>,
    /// Instance sizes
    pub vm_sizes: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Catalog {
    /// Offerings mirrored from each provider
    pub fn for_provider(provider: CloudProvider) -> Self {
        let (regions, sizes): (&[&str], &[&str]) = match provider {
            CloudProvider::Civo => (
                &["LON1", "FRA1", "NYC1", "PHX1"],
                &["g4s.kube.small", "g4s.kube.medium", "g4s.kube.large"],
            ),
            CloudProvider::Aws => (
                &["us-east-1", "eu-west-1", "ap-south-1"],
                &["t2.medium", "t3.medium", "t3.large"],
            ),
            CloudProvider::Azure => (
                &["eastus", "westeurope", "centralindia"],
                &["Standard_B2s", "Standard_B4ms", "Standard_D2s_v3"],
            ),
            CloudProvider::Local => (&["local"], &["small", "medium", "large"]),
        };
        Self {
            regions: strings(regions),
            vm_sizes: strings(sizes),
        }
    }
}

#[derive(Clone, Debug)]
struct MemoryInstance {
    ready: Instance,
    network_id: String,
    polls_left: u32,
}

/// Simulated provider keeping every resource in concurrent maps
pub struct MemoryCloud {
    provider: CloudProvider,
    catalog: Catalog,
    boot_polls: u32,
    reject_credentials: bool,
    next_host: AtomicU32,
    networks: DashMap<String, Network>,
    firewalls: DashMap<String, FirewallSpec>,
    ssh_keys: DashMap<String, String>,
    instances: DashMap<String, MemoryInstance>,
    failing_instances: DashSet<String>,
    calls: DashMap<&'static str, usize>,
}

impl MemoryCloud {
    /// Simulate `provider` with its catalog; instances boot after one poll
    pub fn new(provider: CloudProvider) -> Self {
        Self {
            provider,
            catalog: Catalog::for_provider(provider),
            boot_polls: 1,
            reject_credentials: false,
            next_host: AtomicU32::new(0),
            networks: DashMap::new(),
            firewalls: DashMap::new(),
            ssh_keys: DashMap::new(),
            instances: DashMap::new(),
            failing_instances: DashSet::new(),
            calls: DashMap::new(),
        }
    }

    /// Number of `get_instance` polls that report pending before active
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.boot_polls = polls;
        self
    }

    /// Fail credential verification
    pub fn with_rejected_credentials(mut self) -> Self {
        self.reject_credentials = true;
        self
    }

    /// Make creation of the named instance fail permanently
    pub fn fail_instance(&self, name: impl Into<String>) {
        self.failing_instances.insert(name.into());
    }

    /// Let creation of the named instance succeed again
    pub fn recover_instance(&self, name: &str) {
        self.failing_instances.remove(name);
    }

    /// How many times an API method was called
    pub fn calls(&self, method: &str) -> usize {
        self.calls.get(method).map(|c| *c).unwrap_or(0)
    }

    /// Instances currently alive
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Firewalls currently alive
    pub fn firewall_count(&self) -> usize {
        self.firewalls.len()
    }

    /// Ports opened by the firewall with this name
    pub fn firewall_ports(&self, name: &str) -> Vec<PortRange> {
        self.firewalls
            .iter()
            .filter(|f| f.name == name)
            .flat_map(|f| f.rules.iter().map(|r| r.ports).collect::<Vec<_>>())
            .collect()
    }

    /// Networks currently alive
    pub fn network_count(&self) -> usize {
        self.networks.len()
    }

    fn record(&self, method: &'static str) {
        *self.calls.entry(method).or_insert(0) += 1;
    }

    fn not_found(&self, what: &str, id: &str) -> Error {
        Error::not_found(format!("{} {} {}", self.provider, what, id))
    }

    fn allocate_addresses(&self) -> (String, String) {
        let n = self.next_host.fetch_add(1, Ordering::Relaxed);
        (
            format!("198.51.{}.{}", 100 + n / 250, n % 250 + 2),
            format!("10.0.{}.{}", n / 250, n % 250 + 2),
        )
    }
}

#[async_trait]
impl CloudClient for MemoryCloud {
    fn provider(&self) -> CloudProvider {
        self.provider
    }

    async fn verify_credentials(&self) -> Result<()> {
        self.record("verify_credentials");
        if self.reject_credentials {
            return Err(Error::cloud_auth(self.provider.as_str(), "credentials rejected"));
        }
        Ok(())
    }

    async fn list_regions(&self) -> Result<Vec<String>> {
        Ok(self.catalog.regions.clone())
    }

    async fn list_vm_sizes(&self) -> Result<Vec<String>> {
        Ok(self.catalog.vm_sizes.clone())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<Network> {
        self.record("create_network");
        if !self.catalog.regions.contains(&spec.region) {
            return Err(Error::validation_for_field(
                "region",
                format!("unknown region {}", spec.region),
            ));
        }
        let network = Network {
            id: Uuid::new_v4().to_string(),
            cidr: MEMORY_NETWORK_CIDR.to_string(),
            status: ResourceStatus::Pending,
        };
        self.networks.insert(network.id.clone(), network.clone());
        debug!(provider = %self.provider, network = %spec.name, "network created");
        Ok(network)
    }

    async fn get_network(&self, id: &str) -> Result<Network> {
        self.record("get_network");
        let mut network = self
            .networks
            .get_mut(id)
            .ok_or_else(|| self.not_found("network", id))?;
        let current = network.clone();
        network.status = ResourceStatus::Active;
        Ok(current)
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        self.record("delete_network");
        if self.instances.iter().any(|i| i.network_id == id) {
            return Err(Error::provider_for(
                self.provider.as_str(),
                format!("network {} still has instances attached", id),
            ));
        }
        self.networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.not_found("network", id))
    }

    async fn create_firewall(&self, spec: &FirewallSpec) -> Result<String> {
        self.record("create_firewall");
        if !self.networks.contains_key(&spec.network_id) {
            return Err(self.not_found("network", &spec.network_id));
        }
        if self.firewalls.iter().any(|f| f.name == spec.name) {
            return Err(Error::duplicate(format!("firewall {}", spec.name)));
        }
        let id = Uuid::new_v4().to_string();
        self.firewalls.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn delete_firewall(&self, id: &str) -> Result<()> {
        self.record("delete_firewall");
        self.firewalls
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.not_found("firewall", id))
    }

    async fn import_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        self.record("import_ssh_key");
        if public_key.trim().is_empty() {
            return Err(Error::validation_for_field("public_key", "empty public key"));
        }
        if self.ssh_keys.iter().any(|k| k.value() == name) {
            return Err(Error::duplicate(format!("ssh key {}", name)));
        }
        let id = Uuid::new_v4().to_string();
        self.ssh_keys.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn delete_ssh_key(&self, id: &str) -> Result<()> {
        self.record("delete_ssh_key");
        self.ssh_keys
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.not_found("ssh key", id))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        self.record("create_instance");
        if self.failing_instances.contains(&spec.name) {
            return Err(Error::provider_permanent(
                self.provider.as_str(),
                format!("instance {} could not be scheduled", spec.name),
            ));
        }
        if !self.catalog.vm_sizes.contains(&spec.size) {
            return Err(Error::validation_for_field(
                "vm_size",
                format!("unknown size {}", spec.size),
            ));
        }
        if !self.networks.contains_key(&spec.network_id) {
            return Err(self.not_found("network", &spec.network_id));
        }
        if !self.firewalls.contains_key(&spec.firewall_id) {
            return Err(self.not_found("firewall", &spec.firewall_id));
        }
        if !self.ssh_keys.contains_key(&spec.ssh_key_id) {
            return Err(self.not_found("ssh key", &spec.ssh_key_id));
        }
        if self.instances.iter().any(|i| i.ready.hostname == spec.name) {
            return Err(Error::duplicate(format!("instance {}", spec.name)));
        }

        let (public_ip, private_ip) = self.allocate_addresses();
        let ready = Instance {
            id: Uuid::new_v4().to_string(),
            status: ResourceStatus::Active,
            public_ip,
            private_ip,
            hostname: spec.name.clone(),
        };
        let pending = Instance {
            id: ready.id.clone(),
            status: ResourceStatus::Pending,
            hostname: ready.hostname.clone(),
            ..Default::default()
        };
        self.instances.insert(
            ready.id.clone(),
            MemoryInstance {
                ready,
                network_id: spec.network_id.clone(),
                polls_left: self.boot_polls,
            },
        );
        Ok(pending)
    }

    async fn get_instance(&self, id: &str) -> Result<Instance> {
        self.record("get_instance");
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| self.not_found("instance", id))?;
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(Instance {
                id: entry.ready.id.clone(),
                status: ResourceStatus::Pending,
                hostname: entry.ready.hostname.clone(),
                ..Default::default()
            });
        }
        Ok(entry.ready.clone())
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        self.record("delete_instance");
        self.instances
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.not_found("instance", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_common::ErrorKind;

    async fn network(cloud: &MemoryCloud) -> String {
        cloud
            .create_network(&NetworkSpec {
                name: "demo-net".into(),
                region: "local".into(),
            })
            .await
            .unwrap()
            .id
    }

    async fn instance_spec(cloud: &MemoryCloud, name: &str) -> InstanceSpec {
        let network_id = network(cloud).await;
        let firewall_id = cloud
            .create_firewall(&FirewallSpec {
                name: format!("{}-fw", name),
                network_id: network_id.clone(),
                rules: vec![],
            })
            .await
            .unwrap();
        let ssh_key_id = cloud
            .import_ssh_key(&format!("{}-key", name), "ssh-ed25519 AAAA")
            .await
            .unwrap();
        InstanceSpec {
            name: name.into(),
            region: "local".into(),
            size: "small".into(),
            network_id,
            firewall_id,
            ssh_key_id,
        }
    }

    #[tokio::test]
    async fn instances_become_active_after_boot_polls() {
        let cloud = MemoryCloud::new(CloudProvider::Local).with_boot_polls(2);
        let spec = instance_spec(&cloud, "demo-cp-0").await;

        let created = cloud.create_instance(&spec).await.unwrap();
        assert_eq!(created.status, ResourceStatus::Pending);
        assert!(created.public_ip.is_empty());

        assert!(!cloud.get_instance(&created.id).await.unwrap().is_ready());
        assert!(!cloud.get_instance(&created.id).await.unwrap().is_ready());
        let ready = cloud.get_instance(&created.id).await.unwrap();
        assert!(ready.is_ready());
        assert_eq!(ready.hostname, "demo-cp-0");
    }

    #[tokio::test]
    async fn network_in_use_cannot_be_deleted() {
        let cloud = MemoryCloud::new(CloudProvider::Local);
        let spec = instance_spec(&cloud, "demo-wp-0").await;
        let vm = cloud.create_instance(&spec).await.unwrap();

        let err = cloud.delete_network(&spec.network_id).await.unwrap_err();
        assert!(err.is_retryable());

        cloud.delete_instance(&vm.id).await.unwrap();
        cloud.delete_network(&spec.network_id).await.unwrap();
        assert_eq!(cloud.network_count(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let cloud = MemoryCloud::new(CloudProvider::Civo);
        let err = cloud.get_instance("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = cloud.delete_firewall("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn duplicate_instance_names_are_rejected() {
        let cloud = MemoryCloud::new(CloudProvider::Local);
        let spec = instance_spec(&cloud, "demo-lb").await;
        cloud.create_instance(&spec).await.unwrap();
        let err = cloud.create_instance(&spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
    }

    #[tokio::test]
    async fn catalog_follows_the_simulated_provider() {
        let cloud = MemoryCloud::new(CloudProvider::Aws);
        assert!(cloud.list_regions().await.unwrap().contains(&"us-east-1".to_string()));
        assert!(cloud.list_vm_sizes().await.unwrap().contains(&"t3.medium".to_string()));
    }
}
