//! The state document: the single persisted record of a cluster's progress.
//!
//! Every provisioning and bootstrap step reads the document before acting and
//! writes it after acting. A resource counts as created iff its id field is
//! non-empty, which is what makes re-running a half-finished pipeline safe.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::Storage;
use crate::types::{BootstrapProvider, CloudProvider, ClusterType, Cni, Role};
use crate::{Error, Result};

/// Suffix appended to every generated kubeconfig context name
pub const CONTEXT_SUFFIX: &str = "kiln";

/// Identifies one cluster record in a store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    /// Cloud backend
    pub provider: CloudProvider,
    /// Self-managed or managed
    pub cluster_type: ClusterType,
    /// Cluster name
    pub name: String,
    /// Provider region
    pub region: String,
}

impl ClusterKey {
    /// Build a key
    pub fn new(
        provider: CloudProvider,
        cluster_type: ClusterType,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            cluster_type,
            name: name.into(),
            region: region.into(),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.provider, self.cluster_type, self.name, self.region
        )
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Installed component versions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    /// k3s release (e.g. "v1.30.3+k3s1")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub k3s: String,
    /// kubeadm release (e.g. "v1.30")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubeadm: String,
    /// etcd release on the datastore nodes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd: String,
    /// HAProxy release on the load balancer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub haproxy: String,
}

/// Parallel arrays describing every VM of one role.
///
/// Index `i` of every array describes the same node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCollection {
    /// Provider instance ids
    #[serde(default)]
    pub vm_ids: Vec<String>,
    /// Public IPv4 addresses
    #[serde(default)]
    pub public_ips: Vec<String>,
    /// Private IPv4 addresses
    #[serde(default)]
    pub private_ips: Vec<String>,
    /// Hostnames reported by the provider
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// Instance sizes
    #[serde(default)]
    pub vm_sizes: Vec<String>,
}

impl VmCollection {
    /// Collection with `len` empty slots
    pub fn with_len(len: usize) -> Self {
        let mut c = Self::default();
        c.resize(len);
        c
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.vm_ids.len()
    }

    /// True when no slots are allocated
    pub fn is_empty(&self) -> bool {
        self.vm_ids.is_empty()
    }

    /// Grow with empty slots or truncate, keeping every array aligned
    pub fn resize(&mut self, len: usize) {
        self.vm_ids.resize(len, String::new());
        self.public_ips.resize(len, String::new());
        self.private_ips.resize(len, String::new());
        self.hostnames.resize(len, String::new());
        self.vm_sizes.resize(len, String::new());
    }

    /// Every array has the same length
    pub fn is_aligned(&self) -> bool {
        let n = self.vm_ids.len();
        self.public_ips.len() == n
            && self.private_ips.len() == n
            && self.hostnames.len() == n
            && self.vm_sizes.len() == n
    }

    /// The VM in slot `index` has an id and both addresses
    pub fn is_ready(&self, index: usize) -> bool {
        index < self.len()
            && !self.vm_ids[index].is_empty()
            && !self.public_ips[index].is_empty()
            && !self.private_ips[index].is_empty()
    }

    /// View of one slot
    pub fn get(&self, index: usize) -> Option<VmRecord> {
        if index >= self.len() {
            return None;
        }
        Some(VmRecord {
            vm_id: self.vm_ids[index].clone(),
            public_ip: self.public_ips[index].clone(),
            private_ip: self.private_ips[index].clone(),
            hostname: self.hostnames[index].clone(),
            vm_size: self.vm_sizes[index].clone(),
        })
    }

    /// Write a slot from a record
    pub fn set(&mut self, index: usize, vm: VmRecord) -> Result<()> {
        if index >= self.len() {
            return Err(Error::state(format!(
                "vm index {} out of range for {} slots",
                index,
                self.len()
            )));
        }
        self.vm_ids[index] = vm.vm_id;
        self.public_ips[index] = vm.public_ip;
        self.private_ips[index] = vm.private_ip;
        self.hostnames[index] = vm.hostname;
        self.vm_sizes[index] = vm.vm_size;
        Ok(())
    }
}

/// One VM (used directly for the single load balancer)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Provider instance id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_id: String,
    /// Public IPv4 address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_ip: String,
    /// Private IPv4 address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_ip: String,
    /// Hostname
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Instance size
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_size: String,
}

impl VmRecord {
    /// Has an id and both addresses
    pub fn is_ready(&self) -> bool {
        !self.vm_id.is_empty() && !self.public_ip.is_empty() && !self.private_ip.is_empty()
    }
}

/// Firewall id per role; empty means not created
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallIds {
    /// Control-plane firewall
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane: String,
    /// Worker firewall
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker_plane: String,
    /// Datastore firewall
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_store: String,
    /// Load balancer firewall
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balancer: String,
}

impl FirewallIds {
    /// Stored id for a role
    pub fn get(&self, role: Role) -> &str {
        match role {
            Role::ControlPlane => &self.control_plane,
            Role::WorkerPlane => &self.worker_plane,
            Role::DataStore => &self.data_store,
            Role::LoadBalancer => &self.load_balancer,
        }
    }

    /// Mutable id slot for a role
    pub fn get_mut(&mut self, role: Role) -> &mut String {
        match role {
            Role::ControlPlane => &mut self.control_plane,
            Role::WorkerPlane => &mut self.worker_plane,
            Role::DataStore => &mut self.data_store,
            Role::LoadBalancer => &mut self.load_balancer,
        }
    }
}

/// Cloud resources of a self-managed cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInfra {
    /// Network id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_id: String,
    /// Network CIDR reported by the provider
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_cidr: String,
    /// Firewall ids per role
    #[serde(default)]
    pub firewall_ids: FirewallIds,
    /// Uploaded SSH key id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_id: String,
    /// SSH login user on the VMs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_user: String,
    /// Control-plane VMs
    #[serde(default)]
    pub control_planes: VmCollection,
    /// Worker VMs
    #[serde(default)]
    pub worker_planes: VmCollection,
    /// Datastore VMs
    #[serde(default)]
    pub data_stores: VmCollection,
    /// Load balancer VM
    #[serde(default)]
    pub load_balancer: VmRecord,
    /// Requested Kubernetes version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,
    /// Provider specific ids (subnets, resource groups, route tables)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_meta: BTreeMap<String, String>,
    /// Every required VM has both addresses recorded
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_completed: bool,
}

impl CloudInfra {
    /// VM collection for a multi-node role; `None` for the load balancer
    pub fn vms(&self, role: Role) -> Option<&VmCollection> {
        match role {
            Role::ControlPlane => Some(&self.control_planes),
            Role::WorkerPlane => Some(&self.worker_planes),
            Role::DataStore => Some(&self.data_stores),
            Role::LoadBalancer => None,
        }
    }

    /// Mutable VM collection for a multi-node role
    pub fn vms_mut(&mut self, role: Role) -> Option<&mut VmCollection> {
        match role {
            Role::ControlPlane => Some(&mut self.control_planes),
            Role::WorkerPlane => Some(&mut self.worker_planes),
            Role::DataStore => Some(&mut self.data_stores),
            Role::LoadBalancer => None,
        }
    }

    /// Record of one VM regardless of role
    pub fn vm(&self, role: Role, index: usize) -> Option<VmRecord> {
        match self.vms(role) {
            Some(c) => c.get(index),
            None => Some(self.load_balancer.clone()),
        }
    }

    /// Write one VM regardless of role
    pub fn set_vm(&mut self, role: Role, index: usize, vm: VmRecord) -> Result<()> {
        match self.vms_mut(role) {
            Some(c) => c.set(index, vm),
            None => {
                self.load_balancer = vm;
                Ok(())
            }
        }
    }
}

/// SSH connection info handed to the bootstrap phase
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    /// Login user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    /// Private key (OpenSSH PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key: String,
}

/// Addresses per role copied from the cloud state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleIps {
    /// Control planes
    #[serde(default)]
    pub control_planes: Vec<String>,
    /// Workers
    #[serde(default)]
    pub worker_planes: Vec<String>,
    /// Datastores
    #[serde(default)]
    pub data_stores: Vec<String>,
    /// Load balancer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub load_balancer: String,
}

/// Bootstrap data shared by all distributions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapBase {
    /// Etcd CA certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
    /// Etcd server/client certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_cert: String,
    /// Etcd private key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_key: String,
    /// Public addresses
    #[serde(default)]
    pub public_ips: RoleIps,
    /// Private addresses
    #[serde(default)]
    pub private_ips: RoleIps,
    /// SSH connection info
    #[serde(default)]
    pub ssh: SshInfo,
}

/// k3s join material
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K3sState {
    /// Server token minted by control plane 0
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

/// kubeadm join material
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeadmState {
    /// Bootstrap token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootstrap_token: String,
    /// Key decrypting the uploaded control-plane certificates
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_key: String,
    /// `sha256:<hex>` hash of the cluster CA public key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub discovery_token_ca_cert_hash: String,
    /// Bootstrap token expiry (RFC 3339, UTC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_token_expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Kubernetes bootstrap progress
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sBootstrap {
    /// Shared material
    #[serde(default)]
    pub base: BootstrapBase,
    /// k3s specifics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s: Option<K3sState>,
    /// kubeadm specifics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeadm: Option<KubeadmState>,
    /// Leading worker slots known to have joined the cluster
    #[serde(default)]
    pub joined_worker_planes: usize,
}

/// Generated SSH key pair
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyPair {
    /// authorized_keys formatted public key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    /// OpenSSH PEM private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key: String,
}

/// An installed application
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    /// Application name
    pub name: String,
    /// Installed version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Addon inventory
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addons {
    /// Network plugin
    #[serde(default)]
    pub cni: Cni,
    /// Whether the network plugin is installed outside the distribution
    #[serde(default, skip_serializing_if = "is_false")]
    pub external_cni: bool,
    /// Applications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<AppRecord>,
}

/// The persisted record of one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    /// Cluster name
    pub cluster_name: String,
    /// Provider region
    pub region: String,
    /// Cloud backend
    pub infra_provider: CloudProvider,
    /// Self-managed or managed
    pub cluster_type: ClusterType,
    /// Kubernetes distribution
    pub bootstrap_provider: BootstrapProvider,
    /// Installed component versions
    #[serde(default)]
    pub versions: Versions,
    /// Cloud resources
    #[serde(default)]
    pub cloud_infra: CloudInfra,
    /// Kubernetes bootstrap progress
    #[serde(default)]
    pub k8s_bootstrap: K8sBootstrap,
    /// Generated SSH key pair
    #[serde(default)]
    pub ssh_key_pair: SshKeyPair,
    /// Admin kubeconfig of the finished cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_kubeconfig: String,
    /// Context name inside the kubeconfig
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_kubeconfig_context: String,
    /// Addon inventory
    #[serde(default)]
    pub addons: Addons,
}

impl StateDocument {
    /// Fresh document for a cluster about to be created
    pub fn new(key: &ClusterKey, bootstrap_provider: BootstrapProvider) -> Self {
        Self {
            cluster_name: key.name.clone(),
            region: key.region.clone(),
            infra_provider: key.provider,
            cluster_type: key.cluster_type,
            bootstrap_provider,
            ..Default::default()
        }
    }

    /// Storage key of this document
    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(
            self.infra_provider,
            self.cluster_type,
            self.cluster_name.clone(),
            self.region.clone(),
        )
    }

    /// Kubeconfig context name unique to this cluster
    pub fn cluster_context_name(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.cluster_name, self.region, self.cluster_type, self.infra_provider, CONTEXT_SUFFIX
        )
    }

    /// Worker slots allocated but not yet joined to the cluster
    pub fn pending_workers(&self) -> Range<usize> {
        let len = self.cloud_infra.worker_planes.len();
        self.k8s_bootstrap.joined_worker_planes.min(len)..len
    }

    /// A kubeconfig has been fetched and every worker slot has joined
    pub fn is_finished(&self) -> bool {
        !self.cluster_kubeconfig.is_empty() && self.pending_workers().is_empty()
    }

    /// Every role's parallel arrays are aligned
    pub fn vm_arrays_aligned(&self) -> bool {
        self.cloud_infra.control_planes.is_aligned()
            && self.cloud_infra.worker_planes.is_aligned()
            && self.cloud_infra.data_stores.is_aligned()
    }
}

/// Etcd `--initial-cluster` value: `infra<i>=https://<ip>:2380`, comma-joined.
pub fn etcd_member_list(private_ips: &[String]) -> String {
    private_ips
        .iter()
        .enumerate()
        .map(|(i, ip)| format!("infra{}=https://{}:2380", i, ip))
        .collect::<Vec<_>>()
        .join(",")
}

/// Client endpoints of the datastore, comma-joined.
pub fn datastore_endpoints(private_ips: &[String]) -> String {
    private_ips
        .iter()
        .map(|ip| format!("https://{}:2379", ip))
        .collect::<Vec<_>>()
        .join(",")
}

/// Shared handle to one cluster's state document.
///
/// The document lock only covers the in-memory change. Each change bumps a
/// revision and the copy taken under the lock is written afterwards; a write
/// whose revision is older than the last one persisted is dropped, so the
/// store never goes backwards.
#[derive(Clone)]
pub struct StateHandle {
    doc: Arc<Mutex<Revisioned>>,
    persisted: Arc<Mutex<u64>>,
    store: Arc<dyn Storage>,
}

struct Revisioned {
    doc: StateDocument,
    revision: u64,
}

impl Revisioned {
    fn bump(&mut self) -> (StateDocument, u64) {
        self.revision += 1;
        (self.doc.clone(), self.revision)
    }
}

impl StateHandle {
    /// Wrap a document and the store it persists to
    pub fn new(doc: StateDocument, store: Arc<dyn Storage>) -> Self {
        Self {
            doc: Arc::new(Mutex::new(Revisioned { doc, revision: 0 })),
            persisted: Arc::new(Mutex::new(0)),
            store,
        }
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    /// Copy of the current document
    pub async fn snapshot(&self) -> StateDocument {
        self.doc.lock().await.doc.clone()
    }

    /// Read from the document under the lock
    pub async fn read<R>(&self, f: impl FnOnce(&StateDocument) -> R) -> R {
        let inner = self.doc.lock().await;
        f(&inner.doc)
    }

    /// Mutate the document in place without persisting
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut StateDocument) -> R) -> R {
        let mut inner = self.doc.lock().await;
        f(&mut inner.doc)
    }

    async fn commit(&self, doc: StateDocument, revision: u64) -> Result<()> {
        let mut persisted = self.persisted.lock().await;
        if *persisted >= revision {
            debug!(cluster = %doc.cluster_name, revision, "newer state already persisted");
            return Ok(());
        }
        self.store.write(&doc).await?;
        *persisted = revision;
        debug!(cluster = %doc.cluster_name, revision, "state persisted");
        Ok(())
    }

    /// Mutate the document, then persist the result
    pub async fn update<R>(&self, f: impl FnOnce(&mut StateDocument) -> R) -> Result<R> {
        let (out, doc, revision) = {
            let mut inner = self.doc.lock().await;
            let out = f(&mut inner.doc);
            let (doc, revision) = inner.bump();
            (out, doc, revision)
        };
        self.commit(doc, revision).await?;
        Ok(out)
    }

    /// Fallible variant of [`StateHandle::update`]; nothing is written on error
    pub async fn try_update<R>(
        &self,
        f: impl FnOnce(&mut StateDocument) -> Result<R>,
    ) -> Result<R> {
        let (out, doc, revision) = {
            let mut inner = self.doc.lock().await;
            let out = f(&mut inner.doc)?;
            let (doc, revision) = inner.bump();
            (out, doc, revision)
        };
        self.commit(doc, revision).await?;
        Ok(out)
    }

    /// Persist the current document
    pub async fn persist(&self) -> Result<()> {
        let (doc, revision) = self.doc.lock().await.bump();
        self.commit(doc, revision).await
    }

    /// Replace the whole document (used when loading from the store)
    pub async fn replace(&self, doc: StateDocument) {
        self.doc.lock().await.doc = doc;
    }
}
