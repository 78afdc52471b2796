//! Cluster lifecycle: create, inspect, scale and delete.
//!
//! The controller drives a [`CloudFactory`] and a [`Bootstrap`] distribution
//! in phases. Every step it calls is idempotent against the state document, so
//! re-running `create` after a failure resumes where the last run stopped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiln_bootstrap::{distribution, Bootstrap, Remote};
use kiln_cloud::{all_required_ready, CloudFactory, Provisioner, VmSizes};
use kiln_common::config::Timing;
use kiln_common::credentials::CredentialsDocument;
use kiln_common::state::VmCollection;
use kiln_common::storage::{ClusterFilter, Storage, StorageExport};
use kiln_common::{
    BootstrapProvider, CloudProvider, ClusterKey, ClusterType, Cni, Error, ErrorKind, Operation,
    Result, Role, StateDocument, StateHandle,
};
use kiln_remote::ExecutorFactory;

use crate::connector::{resolve_credentials, CloudConnector};
use crate::phase::Phase;
use crate::request::ClusterRequest;

/// One row of `get`
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterSummary {
    /// Cluster name
    pub name: String,
    /// Provider region
    pub region: String,
    /// Cloud backend
    pub provider: CloudProvider,
    /// Self-managed or managed
    pub cluster_type: ClusterType,
    /// Kubernetes distribution
    pub bootstrap: BootstrapProvider,
    /// Installed distribution release
    pub version: String,
    /// Control plane count
    pub control_planes: usize,
    /// Worker count
    pub worker_planes: usize,
    /// Etcd member count
    pub data_stores: usize,
    /// Creation finished and every worker has joined
    pub ready: bool,
    /// Kubeconfig context
    pub context: String,
}

impl From<&StateDocument> for ClusterSummary {
    fn from(doc: &StateDocument) -> Self {
        let version = match doc.bootstrap_provider {
            BootstrapProvider::K3s => doc.versions.k3s.clone(),
            BootstrapProvider::Kubeadm => doc.versions.kubeadm.clone(),
            BootstrapProvider::Managed => String::new(),
        };
        Self {
            name: doc.cluster_name.clone(),
            region: doc.region.clone(),
            provider: doc.infra_provider,
            cluster_type: doc.cluster_type,
            bootstrap: doc.bootstrap_provider,
            version,
            control_planes: doc.cloud_infra.control_planes.len(),
            worker_planes: doc.cloud_infra.worker_planes.len(),
            data_stores: doc.cloud_infra.data_stores.len(),
            ready: doc.is_finished(),
            context: doc.cluster_kubeconfig_context.clone(),
        }
    }
}

/// A loaded cluster with a connected provider
struct Session {
    state: StateHandle,
    cloud: Box<dyn CloudFactory>,
}

async fn role_counts(state: &StateHandle) -> (usize, usize, usize) {
    state
        .read(|d| {
            (
                d.cloud_infra.control_planes.len(),
                d.cloud_infra.worker_planes.len(),
                d.cloud_infra.data_stores.len(),
            )
        })
        .await
}

/// Orchestrates provisioning and bootstrap of self-managed clusters
pub struct ClusterController {
    store: Arc<dyn Storage>,
    connector: Arc<dyn CloudConnector>,
    executors: Arc<dyn ExecutorFactory>,
    timing: Timing,
    cancel: CancellationToken,
}

impl ClusterController {
    /// Controller persisting to `store`, provisioning through `connector`
    /// and running scripts through `executors`
    pub fn new(
        store: Arc<dyn Storage>,
        connector: Arc<dyn CloudConnector>,
        executors: Arc<dyn ExecutorFactory>,
        timing: Timing,
    ) -> Self {
        Self {
            store,
            connector,
            executors,
            timing,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancellation observed by every wait
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn session(&self, doc: StateDocument, sizes: VmSizes) -> Result<Session> {
        let credentials = resolve_credentials(self.store.as_ref(), doc.infra_provider).await?;
        let client = self.connector.connect(&credentials)?;
        let state = StateHandle::new(doc, self.store.clone());
        let cloud = Provisioner::new(client, state.clone(), self.timing)
            .with_sizes(sizes)
            .with_cancel(self.cancel.clone());
        cloud.init_client().await?;
        Ok(Session {
            state,
            cloud: Box::new(cloud),
        })
    }

    fn bootstrap(&self, session: &Session, provider: BootstrapProvider) -> Result<Box<dyn Bootstrap>> {
        distribution(
            provider,
            session.state.clone(),
            Remote::new(self.executors.clone()),
        )
    }

    async fn pause(&self, duration: Duration, what: &str) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled(what)),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Create a cluster, or resume one whose earlier run failed
    pub async fn create(&self, request: &ClusterRequest) -> Result<StateDocument> {
        request.validate()?;
        let key = request.key();

        let doc = match self.store.read(&key).await {
            Ok(doc) if doc.is_finished() => {
                return Err(Error::duplicate(format!("cluster {} already exists", key)));
            }
            Ok(doc) => {
                if doc.bootstrap_provider != request.bootstrap {
                    return Err(Error::validation_for_field(
                        "distribution",
                        format!(
                            "cluster {} was started with {}, not {}",
                            key, doc.bootstrap_provider, request.bootstrap
                        ),
                    ));
                }
                info!(cluster = %request.name, provider = %request.provider, "resuming cluster from stored state");
                doc
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let mut doc = StateDocument::new(&key, request.bootstrap);
                doc.cloud_infra.control_planes = VmCollection::with_len(request.control_planes);
                doc.cloud_infra.worker_planes = VmCollection::with_len(request.worker_planes);
                doc.cloud_infra.data_stores = VmCollection::with_len(request.data_stores);
                doc.addons.cni = Cni::parse(&request.cni);
                doc
            }
            Err(e) => return Err(e),
        };
        info!(
            cluster = %request.name,
            provider = %request.provider,
            region = %request.region,
            distribution = %request.bootstrap,
            "creating cluster"
        );

        let session = self.session(doc, request.sizes.clone()).await?;
        session.cloud.is_valid_region(&request.region).await?;
        for size in request.distinct_sizes() {
            session.cloud.is_valid_vm_size(&size).await?;
        }
        if !request.version.is_empty() {
            session
                .cloud
                .is_valid_version(request.bootstrap, &request.version)?;
        }
        session.state.persist().await?;

        self.provision(&session).await?;
        let bootstrap = self.bootstrap(&session, request.bootstrap)?;
        self.bootstrap_cluster(&session, bootstrap.as_ref(), request)
            .await?;

        let doc = session.state.snapshot().await;
        info!(cluster = %request.name, context = %doc.cluster_kubeconfig_context, "cluster created");
        Ok(doc)
    }

    async fn provision(&self, session: &Session) -> Result<()> {
        let cloud = session.cloud.as_ref();
        cloud.new_network().await?;
        cloud.create_upload_ssh_key_pair().await?;
        for role in [
            Role::ControlPlane,
            Role::WorkerPlane,
            Role::DataStore,
            Role::LoadBalancer,
        ] {
            cloud.new_firewall(role).await?;
        }

        let (cps, wps, dss) = role_counts(&session.state).await;
        let mut vms = Phase::new("provision vms");
        vms.push("loadbalancer", cloud.new_vm(Role::LoadBalancer, 0));
        for i in 0..dss {
            vms.push(format!("datastore {}", i), cloud.new_vm(Role::DataStore, i));
        }
        for i in 0..cps {
            vms.push(format!("controlplane {}", i), cloud.new_vm(Role::ControlPlane, i));
        }
        for i in 0..wps {
            vms.push(format!("workerplane {}", i), cloud.new_vm(Role::WorkerPlane, i));
        }
        vms.run().await?;
        Self::require_completed(&session.state).await
    }

    async fn require_completed(state: &StateHandle) -> Result<()> {
        let completed = state
            .try_update(|d| {
                d.cloud_infra.is_completed = all_required_ready(&d.cloud_infra);
                Ok(d.cloud_infra.is_completed)
            })
            .await?;
        if !completed {
            return Err(Error::state(
                "provisioning finished but some vms have no addresses",
            ));
        }
        Ok(())
    }

    async fn bootstrap_cluster(
        &self,
        session: &Session,
        bootstrap: &dyn Bootstrap,
        request: &ClusterRequest,
    ) -> Result<()> {
        bootstrap.setup_base(Operation::Create).await?;

        let (cps, wps, dss) = role_counts(&session.state).await;
        let mut infra = Phase::new("datastores and load balancer");
        infra.push("loadbalancer", bootstrap.configure_loadbalancer());
        for i in 0..dss {
            infra.push(format!("datastore {}", i), bootstrap.configure_datastore(i));
        }
        infra.run().await?;

        bootstrap.setup(Operation::Create).await?;
        bootstrap.cni(&request.cni).await?;
        bootstrap.k8s_version(&request.version).await?;
        bootstrap.configure_control_plane(0).await?;

        let mut nodes = Phase::new("join nodes");
        for i in 1..cps {
            nodes.push(
                format!("controlplane {}", i),
                bootstrap.configure_control_plane(i),
            );
        }
        for i in 0..wps {
            nodes.push(format!("workerplane {}", i), bootstrap.join_worker_plane(i));
        }
        nodes.run().await?;
        session
            .state
            .update(|d| d.k8s_bootstrap.joined_worker_planes = wps)
            .await
    }

    /// Summaries of the clusters the filter selects
    pub async fn get(&self, filter: &ClusterFilter) -> Result<Vec<ClusterSummary>> {
        let groups = self.store.get_one_or_more_clusters(filter).await?;
        Ok(groups
            .values()
            .flatten()
            .filter(|d| filter.matches_identity(d))
            .map(ClusterSummary::from)
            .collect())
    }

    /// Tear down every resource of a cluster and remove its record
    pub async fn delete(&self, key: &ClusterKey) -> Result<()> {
        let doc = self.store.read(key).await?;
        info!(cluster = %key.name, provider = %key.provider, region = %key.region, "deleting cluster");
        let session = self.session(doc, VmSizes::default()).await?;
        let cloud = session.cloud.as_ref();

        let (cps, wps, dss) = role_counts(&session.state).await;
        let mut vms = Phase::new("delete vms");
        vms.push("loadbalancer", cloud.del_vm(Role::LoadBalancer, 0));
        for i in 0..dss {
            vms.push(format!("datastore {}", i), cloud.del_vm(Role::DataStore, i));
        }
        for i in 0..cps {
            vms.push(format!("controlplane {}", i), cloud.del_vm(Role::ControlPlane, i));
        }
        for i in 0..wps {
            vms.push(format!("workerplane {}", i), cloud.del_vm(Role::WorkerPlane, i));
        }
        vms.run().await?;

        info!(cluster = %key.name, "waiting for the provider to release firewalls");
        self.pause(self.timing.firewall_teardown, "firewall teardown")
            .await?;
        for role in [
            Role::DataStore,
            Role::ControlPlane,
            Role::WorkerPlane,
            Role::LoadBalancer,
        ] {
            cloud.del_firewall(role).await?;
        }
        cloud.del_ssh_key_pair().await?;
        cloud.del_network().await?;

        info!(cluster = %key.name, "cluster deleted");
        Ok(())
    }

    async fn load_ready(&self, key: &ClusterKey) -> Result<StateDocument> {
        let doc = self.store.read(key).await?;
        if doc.cluster_kubeconfig.is_empty() {
            return Err(Error::state(format!(
                "cluster {} is not fully created; run create again to resume it",
                key
            )));
        }
        Ok(doc)
    }

    /// Provision `count` more workers and join them to a finished cluster.
    ///
    /// Worker slots left unjoined by an earlier failed run are provisioned
    /// and joined first. Without a size the new workers match the existing ones.
    pub async fn add_workers(
        &self,
        key: &ClusterKey,
        count: usize,
        size: Option<String>,
    ) -> Result<StateDocument> {
        if count == 0 {
            return Err(Error::validation_for_field("count", "add at least one worker"));
        }
        let doc = self.load_ready(key).await?;
        let pending = doc.pending_workers();
        let target = pending.end + count;
        let size = size
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                let infra = &doc.cloud_infra;
                infra
                    .worker_planes
                    .vm_sizes
                    .iter()
                    .chain(&infra.control_planes.vm_sizes)
                    .find(|s| !s.is_empty())
                    .cloned()
            })
            .ok_or_else(|| {
                Error::validation_for_field("vm_size", "no instance size given for new workers")
            })?;
        let provider = doc.bootstrap_provider;
        if !pending.is_empty() {
            info!(cluster = %key.name, pending = pending.len(), "resuming workers left by an earlier run");
        }
        info!(cluster = %key.name, count, size = %size, "adding workers");

        let sizes = VmSizes {
            worker_plane: size.clone(),
            ..Default::default()
        };
        let session = self.session(doc, sizes).await?;
        session.cloud.is_valid_vm_size(&size).await?;
        session
            .state
            .update(|d| {
                d.cloud_infra.worker_planes.resize(target);
                d.cloud_infra.is_completed = false;
            })
            .await?;

        let cloud = session.cloud.as_ref();
        let mut vms = Phase::new("provision workers");
        for i in pending.start..target {
            vms.push(format!("workerplane {}", i), cloud.new_vm(Role::WorkerPlane, i));
        }
        vms.run().await?;
        Self::require_completed(&session.state).await?;

        let bootstrap = self.bootstrap(&session, provider)?;
        bootstrap.setup_base(Operation::Create).await?;
        bootstrap.setup(Operation::Get).await?;
        let mut joins = Phase::new("join workers");
        for i in pending.start..target {
            joins.push(format!("workerplane {}", i), bootstrap.join_worker_plane(i));
        }
        joins.run().await?;
        session
            .state
            .update(|d| d.k8s_bootstrap.joined_worker_planes = target)
            .await?;

        info!(cluster = %key.name, workers = target, "workers added");
        Ok(session.state.snapshot().await)
    }

    /// Drain and delete the last `count` workers of a finished cluster
    pub async fn del_workers(&self, key: &ClusterKey, count: usize) -> Result<StateDocument> {
        if count == 0 {
            return Err(Error::validation_for_field("count", "remove at least one worker"));
        }
        let doc = self.load_ready(key).await?;
        let current = doc.cloud_infra.worker_planes.len();
        if count > current {
            return Err(Error::validation_for_field(
                "count",
                format!("cluster {} has only {} workers", key, current),
            ));
        }
        let keep = current - count;
        let hostnames: Vec<String> = doc.cloud_infra.worker_planes.hostnames[keep..]
            .iter()
            .filter(|h| !h.is_empty())
            .cloned()
            .collect();
        let provider = doc.bootstrap_provider;
        info!(cluster = %key.name, count, "removing workers");

        let session = self.session(doc, VmSizes::default()).await?;
        let bootstrap = self.bootstrap(&session, provider)?;
        bootstrap.setup_base(Operation::Get).await?;
        bootstrap.remove_worker_planes(&hostnames).await?;

        let cloud = session.cloud.as_ref();
        let mut vms = Phase::new("delete workers");
        for i in keep..current {
            vms.push(format!("workerplane {}", i), cloud.del_vm(Role::WorkerPlane, i));
        }
        vms.run().await?;

        session
            .state
            .update(|d| {
                d.cloud_infra.worker_planes.resize(keep);
                let joined = &mut d.k8s_bootstrap.joined_worker_planes;
                *joined = (*joined).min(keep);
                let base = &mut d.k8s_bootstrap.base;
                base.public_ips.worker_planes.truncate(keep);
                base.private_ips.worker_planes.truncate(keep);
                d.cloud_infra.is_completed = all_required_ready(&d.cloud_infra);
            })
            .await?;
        if !session.state.read(|d| d.cloud_infra.is_completed).await {
            warn!(cluster = %key.name, "remaining vms are missing addresses");
        }

        info!(cluster = %key.name, workers = keep, "workers removed");
        Ok(session.state.snapshot().await)
    }

    /// Context name and admin kubeconfig of a finished cluster
    pub async fn kubeconfig(&self, key: &ClusterKey) -> Result<(String, String)> {
        let doc = self.store.read(key).await?;
        if doc.cluster_kubeconfig.is_empty() {
            return Err(Error::not_found(format!("cluster {} has no kubeconfig yet", key)));
        }
        Ok((doc.cluster_kubeconfig_context, doc.cluster_kubeconfig))
    }

    /// Store the provider credentials found in the environment
    pub async fn save_credentials(&self, provider: CloudProvider) -> Result<()> {
        let creds = CredentialsDocument::from_env(provider)?;
        self.store.write_credentials(&creds).await?;
        info!(provider = %provider, "credentials saved");
        Ok(())
    }

    /// Clusters and credentials selected by the filter
    pub async fn export(&self, filter: &ClusterFilter) -> Result<StorageExport> {
        self.store.export(filter).await
    }

    /// Write every document of an export bundle
    pub async fn import(&self, bundle: &StorageExport) -> Result<()> {
        self.store.import(bundle).await?;
        info!(
            clusters = bundle.clusters.len(),
            credentials = bundle.credentials.len(),
            "import complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use kiln_cloud::rules::PortRange;
    use kiln_cloud::{vm_name, CloudClient, MemoryCloud};
    use kiln_common::credentials::CivoCredentials;
    use kiln_common::storage::LocalStore;
    use kiln_remote::{ConnectionRequest, RemoteExecutor, SshExecutorFactory};
    use tempfile::TempDir;

    use super::*;
    use crate::connector::MockCloudConnector;
    use crate::request::request;

    struct SharedCloud(Arc<MemoryCloud>);

    impl CloudConnector for SharedCloud {
        fn connect(&self, _credentials: &CredentialsDocument) -> Result<Arc<dyn CloudClient>> {
            Ok(self.0.clone())
        }
    }

    /// Fake executors that fail the first run of one named script
    #[derive(Clone)]
    struct FailOnce {
        inner: SshExecutorFactory,
        script: &'static str,
        armed: Arc<AtomicBool>,
    }

    impl FailOnce {
        fn new(script: &'static str) -> Self {
            Self {
                inner: SshExecutorFactory::new(Timing::fake(), true),
                script,
                armed: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    struct FailOnceExecutor {
        inner: Box<dyn RemoteExecutor>,
        script: &'static str,
        armed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RemoteExecutor for FailOnceExecutor {
        async fn execute(&mut self, request: ConnectionRequest) -> Result<()> {
            let hit = request.scripts.names().iter().any(|n| n == self.script);
            if hit && self.armed.swap(false, Ordering::SeqCst) {
                return Err(Error::remote_command(&request.host, self.script, "exit status 1"));
            }
            self.inner.execute(request).await
        }

        fn take_output(&mut self) -> Vec<String> {
            self.inner.take_output()
        }
    }

    impl ExecutorFactory for FailOnce {
        fn executor(&self) -> Box<dyn RemoteExecutor> {
            Box::new(FailOnceExecutor {
                inner: self.inner.executor(),
                script: self.script,
                armed: self.armed.clone(),
            })
        }
    }

    fn controller_with(
        cloud: MemoryCloud,
        executors: Arc<dyn ExecutorFactory>,
    ) -> (TempDir, Arc<MemoryCloud>, ClusterController) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Storage> = Arc::new(LocalStore::new(dir.path()));
        let cloud = Arc::new(cloud);
        let controller = ClusterController::new(
            store,
            Arc::new(SharedCloud(cloud.clone())),
            executors,
            Timing::fake(),
        );
        (dir, cloud, controller)
    }

    fn controller(cloud: MemoryCloud) -> (TempDir, Arc<MemoryCloud>, ClusterController) {
        controller_with(cloud, Arc::new(SshExecutorFactory::new(Timing::fake(), true)))
    }

    fn local() -> MemoryCloud {
        MemoryCloud::new(CloudProvider::Local)
    }

    #[tokio::test]
    async fn k3s_cluster_is_created_end_to_end() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);

        let doc = c.create(&r).await.unwrap();
        assert_eq!(cloud.instance_count(), 8);
        assert_eq!(cloud.firewall_count(), 4);
        assert!(doc.cloud_infra.is_completed);
        assert_eq!(doc.versions.k3s, BootstrapProvider::K3s.default_version());
        assert!(!doc.versions.etcd.is_empty());
        assert!(!doc.versions.haproxy.is_empty());
        assert!(!doc.k8s_bootstrap.base.ca_cert.is_empty());
        assert!(!doc.k8s_bootstrap.k3s.as_ref().unwrap().token.is_empty());
        assert_eq!(doc.cluster_kubeconfig_context, doc.cluster_context_name());
        assert!(doc
            .cluster_kubeconfig
            .contains(&format!("https://{}:6443", doc.cloud_infra.load_balancer.public_ip)));
    }

    #[tokio::test]
    async fn kubeadm_cluster_records_join_material() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::Kubeadm);

        let doc = c.create(&r).await.unwrap();
        assert_eq!(cloud.instance_count(), 8);
        let kubeadm = doc.k8s_bootstrap.kubeadm.as_ref().unwrap();
        assert!(!kubeadm.bootstrap_token.is_empty());
        assert!(kubeadm.discovery_token_ca_cert_hash.starts_with("sha256:"));
        assert!(!doc.cluster_kubeconfig.is_empty());
    }

    #[tokio::test]
    async fn finished_cluster_cannot_be_created_twice() {
        let (_dir, _cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        c.create(&r).await.unwrap();

        let err = c.create(&r).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
    }

    #[tokio::test]
    async fn failed_create_resumes_without_duplicating_resources() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        let failing = vm_name("demo", Role::WorkerPlane, 0);
        cloud.fail_instance(failing.clone());

        assert!(c.create(&r).await.is_err());
        assert_eq!(cloud.instance_count(), 7);
        let stored = c.store.read(&r.key()).await.unwrap();
        assert!(!stored.cloud_infra.is_completed);
        assert!(stored.cluster_kubeconfig.is_empty());

        cloud.recover_instance(&failing);
        let doc = c.create(&r).await.unwrap();
        assert_eq!(cloud.instance_count(), 8);
        assert_eq!(cloud.calls("create_network"), 1);
        assert!(!doc.cluster_kubeconfig.is_empty());
    }

    #[tokio::test]
    async fn failed_worker_join_is_finished_by_the_next_create() {
        let (_dir, cloud, c) = controller_with(local(), Arc::new(FailOnce::new("k3s-agent")));
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);

        assert!(c.create(&r).await.is_err());
        let before = c.store.read(&r.key()).await.unwrap();
        assert!(!before.is_finished());
        assert_eq!(before.pending_workers(), 0..1);
        let created = cloud.calls("create_instance");

        let doc = c.create(&r).await.unwrap();
        assert_eq!(cloud.calls("create_instance"), created);
        assert_eq!(cloud.instance_count(), 8);
        assert_eq!(doc.k8s_bootstrap.base.ca_cert, before.k8s_bootstrap.base.ca_cert);
        assert_eq!(doc.k8s_bootstrap.base.etcd_key, before.k8s_bootstrap.base.etcd_key);
        assert_eq!(doc.k8s_bootstrap.k3s, before.k8s_bootstrap.k3s);
        assert!(doc.is_finished());
        assert!(!doc.cluster_kubeconfig.is_empty());
    }

    #[tokio::test]
    async fn failed_datastore_script_resumes_with_the_same_material() {
        let (_dir, cloud, c) = controller_with(local(), Arc::new(FailOnce::new("etcd-start")));
        let r = request(CloudProvider::Local, BootstrapProvider::Kubeadm);

        assert!(c.create(&r).await.is_err());
        let before = c.store.read(&r.key()).await.unwrap();
        assert!(before.cloud_infra.is_completed);
        assert!(!before.k8s_bootstrap.base.ca_cert.is_empty());
        assert!(before.cluster_kubeconfig.is_empty());
        let created = cloud.calls("create_instance");
        let networks = cloud.calls("create_network");

        let doc = c.create(&r).await.unwrap();
        assert_eq!(cloud.calls("create_instance"), created);
        assert_eq!(cloud.calls("create_network"), networks);
        assert_eq!(doc.k8s_bootstrap.base.ca_cert, before.k8s_bootstrap.base.ca_cert);
        assert_eq!(doc.k8s_bootstrap.base.etcd_cert, before.k8s_bootstrap.base.etcd_cert);
        assert_eq!(doc.ssh_key_pair, before.ssh_key_pair);
        let kubeadm = doc.k8s_bootstrap.kubeadm.as_ref().unwrap();
        assert!(kubeadm.discovery_token_ca_cert_hash.starts_with("sha256:"));
        assert!(doc.is_finished());
    }

    #[tokio::test]
    async fn firewalls_follow_the_requested_network_plugin() {
        let (_dir, cloud, c) = controller(local());
        let mut r = request(CloudProvider::Local, BootstrapProvider::K3s);
        r.cni = "calico".into();

        let doc = c.create(&r).await.unwrap();
        assert_eq!(doc.addons.cni, Cni::Other("calico".into()));
        for fw in ["demo-fw-cp", "demo-fw-wp"] {
            let ports = cloud.firewall_ports(fw);
            assert!(!ports.is_empty());
            assert!(!ports.contains(&PortRange::single(8472)), "{} opens vxlan", fw);
        }

        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        c.create(&r).await.unwrap();
        assert!(cloud.firewall_ports("demo-fw-wp").contains(&PortRange::single(8472)));
    }

    #[tokio::test]
    async fn resume_with_another_distribution_is_rejected() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        cloud.fail_instance(vm_name("demo", Role::LoadBalancer, 0));
        assert!(c.create(&r).await.is_err());

        let other = request(CloudProvider::Local, BootstrapProvider::Kubeadm);
        let err = c.create(&other).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_provider() {
        let (_dir, cloud, c) = controller(local());
        let mut r = request(CloudProvider::Local, BootstrapProvider::K3s);
        r.control_planes = 2;
        assert!(c.create(&r).await.is_err());
        assert_eq!(cloud.calls("verify_credentials"), 0);

        let mut r = request(CloudProvider::Local, BootstrapProvider::K3s);
        r.region = "mars-1".into();
        let err = c.create(&r).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(cloud.calls("create_network"), 0);
    }

    #[tokio::test]
    async fn rejected_credentials_stop_before_provisioning() {
        let (_dir, cloud, c) = controller(local().with_rejected_credentials());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        let err = c.create(&r).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert_eq!(cloud.network_count(), 0);
    }

    #[tokio::test]
    async fn connection_failure_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Storage> = Arc::new(LocalStore::new(dir.path()));
        let mut connector = MockCloudConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(Error::provider_permanent("civo", "no API client")));
        let c = ClusterController::new(
            store.clone(),
            Arc::new(connector),
            Arc::new(SshExecutorFactory::new(Timing::fake(), true)),
            Timing::fake(),
        );

        let mut r = request(CloudProvider::Civo, BootstrapProvider::K3s);
        r.region = "LON1".into();
        r.sizes = VmSizes::uniform("g4s.kube.small");
        store
            .write_credentials(&CredentialsDocument::Civo(CivoCredentials {
                token: "token".into(),
            }))
            .await
            .unwrap();
        assert!(c.create(&r).await.is_err());
        let err = store.read(&r.key()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn delete_removes_every_resource_and_the_record() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        c.create(&r).await.unwrap();

        c.delete(&r.key()).await.unwrap();
        assert_eq!(cloud.instance_count(), 0);
        assert_eq!(cloud.firewall_count(), 0);
        assert_eq!(cloud.network_count(), 0);
        let err = c.store.read(&r.key()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn workers_are_added_and_removed() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        c.create(&r).await.unwrap();

        let doc = c.add_workers(&r.key(), 2, None).await.unwrap();
        assert_eq!(cloud.instance_count(), 10);
        assert_eq!(doc.cloud_infra.worker_planes.len(), 3);
        assert_eq!(doc.k8s_bootstrap.base.public_ips.worker_planes.len(), 3);
        assert_eq!(doc.cloud_infra.worker_planes.vm_sizes[2], "small");
        assert!(doc.cloud_infra.is_completed);

        let doc = c.del_workers(&r.key(), 2).await.unwrap();
        assert_eq!(cloud.instance_count(), 8);
        assert_eq!(doc.cloud_infra.worker_planes.len(), 1);
        assert!(doc.cloud_infra.worker_planes.is_aligned());
        assert_eq!(doc.k8s_bootstrap.base.private_ips.worker_planes.len(), 1);
        assert!(doc.cloud_infra.is_completed);

        let err = c.del_workers(&r.key(), 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn failed_worker_add_is_resumed_by_the_next_add() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        c.create(&r).await.unwrap();
        let failing = vm_name("demo", Role::WorkerPlane, 1);
        cloud.fail_instance(failing.clone());

        assert!(c.add_workers(&r.key(), 2, None).await.is_err());
        let stored = c.store.read(&r.key()).await.unwrap();
        assert_eq!(stored.pending_workers(), 1..3);
        assert!(stored.cloud_infra.worker_planes.vm_ids[1].is_empty());
        assert_eq!(cloud.instance_count(), 9);

        cloud.recover_instance(&failing);
        let doc = c.add_workers(&r.key(), 1, None).await.unwrap();
        assert_eq!(doc.cloud_infra.worker_planes.len(), 4);
        assert!(doc.cloud_infra.worker_planes.vm_ids.iter().all(|id| !id.is_empty()));
        assert_eq!(doc.k8s_bootstrap.base.public_ips.worker_planes.len(), 4);
        assert_eq!(cloud.instance_count(), 11);
        assert!(doc.pending_workers().is_empty());
        assert!(doc.is_finished());
    }

    #[tokio::test]
    async fn scaling_needs_a_finished_cluster() {
        let (_dir, cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        cloud.fail_instance(vm_name("demo", Role::ControlPlane, 2));
        assert!(c.create(&r).await.is_err());

        let err = c.add_workers(&r.key(), 1, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(c.kubeconfig(&r.key()).await.is_err());
    }

    #[tokio::test]
    async fn teardown_pause_stops_on_cancellation() {
        let (_dir, _cloud, c) = controller(local());
        let cancel = CancellationToken::new();
        let c = c.with_cancel(cancel.clone());
        cancel.cancel();

        let err = c
            .pause(Duration::from_secs(30), "firewall teardown")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        c.pause(Duration::ZERO, "nothing").await.unwrap();
    }

    #[tokio::test]
    async fn get_lists_clusters_with_their_progress() {
        let (_dir, _cloud, c) = controller(local());
        let r = request(CloudProvider::Local, BootstrapProvider::K3s);
        c.create(&r).await.unwrap();

        let rows = c.get(&ClusterFilter::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "demo");
        assert_eq!(rows[0].control_planes, 3);
        assert!(rows[0].ready);

        let (context, kubeconfig) = c.kubeconfig(&r.key()).await.unwrap();
        assert_eq!(context, rows[0].context);
        assert!(kubeconfig.contains(&context));
    }
}
