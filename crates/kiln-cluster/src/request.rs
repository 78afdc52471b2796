//! What the caller asks for when creating a cluster.

use std::collections::BTreeSet;

use kiln_cloud::VmSizes;
use kiln_common::types::{validate_name, validate_quorum_count};
use kiln_common::{
    BootstrapProvider, CloudProvider, ClusterKey, ClusterType, Error, Result, Role,
};

/// A self-managed HA cluster to create or resume
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRequest {
    /// Cloud to provision in
    pub provider: CloudProvider,
    /// Cluster name
    pub name: String,
    /// Provider region
    pub region: String,
    /// Kubernetes distribution
    pub bootstrap: BootstrapProvider,
    /// Control plane count, odd and at least 3
    pub control_planes: usize,
    /// Worker count
    pub worker_planes: usize,
    /// Etcd member count, odd and at least 3
    pub data_stores: usize,
    /// Instance size per role
    pub sizes: VmSizes,
    /// Distribution release; empty picks the default
    pub version: String,
    /// Network plugin; empty picks the distribution default
    pub cni: String,
}

impl ClusterRequest {
    /// Storage key of the cluster
    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(self.provider, ClusterType::Ha, &self.name, &self.region)
    }

    /// Distinct instance sizes across roles
    pub fn distinct_sizes(&self) -> BTreeSet<String> {
        [
            Role::ControlPlane,
            Role::WorkerPlane,
            Role::DataStore,
            Role::LoadBalancer,
        ]
        .into_iter()
        .map(|r| self.sizes.get(r).to_string())
        .collect()
    }

    /// Checks that need no provider
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.region.trim().is_empty() {
            return Err(Error::validation_for_field("region", "region is required"));
        }
        if self.bootstrap == BootstrapProvider::Managed {
            return Err(Error::validation_for_field(
                "distribution",
                "self-managed clusters need the k3s or kubeadm distribution",
            ));
        }
        validate_quorum_count(Role::ControlPlane, self.control_planes)?;
        validate_quorum_count(Role::DataStore, self.data_stores)?;
        for role in [
            Role::ControlPlane,
            Role::WorkerPlane,
            Role::DataStore,
            Role::LoadBalancer,
        ] {
            if self.sizes.get(role).trim().is_empty() {
                return Err(Error::validation_for_field(
                    "vm_size",
                    format!("no instance size given for {}", role),
                ));
            }
        }
        if !self.version.is_empty() {
            self.bootstrap.validate_version(&self.version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn request(provider: CloudProvider, bootstrap: BootstrapProvider) -> ClusterRequest {
    ClusterRequest {
        provider,
        name: "demo".to_string(),
        region: "local".to_string(),
        bootstrap,
        control_planes: 3,
        worker_planes: 1,
        data_stores: 3,
        sizes: VmSizes::uniform("small"),
        version: String::new(),
        cni: String::new(),
    }
}
