//! Identity enums shared by every crate and the input validators around them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum length of a cluster or resource name
pub const MAX_NAME_LEN: usize = 50;

/// Cloud backend a cluster lives on
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Civo
    Civo,
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// Simulated provider backed by memory
    #[default]
    Local,
}

impl CloudProvider {
    /// Every provider, in the order stores enumerate them
    pub const ALL: [CloudProvider; 4] = [
        CloudProvider::Civo,
        CloudProvider::Aws,
        CloudProvider::Azure,
        CloudProvider::Local,
    ];

    /// Lowercase identifier used in paths and state
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Civo => "civo",
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Local => "local",
        }
    }
}

/// Whether the cluster is built from VMs or delegated to a managed offering
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// Self-managed, highly available
    #[default]
    Ha,
    /// Provider-managed
    Managed,
}

impl ClusterType {
    /// Both cluster types
    pub const ALL: [ClusterType; 2] = [ClusterType::Managed, ClusterType::Ha];

    /// Lowercase identifier used in paths and state
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Ha => "ha",
            ClusterType::Managed => "managed",
        }
    }
}

/// Kubernetes distribution installed on the VMs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapProvider {
    /// Rancher k3s
    #[default]
    K3s,
    /// Upstream kubeadm
    Kubeadm,
    /// Provider-managed control plane
    Managed,
}

impl BootstrapProvider {
    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapProvider::K3s => "k3s",
            BootstrapProvider::Kubeadm => "kubeadm",
            BootstrapProvider::Managed => "managed",
        }
    }

    /// Releases the distribution can install, newest first
    pub fn supported_versions(&self) -> &'static [&'static str] {
        match self {
            BootstrapProvider::K3s => &["v1.30.3+k3s1", "v1.29.7+k3s1", "v1.28.12+k3s1"],
            BootstrapProvider::Kubeadm => &["v1.30", "v1.29", "v1.28"],
            BootstrapProvider::Managed => &[],
        }
    }

    /// Release installed when none is requested
    pub fn default_version(&self) -> &'static str {
        self.supported_versions().first().copied().unwrap_or_default()
    }

    /// Check a requested release against [`BootstrapProvider::supported_versions`]
    pub fn validate_version(&self, version: &str) -> Result<()> {
        if self.supported_versions().contains(&version) {
            return Ok(());
        }
        Err(Error::validation_for_field(
            "version",
            format!(
                "{} does not support version '{}' (supported: {})",
                self,
                version,
                self.supported_versions().join(", ")
            ),
        ))
    }
}

/// The four node classes a self-managed cluster is made of
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Kubernetes control plane
    #[serde(rename = "controlplane")]
    ControlPlane,
    /// Kubernetes worker
    #[serde(rename = "workerplane")]
    WorkerPlane,
    /// External etcd member
    DataStore,
    /// HAProxy in front of the API servers
    LoadBalancer,
}

impl Role {
    /// Lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ControlPlane => "controlplane",
            Role::WorkerPlane => "workerplane",
            Role::DataStore => "datastore",
            Role::LoadBalancer => "loadbalancer",
        }
    }

    /// Abbreviation used in provider resource names
    pub fn short(&self) -> &'static str {
        match self {
            Role::ControlPlane => "cp",
            Role::WorkerPlane => "wp",
            Role::DataStore => "ds",
            Role::LoadBalancer => "lb",
        }
    }
}

/// Lifecycle operation the state is being initialised for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Create or resume
    Create,
    /// Read-only
    Get,
    /// Tear down
    Delete,
}

/// Container network plugin requested for the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cni {
    /// Flannel, bundled with k3s
    #[default]
    Flannel,
    /// Cilium, installed after bootstrap
    Cilium,
    /// No plugin from the distribution; installed externally
    None,
    /// Any other plugin name
    #[serde(untagged)]
    Other(String),
}

impl Cni {
    /// Parse a user supplied plugin name; empty selects the default
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "" | "flannel" => Cni::Flannel,
            "cilium" => Cni::Cilium,
            "none" => Cni::None,
            other => Cni::Other(other.to_string()),
        }
    }
}

macro_rules! display_and_parse {
    ($ty:ty, $what:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let s = s.trim().to_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| Error::validation_for_field($what, format!("invalid {} '{}'", $what, s)))
            }
        }
    };
}

display_and_parse!(
    CloudProvider,
    "provider",
    [CloudProvider::Civo, CloudProvider::Aws, CloudProvider::Azure, CloudProvider::Local]
);
display_and_parse!(ClusterType, "cluster type", [ClusterType::Ha, ClusterType::Managed]);
display_and_parse!(
    BootstrapProvider,
    "distribution",
    [BootstrapProvider::K3s, BootstrapProvider::Kubeadm, BootstrapProvider::Managed]
);
display_and_parse!(
    Role,
    "role",
    [Role::ControlPlane, Role::WorkerPlane, Role::DataStore, Role::LoadBalancer]
);

/// Validate a cluster or resource name.
///
/// Lowercase alphanumerics and `-`, starting with a letter, at most
/// [`MAX_NAME_LEN`] characters.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            "name",
            format!(
                "'{}' must be lowercase alphanumerics or '-', start with a letter, at most {} chars",
                name, MAX_NAME_LEN
            ),
        ))
    }
}

/// Control-plane and datastore counts must be odd and at least 3
pub fn validate_quorum_count(role: Role, count: usize) -> Result<()> {
    if count >= 3 && count % 2 == 1 {
        Ok(())
    } else {
        Err(Error::validation_for_field(
            role.as_str(),
            format!("{} count must be odd and >= 3, got {}", role, count),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_parse_from_their_identifiers() {
        assert_eq!("controlplane".parse::<Role>().unwrap(), Role::ControlPlane);
        assert_eq!("LoadBalancer".parse::<Role>().unwrap(), Role::LoadBalancer);
        assert!("gateway".parse::<Role>().is_err());
    }

    #[test]
    fn role_serde_matches_display() {
        let json = serde_json::to_string(&Role::WorkerPlane).unwrap();
        assert_eq!(json, "\"workerplane\"");
        let json = serde_json::to_string(&Role::DataStore).unwrap();
        assert_eq!(json, "\"datastore\"");
    }

    #[test]
    fn cni_defaults_to_flannel() {
        assert_eq!(Cni::parse(""), Cni::Flannel);
        assert_eq!(Cni::parse("Cilium"), Cni::Cilium);
        assert_eq!(Cni::parse("calico"), Cni::Other("calico".to_string()));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_name("demo-1").is_ok());
        assert!(validate_name("Demo").is_err());
        assert!(validate_name("1demo").is_err());
        assert!(validate_name("demo_1").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn quorum_counts_must_be_odd_and_at_least_three() {
        assert!(validate_quorum_count(Role::ControlPlane, 3).is_ok());
        assert!(validate_quorum_count(Role::DataStore, 5).is_ok());
        assert!(validate_quorum_count(Role::ControlPlane, 1).is_err());
        assert!(validate_quorum_count(Role::DataStore, 4).is_err());
    }

    #[test]
    fn versions_are_checked_per_distribution() {
        assert_eq!(BootstrapProvider::K3s.default_version(), "v1.30.3+k3s1");
        assert_eq!(BootstrapProvider::Kubeadm.default_version(), "v1.30");
        assert!(BootstrapProvider::Kubeadm.validate_version("v1.29").is_ok());
        assert!(BootstrapProvider::K3s.validate_version("v1.29").is_err());
        assert!(BootstrapProvider::Managed.validate_version("v1.30").is_err());
    }
}
