//! Kubernetes bootstrap for kiln
//!
//! Turns provisioned VMs into a cluster over SSH: an external etcd datastore,
//! an HAProxy load balancer, then the control planes and workers of the
//! selected [`Bootstrap`] distribution. Every step records its results in the
//! state document before returning.

#![deny(missing_docs)]

pub mod certs;
pub mod distro;
pub mod k3s;
pub mod kubeadm;
pub mod kubeconfig;
pub mod prebootstrap;
pub mod remote;
pub mod render;

pub use certs::{generate_etcd_certs, EtcdCerts};
pub use distro::{distribution, Bootstrap};
pub use k3s::K3s;
pub use kubeadm::Kubeadm;
pub use kubeconfig::rewrite_kubeconfig;
pub use prebootstrap::PreBootstrap;
pub use remote::Remote;
