//! Cluster lifecycle orchestration for kiln
//!
//! [`ClusterController`] sequences cloud provisioning and Kubernetes
//! bootstrap into phases of concurrent steps. Each phase waits for all of its
//! steps before the next one starts.

#![deny(missing_docs)]

pub mod connector;
pub mod controller;
pub mod phase;
pub mod request;

pub use connector::{resolve_credentials, CloudConnector, ProviderConnector};
pub use controller::{ClusterController, ClusterSummary};
pub use phase::Phase;
pub use request::ClusterRequest;
