//! Common types for kiln: errors, backoff, the state document and storage

#![deny(missing_docs)]

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod error;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod types;

pub use backoff::{Backoff, ErrorAction};
pub use error::{Error, ErrorKind};
pub use state::{ClusterKey, StateDocument, StateHandle};
pub use types::{BootstrapProvider, CloudProvider, ClusterType, Cni, Operation, Role};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Login user the provisioned VMs accept keys for
pub const DEFAULT_SSH_USER: &str = "root";

/// Kubernetes API server port, fronted by the load balancer
pub const API_SERVER_PORT: u16 = 6443;
