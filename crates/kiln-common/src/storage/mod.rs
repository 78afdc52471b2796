//! Storage contract for state documents and credentials.
//!
//! Backends are interchangeable implementations of [`Storage`]. Only the
//! local file tree ships here; every step talks to the trait.

mod local;

pub use local::LocalStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::credentials::CredentialsDocument;
use crate::state::{ClusterKey, StateDocument};
use crate::types::{CloudProvider, ClusterType};
use crate::{ErrorKind, Result};

/// Selects cluster records.
///
/// `name` and `region` only apply when both are set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterFilter {
    /// Restrict to one provider
    pub provider: Option<CloudProvider>,
    /// Restrict to one cluster type
    pub cluster_type: Option<ClusterType>,
    /// Cluster name
    pub name: Option<String>,
    /// Cluster region
    pub region: Option<String>,
}

impl ClusterFilter {
    /// Providers selected by this filter
    pub fn providers(&self) -> Vec<CloudProvider> {
        match self.provider {
            Some(p) => vec![p],
            None => CloudProvider::ALL.to_vec(),
        }
    }

    /// Cluster types selected by this filter
    pub fn cluster_types(&self) -> Vec<ClusterType> {
        match self.cluster_type {
            Some(t) => vec![t],
            None => ClusterType::ALL.to_vec(),
        }
    }

    /// Whether a document passes the name/region part of the filter
    pub fn matches_identity(&self, doc: &StateDocument) -> bool {
        match (&self.name, &self.region) {
            (Some(name), Some(region)) => &doc.cluster_name == name && &doc.region == region,
            _ => true,
        }
    }
}

/// Bulk export of clusters and credentials
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageExport {
    /// Cluster documents
    #[serde(default)]
    pub clusters: Vec<StateDocument>,
    /// Provider credentials
    #[serde(default)]
    pub credentials: Vec<CredentialsDocument>,
    /// When the export was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Read/write access to persisted cluster state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the document of one cluster
    ///
    /// Returns `NoMatchingRecords` if absent and `State` if corrupt.
    async fn read(&self, key: &ClusterKey) -> Result<StateDocument>;

    /// Persist a document under the key derived from its identity fields
    async fn write(&self, doc: &StateDocument) -> Result<()>;

    /// Read stored credentials for a provider
    async fn read_credentials(&self, provider: CloudProvider) -> Result<CredentialsDocument>;

    /// Store credentials, replacing any previous ones for the provider
    async fn write_credentials(&self, creds: &CredentialsDocument) -> Result<()>;

    /// Ok if the cluster record exists, `NoMatchingRecords` otherwise
    async fn already_created(&self, key: &ClusterKey) -> Result<()>;

    /// Remove a cluster record
    async fn delete_cluster(&self, key: &ClusterKey) -> Result<()>;

    /// Every document matching the provider/type part of `filter`, grouped by type
    async fn get_one_or_more_clusters(
        &self,
        filter: &ClusterFilter,
    ) -> Result<BTreeMap<ClusterType, Vec<StateDocument>>>;

    /// Export matching clusters and credentials of the selected providers
    async fn export(&self, filter: &ClusterFilter) -> Result<StorageExport> {
        let mut out = StorageExport {
            exported_at: Some(chrono::Utc::now()),
            ..Default::default()
        };

        for (_, docs) in self.get_one_or_more_clusters(filter).await? {
            out.clusters
                .extend(docs.into_iter().filter(|d| filter.matches_identity(d)));
        }

        for provider in filter.providers() {
            match self.read_credentials(provider).await {
                Ok(creds) => out.credentials.push(creds),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(provider = %provider, "no credentials to export");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Write every document and credential of an export
    async fn import(&self, bundle: &StorageExport) -> Result<()> {
        for doc in &bundle.clusters {
            self.write(doc).await?;
        }
        for creds in &bundle.credentials {
            self.write_credentials(creds).await?;
        }
        Ok(())
    }
}
