//! Resolving credentials and building provider clients.

use std::sync::Arc;

use tracing::debug;

use kiln_cloud::CloudClient;
use kiln_common::credentials::CredentialsDocument;
use kiln_common::storage::Storage;
use kiln_common::{CloudProvider, ErrorKind, Result};

#[cfg(test)]
use mockall::automock;

/// Builds the provider client a cluster is provisioned through
#[cfg_attr(test, automock)]
pub trait CloudConnector: Send + Sync {
    /// Client authenticated with `credentials`
    fn connect(&self, credentials: &CredentialsDocument) -> Result<Arc<dyn CloudClient>>;
}

/// Connector backed by the clients compiled into this build
#[derive(Clone, Copy, Debug, Default)]
pub struct ProviderConnector {
    fake: bool,
}

impl ProviderConnector {
    /// `fake` serves every provider from memory
    pub fn new(fake: bool) -> Self {
        Self { fake }
    }
}

impl CloudConnector for ProviderConnector {
    fn connect(&self, credentials: &CredentialsDocument) -> Result<Arc<dyn CloudClient>> {
        kiln_cloud::connect(credentials, self.fake)
    }
}

/// Stored credentials for `provider`, falling back to its environment variables
pub async fn resolve_credentials(
    store: &dyn Storage,
    provider: CloudProvider,
) -> Result<CredentialsDocument> {
    match store.read_credentials(provider).await {
        Ok(creds) => Ok(creds),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(provider = %provider, "no stored credentials, reading environment");
            CredentialsDocument::from_env(provider)
        }
        Err(e) => Err(e),
    }
}
