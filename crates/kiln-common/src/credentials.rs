//! Cloud provider credentials
//!
//! Credentials are read from the environment once (`kiln credentials`) and
//! persisted through the store, keyed by provider.

use serde::{Deserialize, Serialize};

use crate::types::CloudProvider;
use crate::{Error, Result};

/// Civo API token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CivoCredentials {
    /// API token
    pub token: String,
}

/// AWS access key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsCredentials {
    /// AWS access key ID
    pub access_key_id: String,
    /// AWS secret access key
    pub secret_access_key: String,
}

/// Azure service principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureCredentials {
    /// Subscription to create resources in
    pub subscription_id: String,
    /// Directory (tenant) id
    pub tenant_id: String,
    /// Service principal client id
    pub client_id: String,
    /// Service principal secret
    pub client_secret: String,
}

/// Credentials for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum CredentialsDocument {
    /// Civo
    Civo(CivoCredentials),
    /// AWS
    Aws(AwsCredentials),
    /// Azure
    Azure(AzureCredentials),
    /// The simulated provider needs none
    Local,
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl CredentialsDocument {
    /// Provider these credentials belong to
    pub fn provider(&self) -> CloudProvider {
        match self {
            CredentialsDocument::Civo(_) => CloudProvider::Civo,
            CredentialsDocument::Aws(_) => CloudProvider::Aws,
            CredentialsDocument::Azure(_) => CloudProvider::Azure,
            CredentialsDocument::Local => CloudProvider::Local,
        }
    }

    /// Load credentials for `provider` from its environment variables
    ///
    /// * civo: `CIVO_TOKEN`
    /// * aws: `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
    /// * azure: `AZURE_SUBSCRIPTION_ID`, `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`,
    ///   `AZURE_CLIENT_SECRET`
    pub fn from_env(provider: CloudProvider) -> Result<Self> {
        let missing = || Error::nil_credentials(provider.as_str());
        Ok(match provider {
            CloudProvider::Civo => CredentialsDocument::Civo(CivoCredentials {
                token: env("CIVO_TOKEN").ok_or_else(missing)?,
            }),
            CloudProvider::Aws => CredentialsDocument::Aws(AwsCredentials {
                access_key_id: env("AWS_ACCESS_KEY_ID").ok_or_else(missing)?,
                secret_access_key: env("AWS_SECRET_ACCESS_KEY").ok_or_else(missing)?,
            }),
            CloudProvider::Azure => CredentialsDocument::Azure(AzureCredentials {
                subscription_id: env("AZURE_SUBSCRIPTION_ID").ok_or_else(missing)?,
                tenant_id: env("AZURE_TENANT_ID").ok_or_else(missing)?,
                client_id: env("AZURE_CLIENT_ID").ok_or_else(missing)?,
                client_secret: env("AZURE_CLIENT_SECRET").ok_or_else(missing)?,
            }),
            CloudProvider::Local => CredentialsDocument::Local,
        })
    }
}
