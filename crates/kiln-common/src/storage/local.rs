//! File-tree store.
//!
//! Layout under `<root>/.kiln/`:
//! - `state/<provider>/<type>/<name> <region>/state.json`
//! - `credentials/<provider>.json`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{ClusterFilter, Storage};
use crate::credentials::CredentialsDocument;
use crate::state::{ClusterKey, StateDocument};
use crate::types::{CloudProvider, ClusterType};
use crate::{Error, Result};

const KILN_DIR: &str = ".kiln";
const STATE_DIR: &str = "state";
const CREDENTIALS_DIR: &str = "credentials";
const STATE_FILE: &str = "state.json";

/// Documents hold private keys and provider tokens
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Store backed by JSON files on the local disk
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Store rooted at `<base>/.kiln`
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            root: base.as_ref().join(KILN_DIR),
        }
    }

    /// Store rooted at the user's home directory
    pub fn in_home() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::internal_with_context("store", "could not determine home directory"))?;
        Ok(Self::new(home))
    }

    /// Root of the tree (`<base>/.kiln`)
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_dir(&self, provider: CloudProvider, cluster_type: ClusterType) -> PathBuf {
        self.root
            .join(STATE_DIR)
            .join(provider.as_str())
            .join(cluster_type.as_str())
    }

    fn cluster_dir(&self, key: &ClusterKey) -> PathBuf {
        self.type_dir(key.provider, key.cluster_type)
            .join(format!("{} {}", key.name, key.region))
    }

    fn state_path(&self, key: &ClusterKey) -> PathBuf {
        self.cluster_dir(key).join(STATE_FILE)
    }

    fn credentials_path(&self, provider: CloudProvider) -> PathBuf {
        self.root
            .join(CREDENTIALS_DIR)
            .join(format!("{}.json", provider.as_str()))
    }

    async fn read_state_file(path: &Path) -> Result<StateDocument> {
        let data = tokio::fs::read(path).await?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::state(format!("corrupt state document {}: {}", path.display(), e))
        })
    }
}

async fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(path).await?;
    Ok(())
}

/// Write through a temporary file so a crash never leaves a truncated document.
///
/// The file is readable by its owner only.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = tokio::fs::remove_file(&tmp).await {
        if !is_not_found(&e) {
            return Err(e.into());
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);
    let mut file = options.open(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

#[async_trait]
impl Storage for LocalStore {
    async fn read(&self, key: &ClusterKey) -> Result<StateDocument> {
        let path = self.state_path(key);
        match Self::read_state_file(&path).await {
            Err(Error::Io { source }) if is_not_found(&source) => {
                Err(Error::not_found(format!("cluster {}", key)))
            }
            other => other,
        }
    }

    async fn write(&self, doc: &StateDocument) -> Result<()> {
        let key = doc.key();
        let path = self.state_path(&key);
        let data = serde_json::to_vec_pretty(doc)?;
        write_atomic(&path, &data).await?;
        debug!(path = %path.display(), "wrote state document");
        Ok(())
    }

    async fn read_credentials(&self, provider: CloudProvider) -> Result<CredentialsDocument> {
        let path = self.credentials_path(provider);
        let data = match tokio::fs::read(&path).await {
            Ok(d) => d,
            Err(e) if is_not_found(&e) => {
                return Err(Error::not_found(format!("credentials for {}", provider)))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| {
            Error::state(format!("corrupt credentials {}: {}", path.display(), e))
        })
    }

    async fn write_credentials(&self, creds: &CredentialsDocument) -> Result<()> {
        let path = self.credentials_path(creds.provider());
        let data = serde_json::to_vec_pretty(creds)?;
        write_atomic(&path, &data).await
    }

    async fn already_created(&self, key: &ClusterKey) -> Result<()> {
        if tokio::fs::try_exists(self.state_path(key)).await? {
            Ok(())
        } else {
            Err(Error::not_found(format!("cluster {}", key)))
        }
    }

    async fn delete_cluster(&self, key: &ClusterKey) -> Result<()> {
        let dir = self.cluster_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(path = %dir.display(), "deleted cluster record");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Err(Error::not_found(format!("cluster {}", key))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_one_or_more_clusters(
        &self,
        filter: &ClusterFilter,
    ) -> Result<BTreeMap<ClusterType, Vec<StateDocument>>> {
        let mut out: BTreeMap<ClusterType, Vec<StateDocument>> = BTreeMap::new();

        for provider in filter.providers() {
            for cluster_type in filter.cluster_types() {
                let docs = out.entry(cluster_type).or_default();
                let dir = self.type_dir(provider, cluster_type);
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if is_not_found(&e) => continue,
                    Err(e) => return Err(e.into()),
                };

                let mut paths = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        paths.push(entry.path().join(STATE_FILE));
                    }
                }
                paths.sort();

                for path in paths {
                    match Self::read_state_file(&path).await {
                        Ok(doc) => docs.push(doc),
                        Err(Error::Io { source }) if is_not_found(&source) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CivoCredentials;
    use crate::storage::StorageExport;
    use crate::types::BootstrapProvider;
    use crate::ErrorKind;

    fn doc(provider: CloudProvider, name: &str, region: &str) -> StateDocument {
        StateDocument::new(
            &ClusterKey::new(provider, ClusterType::Ha, name, region),
            BootstrapProvider::K3s,
        )
    }

    #[tokio::test]
    async fn write_then_read_returns_same_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let mut d = doc(CloudProvider::Civo, "demo", "lon1");
        d.cloud_infra.network_id = "net-1".into();

        store.write(&d).await.unwrap();
        let back = store.read(&d.key()).await.unwrap();
        assert_eq!(back, d);
        assert!(dir
            .path()
            .join(".kiln/state/civo/ha/demo lon1/state.json")
            .exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn documents_are_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let d = doc(CloudProvider::Civo, "demo", "lon1");
        store.write(&d).await.unwrap();
        store
            .write_credentials(&CredentialsDocument::Civo(CivoCredentials {
                token: "secret".into(),
            }))
            .await
            .unwrap();

        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&store.state_path(&d.key())), 0o600);
        assert_eq!(mode(&store.credentials_path(CloudProvider::Civo)), 0o600);
        assert_eq!(mode(&store.cluster_dir(&d.key())), 0o700);
        assert_eq!(mode(&store.root().join(CREDENTIALS_DIR)), 0o700);

        store.write(&d).await.unwrap();
        assert_eq!(mode(&store.state_path(&d.key())), 0o600);
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let key = ClusterKey::new(CloudProvider::Aws, ClusterType::Ha, "nope", "eu-west-1");

        let err = store.read(&key).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            store.already_created(&key).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn corrupt_document_is_a_state_error_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let key = ClusterKey::new(CloudProvider::Civo, ClusterType::Ha, "bad", "lon1");
        let path = store.state_path(&key);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let err = store.read(&key).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"{ not json");
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let d = doc(CloudProvider::Local, "demo", "local");
        store.write(&d).await.unwrap();
        store.already_created(&d.key()).await.unwrap();

        store.delete_cluster(&d.key()).await.unwrap();
        assert!(store.already_created(&d.key()).await.is_err());
        assert!(store.delete_cluster(&d.key()).await.is_err());
    }

    #[tokio::test]
    async fn clusters_are_listed_by_provider_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write(&doc(CloudProvider::Civo, "a", "lon1")).await.unwrap();
        store.write(&doc(CloudProvider::Civo, "b", "fra1")).await.unwrap();
        store.write(&doc(CloudProvider::Aws, "c", "us-east-1")).await.unwrap();

        let all = store
            .get_one_or_more_clusters(&ClusterFilter::default())
            .await
            .unwrap();
        assert_eq!(all[&ClusterType::Ha].len(), 3);

        let civo = store
            .get_one_or_more_clusters(&ClusterFilter {
                provider: Some(CloudProvider::Civo),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = civo[&ClusterType::Ha]
            .iter()
            .map(|d| d.cluster_name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn export_then_import_into_another_store() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = LocalStore::new(src_dir.path());
        src.write(&doc(CloudProvider::Civo, "a", "lon1")).await.unwrap();
        src.write(&doc(CloudProvider::Civo, "b", "fra1")).await.unwrap();
        src.write_credentials(&CredentialsDocument::Civo(CivoCredentials {
            token: "tok".into(),
        }))
        .await
        .unwrap();

        let bundle: StorageExport = src
            .export(&ClusterFilter {
                provider: Some(CloudProvider::Civo),
                name: Some("b".into()),
                region: Some("fra1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bundle.clusters.len(), 1);
        assert_eq!(bundle.credentials.len(), 1);

        let dst_dir = tempfile::tempdir().unwrap();
        let dst = LocalStore::new(dst_dir.path());
        dst.import(&bundle).await.unwrap();
        let key = ClusterKey::new(CloudProvider::Civo, ClusterType::Ha, "b", "fra1");
        assert_eq!(dst.read(&key).await.unwrap().cluster_name, "b");
        assert_eq!(
            dst.read_credentials(CloudProvider::Civo).await.unwrap(),
            CredentialsDocument::Civo(CivoCredentials {
                token: "tok".into()
            })
        );
    }
}
