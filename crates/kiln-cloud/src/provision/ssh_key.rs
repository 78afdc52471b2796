use tracing::info;

use kiln_common::state::SshKeyPair;
use kiln_common::{Result, DEFAULT_SSH_USER};
use kiln_remote::generate_key_pair;

use super::{ignore_not_found, Provisioner};

impl Provisioner {
    pub(super) async fn create_ssh_key(&self) -> Result<()> {
        let (cluster, ssh_id, public_key) = self
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.cloud_infra.ssh_id.clone(),
                    d.ssh_key_pair.public_key.clone(),
                )
            })
            .await;
        if !ssh_id.is_empty() {
            info!(cluster = %cluster, resource_id = %ssh_id, "ssh key already uploaded, skipping");
            return Ok(());
        }

        // A pair generated by an earlier, failed run is reused.
        let public_key = if public_key.is_empty() {
            let pair = generate_key_pair(&format!("{}@kiln", cluster))?;
            let public_key = pair.public_key.clone();
            self.state.update(|d| d.ssh_key_pair = pair).await?;
            public_key
        } else {
            public_key
        };

        info!(cluster = %cluster, "uploading ssh key");
        let id = self
            .client
            .import_ssh_key(&format!("{}-ssh", cluster), &public_key)
            .await?;
        self.state
            .update(|d| {
                d.cloud_infra.ssh_id = id.clone();
                d.cloud_infra.ssh_user = DEFAULT_SSH_USER.to_string();
            })
            .await?;

        info!(cluster = %cluster, resource_id = %id, "ssh key uploaded");
        Ok(())
    }

    pub(super) async fn delete_ssh_key(&self) -> Result<()> {
        let (cluster, ssh_id) = self
            .state
            .read(|d| (d.cluster_name.clone(), d.cloud_infra.ssh_id.clone()))
            .await;

        if ssh_id.is_empty() {
            info!(cluster = %cluster, "no ssh key recorded, skipping");
        } else {
            info!(cluster = %cluster, resource_id = %ssh_id, "deleting ssh key");
            ignore_not_found(self.client.delete_ssh_key(&ssh_id).await)?;
        }

        self.state
            .update(|d| {
                d.cloud_infra.ssh_id.clear();
                d.cloud_infra.ssh_user.clear();
                d.ssh_key_pair = SshKeyPair::default();
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiln_common::config::Timing;
    use kiln_common::CloudProvider;

    use crate::factory::CloudFactory;
    use crate::memory::MemoryCloud;
    use crate::provision::{test_support, Provisioner};

    #[tokio::test]
    async fn key_pair_is_generated_and_uploaded_once() {
        let (_dir, state) = test_support::state();
        let cloud = Arc::new(MemoryCloud::new(CloudProvider::Local));
        let p = Provisioner::new(cloud.clone(), state.clone(), Timing::fake());

        p.create_upload_ssh_key_pair().await.unwrap();
        let first = state.snapshot().await;
        assert!(!first.cloud_infra.ssh_id.is_empty());
        assert_eq!(first.cloud_infra.ssh_user, "root");
        assert!(first.ssh_key_pair.public_key.starts_with("ssh-ed25519 "));

        p.create_upload_ssh_key_pair().await.unwrap();
        assert_eq!(cloud.calls("import_ssh_key"), 1);
        assert_eq!(state.snapshot().await, first);
    }

    #[tokio::test]
    async fn delete_erases_key_material() {
        let (_dir, state) = test_support::state();
        let cloud = Arc::new(MemoryCloud::new(CloudProvider::Local));
        let p = Provisioner::new(cloud.clone(), state.clone(), Timing::fake());

        p.create_upload_ssh_key_pair().await.unwrap();
        p.del_ssh_key_pair().await.unwrap();

        let doc = state.snapshot().await;
        assert!(doc.cloud_infra.ssh_id.is_empty());
        assert!(doc.cloud_infra.ssh_user.is_empty());
        assert!(doc.ssh_key_pair.private_key.is_empty());
        assert!(doc.ssh_key_pair.public_key.is_empty());
        assert_eq!(cloud.calls("delete_ssh_key"), 1);
    }
}
