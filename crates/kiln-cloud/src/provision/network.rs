use tracing::info;

use kiln_common::{Error, ErrorAction, Result};

use super::{ignore_not_found, Provisioner};
use crate::client::{Network, NetworkSpec, ResourceStatus};

impl Provisioner {
    async fn poll_network(&self, id: &str) -> Result<Network> {
        let network = self.client.get_network(id).await?;
        if network.status == ResourceStatus::Failed {
            return Err(Error::provider_permanent(
                self.provider(),
                format!("network {} failed to provision", id),
            ));
        }
        Ok(network)
    }

    pub(super) async fn create_network(&self) -> Result<()> {
        let (cluster, region, existing) = self
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.region.clone(),
                    d.cloud_infra.network_id.clone(),
                )
            })
            .await;
        if !existing.is_empty() {
            info!(cluster = %cluster, resource_id = %existing, "network already created, skipping");
            return Ok(());
        }

        info!(cluster = %cluster, region = %region, "creating network");
        let network = self
            .client
            .create_network(&NetworkSpec {
                name: format!("{}-net", cluster),
                region,
            })
            .await?;
        self.state
            .update(|d| {
                d.cloud_infra.network_id = network.id.clone();
                d.cloud_infra.network_cidr = network.cidr.clone();
            })
            .await?;

        let active = self
            .timing
            .network_watch
            .run(
                &self.cancel,
                "watch network",
                || self.poll_network(&network.id),
                |n| n.status == ResourceStatus::Active,
                ErrorAction::retry_if_retryable,
                Ok,
            )
            .await?;
        if !active.cidr.is_empty() && active.cidr != network.cidr {
            self.state
                .update(|d| d.cloud_infra.network_cidr = active.cidr.clone())
                .await?;
        }

        info!(cluster = %cluster, resource_id = %network.id, "network created");
        Ok(())
    }

    pub(super) async fn delete_network(&self) -> Result<()> {
        let (key, id) = self
            .state
            .read(|d| (d.key(), d.cloud_infra.network_id.clone()))
            .await;

        if id.is_empty() {
            info!(cluster = %key.name, "no network recorded, skipping");
        } else {
            info!(cluster = %key.name, resource_id = %id, "deleting network");
            self.timing
                .network_delete
                .run(
                    &self.cancel,
                    "delete network",
                    || async { ignore_not_found(self.client.delete_network(&id).await) },
                    |_| true,
                    ErrorAction::retry_if_retryable,
                    Ok,
                )
                .await?;
            self.state
                .mutate(|d| {
                    d.cloud_infra.network_id.clear();
                    d.cloud_infra.network_cidr.clear();
                })
                .await;
        }

        ignore_not_found(self.state.store().delete_cluster(&key).await)?;
        info!(cluster = %key.name, "network deleted and cluster record removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiln_common::config::Timing;
    use kiln_common::storage::Storage;
    use kiln_common::CloudProvider;

    use crate::factory::CloudFactory;
    use crate::memory::MemoryCloud;
    use crate::provision::{test_support, Provisioner};

    #[tokio::test]
    async fn network_is_created_once_and_waited_on() {
        let (_dir, state) = test_support::state();
        let cloud = Arc::new(MemoryCloud::new(CloudProvider::Local));
        let p = Provisioner::new(cloud.clone(), state.clone(), Timing::fake());

        p.new_network().await.unwrap();
        let first = state.snapshot().await;
        assert!(!first.cloud_infra.network_id.is_empty());
        assert_eq!(first.cloud_infra.network_cidr, "10.0.0.0/16");
        assert!(cloud.calls("get_network") >= 2);

        p.new_network().await.unwrap();
        assert_eq!(cloud.calls("create_network"), 1);
        assert_eq!(state.snapshot().await, first);
    }

    #[tokio::test]
    async fn delete_clears_the_id_and_removes_the_record() {
        let (_dir, state) = test_support::state();
        let cloud = Arc::new(MemoryCloud::new(CloudProvider::Local));
        let p = Provisioner::new(cloud.clone(), state.clone(), Timing::fake());

        p.new_network().await.unwrap();
        let key = state.read(|d| d.key()).await;
        state.store().already_created(&key).await.unwrap();

        p.del_network().await.unwrap();
        assert!(state.read(|d| d.cloud_infra.network_id.is_empty()).await);
        assert!(state.store().already_created(&key).await.is_err());
        assert_eq!(cloud.network_count(), 0);

        p.del_network().await.unwrap();
        assert_eq!(cloud.calls("delete_network"), 1);
    }
}
