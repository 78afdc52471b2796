use tracing::{debug, info};

use kiln_common::state::{CloudInfra, VmCollection, VmRecord};
use kiln_common::{Error, ErrorAction, Result, Role};

use super::{ignore_not_found, vm_name, Provisioner};
use crate::client::{Instance, InstanceSpec, ResourceStatus};

/// Every allocated slot of every role has an id and both addresses
pub fn all_required_ready(infra: &CloudInfra) -> bool {
    let ready = |c: &VmCollection| (0..c.len()).all(|i| c.is_ready(i));
    !infra.control_planes.is_empty()
        && ready(&infra.control_planes)
        && ready(&infra.worker_planes)
        && ready(&infra.data_stores)
        && infra.load_balancer.is_ready()
}

impl Provisioner {
    async fn poll_instance(&self, id: &str) -> Result<Instance> {
        let instance = self.client.get_instance(id).await?;
        if instance.status == ResourceStatus::Failed {
            return Err(Error::provider_permanent(
                self.provider(),
                format!("instance {} failed to provision", id),
            ));
        }
        Ok(instance)
    }

    pub(super) async fn create_vm(&self, role: Role, index: usize) -> Result<()> {
        let doc = self.state.snapshot().await;
        let cluster = doc.cluster_name.clone();
        let existing = doc.cloud_infra.vm(role, index).ok_or_else(|| {
            Error::state(format!("{} index {} is outside the allocated VMs", role, index))
        })?;

        if existing.is_ready() {
            info!(cluster = %cluster, role = %role, index, resource_id = %existing.vm_id, "vm already created, skipping");
            return Ok(());
        }

        let vm_id = if existing.vm_id.is_empty() {
            let infra = &doc.cloud_infra;
            let firewall_id = infra.firewall_ids.get(role);
            if infra.network_id.is_empty() || firewall_id.is_empty() || infra.ssh_id.is_empty() {
                return Err(Error::state(format!(
                    "{} vm requires network, firewall and ssh key",
                    role
                )));
            }
            let size = self.sizes.get(role);
            if size.is_empty() {
                return Err(Error::validation_for_field(
                    "vm_size",
                    format!("no instance size configured for {}", role),
                ));
            }

            let name = vm_name(&cluster, role, index);
            info!(cluster = %cluster, role = %role, index, name = %name, size = %size, "creating vm");
            let instance = self
                .client
                .create_instance(&InstanceSpec {
                    name,
                    region: doc.region.clone(),
                    size: size.to_string(),
                    network_id: infra.network_id.clone(),
                    firewall_id: firewall_id.to_string(),
                    ssh_key_id: infra.ssh_id.clone(),
                })
                .await?;

            let record = VmRecord {
                vm_id: instance.id.clone(),
                vm_size: size.to_string(),
                ..Default::default()
            };
            self.state
                .try_update(|d| d.cloud_infra.set_vm(role, index, record))
                .await?;
            instance.id
        } else {
            info!(cluster = %cluster, role = %role, index, resource_id = %existing.vm_id, "vm exists without addresses, resuming watch");
            existing.vm_id
        };

        let instance = self
            .timing
            .vm_watch
            .run(
                &self.cancel,
                "watch instance",
                || self.poll_instance(&vm_id),
                Instance::is_ready,
                ErrorAction::retry_if_retryable,
                Ok,
            )
            .await?;

        let completed = self
            .state
            .try_update(|d| {
                let mut record = d.cloud_infra.vm(role, index).unwrap_or_default();
                record.vm_id = instance.id.clone();
                record.public_ip = instance.public_ip.clone();
                record.private_ip = instance.private_ip.clone();
                record.hostname = instance.hostname.clone();
                d.cloud_infra.set_vm(role, index, record)?;
                d.cloud_infra.is_completed = all_required_ready(&d.cloud_infra);
                Ok(d.cloud_infra.is_completed)
            })
            .await?;

        info!(
            cluster = %cluster,
            role = %role,
            index,
            resource_id = %instance.id,
            public_ip = %instance.public_ip,
            private_ip = %instance.private_ip,
            "vm ready"
        );
        if completed {
            info!(cluster = %cluster, "all vms have addresses");
        }
        Ok(())
    }

    pub(super) async fn delete_vm(&self, role: Role, index: usize) -> Result<()> {
        let (cluster, existing) = self
            .state
            .read(|d| (d.cluster_name.clone(), d.cloud_infra.vm(role, index)))
            .await;
        let vm_id = existing.map(|vm| vm.vm_id).unwrap_or_default();
        if vm_id.is_empty() {
            info!(cluster = %cluster, role = %role, index, "no vm recorded, skipping");
            return Ok(());
        }

        info!(cluster = %cluster, role = %role, index, resource_id = %vm_id, "deleting vm");
        ignore_not_found(self.client.delete_instance(&vm_id).await)?;
        self.state
            .try_update(|d| {
                d.cloud_infra.is_completed = false;
                d.cloud_infra.set_vm(role, index, VmRecord::default())
            })
            .await?;

        debug!(cluster = %cluster, role = %role, index, "waiting for provider teardown");
        tokio::time::sleep(self.timing.vm_delete_grace).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kiln_common::config::Timing;
    use kiln_common::state::VmCollection;
    use kiln_common::{CloudProvider, ErrorKind, Role, StateHandle};

    use crate::factory::CloudFactory;
    use crate::memory::MemoryCloud;
    use crate::provision::{test_support, Provisioner, VmSizes};

    async fn ready_for_vms(cloud: MemoryCloud) -> (tempfile::TempDir, StateHandle, Arc<MemoryCloud>, Provisioner) {
        let (dir, state) = test_support::state();
        let cloud = Arc::new(cloud);
        let p = Provisioner::new(cloud.clone(), state.clone(), Timing::fake())
            .with_sizes(VmSizes::uniform("small"));
        state
            .mutate(|d| {
                d.cloud_infra.control_planes = VmCollection::with_len(3);
                d.cloud_infra.data_stores = VmCollection::with_len(3);
                d.cloud_infra.worker_planes = VmCollection::with_len(1);
            })
            .await;
        p.new_network().await.unwrap();
        p.create_upload_ssh_key_pair().await.unwrap();
        for role in [Role::ControlPlane, Role::WorkerPlane, Role::DataStore, Role::LoadBalancer] {
            p.new_firewall(role).await.unwrap();
        }
        (dir, state, cloud, p)
    }

    #[tokio::test]
    async fn vm_is_created_watched_and_recorded() {
        let (_dir, state, cloud, p) =
            ready_for_vms(MemoryCloud::new(CloudProvider::Local).with_boot_polls(3)).await;

        p.new_vm(Role::ControlPlane, 1).await.unwrap();
        let vm = state
            .read(|d| d.cloud_infra.vm(Role::ControlPlane, 1))
            .await
            .unwrap();
        assert!(vm.is_ready());
        assert_eq!(vm.hostname, "demo-cp-1");
        assert_eq!(vm.vm_size, "small");
        assert_eq!(cloud.calls("get_instance"), 4);
        assert!(state.read(|d| d.vm_arrays_aligned()).await);
    }

    #[tokio::test]
    async fn creating_a_ready_vm_twice_calls_the_provider_once() {
        let (_dir, state, cloud, p) = ready_for_vms(MemoryCloud::new(CloudProvider::Local)).await;

        p.new_vm(Role::DataStore, 0).await.unwrap();
        let first = state.snapshot().await;
        p.new_vm(Role::DataStore, 0).await.unwrap();

        assert_eq!(cloud.calls("create_instance"), 1);
        assert_eq!(state.snapshot().await, first);
    }

    #[tokio::test]
    async fn vm_with_id_but_no_addresses_is_watched_not_recreated() {
        let (_dir, state, cloud, p) = ready_for_vms(MemoryCloud::new(CloudProvider::Local)).await;

        p.new_vm(Role::WorkerPlane, 0).await.unwrap();
        // Simulate a crash between create and the address write-back.
        state
            .mutate(|d| {
                d.cloud_infra.worker_planes.public_ips[0].clear();
                d.cloud_infra.worker_planes.private_ips[0].clear();
            })
            .await;

        p.new_vm(Role::WorkerPlane, 0).await.unwrap();
        assert_eq!(cloud.calls("create_instance"), 1);
        assert!(state.read(|d| d.cloud_infra.worker_planes.is_ready(0)).await);
    }

    #[tokio::test]
    async fn completed_flag_waits_for_every_vm() {
        let (_dir, state, _cloud, p) = ready_for_vms(MemoryCloud::new(CloudProvider::Local)).await;

        p.new_vm(Role::LoadBalancer, 0).await.unwrap();
        for i in 0..3 {
            p.new_vm(Role::DataStore, i).await.unwrap();
            p.new_vm(Role::ControlPlane, i).await.unwrap();
        }
        assert!(!state.read(|d| d.cloud_infra.is_completed).await);

        p.new_vm(Role::WorkerPlane, 0).await.unwrap();
        assert!(state.read(|d| d.cloud_infra.is_completed).await);
    }

    #[tokio::test]
    async fn index_outside_allocation_is_a_state_error() {
        let (_dir, _state, _cloud, p) = ready_for_vms(MemoryCloud::new(CloudProvider::Local)).await;
        let err = p.new_vm(Role::ControlPlane, 5).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[tokio::test]
    async fn provider_failure_leaves_the_slot_empty() {
        let cloud = MemoryCloud::new(CloudProvider::Local);
        cloud.fail_instance("demo-ds-2");
        let (_dir, state, _cloud, p) = ready_for_vms(cloud).await;

        assert!(p.new_vm(Role::DataStore, 2).await.is_err());
        let vm = state.read(|d| d.cloud_infra.vm(Role::DataStore, 2)).await.unwrap();
        assert!(vm.vm_id.is_empty());
    }

    #[tokio::test]
    async fn delete_clears_only_that_slot() {
        let (_dir, state, cloud, p) = ready_for_vms(MemoryCloud::new(CloudProvider::Local)).await;
        p.new_vm(Role::ControlPlane, 0).await.unwrap();
        p.new_vm(Role::ControlPlane, 1).await.unwrap();

        p.del_vm(Role::ControlPlane, 0).await.unwrap();
        let cps = state.read(|d| d.cloud_infra.control_planes.clone()).await;
        assert_eq!(cps.len(), 3);
        assert!(cps.vm_ids[0].is_empty());
        assert!(cps.hostnames[0].is_empty());
        assert!(cps.is_ready(1));
        assert_eq!(cloud.instance_count(), 1);

        p.del_vm(Role::ControlPlane, 0).await.unwrap();
        assert_eq!(cloud.calls("delete_instance"), 1);
    }
}
