use tracing::info;

use kiln_common::{Error, Result, Role};

use super::{ignore_not_found, Provisioner};
use crate::client::FirewallSpec;
use crate::rules::{rules_for, RuleContext};

impl Provisioner {
    pub(super) async fn create_firewall(&self, role: Role) -> Result<()> {
        let doc = self.state.snapshot().await;
        let cluster = &doc.cluster_name;
        let existing = doc.cloud_infra.firewall_ids.get(role);
        if !existing.is_empty() {
            info!(cluster = %cluster, role = %role, resource_id = %existing, "firewall already created, skipping");
            return Ok(());
        }
        if doc.cloud_infra.network_id.is_empty() || doc.cloud_infra.network_cidr.is_empty() {
            return Err(Error::state(format!(
                "{} firewall requires a provisioned network",
                role
            )));
        }

        let rules = rules_for(
            role,
            &RuleContext {
                network_cidr: &doc.cloud_infra.network_cidr,
                bootstrap: doc.bootstrap_provider,
                cni: &doc.addons.cni,
            },
        );
        info!(cluster = %cluster, role = %role, rules = rules.len(), "creating firewall");
        let id = self
            .client
            .create_firewall(&FirewallSpec {
                name: format!("{}-fw-{}", cluster, role.short()),
                network_id: doc.cloud_infra.network_id.clone(),
                rules,
            })
            .await?;
        self.state
            .update(|d| *d.cloud_infra.firewall_ids.get_mut(role) = id.clone())
            .await?;

        info!(cluster = %cluster, role = %role, resource_id = %id, "firewall created");
        Ok(())
    }

    pub(super) async fn delete_firewall(&self, role: Role) -> Result<()> {
        let (cluster, id) = self
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.cloud_infra.firewall_ids.get(role).to_string(),
                )
            })
            .await;
        if id.is_empty() {
            info!(cluster = %cluster, role = %role, "no firewall recorded, skipping");
            return Ok(());
        }

        info!(cluster = %cluster, role = %role, resource_id = %id, "deleting firewall");
        ignore_not_found(self.client.delete_firewall(&id).await)?;
        self.state
            .update(|d| d.cloud_infra.firewall_ids.get_mut(role).clear())
            .await?;
        Ok(())
    }
}
