//! k3s on an external etcd datastore.
//!
//! Control plane 0 installs the server and mints the cluster token; every
//! other server and agent joins with it through the load balancer.

use async_trait::async_trait;
use minijinja::context;
use tracing::info;

use kiln_common::state::{datastore_endpoints, K3sState};
use kiln_common::{BootstrapProvider, Cni, Error, Operation, Result, Role};
use kiln_remote::{single_output, Script, ScriptCollection};

use crate::distro::Bootstrap;
use crate::prebootstrap::{
    choose_version, etcd_certs_script, node_ip, or_default, PreBootstrap, ETCD_CERT_DIR,
};
use crate::remote::templated;

const TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/token";
const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";
const KUBECTL: &str = "sudo k3s kubectl";

/// Token a fake run reports
const FAKE_TOKEN: &str = "K10fake::server:token";

/// The k3s distribution
pub struct K3s {
    pre: PreBootstrap,
}

impl K3s {
    /// k3s steps over the shared pre-bootstrap
    pub fn new(pre: PreBootstrap) -> Self {
        Self { pre }
    }

    async fn token(&self) -> String {
        self.pre
            .state
            .read(|d| {
                d.k8s_bootstrap
                    .k3s
                    .as_ref()
                    .map(|k| k.token.clone())
                    .unwrap_or_default()
            })
            .await
    }

    async fn require_token(&self) -> Result<String> {
        let token = self.token().await;
        if token.is_empty() {
            return Err(Error::state(
                "k3s token is missing; control plane 0 must be configured first",
            ));
        }
        Ok(token)
    }

    async fn version(&self) -> String {
        self.pre
            .state
            .read(|d| or_default(&d.versions.k3s, BootstrapProvider::K3s.default_version()))
            .await
    }

    async fn fetch_token(&self, host: &str) -> Result<()> {
        let ssh = self.pre.state.read(|d| d.k8s_bootstrap.base.ssh.clone()).await;
        let scripts: ScriptCollection = [
            Script::new("k3s-token", format!("sudo cat {}", TOKEN_PATH)).with_fake_output(FAKE_TOKEN),
        ]
        .into_iter()
        .collect();
        let token = single_output(
            self.pre.remote.run_with_output(&ssh, host, scripts).await?,
            "k3s token",
        )?;
        if token.is_empty() {
            return Err(Error::remote_command(host, "k3s-token", "server token is empty"));
        }

        self.pre
            .state
            .update(|d| d.k8s_bootstrap.k3s.get_or_insert_with(K3sState::default).token = token)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Bootstrap for K3s {
    async fn setup_base(&self, op: Operation) -> Result<()> {
        self.pre.setup_base(op).await
    }

    async fn configure_datastore(&self, index: usize) -> Result<()> {
        self.pre.configure_datastore(index).await
    }

    async fn configure_loadbalancer(&self) -> Result<()> {
        self.pre.configure_loadbalancer().await
    }

    async fn setup(&self, op: Operation) -> Result<()> {
        if op == Operation::Create {
            return self
                .pre
                .state
                .update(|d| {
                    d.k8s_bootstrap.k3s.get_or_insert_with(K3sState::default);
                })
                .await;
        }
        let present = self.pre.state.read(|d| d.k8s_bootstrap.k3s.is_some()).await;
        if !present {
            return Err(Error::state("cluster has no k3s record"));
        }
        Ok(())
    }

    async fn k8s_version(&self, version: &str) -> Result<()> {
        let recorded = self.pre.state.read(|d| d.versions.k3s.clone()).await;
        let chosen = choose_version(BootstrapProvider::K3s, &recorded, version)?;
        info!(version = %chosen, "k3s version selected");
        self.pre.state.update(|d| d.versions.k3s = chosen).await
    }

    async fn cni(&self, name: &str) -> Result<bool> {
        let cni = Cni::parse(name);
        let external = cni != Cni::Flannel;
        info!(cni = ?cni, external, "network plugin selected");
        self.pre
            .state
            .update(|d| {
                d.addons.cni = cni;
                d.addons.external_cni = external;
            })
            .await?;
        Ok(external)
    }

    async fn configure_control_plane(&self, index: usize) -> Result<()> {
        let (cluster, base, external_cni, last) = self
            .pre
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.k8s_bootstrap.base.clone(),
                    d.addons.external_cni,
                    d.k8s_bootstrap.base.public_ips.control_planes.len().saturating_sub(1),
                )
            })
            .await;
        let host = node_ip(&base.public_ips, Role::ControlPlane, index)?;
        let version = self.version().await;
        let token = if index == 0 {
            String::new()
        } else {
            self.require_token().await?
        };

        info!(cluster = %cluster, role = %Role::ControlPlane, index, version = %version, "configuring control plane");
        let scripts = ScriptCollection::new();
        scripts.append(etcd_certs_script(&base)?);
        scripts.append(
            templated(
                "k3s-server.sh",
                context! {
                    version => &version,
                    token => &token,
                    datastore_endpoints => datastore_endpoints(&base.private_ips.data_stores),
                    cert_dir => ETCD_CERT_DIR,
                    external_cni => external_cni,
                    lb_public_ip => &base.public_ips.load_balancer,
                    lb_private_ip => &base.private_ips.load_balancer,
                },
            )?
            .with_retries(3),
        );
        self.pre.remote.run(&base.ssh, &host, scripts, false).await?;
        self.pre.state.persist().await?;

        if index == 0 {
            self.fetch_token(&host).await?;
        }
        if index == last {
            self.pre.fetch_kubeconfig(&host, KUBECONFIG_PATH).await?;
        }
        info!(cluster = %cluster, role = %Role::ControlPlane, index, "control plane configured");
        Ok(())
    }

    async fn join_worker_plane(&self, index: usize) -> Result<()> {
        let (cluster, base) = self
            .pre
            .state
            .read(|d| (d.cluster_name.clone(), d.k8s_bootstrap.base.clone()))
            .await;
        let host = node_ip(&base.public_ips, Role::WorkerPlane, index)?;
        let token = self.require_token().await?;
        let version = self.version().await;

        info!(cluster = %cluster, role = %Role::WorkerPlane, index, "joining worker");
        let scripts: ScriptCollection = [templated(
            "k3s-agent.sh",
            context! {
                version => &version,
                lb_private_ip => &base.private_ips.load_balancer,
                token => &token,
            },
        )?
        .with_retries(3)]
        .into_iter()
        .collect();
        self.pre.remote.run(&base.ssh, &host, scripts, false).await?;
        self.pre.state.persist().await?;
        info!(cluster = %cluster, role = %Role::WorkerPlane, index, "worker joined");
        Ok(())
    }

    async fn remove_worker_planes(&self, hostnames: &[String]) -> Result<()> {
        self.pre.remove_nodes(KUBECTL, hostnames).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::remote::test_support::{provisioned, RecordingExecutor};
    use crate::remote::Remote;
    use kiln_common::{ErrorKind, StateHandle};

    const TOKEN: &str = "K10abc123::server:s3cr3t";

    async fn k3s() -> (tempfile::TempDir, StateHandle, RecordingExecutor, K3s) {
        let (dir, state) = provisioned(BootstrapProvider::K3s);
        let rec = RecordingExecutor::default();
        rec.answer("k3s-token", &format!("{}\n", TOKEN));
        rec.answer("kubeconfig", crate::kubeconfig::FAKE_KUBECONFIG);
        let k3s = K3s::new(PreBootstrap::new(state.clone(), Remote::new(Arc::new(rec.clone()))));
        k3s.setup_base(Operation::Create).await.unwrap();
        k3s.setup(Operation::Create).await.unwrap();
        k3s.k8s_version("").await.unwrap();
        (dir, state, rec, k3s)
    }

    #[tokio::test]
    async fn control_plane_zero_mints_the_token() {
        let (_dir, state, rec, k3s) = k3s().await;
        k3s.cni("").await.unwrap();
        k3s.configure_control_plane(0).await.unwrap();

        assert_eq!(
            rec.names_on("198.51.100.10"),
            vec!["etcd-certs", "k3s-server", "k3s-token"]
        );
        let server = &rec.bodies("k3s-server")[0];
        assert!(!server.contains("--token"));
        assert!(!server.contains("--flannel-backend"));
        assert!(server.contains(
            "https://10.0.0.30:2379,https://10.0.0.31:2379,https://10.0.0.32:2379"
        ));
        assert_eq!(state.read(|d| d.k8s_bootstrap.k3s.clone()).await.unwrap().token, TOKEN);
        assert!(state.read(|d| d.cluster_kubeconfig.is_empty()).await);
    }

    #[tokio::test]
    async fn join_material_from_control_plane_zero_is_reused_everywhere() {
        let (_dir, state, rec, k3s) = k3s().await;
        k3s.configure_control_plane(0).await.unwrap();
        k3s.configure_control_plane(1).await.unwrap();
        k3s.configure_control_plane(2).await.unwrap();
        k3s.join_worker_plane(0).await.unwrap();
        k3s.join_worker_plane(1).await.unwrap();

        let servers = rec.bodies("k3s-server");
        assert_eq!(servers.len(), 3);
        for joined in &servers[1..] {
            assert!(joined.contains(&format!("--token \"{}\"", TOKEN)));
        }
        let agents = rec.bodies("k3s-agent");
        assert_eq!(agents.len(), 2);
        for agent in &agents {
            assert!(agent.contains(&format!("K3S_TOKEN=\"{}\"", TOKEN)));
            assert!(agent.contains("K3S_URL=\"https://10.0.0.2:6443\""));
        }
        assert_eq!(rec.bodies("k3s-token").len(), 1);
        assert_eq!(state.read(|d| d.k8s_bootstrap.k3s.clone()).await.unwrap().token, TOKEN);
    }

    #[tokio::test]
    async fn last_control_plane_stores_the_rewritten_kubeconfig() {
        let (_dir, state, rec, k3s) = k3s().await;
        k3s.configure_control_plane(0).await.unwrap();
        k3s.configure_control_plane(2).await.unwrap();

        assert_eq!(
            rec.names_on("198.51.100.12"),
            vec!["etcd-certs", "k3s-server", "kubeconfig"]
        );
        let doc = state.snapshot().await;
        assert_eq!(doc.cluster_kubeconfig_context, "demo-local-ha-local-kiln");
        assert!(doc.cluster_kubeconfig.contains("https://198.51.100.2:6443"));
        assert!(doc.cluster_kubeconfig.contains("current-context: demo-local-ha-local-kiln"));
    }

    #[tokio::test]
    async fn joining_before_control_plane_zero_is_a_state_error() {
        let (_dir, _state, rec, k3s) = k3s().await;
        assert_eq!(
            k3s.configure_control_plane(1).await.unwrap_err().kind(),
            ErrorKind::State
        );
        assert_eq!(k3s.join_worker_plane(0).await.unwrap_err().kind(), ErrorKind::State);
        assert!(rec.executed().is_empty());
    }

    #[tokio::test]
    async fn anything_but_flannel_is_external() {
        let (_dir, state, rec, k3s) = k3s().await;
        assert!(!k3s.cni("flannel").await.unwrap());
        assert!(k3s.cni("cilium").await.unwrap());
        assert_eq!(state.read(|d| d.addons.cni.clone()).await, Cni::Cilium);

        k3s.configure_control_plane(0).await.unwrap();
        assert!(rec.bodies("k3s-server")[0].contains("--flannel-backend none"));
    }

    #[tokio::test]
    async fn recorded_version_is_kept() {
        let (_dir, state, _rec, k3s) = k3s().await;
        let default = BootstrapProvider::K3s.default_version();
        assert_eq!(state.read(|d| d.versions.k3s.clone()).await, default);
        assert!(k3s.k8s_version("v1.28.12+k3s1").await.is_err());
        k3s.k8s_version(default).await.unwrap();
    }

    #[tokio::test]
    async fn node_removal_runs_on_control_plane_zero() {
        let (_dir, _state, rec, k3s) = k3s().await;
        k3s.remove_worker_planes(&["demo-wp-1".to_string()]).await.unwrap();
        assert_eq!(rec.names_on("198.51.100.10"), vec!["remove-nodes"]);

        rec.fail("remove-nodes");
        k3s.remove_worker_planes(&["demo-wp-0".to_string()]).await.unwrap();
    }
}
