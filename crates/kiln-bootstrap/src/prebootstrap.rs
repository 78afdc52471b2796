//! Distribution independent bootstrap: shared material, the external etcd
//! datastore and the HAProxy load balancer in front of the API servers.

use minijinja::context;
use tracing::{info, warn};

use kiln_common::state::{etcd_member_list, BootstrapBase, RoleIps, SshInfo};
use kiln_common::{
    BootstrapProvider, Error, Operation, Result, Role, StateHandle, DEFAULT_SSH_USER,
};
use kiln_remote::{single_output, Script, ScriptCollection};

use crate::certs::{generate_etcd_certs, EtcdCerts};
use crate::kubeconfig::{rewrite_kubeconfig, FAKE_KUBECONFIG};
use crate::remote::{templated, Remote};

/// Etcd release installed when none is recorded
pub const DEFAULT_ETCD_VERSION: &str = "v3.5.15";

/// HAProxy release installed when none is recorded
pub const DEFAULT_HAPROXY_VERSION: &str = "3.0";

/// Where etcd certificates live on datastore and control plane nodes
pub const ETCD_CERT_DIR: &str = "/var/lib/etcd-certs";

/// Node address by role and index from the bootstrap base
pub(crate) fn node_ip(ips: &RoleIps, role: Role, index: usize) -> Result<String> {
    let found = match role {
        Role::ControlPlane => ips.control_planes.get(index),
        Role::WorkerPlane => ips.worker_planes.get(index),
        Role::DataStore => ips.data_stores.get(index),
        Role::LoadBalancer => Some(&ips.load_balancer),
    };
    match found {
        Some(ip) if !ip.is_empty() => Ok(ip.clone()),
        _ => Err(Error::state(format!(
            "no address recorded for {} {}",
            role, index
        ))),
    }
}

/// Script writing the etcd certificates into [`ETCD_CERT_DIR`]
pub(crate) fn etcd_certs_script(base: &BootstrapBase) -> Result<Script> {
    templated(
        "etcd-certs.sh",
        context! {
            cert_dir => ETCD_CERT_DIR,
            ca_cert => base.ca_cert.trim(),
            etcd_cert => base.etcd_cert.trim(),
            etcd_key => base.etcd_key.trim(),
        },
    )
}

pub(crate) fn or_default(recorded: &str, default: &str) -> String {
    if recorded.is_empty() {
        default.to_string()
    } else {
        recorded.to_string()
    }
}

/// Version a distribution should run.
///
/// An empty request keeps the recorded release, or picks the newest supported
/// one on a fresh cluster. A recorded release is never changed in place.
pub(crate) fn choose_version(
    provider: BootstrapProvider,
    recorded: &str,
    requested: &str,
) -> Result<String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Ok(or_default(recorded, provider.default_version()));
    }
    if !recorded.is_empty() && recorded != requested {
        return Err(Error::validation_for_field(
            "version",
            format!(
                "cluster already runs {} {}; cannot switch to {}",
                provider, recorded, requested
            ),
        ));
    }
    provider.validate_version(requested)?;
    Ok(requested.to_string())
}

/// Steps shared by every self-managed distribution
#[derive(Clone)]
pub struct PreBootstrap {
    pub(crate) state: StateHandle,
    pub(crate) remote: Remote,
}

impl PreBootstrap {
    /// Steps for the cluster behind `state`
    pub fn new(state: StateHandle, remote: Remote) -> Self {
        Self { state, remote }
    }

    /// Record the material every later step reads.
    ///
    /// On create this generates the etcd PKI once, then copies the node
    /// addresses and SSH identity from the provisioned infrastructure; running
    /// it again refreshes the addresses and keeps the certificates. Other
    /// operations only need a bootstrapped document.
    pub async fn setup_base(&self, op: Operation) -> Result<()> {
        let doc = self.state.snapshot().await;
        if op != Operation::Create {
            if doc.k8s_bootstrap.base.ssh.private_key.is_empty() {
                return Err(Error::state(format!(
                    "cluster {} has no bootstrap record",
                    doc.cluster_name
                )));
            }
            return Ok(());
        }

        let infra = &doc.cloud_infra;
        if !infra.is_completed {
            return Err(Error::state(
                "infrastructure is not fully provisioned; every vm needs an address",
            ));
        }

        let base = &doc.k8s_bootstrap.base;
        let certs = if base.ca_cert.is_empty() {
            info!(cluster = %doc.cluster_name, "generating etcd certificates");
            generate_etcd_certs(&infra.data_stores.private_ips)?
        } else {
            EtcdCerts {
                ca_cert: base.ca_cert.clone(),
                etcd_cert: base.etcd_cert.clone(),
                etcd_key: base.etcd_key.clone(),
            }
        };

        let public_ips = RoleIps {
            control_planes: infra.control_planes.public_ips.clone(),
            worker_planes: infra.worker_planes.public_ips.clone(),
            data_stores: infra.data_stores.public_ips.clone(),
            load_balancer: infra.load_balancer.public_ip.clone(),
        };
        let private_ips = RoleIps {
            control_planes: infra.control_planes.private_ips.clone(),
            worker_planes: infra.worker_planes.private_ips.clone(),
            data_stores: infra.data_stores.private_ips.clone(),
            load_balancer: infra.load_balancer.private_ip.clone(),
        };
        let ssh = SshInfo {
            user_name: or_default(&infra.ssh_user, DEFAULT_SSH_USER),
            private_key: doc.ssh_key_pair.private_key.clone(),
        };

        self.state
            .update(|d| {
                d.k8s_bootstrap.base = BootstrapBase {
                    ca_cert: certs.ca_cert,
                    etcd_cert: certs.etcd_cert,
                    etcd_key: certs.etcd_key,
                    public_ips,
                    private_ips,
                    ssh,
                };
            })
            .await?;
        info!(cluster = %doc.cluster_name, "bootstrap base recorded");
        Ok(())
    }

    /// Install etcd on datastore `index` and join it to the member list
    pub async fn configure_datastore(&self, index: usize) -> Result<()> {
        let (cluster, base, version) = self
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.k8s_bootstrap.base.clone(),
                    or_default(&d.versions.etcd, DEFAULT_ETCD_VERSION),
                )
            })
            .await;
        let public_ip = node_ip(&base.public_ips, Role::DataStore, index)?;
        let private_ip = node_ip(&base.private_ips, Role::DataStore, index)?;

        info!(cluster = %cluster, role = %Role::DataStore, index, version = %version, "configuring datastore");
        let scripts = ScriptCollection::new();
        scripts.append(templated("etcd-download.sh", context! { version => &version })?.with_retries(9));
        scripts.append(templated("etcd-install.sh", context! {})?);
        scripts.append(etcd_certs_script(&base)?);
        scripts.append(templated(
            "etcd-unit.sh",
            context! {
                index => index,
                private_ip => &private_ip,
                member_list => etcd_member_list(&base.private_ips.data_stores),
                cert_dir => ETCD_CERT_DIR,
            },
        )?);
        scripts.append(templated("etcd-start.sh", context! {})?.with_retries(3));

        self.remote.run(&base.ssh, &public_ip, scripts, false).await?;

        self.state.update(|d| d.versions.etcd = version).await?;
        info!(cluster = %cluster, role = %Role::DataStore, index, "datastore configured");
        Ok(())
    }

    /// Install HAProxy on the load balancer, balancing every control plane
    pub async fn configure_loadbalancer(&self) -> Result<()> {
        let (cluster, base, version) = self
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.k8s_bootstrap.base.clone(),
                    or_default(&d.versions.haproxy, DEFAULT_HAPROXY_VERSION),
                )
            })
            .await;
        let public_ip = node_ip(&base.public_ips, Role::LoadBalancer, 0)?;

        info!(cluster = %cluster, role = %Role::LoadBalancer, version = %version, "configuring load balancer");
        let scripts = ScriptCollection::new();
        scripts.append(templated("haproxy-install.sh", context! { version => &version })?.with_retries(9));
        scripts.append(templated("haproxy-enable.sh", context! {})?.with_retries(3));
        scripts.append(templated(
            "haproxy-config.sh",
            context! { control_plane_ips => &base.private_ips.control_planes },
        )?);
        scripts.append(templated("haproxy-restart.sh", context! {})?.with_retries(3));

        self.remote.run(&base.ssh, &public_ip, scripts, false).await?;

        self.state.update(|d| d.versions.haproxy = version).await?;
        info!(cluster = %cluster, role = %Role::LoadBalancer, "load balancer configured");
        Ok(())
    }

    /// Read the admin kubeconfig from a control plane, point it at the load
    /// balancer and store it with the cluster's context name
    pub(crate) async fn fetch_kubeconfig(&self, host: &str, path: &str) -> Result<()> {
        let (cluster, ssh, lb_public, context) = self
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.k8s_bootstrap.base.ssh.clone(),
                    d.k8s_bootstrap.base.public_ips.load_balancer.clone(),
                    d.cluster_context_name(),
                )
            })
            .await;

        info!(cluster = %cluster, host = %host, "fetching kubeconfig");
        let scripts: ScriptCollection = [Script::new("kubeconfig", format!("sudo cat {}", path))
            .with_fake_output(FAKE_KUBECONFIG)]
        .into_iter()
        .collect();
        let raw = single_output(
            self.remote.run_with_output(&ssh, host, scripts).await?,
            "kubeconfig",
        )?;
        let kubeconfig = rewrite_kubeconfig(&raw, &context, &lb_public)?;

        self.state
            .update(|d| {
                d.cluster_kubeconfig = kubeconfig;
                d.cluster_kubeconfig_context = context;
            })
            .await?;
        info!(cluster = %cluster, "kubeconfig stored");
        Ok(())
    }

    /// Drain and delete nodes through control plane 0; failures are logged
    pub(crate) async fn remove_nodes(&self, kubectl: &str, hostnames: &[String]) -> Result<()> {
        if hostnames.is_empty() {
            return Ok(());
        }
        let (cluster, base) = self
            .state
            .read(|d| (d.cluster_name.clone(), d.k8s_bootstrap.base.clone()))
            .await;
        let host = node_ip(&base.public_ips, Role::ControlPlane, 0)?;

        info!(cluster = %cluster, nodes = ?hostnames, "removing nodes from the cluster");
        let scripts: ScriptCollection = [templated(
            "remove-nodes.sh",
            context! { kubectl => kubectl, hostnames => hostnames },
        )?]
        .into_iter()
        .collect();
        if let Err(e) = self.remote.run(&base.ssh, &host, scripts, true).await {
            warn!(cluster = %cluster, error = %e, "failed to remove nodes, continuing");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::remote::test_support::{provisioned, RecordingExecutor};
    use kiln_common::{BootstrapProvider, ErrorKind};

    async fn prebootstrap() -> (tempfile::TempDir, StateHandle, RecordingExecutor, PreBootstrap) {
        let (dir, state) = provisioned(BootstrapProvider::K3s);
        let rec = RecordingExecutor::default();
        let pre = PreBootstrap::new(state.clone(), Remote::new(Arc::new(rec.clone())));
        pre.setup_base(Operation::Create).await.unwrap();
        (dir, state, rec, pre)
    }

    #[test]
    fn versions_default_then_stick() {
        let k3s = BootstrapProvider::K3s;
        assert_eq!(choose_version(k3s, "", "").unwrap(), k3s.default_version());
        assert_eq!(choose_version(k3s, "v1.29.7+k3s1", "").unwrap(), "v1.29.7+k3s1");
        assert_eq!(choose_version(k3s, "", "v1.28.12+k3s1").unwrap(), "v1.28.12+k3s1");
        assert!(choose_version(k3s, "v1.29.7+k3s1", "v1.30.3+k3s1").is_err());
        assert!(choose_version(BootstrapProvider::Kubeadm, "", "v1.99").is_err());
    }

    #[tokio::test]
    async fn setup_copies_addresses_and_generates_certs_once() {
        let (_dir, state, _rec, pre) = prebootstrap().await;
        let base = state.read(|d| d.k8s_bootstrap.base.clone()).await;
        assert_eq!(base.private_ips.data_stores, vec!["10.0.0.30", "10.0.0.31", "10.0.0.32"]);
        assert_eq!(base.public_ips.load_balancer, "198.51.100.2");
        assert_eq!(base.ssh.user_name, "root");
        assert!(base.ca_cert.contains("BEGIN CERTIFICATE"));

        pre.setup_base(Operation::Create).await.unwrap();
        let again = state.read(|d| d.k8s_bootstrap.base.clone()).await;
        assert_eq!(again.ca_cert, base.ca_cert);
        assert_eq!(again.etcd_key, base.etcd_key);
    }

    #[tokio::test]
    async fn setup_refuses_unfinished_infrastructure() {
        let (_dir, state) = provisioned(BootstrapProvider::K3s);
        state.mutate(|d| d.cloud_infra.is_completed = false).await;
        let pre = PreBootstrap::new(state, Remote::new(Arc::new(RecordingExecutor::default())));

        let err = pre.setup_base(Operation::Create).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(pre.setup_base(Operation::Delete).await.is_err());
    }

    #[tokio::test]
    async fn datastore_runs_etcd_scripts_and_records_version() {
        let (_dir, state, rec, pre) = prebootstrap().await;
        pre.configure_datastore(1).await.unwrap();

        assert_eq!(
            rec.names_on("198.51.100.31"),
            vec!["etcd-download", "etcd-install", "etcd-certs", "etcd-unit", "etcd-start"]
        );
        let download = &rec.executed()[0].script;
        assert!(download.can_retry);
        assert_eq!(download.max_retries, 9);

        let unit = &rec.bodies("etcd-unit")[0];
        assert!(unit.contains("--name infra1"));
        assert!(unit.contains(
            "infra0=https://10.0.0.30:2380,infra1=https://10.0.0.31:2380,infra2=https://10.0.0.32:2380"
        ));
        assert_eq!(state.read(|d| d.versions.etcd.clone()).await, DEFAULT_ETCD_VERSION);
    }

    #[tokio::test]
    async fn load_balancer_balances_control_plane_private_addresses() {
        let (_dir, state, rec, pre) = prebootstrap().await;
        pre.configure_loadbalancer().await.unwrap();

        assert_eq!(
            rec.names_on("198.51.100.2"),
            vec!["haproxy-install", "haproxy-enable", "haproxy-config", "haproxy-restart"]
        );
        let config = &rec.bodies("haproxy-config")[0];
        assert!(config.contains("server k3sserver-3 10.0.0.12:6443 check"));
        assert_eq!(state.read(|d| d.versions.haproxy.clone()).await, "3.0");
    }

    #[tokio::test]
    async fn failed_datastore_script_leaves_version_unset() {
        let (_dir, state, rec, pre) = prebootstrap().await;
        rec.fail("etcd-start");

        let err = pre.configure_datastore(0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteCommand);
        assert!(state.read(|d| d.versions.etcd.is_empty()).await);
    }

    #[tokio::test]
    async fn unknown_datastore_index_is_a_state_error() {
        let (_dir, _state, _rec, pre) = prebootstrap().await;
        assert_eq!(
            pre.configure_datastore(7).await.unwrap_err().kind(),
            ErrorKind::State
        );
    }
}
