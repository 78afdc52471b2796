//! kubeadm on an external etcd datastore.
//!
//! Join material is minted locally before control plane 0 runs `kubeadm init`
//! and persisted first, so a rerun after a crash initialises with the same
//! token and certificate key the document already holds.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use minijinja::context;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::info;

use kiln_common::state::{BootstrapBase, KubeadmState};
use kiln_common::{BootstrapProvider, Cni, Error, Operation, Result, Role};
use kiln_remote::{single_output, Script, ScriptCollection};

use crate::distro::Bootstrap;
use crate::prebootstrap::{
    choose_version, etcd_certs_script, node_ip, or_default, PreBootstrap, ETCD_CERT_DIR,
};
use crate::remote::templated;
use crate::render::render;

const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const KUBECTL: &str = "sudo kubectl --kubeconfig /etc/kubernetes/admin.conf";

/// Lifetime of a bootstrap token
const TOKEN_TTL_MINUTES: i64 = 20;

/// Tokens closer than this to expiry are replaced before a join
const TOKEN_RENEW_MINUTES: i64 = 10;

const TOKEN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

const DISCOVERY_HASH_SCRIPT: &str = "openssl x509 -pubkey -in /etc/kubernetes/pki/ca.crt \
| openssl rsa -pubin -outform der 2>/dev/null \
| openssl dgst -sha256 -hex | sed 's/^.* //'";

const FAKE_DISCOVERY_HASH: &str =
    "6a1b3d5f7e9c0b2a4d6f8e1c3b5a7d9f0e2c4b6a8d1f3e5c7b9a0d2f4e6c8b1a";
const FAKE_TOKEN: &str = "fake00.fake00fake00fake";

fn random_chars(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

/// Bootstrap token in kubeadm's `[a-z0-9]{6}.[a-z0-9]{16}` format
pub fn generate_bootstrap_token() -> String {
    let mut rng = rand::thread_rng();
    format!("{}.{}", random_chars(&mut rng, 6), random_chars(&mut rng, 16))
}

/// 32 random bytes, hex encoded, for encrypting uploaded control plane certs
pub fn generate_certificate_key() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The kubeadm distribution
pub struct Kubeadm {
    pre: PreBootstrap,
    renew: Mutex<()>,
}

impl Kubeadm {
    /// kubeadm steps over the shared pre-bootstrap
    pub fn new(pre: PreBootstrap) -> Self {
        Self {
            pre,
            renew: Mutex::new(()),
        }
    }

    async fn kubeadm_state(&self) -> KubeadmState {
        self.pre
            .state
            .read(|d| d.k8s_bootstrap.kubeadm.clone().unwrap_or_default())
            .await
    }

    async fn version(&self) -> String {
        self.pre
            .state
            .read(|d| {
                or_default(
                    &d.versions.kubeadm,
                    BootstrapProvider::Kubeadm.default_version(),
                )
            })
            .await
    }

    async fn update_kubeadm(&self, f: impl FnOnce(&mut KubeadmState) + Send) -> Result<()> {
        self.pre
            .state
            .update(|d| f(d.k8s_bootstrap.kubeadm.get_or_insert_with(KubeadmState::default)))
            .await
    }

    /// Token and certificate key, minted and persisted on first use
    async fn join_material(&self) -> Result<KubeadmState> {
        let current = self.kubeadm_state().await;
        if !current.bootstrap_token.is_empty() && !current.certificate_key.is_empty() {
            return Ok(current);
        }
        let token = generate_bootstrap_token();
        let key = generate_certificate_key();
        let expires = Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES);
        self.update_kubeadm(|k| {
            k.bootstrap_token = token;
            k.certificate_key = key;
            k.bootstrap_token_expires_at = Some(expires);
        })
        .await?;
        info!("kubeadm join material minted");
        Ok(self.kubeadm_state().await)
    }

    /// Replace the bootstrap token through control plane 0 when it is about
    /// to expire
    async fn fresh_token(&self, base: &BootstrapBase) -> Result<String> {
        let _guard = self.renew.lock().await;
        let current = self.kubeadm_state().await;
        let renew_by = Utc::now() + Duration::minutes(TOKEN_RENEW_MINUTES);
        let valid = current
            .bootstrap_token_expires_at
            .is_some_and(|at| at > renew_by);
        if valid && !current.bootstrap_token.is_empty() {
            return Ok(current.bootstrap_token);
        }

        let host = node_ip(&base.public_ips, Role::ControlPlane, 0)?;
        info!(host = %host, "bootstrap token expiring, creating a new one");
        let scripts: ScriptCollection = [Script::new(
            "kubeadm-token",
            format!("sudo kubeadm token create --ttl {}m", TOKEN_TTL_MINUTES),
        )
        .with_fake_output(FAKE_TOKEN)]
        .into_iter()
        .collect();
        let token = single_output(
            self.pre.remote.run_with_output(&base.ssh, &host, scripts).await?,
            "bootstrap token",
        )?;
        if token.is_empty() {
            return Err(Error::remote_command(&host, "kubeadm-token", "no token printed"));
        }

        let expires = Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES);
        let recorded = token.clone();
        self.update_kubeadm(|k| {
            k.bootstrap_token = recorded;
            k.bootstrap_token_expires_at = Some(expires);
        })
        .await?;
        Ok(token)
    }

    async fn fetch_discovery_hash(&self, base: &BootstrapBase, host: &str) -> Result<()> {
        let scripts: ScriptCollection = [Script::new("kubeadm-discovery-hash", DISCOVERY_HASH_SCRIPT)
            .with_fake_output(FAKE_DISCOVERY_HASH)]
        .into_iter()
        .collect();
        let hash = single_output(
            self.pre.remote.run_with_output(&base.ssh, host, scripts).await?,
            "discovery hash",
        )?;
        if hash.is_empty() {
            return Err(Error::remote_command(
                host,
                "kubeadm-discovery-hash",
                "empty CA public key hash",
            ));
        }
        self.update_kubeadm(|k| k.discovery_token_ca_cert_hash = format!("sha256:{}", hash))
            .await
    }

    fn join_script(
        base: &BootstrapBase,
        material: &KubeadmState,
        token: &str,
        control_plane_ip: Option<&str>,
    ) -> Result<Script> {
        Ok(templated(
            "kubeadm-join.sh",
            context! {
                lb_private_ip => &base.private_ips.load_balancer,
                bootstrap_token => token,
                control_plane => control_plane_ip.is_some(),
                certificate_key => &material.certificate_key,
                private_ip => control_plane_ip.unwrap_or_default(),
                discovery_hash => &material.discovery_token_ca_cert_hash,
            },
        )?
        .with_retries(3))
    }

    async fn require_discovery(&self) -> Result<KubeadmState> {
        let material = self.kubeadm_state().await;
        if material.discovery_token_ca_cert_hash.is_empty() || material.certificate_key.is_empty() {
            return Err(Error::state(
                "kubeadm join material is missing; control plane 0 must be configured first",
            ));
        }
        Ok(material)
    }

    async fn init_first_control_plane(&self, base: &BootstrapBase, version: &str) -> Result<()> {
        let host = node_ip(&base.public_ips, Role::ControlPlane, 0)?;
        let private_ip = node_ip(&base.private_ips, Role::ControlPlane, 0)?;
        let material = self.join_material().await?;

        let endpoints: Vec<String> = base
            .private_ips
            .data_stores
            .iter()
            .map(|ip| format!("https://{}:2379", ip))
            .collect();
        let config = render(
            "kubeadm-config.yaml",
            context! {
                bootstrap_token => &material.bootstrap_token,
                certificate_key => &material.certificate_key,
                private_ip => &private_ip,
                version => version,
                lb_private_ip => &base.private_ips.load_balancer,
                lb_public_ip => &base.public_ips.load_balancer,
                etcd_endpoints => endpoints,
                cert_dir => ETCD_CERT_DIR,
            },
        )?;

        let scripts = ScriptCollection::new();
        scripts.append(etcd_certs_script(base)?);
        scripts.append(
            templated("kubeadm-prerequisites.sh", context! { version => version })?
                .with_retries(3),
        );
        scripts.append(templated("kubeadm-init.sh", context! { config => config })?);
        self.pre.remote.run(&base.ssh, &host, scripts, false).await?;
        self.pre.state.persist().await?;

        self.fetch_discovery_hash(base, &host).await
    }
}

#[async_trait]
impl Bootstrap for Kubeadm {
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
            return self.update_kubeadm(|_| {}).await;
        }
        let present = self
            .pre
            .state
            .read(|d| d.k8s_bootstrap.kubeadm.is_some())
            .await;
        if !present {
            return Err(Error::state("cluster has no kubeadm record"));
        }
        Ok(())
    }

    async fn k8s_version(&self, version: &str) -> Result<()> {
        let recorded = self.pre.state.read(|d| d.versions.kubeadm.clone()).await;
        let chosen = choose_version(BootstrapProvider::Kubeadm, &recorded, version)?;
        info!(version = %chosen, "kubeadm version selected");
        self.pre.state.update(|d| d.versions.kubeadm = chosen).await
    }

    async fn cni(&self, name: &str) -> Result<bool> {
        let cni = Cni::parse(name);
        info!(cni = ?cni, "network plugin selected; kubeadm always installs it externally");
        self.pre
            .state
            .update(|d| {
                d.addons.cni = cni;
                d.addons.external_cni = true;
            })
            .await?;
        Ok(true)
    }

    async fn configure_control_plane(&self, index: usize) -> Result<()> {
        let (cluster, base, last) = self
            .pre
            .state
            .read(|d| {
                (
                    d.cluster_name.clone(),
                    d.k8s_bootstrap.base.clone(),
                    d.k8s_bootstrap.base.public_ips.control_planes.len().saturating_sub(1),
                )
            })
            .await;
        let host = node_ip(&base.public_ips, Role::ControlPlane, index)?;
        let version = self.version().await;

        info!(cluster = %cluster, role = %Role::ControlPlane, index, version = %version, "configuring control plane");
        if index == 0 {
            self.init_first_control_plane(&base, &version).await?;
        } else {
            let private_ip = node_ip(&base.private_ips, Role::ControlPlane, index)?;
            let material = self.require_discovery().await?;
            let token = self.fresh_token(&base).await?;

            let scripts = ScriptCollection::new();
            scripts.append(etcd_certs_script(&base)?);
            scripts.append(
                templated("kubeadm-prerequisites.sh", context! { version => &version })?
                    .with_retries(3),
            );
            scripts.append(Self::join_script(&base, &material, &token, Some(&private_ip))?);
            self.pre.remote.run(&base.ssh, &host, scripts, false).await?;
            self.pre.state.persist().await?;
        }

        if index == last {
            self.pre.fetch_kubeconfig(&host, ADMIN_CONF).await?;
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
        let material = self.require_discovery().await?;
        let version = self.version().await;
        let token = self.fresh_token(&base).await?;

        info!(cluster = %cluster, role = %Role::WorkerPlane, index, "joining worker");
        let scripts = ScriptCollection::new();
        scripts.append(
            templated("kubeadm-prerequisites.sh", context! { version => &version })?
                .with_retries(3),
        );
        scripts.append(Self::join_script(&base, &material, &token, None)?);
        self.pre.remote.run(&base.ssh, &host, scripts, false).await?;
        self.pre.state.persist().await?;
        info!(cluster = %cluster, role = %Role::WorkerPlane, index, "worker joined");
        Ok(())
    }

    async fn remove_worker_planes(&self, hostnames: &[String]) -> Result<()> {
        self.pre.remove_nodes(KUBECTL, hostnames).await
    }
}
