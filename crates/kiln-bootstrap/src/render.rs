//! Script templates.
//!
//! Every remote script body lives under `templates/` and is compiled into the
//! binary. Rendering is strict: a variable missing from the context is an
//! error rather than an empty string in a shell command.

use minijinja::{Environment, UndefinedBehavior, Value};

use kiln_common::{Error, Result};

static TEMPLATES: &[(&str, &str)] = &[
    ("etcd-download.sh", include_str!("../templates/etcd-download.sh")),
    ("etcd-install.sh", include_str!("../templates/etcd-install.sh")),
    ("etcd-certs.sh", include_str!("../templates/etcd-certs.sh")),
    ("etcd-unit.sh", include_str!("../templates/etcd-unit.sh")),
    ("etcd-start.sh", include_str!("../templates/etcd-start.sh")),
    ("haproxy-install.sh", include_str!("../templates/haproxy-install.sh")),
    ("haproxy-enable.sh", include_str!("../templates/haproxy-enable.sh")),
    ("haproxy-config.sh", include_str!("../templates/haproxy-config.sh")),
    ("haproxy-restart.sh", include_str!("../templates/haproxy-restart.sh")),
    ("k3s-server.sh", include_str!("../templates/k3s-server.sh")),
    ("k3s-agent.sh", include_str!("../templates/k3s-agent.sh")),
    (
        "kubeadm-prerequisites.sh",
        include_str!("../templates/kubeadm-prerequisites.sh"),
    ),
    ("kubeadm-config.yaml", include_str!("../templates/kubeadm-config.yaml")),
    ("kubeadm-init.sh", include_str!("../templates/kubeadm-init.sh")),
    ("kubeadm-join.sh", include_str!("../templates/kubeadm-join.sh")),
    ("remove-nodes.sh", include_str!("../templates/remove-nodes.sh")),
];

fn template_error(name: &str, e: minijinja::Error) -> Error {
    Error::internal_with_context("template", format!("{}: {}", name, e))
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    for &(name, source) in TEMPLATES {
        env.add_template(name, source)
            .map_err(|e| template_error(name, e))?;
    }
    Ok(env)
}

/// Render a bundled template
///
/// # Arguments
/// * `name` - File name under `templates/`
/// * `ctx` - Built with `minijinja::context!`
pub fn render(name: &str, ctx: Value) -> Result<String> {
    let env = environment()?;
    env.get_template(name)
        .map_err(|e| template_error(name, e))?
        .render(ctx)
        .map_err(|e| template_error(name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn every_bundled_template_parses() {
        environment().unwrap();
    }

    #[test]
    fn missing_variables_are_errors() {
        let err = render("etcd-download.sh", context! {}).unwrap_err();
        assert!(err.to_string().contains("etcd-download.sh"));
    }

    #[test]
    fn haproxy_lists_one_server_per_control_plane() {
        let out = render(
            "haproxy-config.sh",
            context! { control_plane_ips => vec!["10.0.0.2", "10.0.0.3", "10.0.0.4"] },
        )
        .unwrap();
        assert!(out.contains("  server k3sserver-1 10.0.0.2:6443 check\n"));
        assert!(out.contains("  server k3sserver-3 10.0.0.4:6443 check\nCFG"));
        assert!(out.contains("balance roundrobin\n  server k3sserver-1"));
    }

    #[test]
    fn node_removal_is_best_effort_per_host() {
        let out = render(
            "remove-nodes.sh",
            context! { kubectl => "sudo k3s kubectl", hostnames => vec!["demo-wp-3", "demo-wp-4"] },
        )
        .unwrap();
        assert_eq!(out.matches("|| true").count(), 4);
        assert!(out.contains("sudo k3s kubectl delete node demo-wp-4 --ignore-not-found"));
    }

    #[test]
    fn k3s_server_flags_follow_context() {
        let base = |token: &str, external_cni: bool| {
            render(
                "k3s-server.sh",
                context! {
                    version => "v1.30.3+k3s1",
                    token => token,
                    datastore_endpoints => "https://10.0.0.5:2379",
                    cert_dir => "/var/lib/etcd-certs",
                    external_cni => external_cni,
                    lb_public_ip => "198.51.100.2",
                    lb_private_ip => "10.0.0.9",
                },
            )
            .unwrap()
        };

        let first = base("", false);
        assert!(!first.contains("--token"));
        assert!(!first.contains("--flannel-backend"));
        assert!(first.contains("NoExecute \\\n  --datastore-endpoint"));

        let join = base("K10abc::server:xyz", true);
        assert!(join.contains("--token \"K10abc::server:xyz\" \\\n"));
        assert!(join.contains("--flannel-backend none \\\n"));
        assert!(join.ends_with("--tls-san 10.0.0.9"));
    }
}
