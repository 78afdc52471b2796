//! Kubeconfig rewriting.
//!
//! Distributions write an admin kubeconfig pointing at a node-local or
//! private endpoint under generic names. Before it is stored it is rewritten
//! to reach the API server through the load balancer's public address under a
//! context name unique to the cluster, so several clusters can be merged into
//! one local kubeconfig.

use serde_yaml::Value;

use kiln_common::{Error, Result, API_SERVER_PORT};

/// Admin kubeconfig reported by fake runs
pub(crate) const FAKE_KUBECONFIG: &str = "apiVersion: v1
clusters:
- cluster:
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
users:
- name: default
  user: {}
";

fn single_entry<'a>(config: &'a mut Value, section: &str) -> Result<&'a mut Value> {
    let entries = config
        .get_mut(section)
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| Error::kubeconfig(format!("kubeconfig has no {} list", section)))?;
    match entries.as_mut_slice() {
        [entry] => Ok(entry),
        other => Err(Error::kubeconfig(format!(
            "expected exactly one entry in {}, found {}",
            section,
            other.len()
        ))),
    }
}

fn set(entry: &mut Value, key: &str, value: &str) -> Result<()> {
    let map = entry
        .as_mapping_mut()
        .ok_or_else(|| Error::kubeconfig(format!("'{}' parent is not a mapping", key)))?;
    map.insert(Value::from(key), Value::from(value));
    Ok(())
}

fn nested<'a>(entry: &'a mut Value, key: &str) -> Result<&'a mut Value> {
    entry
        .get_mut(key)
        .ok_or_else(|| Error::kubeconfig(format!("kubeconfig entry has no '{}'", key)))
}

/// Point an admin kubeconfig at the load balancer and rename it.
///
/// # Arguments
/// * `raw` - Kubeconfig as fetched from the first control plane
/// * `context` - Name given to the cluster, user and context entries
/// * `lb_public_ip` - Public address of the API server load balancer
pub fn rewrite_kubeconfig(raw: &str, context: &str, lb_public_ip: &str) -> Result<String> {
    let mut config: Value = serde_yaml::from_str(raw)
        .map_err(|e| Error::kubeconfig(format!("failed to parse kubeconfig: {}", e)))?;
    let server = format!("https://{}:{}", lb_public_ip, API_SERVER_PORT);

    let cluster = single_entry(&mut config, "clusters")?;
    set(cluster, "name", context)?;
    set(nested(cluster, "cluster")?, "server", &server)?;

    let user = single_entry(&mut config, "users")?;
    set(user, "name", context)?;

    let ctx = single_entry(&mut config, "contexts")?;
    set(ctx, "name", context)?;
    let inner = nested(ctx, "context")?;
    set(inner, "cluster", context)?;
    set(inner, "user", context)?;

    set(&mut config, "current-context", context)?;

    serde_yaml::to_string(&config)
        .map_err(|e| Error::kubeconfig(format!("failed to serialize kubeconfig: {}", e)))
}
