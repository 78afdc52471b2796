//! Script execution against cluster nodes.

use std::sync::Arc;

use kiln_common::state::SshInfo;
use kiln_common::{Error, Result};
use kiln_remote::{ConnectionRequest, ExecutorFactory, Script, ScriptCollection};

use crate::render::render;

/// Runs script collections on nodes with the cluster's SSH identity.
///
/// Every call takes a fresh executor so concurrent steps never share one.
#[derive(Clone)]
pub struct Remote {
    factory: Arc<dyn ExecutorFactory>,
}

impl Remote {
    /// Wrap an executor factory
    pub fn new(factory: Arc<dyn ExecutorFactory>) -> Self {
        Self { factory }
    }

    fn request(ssh: &SshInfo, host: &str, scripts: ScriptCollection) -> Result<ConnectionRequest> {
        if host.is_empty() {
            return Err(Error::state("node has no recorded public address"));
        }
        if ssh.private_key.is_empty() {
            return Err(Error::state("ssh key pair is missing from the cluster state"));
        }
        Ok(ConnectionRequest::new(
            host,
            &ssh.user_name,
            &ssh.private_key,
            scripts,
        ))
    }

    /// Run `scripts` on `host`
    ///
    /// # Arguments
    /// * `fast` - Skip the settle pause; for nodes already reached once
    pub async fn run(
        &self,
        ssh: &SshInfo,
        host: &str,
        scripts: ScriptCollection,
        fast: bool,
    ) -> Result<()> {
        let request = Self::request(ssh, host, scripts)?.fast_mode(fast);
        self.factory.executor().execute(request).await
    }

    /// Run `scripts` on an already reached `host` and return each script's stdout
    pub async fn run_with_output(
        &self,
        ssh: &SshInfo,
        host: &str,
        scripts: ScriptCollection,
    ) -> Result<Vec<String>> {
        let request = Self::request(ssh, host, scripts)?
            .fast_mode(true)
            .with_output();
        let mut executor = self.factory.executor();
        executor.execute(request).await?;
        Ok(executor.take_output())
    }
}

/// Script rendered from a bundled template
pub(crate) fn templated(name: &str, ctx: minijinja::Value) -> Result<Script> {
    Ok(Script::new(
        name.trim_end_matches(".sh").to_string(),
        render(name, ctx)?,
    ))
}


#[cfg(test)]
mod tests {
    use super::test_support::{ssh, RecordingExecutor};
    use super::*;
    use kiln_common::ErrorKind;

    #[tokio::test]
    async fn output_is_returned_per_script() {
        let rec = RecordingExecutor::default();
        rec.answer("token", "abc\n");
        let remote = Remote::new(Arc::new(rec.clone()));

        let scripts: ScriptCollection =
            [Script::new("noop", "true"), Script::new("token", "cat token")]
                .into_iter()
                .collect();
        let out = remote.run_with_output(&ssh(), "198.51.100.9", scripts).await.unwrap();
        assert_eq!(out, vec!["".to_string(), "abc\n".to_string()]);
        assert_eq!(rec.names_on("198.51.100.9"), vec!["noop", "token"]);
    }

    #[tokio::test]
    async fn node_without_address_is_a_state_error() {
        let remote = Remote::new(Arc::new(RecordingExecutor::default()));
        let err = remote
            .run(&ssh(), "", ScriptCollection::new(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn templated_scripts_are_named_after_the_template() {
        let script = templated(
            "haproxy-restart.sh",
            minijinja::context! {},
        )
        .unwrap();
        assert_eq!(script.name, "haproxy-restart");
        assert!(script.body.contains("systemctl restart haproxy"));
    }
}
