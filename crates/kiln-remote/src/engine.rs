//! Remote execution engine.
//!
//! One engine per host: load the key, wait for sshd to settle, dial with
//! backoff, verify the host fingerprint, then run every script of the
//! collection in order. Each script run opens its own session and reopens it
//! on channel failures; scripts flagged retryable are re-run up to their own
//! budget before the collection fails.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln_common::config::Timing;
use kiln_common::{Error, ErrorAction, Result};

use crate::fingerprint::{keyscan_type, FingerprintLookup, KeyscanLookup};
use crate::keypair::check_private_key;
use crate::script::{Script, ScriptCollection};
use crate::transport::{
    ConnectError, Connection, ExecError, ExecOutput, HostKey, Ssh2Transport, Transport,
};

/// Canned stdout a fake run returns for scripts without their own
pub const FAKE_STDOUT: &str = "stdout";

/// Everything needed to run a script collection on one host
#[derive(Debug)]
pub struct ConnectionRequest {
    /// IPv4 address of the host
    pub host: String,
    /// Login user
    pub user: String,
    /// OpenSSH private key
    pub private_key: String,
    /// Skip the settle pause before dialing
    pub fast_mode: bool,
    /// Keep each script's stdout for [`RemoteExecutor::take_output`]
    pub capture_output: bool,
    /// Scripts to run, in order
    pub scripts: ScriptCollection,
}

impl ConnectionRequest {
    /// Request with settle pause and no output capture
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        private_key: impl Into<String>,
        scripts: ScriptCollection,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            private_key: private_key.into(),
            fast_mode: false,
            capture_output: false,
            scripts,
        }
    }

    /// Set fast mode
    pub fn fast_mode(mut self, fast: bool) -> Self {
        self.fast_mode = fast;
        self
    }

    /// Capture stdout of every script
    pub fn with_output(mut self) -> Self {
        self.capture_output = true;
        self
    }
}

/// Runs script collections on one host
#[async_trait]
pub trait RemoteExecutor: Send {
    /// Run every script of the request
    async fn execute(&mut self, request: ConnectionRequest) -> Result<()>;

    /// Captured stdout of the last execution, one entry per script; clears it
    fn take_output(&mut self) -> Vec<String>;
}

/// Creates one executor per host
pub trait ExecutorFactory: Send + Sync {
    /// A fresh executor
    fn executor(&self) -> Box<dyn RemoteExecutor>;
}

/// First captured output, trimmed
pub fn single_output(outputs: Vec<String>, what: &str) -> Result<String> {
    outputs
        .into_iter()
        .next()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| Error::internal_with_context("remote", format!("no output for {}", what)))
}

fn verify_host_key(
    lookup: &dyn FingerprintLookup,
    host: &str,
    key: &HostKey,
) -> std::result::Result<(), String> {
    let key_type = keyscan_type(&key.algorithm)
        .ok_or_else(|| format!("unsupported key type '{}'", key.algorithm))?;
    let expected = lookup
        .fingerprint(host, key_type)
        .map_err(|e| format!("failed to fetch server public keys: {}", e))?;
    if expected != key.fingerprint {
        return Err("mismatch of SSH fingerprint".to_string());
    }
    Ok(())
}

fn escalate_transport(err: Error) -> ErrorAction {
    match err {
        Error::Transport { .. } => ErrorAction::Escalate(err),
        other => ErrorAction::Continue(other),
    }
}

type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

/// SSH backed [`RemoteExecutor`]
pub struct SshEngine {
    transport: Arc<dyn Transport>,
    lookup: Arc<dyn FingerprintLookup>,
    timing: Timing,
    fake: bool,
    cancel: CancellationToken,
    output: Vec<String>,
}

impl SshEngine {
    /// Engine over the given transport and fingerprint lookup
    pub fn new(
        transport: Arc<dyn Transport>,
        lookup: Arc<dyn FingerprintLookup>,
        timing: Timing,
    ) -> Self {
        Self {
            transport,
            lookup,
            timing,
            fake: false,
            cancel: CancellationToken::new(),
            output: Vec::new(),
        }
    }

    /// Short-circuit the transport: every script "succeeds" with [`FAKE_STDOUT`]
    pub fn fake(mut self, fake: bool) -> Self {
        self.fake = fake;
        self
    }

    /// Abort dial and session retries when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn dial(&self, request: &ConnectionRequest) -> Result<SharedConnection> {
        let host = request.host.clone();
        let conn = self
            .timing
            .ssh_dial
            .run(
                &self.cancel,
                "ssh dial",
                || {
                    let transport = self.transport.clone();
                    let lookup = self.lookup.clone();
                    let host = request.host.clone();
                    let user = request.user.clone();
                    let key = request.private_key.clone();
                    async move {
                        let target = host.clone();
                        let connected = tokio::task::spawn_blocking(move || {
                            let verify =
                                |k: &HostKey| verify_host_key(lookup.as_ref(), &target, k);
                            transport.connect(&target, &user, &key, &verify)
                        })
                        .await
                        .map_err(|e| Error::internal_with_context("ssh dial", e.to_string()))?;

                        connected.map_err(|e| match e {
                            ConnectError::HostKeyRejected(msg) => Error::transport(&host, msg),
                            other => Error::internal_with_context("ssh dial", other.to_string()),
                        })
                    }
                },
                |_| true,
                escalate_transport,
                Ok,
            )
            .await
            .map_err(|e| match e {
                Error::Timeout { reason, .. } => {
                    Error::transport(&host, format!("dial retries exhausted: {}", reason))
                }
                other => other,
            })?;

        debug!(host = %host, "ssh connection established");
        Ok(Arc::new(Mutex::new(conn)))
    }

    /// Run one command, reopening the session on channel failures
    async fn exec_once(
        &self,
        host: &str,
        conn: &SharedConnection,
        body: &str,
    ) -> Result<ExecOutput> {
        self.timing
            .ssh_session
            .run(
                &self.cancel,
                "ssh session",
                || {
                    let conn = conn.clone();
                    let body = body.to_string();
                    let host = host.to_string();
                    async move {
                        let result = tokio::task::spawn_blocking(move || {
                            conn.lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .exec(&body)
                        })
                        .await
                        .map_err(|e| Error::internal_with_context("ssh session", e.to_string()))?;

                        result.map_err(|e| match e {
                            ExecError::Io(msg) => Error::transport(&host, msg),
                            other => Error::internal_with_context("ssh session", other.to_string()),
                        })
                    }
                },
                |_| true,
                escalate_transport,
                Ok,
            )
            .await
    }

    async fn pause(&self, duration: Duration, operation: &str) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn retry_pause(&self) -> Duration {
        let base = self.timing.script_retry_pause;
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        base + Duration::from_millis(jitter)
    }

    async fn run_script(&self, host: &str, conn: &SharedConnection, script: &Script) -> Result<String> {
        let attempts = if script.can_retry {
            script.max_retries.max(1)
        } else {
            1
        };
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self.exec_once(host, conn, &script.body).await {
                Ok(out) if out.exit_status == 0 => {
                    debug!(host = %host, script = %script.name, stdout = %out.stdout, "script output");
                    return Ok(out.stdout);
                }
                Ok(out) => {
                    reason = format!("exit status {}: {}", out.exit_status, out.stderr.trim());
                }
                Err(e @ Error::Transport { .. }) | Err(e @ Error::Cancelled { .. }) => return Err(e),
                Err(e) => reason = e.to_string(),
            }

            if attempt < attempts {
                warn!(
                    host = %host,
                    script = %script.name,
                    attempt = attempt,
                    reason = %reason,
                    "script failed, retrying"
                );
                self.pause(self.retry_pause(), "script retry").await?;
            }
        }

        Err(Error::remote_command(host, &script.name, reason))
    }
}

#[async_trait]
impl RemoteExecutor for SshEngine {
    async fn execute(&mut self, request: ConnectionRequest) -> Result<()> {
        let host = request.host.clone();

        if self.fake {
            while let Some(script) = request.scripts.next_script() {
                debug!(host = %host, script = %script.name, "fake execution");
                if request.capture_output {
                    let stdout = script.fake_output.unwrap_or_else(|| FAKE_STDOUT.to_string());
                    self.output.push(stdout);
                }
            }
            return Ok(());
        }

        check_private_key(&host, &request.private_key)?;

        if !request.fast_mode {
            self.pause(self.timing.ssh_settle, "ssh settle").await?;
        }

        let conn = self.dial(&request).await?;

        while let Some(script) = request.scripts.next_script() {
            info!(host = %host, script = %script.name, "executing script");
            let stdout = self.run_script(&host, &conn, &script).await?;
            if request.capture_output {
                self.output.push(stdout);
            }
        }

        info!(host = %host, "scripts completed");
        Ok(())
    }

    fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }
}

/// Factory producing [`SshEngine`]s that share a transport and lookup
#[derive(Clone)]
pub struct SshExecutorFactory {
    transport: Arc<dyn Transport>,
    lookup: Arc<dyn FingerprintLookup>,
    timing: Timing,
    fake: bool,
    cancel: CancellationToken,
}

impl SshExecutorFactory {
    /// libssh2 transport with `ssh-keyscan` fingerprint checks
    pub fn new(timing: Timing, fake: bool) -> Self {
        Self {
            transport: Arc::new(Ssh2Transport::default()),
            lookup: Arc::new(KeyscanLookup),
            timing,
            fake,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the transport and fingerprint lookup
    pub fn with_transport(
        mut self,
        transport: Arc<dyn Transport>,
        lookup: Arc<dyn FingerprintLookup>,
    ) -> Self {
        self.transport = transport;
        self.lookup = lookup;
        self
    }

    /// Cancellation shared by every engine
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl ExecutorFactory for SshExecutorFactory {
    fn executor(&self) -> Box<dyn RemoteExecutor> {
        Box::new(
            SshEngine::new(self.transport.clone(), self.lookup.clone(), self.timing)
                .fake(self.fake)
                .with_cancel(self.cancel.clone()),
        )
    }
}
