//! Blocking SSH transport behind a trait so the engine can be driven by a fake.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use thiserror::Error;

/// SSH port on every provisioned VM
pub const SSH_PORT: u16 = 22;

/// Host key algorithms the transport accepts
const HOST_KEY_PREFS: &str = "ssh-ed25519,rsa-sha2-256,rsa-sha2-512,ssh-rsa";

/// Key presented by the remote host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostKey {
    /// Algorithm name from the key blob (e.g. "ssh-ed25519")
    pub algorithm: String,
    /// `SHA256:<base64>` fingerprint, as printed by `ssh-keygen -l`
    pub fingerprint: String,
}

impl HostKey {
    /// Build from the raw wire-format key blob and its SHA-256 hash
    pub fn from_blob(blob: &[u8], sha256: &[u8]) -> Self {
        Self {
            algorithm: key_algorithm(blob).unwrap_or_default(),
            fingerprint: format!("SHA256:{}", STANDARD_NO_PAD.encode(sha256)),
        }
    }
}

/// Algorithm name encoded in the first string of an SSH key blob
pub fn key_algorithm(blob: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4 + len)?;
    String::from_utf8(name.to_vec()).ok()
}

/// Failure to get an authenticated connection
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP or handshake failure; the host may still be booting
    #[error("host unreachable: {0}")]
    Unreachable(String),
    /// Host key failed verification
    #[error("host key rejected: {0}")]
    HostKeyRejected(String),
    /// Public key authentication failed
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Failure running one command on an open connection
#[derive(Debug, Error)]
pub enum ExecError {
    /// Could not open a session channel
    #[error("failed to open session channel: {0}")]
    ChannelOpen(String),
    /// The remote side closed without reporting an exit status
    #[error("missing exit status")]
    MissingExitStatus,
    /// Connection broke while reading output
    #[error("connection error: {0}")]
    Io(String),
}

/// Result of one remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Process exit status
    pub exit_status: i32,
}

/// Host key check run between handshake and authentication
pub type HostKeyVerifier<'a> = &'a (dyn Fn(&HostKey) -> Result<(), String> + Sync);

/// An authenticated connection to one host
pub trait Connection: Send {
    /// Run a command in a fresh session and wait for it to exit
    fn exec(&mut self, command: &str) -> Result<ExecOutput, ExecError>;
}

/// Opens authenticated connections. All calls block.
pub trait Transport: Send + Sync {
    /// Dial, handshake, verify the host key, authenticate
    fn connect(
        &self,
        host: &str,
        user: &str,
        private_key: &str,
        verify: HostKeyVerifier<'_>,
    ) -> Result<Box<dyn Connection>, ConnectError>;
}

/// libssh2 backed transport
#[derive(Clone, Debug)]
pub struct Ssh2Transport {
    port: u16,
    timeout: Duration,
}

impl Default for Ssh2Transport {
    fn default() -> Self {
        Self {
            port: SSH_PORT,
            timeout: Duration::from_secs(300),
        }
    }
}

impl Ssh2Transport {
    /// Transport dialing `port` with the given I/O timeout
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    fn resolve(&self, host: &str) -> Result<SocketAddr, ConnectError> {
        (host, self.port)
            .to_socket_addrs()
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?
            .next()
            .ok_or_else(|| ConnectError::Unreachable(format!("no address for {}", host)))
    }
}

impl Transport for Ssh2Transport {
    fn connect(
        &self,
        host: &str,
        user: &str,
        private_key: &str,
        verify: HostKeyVerifier<'_>,
    ) -> Result<Box<dyn Connection>, ConnectError> {
        let unreachable = |e: ssh2::Error| ConnectError::Unreachable(e.to_string());

        let addr = self.resolve(host)?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let mut session = ssh2::Session::new().map_err(unreachable)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.timeout.as_millis() as u32);
        session
            .method_pref(ssh2::MethodType::HostKey, HOST_KEY_PREFS)
            .map_err(unreachable)?;
        session.handshake().map_err(unreachable)?;

        let blob = session
            .host_key()
            .map(|(blob, _)| blob.to_vec())
            .ok_or_else(|| ConnectError::HostKeyRejected("no host key presented".into()))?;
        let hash = session
            .host_key_hash(ssh2::HashType::Sha256)
            .ok_or_else(|| ConnectError::HostKeyRejected("host key hash unavailable".into()))?;
        verify(&HostKey::from_blob(&blob, hash)).map_err(ConnectError::HostKeyRejected)?;

        session
            .userauth_pubkey_memory(user, None, private_key, None)
            .map_err(|e| ConnectError::Auth(e.to_string()))?;
        if !session.authenticated() {
            return Err(ConnectError::Auth(format!("{} was not accepted", user)));
        }

        Ok(Box::new(Ssh2Connection { session }))
    }
}

struct Ssh2Connection {
    session: ssh2::Session,
}

impl Connection for Ssh2Connection {
    fn exec(&mut self, command: &str) -> Result<ExecOutput, ExecError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| ExecError::ChannelOpen(e.to_string()))?;
        channel
            .exec(command)
            .map_err(|e| ExecError::ChannelOpen(e.to_string()))?;

        let limit = Duration::from_millis(u64::from(self.session.timeout()));
        let started = Instant::now();
        self.session.set_blocking(false);
        let read = {
            let mut out = channel.stream(0);
            let mut err = channel.stderr();
            read_interleaved(&mut out, &mut err, || {
                if !limit.is_zero() && started.elapsed() > limit {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no output before timeout"));
                }
                std::thread::sleep(READ_IDLE);
                Ok(())
            })
        };
        self.session.set_blocking(true);
        let (stdout, stderr) = read.map_err(|e| ExecError::Io(e.to_string()))?;

        channel
            .wait_close()
            .map_err(|_| ExecError::MissingExitStatus)?;
        let exit_status = channel
            .exit_status()
            .map_err(|_| ExecError::MissingExitStatus)?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }
}

/// Pause between polls when neither stream has data
const READ_IDLE: Duration = Duration::from_millis(20);

/// Drain stdout and stderr together until both reach end of file.
///
/// Reads alternate between the streams, so a command filling its stderr
/// window is never left waiting on a stdout reader. `WouldBlock` means no data
/// is buffered yet; `idle` runs whenever a pass over both streams read nothing.
fn read_interleaved(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    mut idle: impl FnMut() -> io::Result<()>,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut streams: [(&mut dyn Read, Vec<u8>, bool); 2] =
        [(stdout, Vec::new(), true), (stderr, Vec::new(), true)];
    let mut buf = [0u8; 8192];
    while streams.iter().any(|(_, _, open)| *open) {
        let mut progressed = false;
        for (reader, collected, open) in streams.iter_mut().filter(|(_, _, open)| *open) {
            match reader.read(&mut buf) {
                Ok(0) => *open = false,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(e),
            }
        }
        if !progressed && streams.iter().any(|(_, _, open)| *open) {
            idle()?;
        }
    }
    let [(_, out, _), (_, err, _)] = streams;
    Ok((out, err))
}
