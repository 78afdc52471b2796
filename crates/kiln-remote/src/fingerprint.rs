//! Out-of-band host key lookup.
//!
//! The fingerprint a host presents during the handshake is compared with one
//! fetched independently through `ssh-keyscan -t <type> <ip> | ssh-keygen -lf -`.

use std::io::Write;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

/// Fetches the expected fingerprint of a host. Calls block.
#[cfg_attr(test, automock)]
pub trait FingerprintLookup: Send + Sync {
    /// Expected `SHA256:<base64>` fingerprint of `host`'s key of `key_type`
    /// (`rsa` or `ed25519`)
    fn fingerprint(&self, host: &str, key_type: &str) -> Result<String, String>;
}

/// Map a key blob algorithm to the `ssh-keyscan -t` type, if supported
pub fn keyscan_type(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "ssh-ed25519" => Some("ed25519"),
        "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => Some("rsa"),
        _ => None,
    }
}

/// Second field of an `ssh-keygen -l` line: `256 SHA256:abc... host (ED25519)`
pub fn parse_keygen_fingerprint(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .split_whitespace()
        .nth(1)
        .filter(|f| f.starts_with("SHA256:"))
        .map(str::to_string)
}

/// Lookup shelling out to the OpenSSH tools
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyscanLookup;

impl FingerprintLookup for KeyscanLookup {
    fn fingerprint(&self, host: &str, key_type: &str) -> Result<String, String> {
        let scan = Command::new("ssh-keyscan")
            .args(["-t", key_type, host])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| format!("ssh-keyscan: {}", e))?;
        if scan.stdout.is_empty() {
            return Err(format!("ssh-keyscan returned no {} key for {}", key_type, host));
        }

        let mut keygen = Command::new("ssh-keygen")
            .args(["-lf", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("ssh-keygen: {}", e))?;
        keygen
            .stdin
            .take()
            .ok_or_else(|| "ssh-keygen stdin unavailable".to_string())?
            .write_all(&scan.stdout)
            .map_err(|e| format!("ssh-keygen: {}", e))?;
        let out = keygen
            .wait_with_output()
            .map_err(|e| format!("ssh-keygen: {}", e))?;

        parse_keygen_fingerprint(&String::from_utf8_lossy(&out.stdout))
            .ok_or_else(|| format!("no fingerprint in ssh-keygen output for {}", host))
    }
}
