//! SSH key pair generation and private key checks.

use rand::rngs::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use kiln_common::state::SshKeyPair;
use kiln_common::{Error, Result};

/// Generate an Ed25519 key pair: OpenSSH PEM private key and an
/// authorized_keys public key.
pub fn generate_key_pair(comment: &str) -> Result<SshKeyPair> {
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| Error::certificate(format!("failed to generate ssh key: {}", e)))?;
    key.set_comment(comment);

    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| Error::certificate(format!("failed to encode ssh private key: {}", e)))?;
    let public_key = key
        .public_key()
        .to_openssh()
        .map_err(|e| Error::certificate(format!("failed to encode ssh public key: {}", e)))?;

    Ok(SshKeyPair {
        public_key,
        private_key: private_key.to_string(),
    })
}

/// Parse an OpenSSH private key, rejecting encrypted keys
pub fn check_private_key(host: &str, pem: &str) -> Result<()> {
    let key = PrivateKey::from_openssh(pem)
        .map_err(|e| Error::transport(host, format!("failed to parse private key: {}", e)))?;
    if key.is_encrypted() {
        return Err(Error::transport(host, "private key is encrypted"));
    }
    Ok(())
}
