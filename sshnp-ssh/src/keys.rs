use std::path::Path;

use sshnp_common::{get_crypto_rng, Secret};
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::{AuthError, SigningError};

/// SSH key algorithm for a session's ephemeral key pair, selected by the
/// client's `sshAlgo` configuration (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshKeyAlgo {
    Ed25519,
    Rsa,
}

/// The canonical set of accepted OpenSSH public-key prefixes (spec.md §9
/// Open Question, resolved as authoritative): anything else — `ssh-dss`,
/// `ecdsa-sha2-*`, etc. — is rejected wherever an SSH public key string
/// crosses a trust boundary (the daemon accepting a client-shared key in
/// reverse mode, or the client validating what it generated).
pub const SUPPORTED_SSH_KEY_PREFIXES: [&str; 2] = ["ssh-ed25519", "ssh-rsa"];

pub fn validate_ssh_public_key_prefix(key: &str) -> Result<(), AuthError> {
    let prefix = key.split_whitespace().next().unwrap_or("");
    if SUPPORTED_SSH_KEY_PREFIXES.contains(&prefix) {
        Ok(())
    } else {
        Err(AuthError::UnsupportedAlgorithm)
    }
}

/// A per-session ephemeral SSH key pair (spec.md §4.2, §4.3). Destroyed on
/// cleanup regardless of session outcome (spec.md §3 invariant).
pub struct EphemeralKeyPair {
    pub algo: SshKeyAlgo,
    pub public_openssh: String,
    pub private_openssh: Secret<String>,
}

/// Generates a fresh ephemeral key pair for one session. Never persisted to
/// disk by this function; callers that need a key file on disk (to hand to
/// an `exec`-driven `ssh` subprocess) write it under the session's scoped
/// temp directory and register it with the cleanup tracker.
pub fn generate_ephemeral_keypair(algo: SshKeyAlgo) -> Result<EphemeralKeyPair, SigningError> {
    let mut rng = get_crypto_rng();
    let key = match algo {
        SshKeyAlgo::Ed25519 => PrivateKey::random(&mut rng, Algorithm::Ed25519)
            .map_err(|e| SigningError::Backend(e.to_string()))?,
        SshKeyAlgo::Rsa => PrivateKey::random(&mut rng, Algorithm::Rsa { hash: None })
            .map_err(|e| SigningError::Backend(e.to_string()))?,
    };
    let public_openssh = key
        .public_key()
        .to_openssh()
        .map_err(|e| SigningError::Backend(e.to_string()))?;
    let private_openssh = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| SigningError::Backend(e.to_string()))?
        .to_string();
    Ok(EphemeralKeyPair {
        algo,
        public_openssh,
        private_openssh: Secret::new(private_openssh),
    })
}

/// Loads an already-generated OpenSSH key pair from disk, for the client's
/// `--identity-file` override (spec.md §6): a caller-supplied identity used
/// in place of a freshly generated ephemeral key pair.
pub fn load_keypair_from_file(path: &Path) -> Result<EphemeralKeyPair, SigningError> {
    let key = PrivateKey::read_openssh_file(path).map_err(|e| SigningError::Backend(e.to_string()))?;
    let algo = match key.algorithm() {
        Algorithm::Ed25519 => SshKeyAlgo::Ed25519,
        Algorithm::Rsa { .. } => SshKeyAlgo::Rsa,
        other => return Err(SigningError::Backend(format!("unsupported identity key algorithm: {other:?}"))),
    };
    let public_openssh = key
        .public_key()
        .to_openssh()
        .map_err(|e| SigningError::Backend(e.to_string()))?;
    let private_openssh = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| SigningError::Backend(e.to_string()))?
        .to_string();
    Ok(EphemeralKeyPair {
        algo,
        public_openssh,
        private_openssh: Secret::new(private_openssh),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_keypair_has_expected_prefix() {
        let pair = generate_ephemeral_keypair(SshKeyAlgo::Ed25519).unwrap();
        assert!(pair.public_openssh.starts_with("ssh-ed25519 "));
        validate_ssh_public_key_prefix(&pair.public_openssh).unwrap();
    }

    #[test]
    fn rejects_unsupported_prefix() {
        assert!(validate_ssh_public_key_prefix("ssh-dss AAAA...").is_err());
    }

    #[test]
    fn rejects_empty_key() {
        assert!(validate_ssh_public_key_prefix("").is_err());
    }
}
