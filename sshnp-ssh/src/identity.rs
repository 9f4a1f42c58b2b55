//! Long-term signing key persistence (spec.md §6: "Daemon and client keep
//! only a local config directory for long-term keys"). Key *onboarding* —
//! provisioning a principal's identity onto the substrate in the first
//! place — is out of scope (spec.md §1); this is only the minimal
//! file-backed persistence a binary needs so its identity survives a
//! restart, generating a fresh key pair the first time it's asked for one.

use std::fs;
use std::path::Path;

use data_encoding::BASE64;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use sshnp_common::get_crypto_rng;

use crate::error::SigningError;
use crate::keys::SshKeyAlgo;
use crate::signing::LongTermSigningKey;

/// First line of an on-disk ed25519 key file, distinguishing it from the
/// PKCS8 PEM this module writes for RSA keys.
const ED25519_LABEL: &str = "sshnp-ed25519-seed-v1";

/// Loads the long-term signing key at `path`, generating `algo` and
/// persisting it (mode `0600` on unix) if the file doesn't exist yet.
pub fn load_or_generate_signing_key(path: &Path, algo: SshKeyAlgo) -> Result<LongTermSigningKey, SigningError> {
    if let Ok(contents) = fs::read_to_string(path) {
        return parse_signing_key(&contents);
    }

    let key = generate_signing_key(algo)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SigningError::Backend(e.to_string()))?;
    }
    fs::write(path, render_signing_key(&key)?).map_err(|e| SigningError::Backend(e.to_string()))?;
    restrict_permissions(path)?;
    Ok(key)
}

fn generate_signing_key(algo: SshKeyAlgo) -> Result<LongTermSigningKey, SigningError> {
    let mut rng = get_crypto_rng();
    Ok(match algo {
        SshKeyAlgo::Ed25519 => LongTermSigningKey::Ed25519(Box::new(ed25519_dalek::SigningKey::generate(&mut rng))),
        SshKeyAlgo::Rsa => LongTermSigningKey::Rsa2048(Box::new(
            RsaPrivateKey::new(&mut rng, 2048).map_err(|e| SigningError::Backend(e.to_string()))?,
        )),
    })
}

fn render_signing_key(key: &LongTermSigningKey) -> Result<String, SigningError> {
    match key {
        LongTermSigningKey::Ed25519(key) => {
            Ok(format!("{ED25519_LABEL}\n{}\n", BASE64.encode(&key.to_bytes())))
        }
        LongTermSigningKey::Rsa2048(key) => key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| SigningError::Backend(e.to_string())),
    }
}

fn parse_signing_key(contents: &str) -> Result<LongTermSigningKey, SigningError> {
    let mut lines = contents.lines();
    if lines.next() == Some(ED25519_LABEL) {
        let seed_line = lines
            .next()
            .ok_or_else(|| SigningError::Backend("key file missing ed25519 seed line".into()))?;
        let seed_bytes = BASE64
            .decode(seed_line.as_bytes())
            .map_err(|e| SigningError::Backend(e.to_string()))?;
        let seed: [u8; 32] = seed_bytes
            .as_slice()
            .try_into()
            .map_err(|_| SigningError::Backend("ed25519 seed must be 32 bytes".into()))?;
        return Ok(LongTermSigningKey::Ed25519(Box::new(ed25519_dalek::SigningKey::from_bytes(&seed))));
    }

    RsaPrivateKey::from_pkcs8_pem(contents)
        .map(|key| LongTermSigningKey::Rsa2048(Box::new(key)))
        .map_err(|e| SigningError::Backend(e.to_string()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), SigningError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .map_err(|e| SigningError::Backend(e.to_string()))?
        .permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).map_err(|e| SigningError::Backend(e.to_string()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), SigningError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_ed25519_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");

        let first = load_or_generate_signing_key(&path, SshKeyAlgo::Ed25519).unwrap();
        let second = load_or_generate_signing_key(&path, SshKeyAlgo::Ed25519).unwrap();

        assert_eq!(first.public_key_record(), second.public_key_record());
    }

    #[test]
    fn generates_and_reloads_rsa_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");

        let first = load_or_generate_signing_key(&path, SshKeyAlgo::Rsa).unwrap();
        let second = load_or_generate_signing_key(&path, SshKeyAlgo::Rsa).unwrap();

        assert_eq!(first.public_key_record(), second.public_key_record());
    }
}
