use data_encoding::BASE64;
use ed25519_dalek::{Signer, Verifier};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};
use sshnp_common::{canonical_json, Envelope, HashingAlgo, PublicKeyRecord, SigningAlgo};

use crate::error::{AuthError, SigningError};

/// A principal's long-term signing key, loaded from local config (spec.md
/// §4.4). Never transmitted; only used to produce signatures.
pub enum LongTermSigningKey {
    Ed25519(Box<ed25519_dalek::SigningKey>),
    Rsa2048(Box<RsaPrivateKey>),
}

impl LongTermSigningKey {
    pub fn algo(&self) -> SigningAlgo {
        match self {
            LongTermSigningKey::Ed25519(_) => SigningAlgo::Ed25519,
            LongTermSigningKey::Rsa2048(_) => SigningAlgo::Rsa2048,
        }
    }

    pub fn public_key_record(&self) -> PublicKeyRecord {
        match self {
            LongTermSigningKey::Ed25519(key) => PublicKeyRecord {
                algo: SigningAlgo::Ed25519,
                key_bytes: key.verifying_key().to_bytes().to_vec(),
            },
            LongTermSigningKey::Rsa2048(key) => PublicKeyRecord {
                algo: SigningAlgo::Rsa2048,
                key_bytes: rsa_public_key_der(&key.to_public_key()),
            },
        }
    }

    fn sign_digest(&self, digest: &[u8], hashing_algo: HashingAlgo) -> Result<Vec<u8>, SigningError> {
        match self {
            LongTermSigningKey::Ed25519(key) => Ok(key.sign(digest).to_bytes().to_vec()),
            LongTermSigningKey::Rsa2048(key) => {
                let scheme = match hashing_algo {
                    HashingAlgo::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                    HashingAlgo::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
                };
                key.sign(scheme, digest)
                    .map_err(|e| SigningError::Backend(e.to_string()))
            }
        }
    }
}

/// DER-encoding helper kept free-standing since `RsaPublicKey` doesn't carry
/// a stable `Display`; grounded in how the teacher's TLS helpers
/// (`warpgate-common::tls::cert`) keep DER conversion as small free functions
/// rather than inherent methods on foreign types.
fn rsa_public_key_der(key: &RsaPublicKey) -> Vec<u8> {
    use rsa::pkcs8::EncodePublicKey;
    key.to_public_key_der()
        .expect("RSA public key should always encode to DER")
        .as_bytes()
        .to_vec()
}

fn digest(payload: &[u8], hashing_algo: HashingAlgo) -> Vec<u8> {
    match hashing_algo {
        HashingAlgo::Sha256 => Sha256::digest(payload).to_vec(),
        HashingAlgo::Sha512 => Sha512::digest(payload).to_vec(),
    }
}

/// Signs `payload` per spec.md §4.4: canonicalise, hash with `hashing_algo`,
/// sign the digest with `key`, base64-encode.
pub fn sign_envelope<P: Serialize>(
    key: &LongTermSigningKey,
    hashing_algo: HashingAlgo,
    payload: P,
) -> Result<Envelope<P>, SigningError> {
    let canonical = canonical_json(&payload)?;
    let digest = digest(&canonical, hashing_algo);
    let signature = key.sign_digest(&digest, hashing_algo)?;
    Ok(Envelope::new(
        BASE64.encode(&signature),
        hashing_algo,
        key.algo(),
        payload,
    ))
}

/// Verifies `envelope` against `pubkey`, per spec.md §4.4: re-canonicalise,
/// recompute the digest, verify the signature. Rejects algorithms outside
/// `{rsa2048, ed25519}` and a missing/mismatched public key.
pub fn verify_envelope<P: Serialize>(
    envelope: &Envelope<P>,
    pubkey: &PublicKeyRecord,
) -> Result<(), AuthError> {
    if pubkey.algo != envelope.signing_algo {
        return Err(AuthError::UnsupportedAlgorithm);
    }
    let canonical =
        canonical_json(&envelope.payload).map_err(|e| AuthError::MalformedKey(e.to_string()))?;
    let digest = digest(&canonical, envelope.hashing_algo);
    let signature = BASE64
        .decode(envelope.signature.as_bytes())
        .map_err(|e| AuthError::MalformedKey(e.to_string()))?;

    match envelope.signing_algo {
        SigningAlgo::Ed25519 => {
            let key_bytes: [u8; 32] = pubkey
                .key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::MalformedKey("ed25519 key must be 32 bytes".into()))?;
            let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
                .map_err(|e| AuthError::MalformedKey(e.to_string()))?;
            let sig_bytes: [u8; 64] = signature
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::MalformedKey("ed25519 signature must be 64 bytes".into()))?;
            let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
            verifying_key
                .verify(&digest, &signature)
                .map_err(|_| AuthError::SignatureMismatch)
        }
        SigningAlgo::Rsa2048 => {
            use rsa::pkcs8::DecodePublicKey;
            let public_key = RsaPublicKey::from_public_key_der(&pubkey.key_bytes)
                .map_err(|e| AuthError::MalformedKey(e.to_string()))?;
            let scheme = match envelope.hashing_algo {
                HashingAlgo::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                HashingAlgo::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
            };
            public_key
                .verify(scheme, &digest, &signature)
                .map_err(|_| AuthError::SignatureMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use serde::Serialize;

    use super::*;

    #[derive(Serialize)]
    struct Payload {
        session_id: String,
        value: u32,
    }

    fn ed25519_key() -> LongTermSigningKey {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        LongTermSigningKey::Ed25519(Box::new(ed25519_dalek::SigningKey::generate(&mut rng)))
    }

    #[test]
    fn ed25519_round_trip_verifies() {
        let key = ed25519_key();
        let pubkey = key.public_key_record();
        let payload = Payload { session_id: "abc".into(), value: 7 };
        let envelope = sign_envelope(&key, HashingAlgo::Sha256, payload).unwrap();
        verify_envelope(&envelope, &pubkey).unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = ed25519_key();
        let pubkey = key.public_key_record();
        let payload = Payload { session_id: "abc".into(), value: 7 };
        let mut envelope = sign_envelope(&key, HashingAlgo::Sha256, payload).unwrap();
        envelope.payload.value = 8;
        assert!(verify_envelope(&envelope, &pubkey).is_err());
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let key = ed25519_key();
        let pubkey = key.public_key_record();
        let payload = Payload { session_id: "abc".into(), value: 7 };
        let mut envelope = sign_envelope(&key, HashingAlgo::Sha256, payload).unwrap();
        let mut raw = BASE64.decode(envelope.signature.as_bytes()).unwrap();
        raw[0] ^= 0xFF;
        envelope.signature = BASE64.encode(&raw);
        assert!(verify_envelope(&envelope, &pubkey).is_err());
    }

    #[test]
    fn wrong_algo_pubkey_is_rejected() {
        let key = ed25519_key();
        let payload = Payload { session_id: "abc".into(), value: 7 };
        let envelope = sign_envelope(&key, HashingAlgo::Sha256, payload).unwrap();
        let wrong_pubkey = PublicKeyRecord {
            algo: SigningAlgo::Rsa2048,
            key_bytes: vec![0u8; 32],
        };
        assert!(matches!(
            verify_envelope(&envelope, &wrong_pubkey),
            Err(AuthError::UnsupportedAlgorithm)
        ));
    }
}
