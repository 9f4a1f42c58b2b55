use serde::{Deserialize, Serialize};

use crate::envelope::SigningAlgo;

/// A principal's long-term verification key as published on the identity
/// substrate's public-key directory, fetched by address and cached by the
/// caller (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub algo: SigningAlgo,
    /// For `ed25519`: 32 raw bytes. For `rsa2048`: DER-encoded `SubjectPublicKeyInfo`.
    pub key_bytes: Vec<u8>,
}
