use serde::{Deserialize, Serialize};

/// Digest algorithm covering the canonicalised payload before signing
/// (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashingAlgo {
    Sha256,
    Sha512,
}

/// Signature algorithm the long-term key uses. Only these two prefixes are
/// accepted anywhere signatures are verified (spec.md §9 Open Question,
/// resolved as `{ssh-rsa, ssh-ed25519}` being the authoritative set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningAlgo {
    Rsa2048,
    Ed25519,
}

/// A signed JSON container for control messages (spec.md §3, §4.4).
///
/// `signature` covers `payload` serialised via [`canonical_json`] using
/// `hashing_algo`/`signing_algo` and the sender's long-term private key.
/// Unknown fields on the wire are ignored on parse (spec.md §6), which falls
/// out of `serde`'s default struct behaviour here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub signature: String,
    pub hashing_algo: HashingAlgo,
    pub signing_algo: SigningAlgo,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(signature: String, hashing_algo: HashingAlgo, signing_algo: SigningAlgo, payload: P) -> Self {
        Self {
            signature,
            hashing_algo,
            signing_algo,
            payload,
        }
    }
}

/// Canonicalises `payload` for signing: stable key ordering.
///
/// Payload types here are fixed-shape structs, not open maps, so
/// `serde_json`'s object-key order (struct field declaration order) is
/// already stable and sufficient; this function is the single place that
/// decision is pinned down, per spec.md §4.4's "canonicalise (stable key
/// ordering)" requirement.
pub fn canonical_json<P: Serialize>(payload: &P) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Payload {
        b: u32,
        a: u32,
    }

    #[test]
    fn canonical_json_preserves_struct_field_order() {
        let bytes = canonical_json(&Payload { b: 1, a: 2 }).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, r#"{"b":1,"a":2}"#);
    }

    #[test]
    fn hashing_algo_round_trips_lowercase() {
        let json = serde_json::to_string(&HashingAlgo::Sha256).unwrap();
        assert_eq!(json, "\"sha256\"");
        let back: HashingAlgo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HashingAlgo::Sha256);
    }
}
