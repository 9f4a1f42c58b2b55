use sshnp_common::Address;

/// Signature mismatch, unknown address, or nonce mismatch (spec.md §7).
///
/// An `AuthError` closes the offending socket with no reply to the peer
/// beyond the connection close; it never crosses a trust boundary with
/// detail that would help an attacker distinguish failure reasons.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no public key on record for {0}")]
    UnknownPrincipal(Address),
    #[error("unsupported signing algorithm")]
    UnsupportedAlgorithm,
    #[error("signature does not verify")]
    SignatureMismatch,
    #[error("nonce does not match the issued allocation")]
    NonceMismatch,
    #[error("session id does not match the issued allocation")]
    SessionMismatch,
    #[error("malformed key material: {0}")]
    MalformedKey(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("failed to sign payload: {0}")]
    Backend(String),
    #[error("failed to serialise payload: {0}")]
    Serialize(#[from] serde_json::Error),
}
