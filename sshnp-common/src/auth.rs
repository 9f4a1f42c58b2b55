use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Payload of the auth envelope sent as the first message on each
/// rendezvous socket (spec.md §3).
///
/// `rvd_nonce` must match the allocation the relay issued and `session_id`
/// must match the allocation's session; the enclosing envelope's signature
/// is verified against the presenting party's long-term key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub rvd_nonce: String,
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_nonce: Option<String>,
}
