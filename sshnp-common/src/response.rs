use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::secret::Secret;
use crate::session::SessionId;

/// Discriminant of a daemon → client response (spec.md §3).
///
/// Unknown discriminants on the wire deserialize into [`Unsupported`] rather
/// than failing parse (DESIGN NOTES §9: "define a tagged variant ... unknown
/// discriminants map to a `Unsupported` variant surfaced as `RemoteError`"),
/// so a client talking to a newer daemon degrades gracefully instead of
/// erroring on an envelope it can otherwise read.
///
/// [`Unsupported`]: ResponseStatus::Unsupported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Error,
    Unsupported(String),
}

impl Serialize for ResponseStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Error => "error",
            ResponseStatus::Unsupported(s) => s.as_str(),
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for ResponseStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "ok" => ResponseStatus::Ok,
            "error" => ResponseStatus::Error,
            _ => ResponseStatus::Unsupported(raw),
        })
    }
}

/// Daemon → client response envelope payload (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub session_id: SessionId,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ephemeral_private_key: Option<Secret<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_deserializes_to_unsupported() {
        let json = r#""reticulating""#;
        let status: ResponseStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status, ResponseStatus::Unsupported("reticulating".into()));
    }

    #[test]
    fn known_statuses_round_trip() {
        for status in [ResponseStatus::Ok, ResponseStatus::Error] {
            let json = serde_json::to_string(&status).unwrap();
            let back: ResponseStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(status, back);
        }
    }
}
