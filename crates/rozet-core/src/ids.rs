use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of any entity identifier.
pub const MAX_ID_LEN: usize = 128;

/// Check an identifier against the accepted alphabet: `[A-Za-z0-9_.:-]{1,128}`.
///
/// Permits both generated UUIDs and legacy opaque IDs carried over from
/// earlier deployments.
pub fn validate_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Parse from an untrusted string, enforcing the ID alphabet.
            pub fn parse(s: &str) -> Option<Self> {
                validate_id(s).then(|| Self(s.to_owned()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(AgentId, "agent");
branded_id!(CommandId, "cmd");
branded_id!(TaskId, "task");
branded_id!(OperationId, "op");
branded_id!(ArtifactId, "art");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn operation_id_has_prefix() {
        let id = OperationId::new();
        assert!(id.as_str().starts_with("op_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = AgentId::new();
        let b = AgentId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_preserves_legacy_ids() {
        let id = SessionId::from_raw("legacy:opaque.id-1");
        assert_eq!(id.as_str(), "legacy:opaque.id-1");
    }

    #[test]
    fn parse_rejects_bad_alphabet() {
        assert!(SessionId::parse("sess_ok-1.2:a").is_some());
        assert!(SessionId::parse("has space").is_none());
        assert!(SessionId::parse("sess/../etc").is_none());
        assert!(SessionId::parse("").is_none());
    }

    #[test]
    fn validate_id_length_bound() {
        assert!(validate_id(&"a".repeat(128)));
        assert!(!validate_id(&"a".repeat(129)));
    }

    #[test]
    fn generated_ids_pass_validation() {
        assert!(validate_id(SessionId::new().as_str()));
        assert!(validate_id(CommandId::new().as_str()));
        assert!(validate_id(TaskId::new().as_str()));
        assert!(validate_id(ArtifactId::new().as_str()));
    }

    #[test]
    fn serde_roundtrip() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<OperationId> = (0..100).map(|_| OperationId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
