use serde::{Deserialize, Serialize};

use std::fmt;

/// Token handed to workers when no identity provider is configured.
pub const PLACEHOLDER_TOKEN: &str = "ZHVtbXlfdG9rZW4=";

/// Subject id paired with [`PLACEHOLDER_TOKEN`].
pub const PLACEHOLDER_USER_ID: &str = "dummy_token";

/// The minimal credential presented to the remote engine by a worker.
///
/// Derived from a provider-issued token set; workers never see refresh
/// tokens or expiry data.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Bearer token.
    pub token: String,
    /// Subject (`sub` claim) of the token.
    pub user_id: String,
}

impl Identity {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }

    /// The fixed identity used when running without an identity provider.
    pub fn placeholder() -> Self {
        Self::new(PLACEHOLDER_TOKEN, PLACEHOLDER_USER_ID)
    }

    pub fn is_placeholder(&self) -> bool {
        self.token == PLACEHOLDER_TOKEN && self.user_id == PLACEHOLDER_USER_ID
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("token", &"[redacted]")
            .field("user_id", &self.user_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_debug_redacts_token() {
        let identity = Identity::new("secret-bearer", "user-1");
        let debug = format!("{identity:?}");
        assert!(!debug.contains("secret-bearer"));
        assert!(debug.contains("user-1"));
    }

    #[test]
    fn test_identity_serializes_camel_case() {
        let identity = Identity::new("t", "u");
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["token"], "t");
        assert_eq!(json["userId"], "u");
    }

    #[test]
    fn test_placeholder_identity() {
        let identity = Identity::placeholder();
        assert!(identity.is_placeholder());
        assert!(!Identity::new("t", "u").is_placeholder());
    }
}
