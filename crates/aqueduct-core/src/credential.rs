//! Credential and claims-based-security vocabulary
//!
//! Credential acquisition is external; the core only needs something that
//! can hand out a token for a set of scopes, plus the authorization type
//! that decides how CBS audiences are shaped.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Token type string sent in the CBS `type` property for JSON web tokens
pub const JWT_TOKEN_TYPE: &str = "jwt";

/// Token type string sent in the CBS `type` property for shared access signatures
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// How tokens put to the CBS node are shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CbsAuthorizationType {
    /// Shared access signature scoped to an entity URL
    SharedAccessSignature,
    /// JSON web token scoped to a fixed authorization scope
    JsonWebToken,
}

impl CbsAuthorizationType {
    /// Value of the CBS `type` application property
    pub fn token_type(&self) -> &'static str {
        match self {
            Self::SharedAccessSignature => SAS_TOKEN_TYPE,
            Self::JsonWebToken => JWT_TOKEN_TYPE,
        }
    }
}

impl fmt::Display for CbsAuthorizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token_type())
    }
}

/// A security token with its expiry
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Opaque token string
    pub token: String,
    /// Instant after which the peer no longer honours the token
    pub expires_on: OffsetDateTime,
}

impl AccessToken {
    /// Create a token
    pub fn new(token: impl Into<String>, expires_on: OffsetDateTime) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of security tokens
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Obtain a token valid for `scopes`.
    async fn get_token(&self, scopes: &[String]) -> Result<AccessToken>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_type_strings() {
        assert_eq!(CbsAuthorizationType::JsonWebToken.token_type(), "jwt");
        assert_eq!(
            CbsAuthorizationType::SharedAccessSignature.token_type(),
            "servicebus.windows.net:sastoken"
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AccessToken::new("secret", OffsetDateTime::UNIX_EPOCH);
        assert!(!format!("{token:?}").contains("secret"));
    }
}
