//! Client authentication.
//!
//! The first thing a browser sends is an `auth` message whose payload carries
//! a `token`.  The handler passes the token to an [`Authenticator`], which
//! returns the user ID that will own any operation locks the client takes.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use robogate_types::GateError;

/// Validates a client token and returns the user's identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// # Errors
    ///
    /// Returns [`GateError::AuthFailed`] when the token is not accepted.
    async fn authenticate(&self, token: &str) -> Result<String, GateError>;
}

/// Fixed token → user table, typically loaded from configuration.
#[derive(Clone, Default)]
pub struct StaticTokenAuthenticator {
    users: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Builder: accept `token` as `user_id`.
    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.users.insert(token.into(), user_id.into());
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// Tokens are secrets.
impl fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("users", &self.users.len())
            .finish()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<String, GateError> {
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| GateError::AuthFailed("invalid token".into()))
    }
}

/// Accepts any non-empty token and uses it as the user ID.
///
/// For development only.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevAuthenticator;

#[async_trait]
impl Authenticator for DevAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<String, GateError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(GateError::AuthFailed("token is required".into()));
        }
        Ok(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_tokens_map_to_users() {
        let auth = StaticTokenAuthenticator::default()
            .with_token("s3cret", "alice")
            .with_token("hunter2", "bob");
        assert_eq!(auth.authenticate("s3cret").await.unwrap(), "alice");
        assert_eq!(auth.authenticate("hunter2").await.unwrap(), "bob");
        assert!(matches!(
            auth.authenticate("alice").await,
            Err(GateError::AuthFailed(_))
        ));
    }

    #[test]
    fn static_debug_hides_tokens() {
        let auth = StaticTokenAuthenticator::default().with_token("s3cret", "alice");
        let shown = format!("{auth:?}");
        assert!(!shown.contains("s3cret"));
        assert!(shown.contains('1'));
    }

    #[tokio::test]
    async fn dev_authenticator_uses_token_as_user() {
        assert_eq!(DevAuthenticator.authenticate(" alice ").await.unwrap(), "alice");
        assert!(DevAuthenticator.authenticate("   ").await.is_err());
    }
}
