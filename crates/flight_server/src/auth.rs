//! Authentication boundary.

use crate::connection::{Role, UserId};
use serde::{Deserialize, Serialize};

/// What the authenticator knows about a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    /// Roles the user may log in as; empty means any
    #[serde(default)]
    pub allowed_roles: Vec<Role>,
}

impl UserProfile {
    pub fn permits(&self, role: Role) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.contains(&role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account {0} is suspended")]
    Suspended(UserId),

    #[error("Authentication backend unavailable: {0}")]
    Unavailable(String),
}

/// Verifies a login token for a user.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, user_id: UserId, token: &str) -> Result<UserProfile, AuthError>;
}

/// Accepts any non-empty token for any user.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustingAuthenticator;

impl Authenticator for TrustingAuthenticator {
    fn authenticate(&self, user_id: UserId, token: &str) -> Result<UserProfile, AuthError> {
        if token.trim().is_empty() || user_id == 0 {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(UserProfile {
            user_id,
            allowed_roles: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusting_authenticator() {
        let auth = TrustingAuthenticator;
        assert!(auth.authenticate(5, "secret").is_ok());
        assert_eq!(auth.authenticate(5, ""), Err(AuthError::InvalidCredentials));
        assert_eq!(auth.authenticate(0, "x"), Err(AuthError::InvalidCredentials));
    }

    #[test]
    fn test_role_permission() {
        let profile = UserProfile {
            user_id: 1,
            allowed_roles: vec![Role::Pilot],
        };
        assert!(profile.permits(Role::Pilot));
        assert!(!profile.permits(Role::Dispatcher));
    }
}
