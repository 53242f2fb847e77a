//! Authentication module.
//!
//! Credential types, the password hashing port and authentication errors.
//! Verification itself lives in [`crate::user::UserService`].

mod error;
mod hasher;

pub use error::{AuthError, AuthErrorResponse};
pub use hasher::{BcryptHasher, HashError, PasswordHasher};

/// What an operator presents to log in.
#[derive(Clone)]
pub enum Credentials {
    Password { username: String, secret: String },
    Sso { username: String, token: String },
}

impl Credentials {
    pub fn password(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn sso(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self::Sso {
            username: username.into(),
            token: token.into(),
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Password { username, .. } | Self::Sso { username, .. } => username,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Sso { .. } => "sso",
        }
    }
}

// Never print secrets.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("method", &self.method())
            .field("username", &self.username())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::password("alice", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
