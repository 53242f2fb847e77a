//! User data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Operator account from the database. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// bcrypt digest; absent for SSO-only accounts.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub sso_token: Option<String>,
    pub created_at: String,
}

impl User {
    /// Accounts without a digest can only log in through SSO.
    pub fn is_sso_only(&self) -> bool {
        self.password_hash.is_none()
    }
}

/// Public view of a user for listings.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    pub created_at: String,
    pub password_login: bool,
    pub sso_login: bool,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            password_login: user.password_hash.is_some(),
            sso_login: user.sso_token.is_some(),
            username: user.username,
            created_at: user.created_at,
        }
    }
}
