//! Typed `Info` shapes of the envelopes operators send.

use serde::{Deserialize, Serialize};
use teamserver_protocol::Info;

/// `InitConnection.Token`: resume with an issued session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenInit {
    pub token: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// `InitConnection.Login`: password or SSO login.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoginInit {
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default, rename = "SSOToken")]
    pub sso_token: Option<String>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl std::fmt::Debug for LoginInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginInit")
            .field("user", &self.user)
            .field("workspace", &self.workspace)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// `Chat.NewMessage`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChatMessage {
    pub message: String,
}

/// `Teamserver.AuditHistory`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditHistoryRequest {
    #[serde(default)]
    pub limit: Option<u32>,
}

/// `Teamserver.Kick`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KickRequest {
    #[serde(rename = "ClientID")]
    pub client_id: String,
}

/// Serialize a typed payload into an envelope `Info` map.
pub(crate) fn to_info<T: Serialize>(value: &T) -> Info {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => Info::new(),
    }
}
