//! Connected agents.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Host details an agent reports when it checks in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentCheckin {
    #[serde(rename = "AgentID")]
    pub agent_id: String,
    pub hostname: String,
    pub username: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default, rename = "InternalIP")]
    pub internal_ip: Option<String>,
    pub process_name: String,
    #[serde(rename = "ProcessPID")]
    pub process_pid: u32,
    pub process_arch: String,
    #[serde(rename = "OSVersion")]
    pub os_version: String,
}

#[derive(Debug)]
pub struct ConnectedAgent {
    workspace_id: i64,
    checkin: AgentCheckin,
    first_seen: DateTime<Utc>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl ConnectedAgent {
    pub fn new(workspace_id: i64, checkin: AgentCheckin) -> Self {
        let now = Utc::now();
        Self {
            workspace_id,
            checkin,
            first_seen: now,
            last_seen: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.checkin.agent_id
    }

    pub fn workspace_id(&self) -> i64 {
        self.workspace_id
    }

    pub fn checkin(&self) -> &AgentCheckin {
        &self.checkin
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }
}
