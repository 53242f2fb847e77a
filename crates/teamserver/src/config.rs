//! Server configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file,
//! then `TEAMSERVER__SECTION__KEY` environment variables.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DEFAULT_WORKSPACE;
use crate::rbac::permissions;
use crate::session::KickPolicy;

/// Prefix of environment overrides (`TEAMSERVER__SERVER__PORT=40056`).
pub const ENV_PREFIX: &str = "TEAMSERVER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Workspaces created at startup (`default` always exists).
    pub workspaces: Vec<String>,
    pub operators: Vec<OperatorConfig>,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sessions: SessionsConfig,
    pub broadcast: BroadcastConfig,
    pub auth: AuthConfig,
    /// Role name -> permissions. Upserted wholesale at startup.
    pub roles: BTreeMap<String, Vec<String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspaces: vec![DEFAULT_WORKSPACE.to_string()],
            operators: Vec::new(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            sessions: SessionsConfig::default(),
            broadcast: BroadcastConfig::default(),
            auth: AuthConfig::default(),
            roles: default_roles(),
        }
    }
}

fn default_roles() -> BTreeMap<String, Vec<String>> {
    let owned = |perms: &[&str]| perms.iter().map(|p| p.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        ("admin".to_string(), owned(permissions::ALL)),
        (
            "operator".to_string(),
            owned(&[
                permissions::CHAT_SEND,
                permissions::OPERATORS_LIST,
                permissions::AGENTS_READ,
                permissions::AGENTS_INTERACT,
                permissions::LISTENERS_MANAGE,
            ]),
        ),
        (
            "observer".to_string(),
            owned(&[
                permissions::AUDIT_READ,
                permissions::OPERATORS_LIST,
                permissions::AGENTS_READ,
            ]),
        ),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 40056,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `teamserver.db` in the data directory.
    /// Supports ~ and environment variables.
    pub path: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub ttl_secs: u64,
    /// Background sweep period; 0 disables the sweeper.
    pub sweep_interval_secs: u64,
    pub kick_policy: KickPolicy,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 300,
            kick_policy: KickPolicy::default(),
        }
    }
}

impl SessionsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Per-recipient write deadline.
    pub write_timeout_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5_000,
        }
    }
}

impl BroadcastConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }
}

/// An operator provisioned from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    pub username: String,
    /// Plaintext; hashed at startup.
    pub password: Option<String>,
    /// Pre-computed bcrypt digest, used when `password` is absent.
    pub password_hash: Option<String>,
    pub sso_token: Option<String>,
    /// Workspace name -> role names.
    pub roles: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ::config::ConfigError),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("operator entry {index} has an empty username")]
    EmptyUsername { index: usize },

    #[error("operator {0:?} is configured more than once")]
    DuplicateOperator(String),

    #[error("operator {operator:?} references unknown role {role:?}")]
    UnknownRole { operator: String, role: String },
}

impl AppConfig {
    /// Load defaults, then `path` (if it exists), then the environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::Zero {
                field: "sessions.ttl_secs",
            });
        }
        if self.broadcast.write_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "broadcast.write_timeout_ms",
            });
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Zero {
                field: "database.max_connections",
            });
        }

        let mut seen = BTreeSet::new();
        for (index, operator) in self.operators.iter().enumerate() {
            if operator.username.trim().is_empty() {
                return Err(ConfigError::EmptyUsername { index });
            }
            if !seen.insert(operator.username.as_str()) {
                return Err(ConfigError::DuplicateOperator(operator.username.clone()));
            }
            for role in operator.roles.values().flatten() {
                if !self.roles.contains_key(role) {
                    return Err(ConfigError::UnknownRole {
                        operator: operator.username.clone(),
                        role: role.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.sessions.kick_policy, KickPolicy::RevokeSession);
        assert_eq!(config.workspaces, vec!["default"]);
        assert_eq!(config.roles["admin"].len(), permissions::ALL.len());
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.server.port, 40056);
        assert_eq!(parsed.roles.len(), 3);
    }

    #[test]
    fn test_load_file_with_operators() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
workspaces = ["default", "red"]

[sessions]
ttl_secs = 60
kick_policy = "drop_connection"

[[operators]]
username = "alice"
password = "hunter2"

[operators.roles]
default = ["admin"]
red = ["observer"]
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.sessions.ttl(), Duration::from_secs(60));
        assert_eq!(config.sessions.kick_policy, KickPolicy::DropConnection);
        assert_eq!(config.broadcast.write_timeout_ms, 5_000);
        assert_eq!(config.operators[0].roles["red"], vec!["observer"]);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sessions.sweep_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::default();
        config.operators.push(OperatorConfig {
            username: "alice".into(),
            roles: BTreeMap::from([("default".into(), vec!["wizard".into()])]),
            ..Default::default()
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownRole { role, .. }) if role == "wizard"
        ));

        let mut config = AppConfig::default();
        config.operators.push(OperatorConfig {
            username: "bob".into(),
            ..Default::default()
        });
        config.operators.push(OperatorConfig {
            username: "bob".into(),
            ..Default::default()
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateOperator(name)) if name == "bob"
        ));

        let mut config = AppConfig::default();
        config.sessions.ttl_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero { .. })));
    }
}
