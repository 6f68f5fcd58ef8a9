//! Configuration for the Sentinela services.
//!
//! Defaults, overridden by an optional TOML file, overridden by environment
//! variables. The env names for operator-facing options are the historical
//! ones (`TELEGRAM_TOKEN`, `HUBSOFT_HOST`, ...); internal tunables use the
//! `SENTINELA_` prefix.

use serde::Deserialize;
use std::path::Path;

pub mod loader;

pub use loader::ConfigLoader;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required option: {0}")]
    MissingRequired(&'static str),

    #[error("invalid option {option}: {message}")]
    Invalid {
        option: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub hubsoft: HubSoftConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            hubsoft: HubSoftConfig::default(),
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Fails fast on options the process cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.token.is_empty() {
            return Err(ConfigError::MissingRequired("TELEGRAM_TOKEN"));
        }
        if self.telegram.group_id == 0 {
            return Err(ConfigError::MissingRequired("TELEGRAM_GROUP_ID"));
        }
        if self.hubsoft.enabled {
            if self.hubsoft.host.is_empty() {
                return Err(ConfigError::MissingRequired("HUBSOFT_HOST"));
            }
            if self.hubsoft.client_id.is_empty() {
                return Err(ConfigError::MissingRequired("HUBSOFT_CLIENT_ID"));
            }
            if self.hubsoft.client_secret.is_empty() {
                return Err(ConfigError::MissingRequired("HUBSOFT_CLIENT_SECRET"));
            }
            if self.hubsoft.user.is_empty() {
                return Err(ConfigError::MissingRequired("HUBSOFT_USER"));
            }
            if self.hubsoft.password.is_empty() {
                return Err(ConfigError::MissingRequired("HUBSOFT_PASSWORD"));
            }
        }
        if self.engine.workers == 0 {
            return Err(ConfigError::Invalid {
                option: "SENTINELA_ENGINE_WORKERS",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: String,
    pub group_id: i64,
    pub rules_topic_id: Option<i64>,
    pub welcome_topic_id: Option<i64>,
    pub support_topic_id: Option<i64>,
    /// Bootstrap admin list; unioned with chat-detected admins.
    pub admin_user_ids: Vec<i64>,
    pub invite_link_expire_time_secs: u64,
    pub invite_link_member_limit: u32,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            group_id: 0,
            rules_topic_id: None,
            welcome_topic_id: None,
            support_topic_id: None,
            admin_user_ids: Vec::new(),
            invite_link_expire_time_secs: 3600,
            invite_link_member_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSoftConfig {
    pub host: String,
    pub client_id: String,
    pub client_secret: String,
    pub user: String,
    pub password: String,
    /// When false, sync jobs queue but are not executed.
    pub enabled: bool,
    pub timeout_secs: u64,
    pub rate_limit_per_sec: u32,
    pub tipo_atendimento_gaming: i64,
    pub status_atendimento_aberto: i64,
    pub endpoints: HubSoftEndpoints,
}

impl Default for HubSoftConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            user: String::new(),
            password: String::new(),
            enabled: false,
            timeout_secs: 30,
            rate_limit_per_sec: 10,
            tipo_atendimento_gaming: 101,
            status_atendimento_aberto: 1,
            endpoints: HubSoftEndpoints::default(),
        }
    }
}

/// Upstream paths, configurable because they differ between installations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubSoftEndpoints {
    pub token: String,
    pub cliente: String,
    pub atendimento: String,
    pub atendimento_mensagem: String,
    pub atendimento_anexo: String,
    pub cliente_atendimento: String,
    pub atendimento_todos: String,
}

impl Default for HubSoftEndpoints {
    fn default() -> Self {
        Self {
            token: "/oauth/token".into(),
            cliente: "/api/v1/integracao/cliente".into(),
            atendimento: "/api/v1/integracao/atendimento".into(),
            atendimento_mensagem: "/api/v1/integracao/atendimento/adicionar_mensagem".into(),
            atendimento_anexo: "/api/v1/integracao/atendimento/adicionar_anexo".into(),
            cliente_atendimento: "/api/v1/integracao/cliente/atendimento".into(),
            atendimento_todos: "/api/v1/integracao/atendimento/todos".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub file: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file: "sentinela.db".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    pub health_check_interval_secs: u64,
    pub expiration_sweep_interval_secs: u64,
    pub admin_sync_interval_secs: u64,
    pub invite_cleanup_interval_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 5_000,
            batch_size: 25,
            health_check_interval_secs: 300,
            expiration_sweep_interval_secs: 300,
            admin_sync_interval_secs: 6 * 3600,
            invite_cleanup_interval_secs: 3600,
            shutdown_grace_secs: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.telegram.invite_link_expire_time_secs, 3600);
        assert_eq!(config.telegram.invite_link_member_limit, 1);
        assert_eq!(config.hubsoft.timeout_secs, 30);
        assert!(!config.hubsoft.enabled);
    }

    #[test]
    fn validate_requires_telegram_credentials() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired("TELEGRAM_TOKEN"))
        ));
    }

    #[test]
    fn validate_requires_hubsoft_credentials_when_enabled() {
        let mut config = AppConfig::default();
        config.telegram.token = "t".into();
        config.telegram.group_id = -100;
        config.hubsoft.enabled = true;
        config.hubsoft.host = "https://api.hubsoft.example".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired("HUBSOFT_CLIENT_ID"))
        ));
    }

    #[test]
    fn disabled_hubsoft_needs_no_credentials() {
        let mut config = AppConfig::default();
        config.telegram.token = "t".into();
        config.telegram.group_id = -100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            [telegram]
            token = "abc"
            group_id = -1001234

            [hubsoft]
            enabled = false
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.telegram.token, "abc");
        assert_eq!(config.engine.poll_interval_ms, 5_000);
    }
}
