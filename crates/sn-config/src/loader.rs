//! Configuration loader with file and environment variable support.

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths.
const CONFIG_PATHS: &[&str] = &[
    "sentinela.toml",
    "config.toml",
    "./config/sentinela.toml",
    "/etc/sentinela/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment overrides,
    /// then validate required options.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("SENTINELA_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // Telegram
        if let Ok(val) = env::var("TELEGRAM_TOKEN") {
            config.telegram.token = val;
        }
        if let Ok(val) = env::var("TELEGRAM_GROUP_ID") {
            if let Ok(id) = val.parse() {
                config.telegram.group_id = id;
            }
        }
        if let Ok(val) = env::var("RULES_TOPIC_ID") {
            config.telegram.rules_topic_id = val.parse().ok();
        }
        if let Ok(val) = env::var("WELCOME_TOPIC_ID") {
            config.telegram.welcome_topic_id = val.parse().ok();
        }
        if let Ok(val) = env::var("SUPPORT_TOPIC_ID") {
            config.telegram.support_topic_id = val.parse().ok();
        }
        if let Ok(val) = env::var("ADMIN_USER_IDS") {
            config.telegram.admin_user_ids = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Ok(val) = env::var("INVITE_LINK_EXPIRE_TIME") {
            if let Ok(secs) = val.parse() {
                config.telegram.invite_link_expire_time_secs = secs;
            }
        }
        if let Ok(val) = env::var("INVITE_LINK_MEMBER_LIMIT") {
            if let Ok(limit) = val.parse() {
                config.telegram.invite_link_member_limit = limit;
            }
        }

        // HubSoft
        if let Ok(val) = env::var("HUBSOFT_HOST") {
            config.hubsoft.host = val;
        }
        if let Ok(val) = env::var("HUBSOFT_CLIENT_ID") {
            config.hubsoft.client_id = val;
        }
        if let Ok(val) = env::var("HUBSOFT_CLIENT_SECRET") {
            config.hubsoft.client_secret = val;
        }
        if let Ok(val) = env::var("HUBSOFT_USER") {
            config.hubsoft.user = val;
        }
        if let Ok(val) = env::var("HUBSOFT_PASSWORD") {
            config.hubsoft.password = val;
        }
        if let Ok(val) = env::var("HUBSOFT_ENABLED") {
            config.hubsoft.enabled = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        // Storage
        if let Ok(val) = env::var("DATABASE_FILE") {
            config.database.file = val;
        }

        // Engine tunables
        if let Ok(val) = env::var("SENTINELA_ENGINE_WORKERS") {
            if let Ok(workers) = val.parse() {
                config.engine.workers = workers;
            }
        }
        if let Ok(val) = env::var("SENTINELA_ENGINE_POLL_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                config.engine.poll_interval_ms = interval;
            }
        }
        if let Ok(val) = env::var("SENTINELA_ENGINE_BATCH_SIZE") {
            if let Ok(size) = val.parse() {
                config.engine.batch_size = size;
            }
        }
        if let Ok(val) = env::var("SENTINELA_HUBSOFT_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.hubsoft.timeout_secs = secs;
            }
        }
        if let Ok(val) = env::var("SENTINELA_HUBSOFT_RATE_LIMIT_PER_SEC") {
            if let Ok(rate) = val.parse() {
                config.hubsoft.rate_limit_per_sec = rate;
            }
        }
        if let Ok(val) = env::var("SENTINELA_SHUTDOWN_GRACE_SECS") {
            if let Ok(secs) = val.parse() {
                config.engine.shutdown_grace_secs = secs;
            }
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
