// Конфигурация ядра.
// Логирование по умолчанию включено только в режиме разработки.

use crate::error::{Error, Result};
use crate::peer::types::ServerConfig;
use crate::utils::random_id;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Период ожидания перед принудительным закрытием сессии после обрыва
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Дефолтные ICE серверы
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// Фильтр в синтаксисе `EnvFilter`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: LOGGING_ENABLED,
            filter: "info".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Идентификатор этого endpoint'а на relay
    pub local_id: String,
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub negotiation_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub max_pending_candidates: usize,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_id: random_id(),
            relay_url: "ws://127.0.0.1:8080/signal".into(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            negotiation_timeout_secs: 30,
            grace_period_secs: GRACE_PERIOD.as_secs(),
            max_pending_candidates: 64,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Поверх текущих значений применяет переменные окружения
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(id) = lookup("DUOCALL_LOCAL_ID").filter(|v| !v.is_empty()) {
            self.local_id = id;
        }
        if let Some(url) = lookup("DUOCALL_RELAY_URL").filter(|v| !v.is_empty()) {
            self.relay_url = url;
        }
        if let Some(filter) = lookup("DUOCALL_LOG").filter(|v| !v.is_empty()) {
            self.logging.enabled = true;
            self.logging.filter = filter;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_id.is_empty() {
            return Err(Error::config("local_id cannot be empty"));
        }
        if self.relay_url.is_empty() {
            return Err(Error::config("relay_url cannot be empty"));
        }
        if self.negotiation_timeout_secs == 0 || self.grace_period_secs == 0 {
            return Err(Error::config("timeouts must be non-zero"));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::config(format!(
                    "ICE server {} has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
