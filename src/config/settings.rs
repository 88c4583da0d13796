use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::RetryPolicy;

/// Top-level configuration for the backend process.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub rabbitmq: RabbitMqSettings,
    pub broker: BrokerSettings,
    pub startup: StartupSettings,
    pub cache: CacheSettings,
    pub log: LogSettings,
}

/// Address the liveness endpoint binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Credentials and location of the RabbitMQ broker.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RabbitMqSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl RabbitMqSettings {
    /// `amqp://<user>:<password>@<host>:<port>`
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}",
            self.user, self.password, self.host, self.port
        )
    }

    /// Same as [`uri`](Self::uri) with the password masked, for logging.
    pub fn redacted_uri(&self) -> String {
        format!("amqp://{}:***@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Amqp,
    /// In-process broker, for local development without RabbitMQ.
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
}

/// Bounded retry applied to the initial broker and cache connects.
#[derive(Debug, Deserialize, Clone)]
pub struct StartupSettings {
    pub attempts: u32,
    /// Seconds to wait between attempts.
    pub delay: u64,
}

impl StartupSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_secs(self.delay))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// Directory of the embedded cache database.
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub rabbitmq: Option<PartialRabbitMqSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub startup: Option<PartialStartupSettings>,
    pub cache: Option<PartialCacheSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRabbitMqSettings {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub kind: Option<BrokerKind>,
}

#[derive(Debug, Deserialize)]
pub struct PartialStartupSettings {
    pub attempts: Option<u32>,
    pub delay: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialCacheSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            rabbitmq: RabbitMqSettings {
                user: "shopfinity".to_string(),
                password: "rabbit123".to_string(),
                host: "rabbitmq".to_string(),
                port: 5672,
            },
            broker: BrokerSettings {
                kind: BrokerKind::Amqp,
            },
            startup: StartupSettings {
                attempts: 5,
                delay: 5,
            },
            cache: CacheSettings {
                path: "shopfinity_cache".to_string(),
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
