mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerKind, BrokerSettings, CacheSettings, LogSettings, RabbitMqSettings, ServerSettings,
    Settings, StartupSettings,
};


/// Loads `config/default.toml` (optional) and environment variables, with
/// `_` separating nested keys (`RABBITMQ_HOST` -> `rabbitmq.host`), and
/// merges the result onto `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server;
    let rabbitmq = partial.rabbitmq;
    let startup = partial.startup;

    Settings {
        server: ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        rabbitmq: RabbitMqSettings {
            user: rabbitmq
                .as_ref()
                .and_then(|r| r.user.clone())
                .unwrap_or(default.rabbitmq.user),
            password: rabbitmq
                .as_ref()
                .and_then(|r| r.password.clone())
                .unwrap_or(default.rabbitmq.password),
            host: rabbitmq
                .as_ref()
                .and_then(|r| r.host.clone())
                .unwrap_or(default.rabbitmq.host),
            port: rabbitmq
                .as_ref()
                .and_then(|r| r.port)
                .unwrap_or(default.rabbitmq.port),
        },
        broker: BrokerSettings {
            kind: partial
                .broker
                .and_then(|b| b.kind)
                .unwrap_or(default.broker.kind),
        },
        startup: StartupSettings {
            attempts: startup
                .as_ref()
                .and_then(|s| s.attempts)
                .unwrap_or(default.startup.attempts),
            delay: startup
                .as_ref()
                .and_then(|s| s.delay)
                .unwrap_or(default.startup.delay),
        },
        cache: CacheSettings {
            path: partial
                .cache
                .and_then(|c| c.path)
                .unwrap_or(default.cache.path),
        },
        log: LogSettings {
            level: partial
                .log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    }
}
