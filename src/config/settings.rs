use serde::Deserialize;
use std::path::PathBuf;

/// Top-level configuration settings for the client.
///
/// Includes the broker endpoint, consumer flow control and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub consumer: ConsumerSettings,
    pub log: LogSettings,
}

/// Where and how to reach the message broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub login: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub ssl: bool,
    pub ca_certs: Option<PathBuf>,
}

/// Consumer side flow control.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub prefetch_count: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub login: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub virtual_host: Option<String>,
    pub ssl: Option<bool>,
    pub ca_certs: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConsumerSettings {
    pub prefetch_count: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Defaults match a stock local RabbitMQ install.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                login: "guest".to_string(),
                password: "guest".to_string(),
                host: "localhost".to_string(),
                port: 5672,
                virtual_host: "/".to_string(),
                ssl: false,
                ca_certs: None,
            },
            consumer: ConsumerSettings {
                prefetch_count: crate::client::DEFAULT_PREFETCH,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Merge over `defaults`, field by field.
    pub fn merge(self, defaults: Settings) -> Settings {
        let broker = self.broker;
        let b = defaults.broker;

        Settings {
            broker: BrokerSettings {
                login: broker
                    .as_ref()
                    .and_then(|s| s.login.clone())
                    .unwrap_or(b.login),
                password: broker
                    .as_ref()
                    .and_then(|s| s.password.clone())
                    .unwrap_or(b.password),
                host: broker
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(b.host),
                port: broker.as_ref().and_then(|s| s.port).unwrap_or(b.port),
                virtual_host: broker
                    .as_ref()
                    .and_then(|s| s.virtual_host.clone())
                    .unwrap_or(b.virtual_host),
                ssl: broker.as_ref().and_then(|s| s.ssl).unwrap_or(b.ssl),
                ca_certs: broker
                    .as_ref()
                    .and_then(|s| s.ca_certs.clone())
                    .or(b.ca_certs),
            },
            consumer: ConsumerSettings {
                prefetch_count: self
                    .consumer
                    .as_ref()
                    .and_then(|c| c.prefetch_count)
                    .unwrap_or(defaults.consumer.prefetch_count),
            },
            log: LogSettings {
                level: self
                    .log
                    .and_then(|l| l.level)
                    .unwrap_or(defaults.log.level),
            },
        }
    }
}
