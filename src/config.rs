//! Messaging configuration
//!
//! Every key is resolved from, in order:
//! - the environment (a `.env` file is loaded first when present)
//! - the `[events]` section of `EVENTS_CONFIG_FILE` (default `config/events.toml`)
//! - a local default, only when a local broker is selected

use std::time::Duration;

use crate::messaging::broker::{KafkaSettings, KafkaTransport, SubscriptionName, TopicName};
use crate::messaging::{BootstrapPolicy, MessagingError, PublisherSettings, RuntimeSettings};

pub const DEFAULT_CONFIG_FILE: &str = "config/events.toml";

const LOCAL_PROJECT: &str = "local-project";
const LOCAL_TOPIC: &str = "user-events";
const LOCAL_SUBSCRIPTION: &str = "task-service.user-events";

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMode {
    /// In-process broker, nothing leaves the process
    InMemory,
    /// Local Kafka-compatible emulator, plaintext
    Emulator { host: String },
    /// Managed cluster over SASL_SSL; topology is provisioned out of band
    Managed {
        brokers: String,
        username: String,
        password: String,
    },
}

impl BrokerMode {
    pub fn is_local(&self) -> bool {
        !matches!(self, BrokerMode::Managed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            BrokerMode::InMemory => "memory",
            BrokerMode::Emulator { .. } => "emulator",
            BrokerMode::Managed { .. } => "managed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub project_id: Option<String>,
    pub topic_id: Option<String>,
    pub subscription_id: Option<String>,
    pub mode: BrokerMode,
    pub publish_timeout: Duration,
    pub ack_deadline: Duration,
    pub shutdown_timeout: Duration,
    pub max_concurrent_handlers: usize,
    pub subscriber_replicas: usize,
    pub metrics_port: u16,
}

impl MessagingConfig {
    pub fn from_env() -> Result<Self, MessagingError> {
        dotenvy::dotenv().ok();

        let path = std::env::var("EVENTS_CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let file = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Toml).required(false))
            .build()
            .map_err(|e| MessagingError::Configuration(format!("cannot read {}: {}", path, e)))?;

        Self::resolve(|key| std::env::var(key).ok(), &file)
    }

    /// Resolve against an arbitrary environment lookup and loaded file
    pub fn resolve<F>(env: F, file: &config::Config) -> Result<Self, MessagingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |env_key: &str, file_key: &str| {
            non_empty(env(env_key)).or_else(|| non_empty(file.get_string(file_key).ok()))
        };

        let mode = match lookup("EVENTS_BROKER", "events.broker").as_deref() {
            Some("memory") => BrokerMode::InMemory,
            Some("kafka") | None => match non_empty(env("EVENTS_EMULATOR_HOST")) {
                Some(host) => BrokerMode::Emulator { host },
                None => BrokerMode::Managed {
                    brokers: lookup("EVENTS_BROKERS", "events.brokers").ok_or_else(|| {
                        MessagingError::Configuration("EVENTS_BROKERS is required for a managed broker".into())
                    })?,
                    username: non_empty(env("EVENTS_SASL_USERNAME")).ok_or_else(|| {
                        MessagingError::Configuration("EVENTS_SASL_USERNAME is required for a managed broker".into())
                    })?,
                    password: non_empty(env("EVENTS_SASL_PASSWORD")).ok_or_else(|| {
                        MessagingError::Configuration("EVENTS_SASL_PASSWORD is required for a managed broker".into())
                    })?,
                },
            },
            Some(other) => {
                return Err(MessagingError::Configuration(format!(
                    "unknown broker kind '{}', expected memory or kafka",
                    other
                )))
            }
        };

        let local = mode.is_local();
        let identifier = |env_key: &str, file_key: &str, fallback: &str| -> Result<Option<String>, MessagingError> {
            let value = lookup(env_key, file_key).or_else(|| local.then(|| fallback.to_string()));
            match value {
                Some(v) if !is_valid_identifier(&v) => Err(MessagingError::Configuration(format!(
                    "{} '{}' may only contain letters, digits, '.', '_' and '-'",
                    env_key, v
                ))),
                other => Ok(other),
            }
        };

        let config = Self {
            project_id: identifier("EVENTS_PROJECT_ID", "events.project_id", LOCAL_PROJECT)?,
            topic_id: identifier("EVENTS_TOPIC_ID", "events.topic_id", LOCAL_TOPIC)?,
            subscription_id: identifier("EVENTS_SUBSCRIPTION_ID", "events.subscription_id", LOCAL_SUBSCRIPTION)?,
            mode,
            publish_timeout: Duration::from_secs(tunable(file, "events.publish_timeout_secs", 10)?),
            ack_deadline: Duration::from_secs(tunable(file, "events.ack_deadline_secs", 30)?),
            shutdown_timeout: Duration::from_secs(tunable(file, "events.shutdown_timeout_secs", 30)?),
            max_concurrent_handlers: tunable(file, "events.max_concurrent_handlers", 4)? as usize,
            subscriber_replicas: tunable(file, "events.subscriber_replicas", 1)? as usize,
            metrics_port: u16::try_from(tunable(file, "events.metrics_port", 9090)?)
                .map_err(|_| MessagingError::Configuration("events.metrics_port out of range".into()))?,
        };

        tracing::debug!(
            mode = config.mode.label(),
            project = ?config.project_id,
            topic = ?config.topic_id,
            subscription = ?config.subscription_id,
            "Resolved messaging configuration"
        );

        Ok(config)
    }

    pub fn topic(&self) -> Result<TopicName, MessagingError> {
        let project = required(&self.project_id, "project id")?;
        let topic = required(&self.topic_id, "topic id")?;
        Ok(TopicName::new(project, topic))
    }

    pub fn subscription(&self) -> Result<SubscriptionName, MessagingError> {
        let project = required(&self.project_id, "project id")?;
        let subscription = required(&self.subscription_id, "subscription id")?;
        Ok(SubscriptionName::new(project, subscription))
    }

    /// Managed brokers are provisioned out of band
    pub fn bootstrap_policy(&self) -> BootstrapPolicy {
        if self.mode.is_local() {
            BootstrapPolicy::Bootstrap
        } else {
            BootstrapPolicy::Skip
        }
    }

    pub fn kafka_settings(&self) -> Option<KafkaSettings> {
        let mut settings = match &self.mode {
            BrokerMode::InMemory => return None,
            BrokerMode::Emulator { host } => KafkaSettings::new(host.clone(), KafkaTransport::Plaintext),
            BrokerMode::Managed {
                brokers,
                username,
                password,
            } => KafkaSettings::new(
                brokers.clone(),
                KafkaTransport::SaslSsl {
                    username: username.clone(),
                    password: password.clone(),
                },
            ),
        };
        settings.message_timeout = self.publish_timeout;
        settings.ack_deadline = self.ack_deadline;
        Some(settings)
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            max_concurrent_handlers: self.max_concurrent_handlers,
            shutdown_timeout: self.shutdown_timeout,
            ..RuntimeSettings::default()
        }
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            ack_timeout: self.publish_timeout,
            ..PublisherSettings::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a Option<String>, what: &str) -> Result<&'a str, MessagingError> {
    value
        .as_deref()
        .ok_or_else(|| MessagingError::Configuration(format!("{} is not configured", what)))
}

fn tunable(file: &config::Config, key: &str, default: u64) -> Result<u64, MessagingError> {
    match file.get_int(key) {
        Ok(value) if value > 0 => Ok(value as u64),
        Ok(value) => Err(MessagingError::Configuration(format!("{} must be positive, got {}", key, value))),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(e) => Err(MessagingError::Configuration(format!("{}: {}", key, e))),
    }
}

pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
