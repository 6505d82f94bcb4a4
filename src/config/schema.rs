//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the bridge.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Root configuration for the bridge.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Outbound broker connection and topology.
    pub amqp: AmqpConfig,

    /// Inbound SMTP submission listener.
    pub smtp: SmtpConfig,

    /// Health endpoint listener.
    pub http: HttpConfig,

    /// Health check settings.
    pub health: HealthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// Broker host name.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Virtual host. Empty selects the broker's default vhost.
    pub virtual_host: String,

    /// Optional login. The password is only used when a login is set.
    pub login: String,

    /// Optional password.
    pub password: String,

    /// Queue name. Also names the exchange unless `exchange` is set.
    pub queue: String,

    /// Exchange name override.
    pub exchange: Option<String>,

    /// Routing key used for the binding and for every publish.
    pub routing_key: String,

    /// Refresh interval of the connection health probe in seconds.
    /// Zero evaluates the probe on every call.
    pub health_interval_secs: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: String::new(),
            login: String::new(),
            password: String::new(),
            queue: "postmanq".to_string(),
            exchange: None,
            routing_key: String::new(),
            health_interval_secs: 5,
        }
    }
}

impl AmqpConfig {
    /// Name of the fanout exchange messages are published to.
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_deref().unwrap_or(&self.queue)
    }

    /// Build the broker URI `amqp://[login[:password]@]host:port/vhost`.
    pub fn uri(&self) -> Result<Url, url::ParseError> {
        let mut uri = Url::parse(&format!("amqp://{}:{}", self.host, self.port))?;

        if !self.login.is_empty() {
            uri.set_username(&self.login)
                .map_err(|_| url::ParseError::EmptyHost)?;
            if !self.password.is_empty() {
                uri.set_password(Some(&self.password))
                    .map_err(|_| url::ParseError::EmptyHost)?;
            }
        }

        // The default vhost is literally named "/", which must travel encoded.
        let vhost = self.virtual_host.replace('/', "%2f");
        uri.set_path(&format!("/{}", vhost));

        Ok(uri)
    }

    /// Background refresh interval for the readiness probe, `None` when disabled.
    pub fn health_interval(&self) -> Option<Duration> {
        match self.health_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// SMTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Bind address (e.g., "0.0.0.0:1025").
    pub addr: String,

    /// Domain announced in the greeting and EHLO reply.
    pub domain: String,

    /// Login clients must authenticate with.
    pub login: String,

    /// Password clients must authenticate with.
    pub password: String,

    /// Maximum accepted message size in bytes.
    pub max_message_bytes: usize,

    /// Maximum recipients per message.
    pub max_recipients: usize,

    /// Idle timeout between client commands in seconds.
    pub idle_timeout_secs: u64,

    /// How long live sessions may take to finish after shutdown starts.
    pub shutdown_timeout_ms: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:1025".to_string(),
            domain: "localhost".to_string(),
            login: String::new(),
            password: String::new(),
            max_message_bytes: 1 << 20,
            max_recipients: 50,
            idle_timeout_secs: 300,
            shutdown_timeout_ms: 5000,
        }
    }
}

/// Health endpoint listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub addr: String,

    /// Upper bound on the graceful shutdown wait in milliseconds.
    pub shutdown_timeout_ms: u64,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            shutdown_timeout_ms: 1000,
            request_timeout_secs: 15,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Liveness fails once more SMTP sessions than this are open.
    pub max_active_sessions: u64,

    /// Cache lifetime of liveness probe results in milliseconds.
    pub cache_ttl_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 200,
            cache_ttl_ms: 1000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
