//! Observability support
//!
//! Structured logging configuration using the tracing ecosystem.

use std::env;

use tracing::Level;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name included in the startup log line
    pub service_name: String,
    /// Default log level when RUST_LOG is unset
    pub log_level: Level,
    /// Whether to emit JSON logs
    pub json_logs: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "mediaspool".to_string(),
            log_level: Level::INFO,
            json_logs: false,
        }
    }
}

impl TracingConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let log_level = env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Level::INFO);

        let json_logs = env::var("JSON_LOGS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Self {
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "mediaspool".to_string()),
            log_level,
            json_logs,
        }
    }
}

/// Initialize tracing from the environment
pub fn init_tracing() {
    init_tracing_with(&TracingConfig::from_env());
}

/// Initialize tracing with the given configuration
pub fn init_tracing_with(config: &TracingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_logs {
        Box::new(
            fmt::layer()
                .json()
                .with_target(true)
                .with_filter(env_filter),
        )
    } else {
        Box::new(fmt::layer().with_target(true).with_filter(env_filter))
    };

    Registry::default().with(fmt_layer).init();

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Tracing initialized"
    );
}
