//! Configuration module for Mediaspool
//!
//! This module handles loading and validating configuration from environment
//! variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Main application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub download: DownloadSettings,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Host to bind to
    pub host: String,
    /// API port
    pub port: u16,
}

/// API authentication configuration
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Shared token required on every /api request; `None` disables auth
    pub password: Option<String>,
}

/// Download manager configuration
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Working directory for the downloader subprocess
    pub download_dir: PathBuf,
    /// Directory for the jobs.json snapshot; `None` disables persistence
    pub data_dir: Option<PathBuf>,
    /// Downloader program invoked as `<bin> <URL>`
    pub downloader_bin: String,
    /// Maximum number of concurrently running attempts
    pub max_concurrent: usize,
    /// Attempts per job before it goes terminal failed
    pub max_retries: u32,
    /// Base of the exponential retry backoff (base * 3^(attempt-1))
    pub retry_backoff: Duration,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self> {
        let settings = Settings {
            server: ServerSettings {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .context("Invalid PORT")?,
            },
            auth: AuthSettings {
                password: env::var("PASSWORD").ok().filter(|p| !p.is_empty()),
            },
            download: DownloadSettings {
                download_dir: env::var("DOWNLOAD_DIR")
                    .unwrap_or_else(|_| "./downloads".to_string())
                    .into(),
                data_dir: env::var("DATA_DIR")
                    .ok()
                    .filter(|d| !d.is_empty())
                    .map(PathBuf::from),
                downloader_bin: env::var("DOWNLOADER_BIN")
                    .unwrap_or_else(|_| "ytdlp-nfo".to_string()),
                max_concurrent: env::var("MAX_CONCURRENT")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .context("Invalid MAX_CONCURRENT")?,
                max_retries: env::var("MAX_RETRIES")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .context("Invalid MAX_RETRIES")?,
                retry_backoff: Duration::from_secs(
                    env::var("RETRY_BACKOFF_SECS")
                        .unwrap_or_else(|_| "10".to_string())
                        .parse()
                        .context("Invalid RETRY_BACKOFF_SECS")?,
                ),
            },
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("PORT cannot be 0");
        }
        if self.download.max_concurrent == 0 {
            anyhow::bail!("MAX_CONCURRENT must be positive");
        }
        if self.download.max_retries == 0 {
            anyhow::bail!("MAX_RETRIES must be positive");
        }
        if self.download.retry_backoff.is_zero() {
            anyhow::bail!("RETRY_BACKOFF_SECS must be positive");
        }
        if self.download.downloader_bin.is_empty() {
            anyhow::bail!("DOWNLOADER_BIN cannot be empty");
        }
        Ok(())
    }

    /// Load settings for testing (with defaults)
    pub fn load_for_testing() -> Self {
        Settings {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            auth: AuthSettings { password: None },
            download: DownloadSettings {
                download_dir: PathBuf::from("./downloads"),
                data_dir: None,
                downloader_bin: "ytdlp-nfo".to_string(),
                max_concurrent: 3,
                max_retries: 3,
                retry_backoff: Duration::from_secs(10),
            },
        }
    }
}
