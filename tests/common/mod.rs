//! Common test utilities and fixtures

// Test utilities may not all be used in every test
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use mediaspool::config::{AuthSettings, DownloadSettings, ServerSettings, Settings};

/// Scratch directories for one test: downloads, persistence, and the stub
/// downloader binaries
pub struct TestEnv {
    pub download_dir: TempDir,
    pub data_dir: TempDir,
    pub bin_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            download_dir: TempDir::new().expect("download dir"),
            data_dir: TempDir::new().expect("data dir"),
            bin_dir: TempDir::new().expect("bin dir"),
        }
    }

    /// Write an executable shell script standing in for the downloader.
    /// The script receives the submitted URL as `$1`.
    pub fn stub(&self, name: &str, body: &str) -> PathBuf {
        let path = self.bin_dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod stub");
        }
        path
    }

    /// Download settings wired to this environment's scratch directories,
    /// with a sub-second backoff so retry tests run fast
    pub fn download_settings(&self, downloader: &Path) -> DownloadSettings {
        DownloadSettings {
            download_dir: self.download_dir.path().to_path_buf(),
            data_dir: Some(self.data_dir.path().to_path_buf()),
            downloader_bin: downloader.to_string_lossy().into_owned(),
            max_concurrent: 3,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }

    /// Full settings for router construction
    pub fn settings(&self, downloader: &Path) -> Settings {
        Settings {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            auth: AuthSettings { password: None },
            download: self.download_settings(downloader),
        }
    }
}

/// Poll a condition until it holds or the timeout elapses
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
