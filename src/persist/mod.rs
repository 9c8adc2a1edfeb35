//! Atomic snapshot persistence
//!
//! The whole job table is written as one pretty-printed `jobs.json` inside
//! the data directory, using a write-to-tmp-then-rename protocol so a crash
//! mid-write never leaves a torn file behind.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::JobStatus;

/// Snapshot file name inside the data directory
pub const STATE_FILE: &str = "jobs.json";

const TMP_FILE: &str = "jobs.json.tmp";

/// One job record as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedJob {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
}

/// Full scheduler snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub next_id: u64,
    pub jobs: Vec<PersistedJob>,
}

/// Write the snapshot atomically: tmp file first, then rename over the
/// final path in the same directory.
pub async fn write_state(dir: &Path, state: &PersistedState) -> Result<()> {
    let data = serde_json::to_vec_pretty(state).context("failed to serialize job state")?;

    let tmp_path = dir.join(TMP_FILE);
    let final_path = dir.join(STATE_FILE);

    tokio::fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .with_context(|| format!("failed to rename into {}", final_path.display()))?;

    Ok(())
}

/// Read the snapshot; `Ok(None)` when no snapshot exists yet
pub async fn read_state(dir: &Path) -> Result<Option<PersistedState>> {
    let path = dir.join(STATE_FILE);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    let state =
        serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(state))
}
