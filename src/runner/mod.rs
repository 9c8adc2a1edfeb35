//! Per-attempt subprocess executor
//!
//! One call to [`execute_attempt`] is one invocation of the downloader
//! program. The runner owns the child's combined output for the attempt's
//! duration, feeds every parsed line into the job's append path, and maps
//! the exit status to the attempt result. It only ever touches the job's
//! own lock, never the manager's.

pub mod output;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::Job;
use output::LineSplitter;

/// Run one download attempt for the job. Returns `Ok` on exit code zero,
/// an error describing the failure otherwise.
pub async fn execute_attempt(
    job: &Arc<Job>,
    downloader_bin: &str,
    download_dir: &Path,
    shutdown: &CancellationToken,
) -> Result<()> {
    tokio::fs::create_dir_all(download_dir)
        .await
        .context("failed to create download dir")?;

    // The attempt's cancel handle derives from the global shutdown token and
    // is stored on the job so delete/shutdown can interrupt the subprocess.
    let cancel = shutdown.child_token();
    job.set_cancel(cancel.clone());

    let result = run_child(job, downloader_bin, download_dir, &cancel).await;

    job.clear_cancel();
    result
}

async fn run_child(
    job: &Arc<Job>,
    downloader_bin: &str,
    download_dir: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut child = Command::new(downloader_bin)
        .arg(&job.url)
        .current_dir(download_dir)
        // Force line-buffered output so progress updates arrive promptly
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to start downloader")?;

    let stdout = child
        .stdout
        .take()
        .context("failed to capture downloader stdout")?;
    let stderr = child
        .stderr
        .take()
        .context("failed to capture downloader stderr")?;

    // Both pipes feed the same append path; together they form the
    // combined output stream.
    let out_pump = tokio::spawn(pump_lines(stdout, Arc::clone(job)));
    let err_pump = tokio::spawn(pump_lines(stderr, Arc::clone(job)));

    let status = tokio::select! {
        status = child.wait() => status.context("failed to wait for downloader")?,
        _ = cancel.cancelled() => {
            debug!(job_id = %job.id, "attempt cancelled, killing downloader");
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = out_pump.await;
            let _ = err_pump.await;
            anyhow::bail!("download cancelled");
        }
    };

    // The child has exited; drain whatever is left in the pipes.
    let _ = out_pump.await;
    let _ = err_pump.await;

    if status.success() {
        Ok(())
    } else {
        anyhow::bail!("downloader exited with {status}")
    }
}

/// Read one pipe to EOF, splitting on CR/LF/CRLF and appending every
/// non-empty trimmed segment to the job.
async fn pump_lines<R>(mut reader: R, job: Arc<Job>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut splitter = LineSplitter::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for segment in splitter.push(&chunk[..n]) {
                    let trimmed = segment.trim();
                    if !trimmed.is_empty() {
                        job.append(trimmed);
                    }
                }
            }
            Err(err) => {
                debug!(job_id = %job.id, error = %err, "output pipe read error");
                break;
            }
        }
    }
    if let Some(tail) = splitter.flush() {
        let trimmed = tail.trim();
        if !trimmed.is_empty() {
            job.append(trimmed);
        }
    }
}
