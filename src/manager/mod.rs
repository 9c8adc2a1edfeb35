//! Download manager
//!
//! The process-wide scheduler: owns the job table, the FIFO pending queue,
//! and the concurrency budget, and orchestrates retry attempts with
//! exponential backoff. One mutex guards the scheduler state; each job has
//! its own finer-grained lock for its output and subscribers, and the
//! per-line append path never re-enters the manager.
//!
//! Slot accounting is the single source of truth: a slot is taken on
//! dispatch, released on attempt exit or on entering backoff, and re-taken
//! on leaving backoff. Every code path holding a slot releases it exactly
//! once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DownloadSettings;
use crate::error::AppError;
use crate::models::{Job, JobStatus};
use crate::persist::{self, PersistedState};
use crate::runner;

/// Quiesce window for coalescing bursts of save requests
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Outcome of one URL inside a bulk submission
pub enum BulkOutcome {
    Admitted(Arc<Job>),
    Duplicate,
    Rejected(String),
}

/// Per-URL result of a bulk submission
pub struct BulkResult {
    pub url: String,
    pub outcome: BulkOutcome,
}

struct ManagerState {
    jobs: HashMap<String, Arc<Job>>,
    queue: VecDeque<String>,
    running: usize,
    next_id: u64,
}

/// Process-wide download scheduler
pub struct DownloadManager {
    state: Mutex<ManagerState>,
    download_dir: PathBuf,
    data_dir: Option<PathBuf>,
    downloader_bin: String,
    max_concurrent: usize,
    max_retries: u32,
    retry_backoff: Duration,
    shutdown: CancellationToken,
    save_tx: mpsc::Sender<()>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl DownloadManager {
    /// Construct the manager, restore persisted jobs, and dispatch queued
    /// work up to the concurrency cap.
    pub async fn start(settings: DownloadSettings, shutdown: CancellationToken) -> Arc<Self> {
        let (save_tx, save_rx) = mpsc::channel(1);

        let manager = Arc::new(Self {
            state: Mutex::new(ManagerState {
                jobs: HashMap::new(),
                queue: VecDeque::new(),
                running: 0,
                next_id: 0,
            }),
            download_dir: settings.download_dir,
            data_dir: settings.data_dir,
            downloader_bin: settings.downloader_bin,
            max_concurrent: settings.max_concurrent,
            max_retries: settings.max_retries,
            retry_backoff: settings.retry_backoff,
            shutdown,
            save_tx,
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        });

        if let Some(dir) = &manager.data_dir {
            if let Err(err) = tokio::fs::create_dir_all(dir).await {
                warn!(error = %err, dir = %dir.display(), "failed to create data dir");
            }
        }

        manager.load_state().await;
        manager.drain_queue();

        tokio::spawn(save_loop(Arc::downgrade(&manager), save_rx));

        manager
    }

    /// Admit one URL: reject duplicates and submissions during shutdown,
    /// then either dispatch immediately or append to the queue.
    pub fn submit(self: &Arc<Self>, url: &str) -> Result<Arc<Job>, AppError> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::ShuttingDown);
        }

        let mut state = self.lock_state();

        for job in state.jobs.values() {
            if job.url == url && job.status() != JobStatus::Completed {
                return Err(AppError::Duplicate(
                    "a download already exists for this URL".to_string(),
                ));
            }
        }

        let job = Self::admit(&mut state, url.to_string(), self.max_retries);
        let dispatch = self.dispatch_or_queue(&mut state, &job);
        drop(state);

        if dispatch {
            self.spawn_run(Arc::clone(&job));
        }
        self.schedule_save();

        info!(job_id = %job.id, url = %job.url, queued = !dispatch, "download submitted");
        Ok(job)
    }

    /// Atomic admission of a batch of URLs. Blank entries are skipped,
    /// duplicates (against active jobs and earlier entries of the same
    /// batch) are marked, and the rest are admitted under the same
    /// dispatch-or-queue rule as single submissions.
    pub fn submit_bulk(self: &Arc<Self>, urls: &[String]) -> Vec<BulkResult> {
        let shutting_down = self.shutdown.is_cancelled();

        let mut state = self.lock_state();

        let mut active_urls: HashSet<String> = state
            .jobs
            .values()
            .filter(|j| j.status() != JobStatus::Completed)
            .map(|j| j.url.clone())
            .collect();

        let mut results = Vec::new();
        let mut dispatches = Vec::new();

        for raw in urls {
            let url = raw.trim();
            if url.is_empty() {
                continue;
            }

            if active_urls.contains(url) {
                results.push(BulkResult {
                    url: url.to_string(),
                    outcome: BulkOutcome::Duplicate,
                });
                continue;
            }

            if shutting_down {
                results.push(BulkResult {
                    url: url.to_string(),
                    outcome: BulkOutcome::Rejected("server is shutting down".to_string()),
                });
                continue;
            }

            let job = Self::admit(&mut state, url.to_string(), self.max_retries);
            if self.dispatch_or_queue(&mut state, &job) {
                dispatches.push(Arc::clone(&job));
            }

            active_urls.insert(url.to_string());
            results.push(BulkResult {
                url: url.to_string(),
                outcome: BulkOutcome::Admitted(job),
            });
        }

        drop(state);

        let admitted = results
            .iter()
            .filter(|r| matches!(r.outcome, BulkOutcome::Admitted(_)))
            .count();
        info!(total = urls.len(), admitted, "bulk submission processed");

        for job in dispatches {
            self.spawn_run(job);
        }
        self.schedule_save();

        results
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.lock_state().jobs.get(id).cloned()
    }

    /// Snapshot of all jobs, newest first
    pub fn list(&self) -> Vec<Arc<Job>> {
        let state = self.lock_state();
        let mut jobs: Vec<Arc<Job>> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| numeric_id(&b.id).cmp(&numeric_id(&a.id)))
        });
        jobs
    }

    /// Reset a failed job and re-admit it
    pub fn retry(self: &Arc<Self>, id: &str) -> Result<Arc<Job>, AppError> {
        let mut state = self.lock_state();

        let job = state
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound("job not found".to_string()))?;

        if !job.reset_for_retry() {
            return Err(AppError::Conflict("job is not failed".to_string()));
        }

        let dispatch = self.dispatch_or_queue(&mut state, &job);
        drop(state);

        if dispatch {
            self.spawn_run(Arc::clone(&job));
        }
        self.schedule_save();

        info!(job_id = %job.id, "failed job re-admitted");
        Ok(job)
    }

    /// Remove a single job, cancelling its in-flight attempt if any
    pub fn delete(&self, id: &str) -> Result<(), AppError> {
        let mut state = self.lock_state();

        let job = state
            .jobs
            .remove(id)
            .ok_or_else(|| AppError::NotFound("job not found".to_string()))?;
        state.queue.retain(|qid| qid != id);
        drop(state);

        job.cancel_attempt();
        job.close_subscribers();
        self.schedule_save();

        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Remove every job, cancelling any in-flight attempts.
    ///
    /// The running counter is deliberately left alone: each cancelled
    /// attempt still holds its slot and releases it exactly once through
    /// its normal exit path, so the counter converges without ever being
    /// double-released.
    pub fn delete_all(&self) {
        let mut state = self.lock_state();

        for job in state.jobs.values() {
            job.cancel_attempt();
            job.close_subscribers();
        }
        let removed = state.jobs.len();
        state.jobs.clear();
        state.queue.clear();
        drop(state);

        self.schedule_save();
        info!(removed, "all jobs deleted");
    }

    /// Number of jobs currently holding a concurrency slot
    pub fn running_count(&self) -> usize {
        self.lock_state().running
    }

    /// Number of jobs waiting in the pending queue
    pub fn queue_depth(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Ids currently waiting in the pending queue, FIFO order
    pub fn queued_ids(&self) -> Vec<String> {
        self.lock_state().queue.iter().cloned().collect()
    }

    /// Wait for every in-flight attempt to return, then flush the final
    /// state snapshot. The shutdown token must already be cancelled.
    pub async fn shutdown(&self) {
        loop {
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        self.save_now().await;
    }

    // ---- internal ----

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn job_exists(&self, id: &str) -> bool {
        self.lock_state().jobs.contains_key(id)
    }

    /// Allocate an id and insert a fresh job into the table
    fn admit(state: &mut ManagerState, url: String, max_retries: u32) -> Arc<Job> {
        state.next_id += 1;
        let id = state.next_id.to_string();
        let job = Arc::new(Job::new(id.clone(), url, max_retries));
        state.jobs.insert(id, Arc::clone(&job));
        job
    }

    /// Take a slot for the job if one is free, otherwise queue it.
    /// Returns true when the caller must spawn the job's run task.
    fn dispatch_or_queue(&self, state: &mut ManagerState, job: &Arc<Job>) -> bool {
        if state.running < self.max_concurrent {
            job.set_status(JobStatus::Pending);
            state.running += 1;
            true
        } else {
            job.set_status(JobStatus::Queued);
            state.queue.push_back(job.id.clone());
            false
        }
    }

    /// Launch the retry/backoff orchestrator for a job that holds a slot
    fn spawn_run(self: &Arc<Self>, job: Arc<Job>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let holds_slot = manager.run_download(&job).await;
            if holds_slot {
                manager.start_next_queued();
            }
            if manager.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                manager.drained.notify_waiters();
            }
        });
    }

    /// Release the caller's slot, then promote the head of the queue if a
    /// job is waiting and shutdown has not been signalled.
    fn start_next_queued(self: &Arc<Self>) {
        let mut state = self.lock_state();
        state.running = state.running.saturating_sub(1);

        if self.shutdown.is_cancelled() {
            return;
        }

        let next = loop {
            match state.queue.pop_front() {
                // A queued id may refer to a deleted job; skip it
                Some(id) => match state.jobs.get(&id) {
                    Some(job) => break Some(Arc::clone(job)),
                    None => continue,
                },
                None => break None,
            }
        };

        if let Some(job) = next {
            state.running += 1;
            drop(state);
            self.spawn_run(job);
        }
    }

    /// Startup only: dispatch restored queue entries up to the cap
    fn drain_queue(self: &Arc<Self>) {
        let mut state = self.lock_state();
        let mut dispatches = Vec::new();
        while state.running < self.max_concurrent {
            let Some(id) = state.queue.pop_front() else {
                break;
            };
            let Some(job) = state.jobs.get(&id).cloned() else {
                continue;
            };
            state.running += 1;
            dispatches.push(job);
        }
        drop(state);

        for job in dispatches {
            self.spawn_run(job);
        }
    }

    /// The retry/backoff orchestrator for one job. Runs attempts in a loop
    /// until the job completes, fails terminally, is deleted, or shutdown
    /// interrupts it. Returns whether the task still holds its slot.
    async fn run_download(self: &Arc<Self>, job: &Arc<Job>) -> bool {
        loop {
            if !self.job_exists(&job.id) {
                return true;
            }

            job.broadcast_status(JobStatus::Running);
            self.schedule_save();

            let result = runner::execute_attempt(
                job,
                &self.downloader_bin,
                &self.download_dir,
                &self.shutdown,
            )
            .await;

            if !self.job_exists(&job.id) {
                return true;
            }

            let err = match result {
                Ok(()) => {
                    job.mark_completed(Utc::now());
                    job.close_subscribers();
                    self.schedule_save();
                    info!(job_id = %job.id, "download completed");
                    return true;
                }
                Err(err) => err,
            };

            // A shutdown-induced failure leaves the status as running so the
            // on-disk snapshot re-queues the job after restart.
            if self.shutdown.is_cancelled() {
                return true;
            }

            let attempt = job.record_attempt_failure(&format!("{err:#}"));
            if attempt >= job.max_retries {
                job.mark_failed(Utc::now());
                job.close_subscribers();
                self.schedule_save();
                warn!(job_id = %job.id, attempts = attempt, error = %err, "download failed");
                return true;
            }

            let backoff = self
                .retry_backoff
                .saturating_mul(3u32.saturating_pow(attempt - 1));

            job.begin_backoff();

            // Release the slot for the duration of the backoff so the
            // pause does not starve the queue.
            self.start_next_queued();
            self.schedule_save();

            job.append(&format!(
                "--- Retry {attempt}/{} in {} ---",
                job.max_retries,
                format_duration(backoff)
            ));
            warn!(job_id = %job.id, attempt, backoff = ?backoff, error = %err, "attempt failed, backing off");

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return false,
            }

            if !self.job_exists(&job.id) {
                return false;
            }

            // Re-acquire a slot; if none is free, re-queue and let a future
            // slot release promote this job back into execution.
            let mut state = self.lock_state();
            if state.running < self.max_concurrent {
                state.running += 1;
            } else {
                job.set_status(JobStatus::Queued);
                state.queue.push_back(job.id.clone());
                drop(state);
                self.schedule_save();
                return false;
            }
        }
    }

    /// Request a debounced snapshot write
    fn schedule_save(&self) {
        if self.data_dir.is_none() {
            return;
        }
        let _ = self.save_tx.try_send(());
    }

    /// Write the snapshot now. Persistence failures are logged, never
    /// surfaced.
    pub async fn save_now(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };

        let snapshot = {
            let state = self.lock_state();
            PersistedState {
                next_id: state.next_id,
                jobs: state.jobs.values().map(|j| j.to_persisted()).collect(),
            }
        };

        if let Err(err) = persist::write_state(dir, &snapshot).await {
            warn!(error = %err, "failed to persist job state");
        }
    }

    /// Restore the snapshot: terminal jobs verbatim, everything else
    /// coerced to queued with zero progress and re-enqueued in submission
    /// order.
    async fn load_state(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };

        let persisted = match persist::read_state(dir).await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "failed to load persisted job state");
                return;
            }
        };

        let mut state = self.lock_state();
        state.next_id = persisted.next_id;

        let mut requeue = Vec::new();
        for record in persisted.jobs {
            if record.status.is_terminal() {
                let job = Arc::new(Job::from_persisted(record));
                state.jobs.insert(job.id.clone(), job);
            } else {
                requeue.push(record);
            }
        }

        // FIFO order after restart honors the original admission sequence
        requeue.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        for mut record in requeue {
            record.status = JobStatus::Queued;
            record.progress = 0.0;
            let job = Arc::new(Job::from_persisted(record));
            state.queue.push_back(job.id.clone());
            state.jobs.insert(job.id.clone(), job);
        }

        info!(
            jobs = state.jobs.len(),
            queued = state.queue.len(),
            "restored persisted jobs"
        );
    }
}

/// Background task that coalesces save requests: wait for a nudge, let the
/// burst quiesce, drain whatever piled up, then write once.
async fn save_loop(manager: Weak<DownloadManager>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(SAVE_DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.save_now().await;
    }
}

fn numeric_id(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

/// Render a backoff duration the way it appears in the synthetic retry
/// line: `10s`, `1m30s`, or milliseconds below one second.
fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn test_settings() -> DownloadSettings {
        let mut settings = Settings::load_for_testing().download;
        settings.downloader_bin = "true".to_string();
        settings.download_dir = std::env::temp_dir().join("mediaspool-manager-tests");
        settings
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(100)), "100ms");
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(270)), "4m30s");
    }

    #[test]
    fn test_backoff_progression() {
        let base = Duration::from_secs(10);
        let backoffs: Vec<Duration> = (1..=3)
            .map(|attempt: u32| base.saturating_mul(3u32.saturating_pow(attempt - 1)))
            .collect();
        assert_eq!(
            backoffs,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(90),
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_rejected_during_shutdown() {
        let shutdown = CancellationToken::new();
        let manager = DownloadManager::start(test_settings(), shutdown.clone()).await;

        shutdown.cancel();
        let err = manager.submit("https://example.com/late").unwrap_err();
        assert!(matches!(err, AppError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_bulk_skips_blank_entries() {
        let shutdown = CancellationToken::new();
        let manager = DownloadManager::start(test_settings(), shutdown.clone()).await;

        let urls = vec![
            "".to_string(),
            "   ".to_string(),
            "https://example.com/a".to_string(),
        ];
        let results = manager.submit_bulk(&urls);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, BulkOutcome::Admitted(_)));

        shutdown.cancel();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_unknown_job_is_not_found() {
        let shutdown = CancellationToken::new();
        let manager = DownloadManager::start(test_settings(), shutdown.clone()).await;

        assert!(matches!(
            manager.delete("999"),
            Err(AppError::NotFound(_))
        ));

        shutdown.cancel();
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_unknown_job_is_not_found() {
        let shutdown = CancellationToken::new();
        let manager = DownloadManager::start(test_settings(), shutdown.clone()).await;

        assert!(matches!(manager.retry("999"), Err(AppError::NotFound(_))));

        shutdown.cancel();
        manager.shutdown().await;
    }
}
