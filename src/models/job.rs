//! Job model and live event fan-out
//!
//! A [`Job`] is the unit of work in Mediaspool: one submitted URL and the
//! state of its download attempt chain. Identity fields are immutable and
//! live directly on the struct; everything the scheduler and the runner
//! mutate sits behind the job's own mutex, so the per-line append path never
//! has to touch the manager lock.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::persist::PersistedJob;

/// Output history kept per job; the oldest lines are dropped on overflow
pub const MAX_OUTPUT_LINES: usize = 500;

/// Bounded capacity of each subscriber channel; events for a full
/// subscriber are dropped, the output buffer stays the lossless history
pub const SUBSCRIBER_CAPACITY: usize = 128;

static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\]\s+([\d.]+)%").expect("progress regex"));

/// Job status enumeration
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted and about to start its first attempt
    #[default]
    Pending,
    /// Waiting in the FIFO queue for a free slot
    Queued,
    /// An attempt is currently executing
    Running,
    /// Sleeping on backoff between attempts
    Retrying,
    /// Finished successfully
    Completed,
    /// Exhausted all attempts
    Failed,
}

impl JobStatus {
    /// Terminal states produce no further events until an explicit retry
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Retrying => write!(f, "retrying"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Live event delivered to job subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// One line of downloader output
    Message(String),
    /// Raw matched percentage text from a progress line
    Progress(String),
    /// Status transition
    Status(JobStatus),
}

/// Mutable portion of a job, guarded by the job's own mutex
#[derive(Debug)]
struct JobState {
    status: JobStatus,
    done_at: Option<DateTime<Utc>>,
    error: String,
    progress: f64,
    retry_count: u32,
    output: Vec<String>,
    subscribers: Vec<mpsc::Sender<JobEvent>>,
    cancel: Option<CancellationToken>,
}

/// One download job: a submitted URL plus its attempt chain
#[derive(Debug)]
pub struct Job {
    /// Monotonically increasing decimal id, unique within the process
    pub id: String,
    /// The submitted URL
    pub url: String,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Attempt cap, snapshot from config at creation
    pub max_retries: u32,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(id: String, url: String, max_retries: u32) -> Self {
        Self {
            id,
            url,
            created_at: Utc::now(),
            max_retries,
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                done_at: None,
                error: String::new(),
                progress: 0.0,
                retry_count: 0,
                output: Vec::new(),
                subscribers: Vec::new(),
                cancel: None,
            }),
        }
    }

    /// Restore a job from its persisted record
    pub fn from_persisted(p: PersistedJob) -> Self {
        Self {
            id: p.id,
            url: p.url,
            created_at: p.created_at,
            max_retries: p.max_retries,
            state: Mutex::new(JobState {
                status: p.status,
                done_at: p.done_at,
                error: p.error,
                progress: p.progress,
                retry_count: p.retry_count,
                output: p.output,
                subscribers: Vec::new(),
                cancel: None,
            }),
        }
    }

    pub fn to_persisted(&self) -> PersistedJob {
        let state = self.lock();
        PersistedJob {
            id: self.id.clone(),
            url: self.url.clone(),
            status: state.status,
            created_at: self.created_at,
            done_at: state.done_at,
            error: state.error.clone(),
            progress: state.progress,
            retry_count: state.retry_count,
            max_retries: self.max_retries,
            output: state.output.clone(),
        }
    }

    /// Append one output line: enforce the history cap, extract progress,
    /// and fan the line out to every live subscriber.
    pub fn append(&self, line: &str) {
        let mut state = self.lock();
        state.output.push(line.to_string());
        if state.output.len() > MAX_OUTPUT_LINES {
            let excess = state.output.len() - MAX_OUTPUT_LINES;
            state.output.drain(..excess);
        }

        if let Some(m) = PROGRESS_RE.captures(line) {
            let raw = &m[1];
            if let Ok(pct) = raw.parse::<f64>() {
                state.progress = pct;
                let evt = JobEvent::Progress(raw.to_string());
                Self::broadcast(&mut state, evt);
            }
        }

        Self::broadcast(&mut state, JobEvent::Message(line.to_string()));
    }

    /// Snapshot the existing output and register a new subscriber channel.
    /// Both happen under one lock so a line appended in between cannot be
    /// missed.
    pub fn subscribe(&self) -> (Vec<String>, mpsc::Receiver<JobEvent>) {
        let mut state = self.lock();
        let existing = state.output.clone();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        state.subscribers.push(tx);
        (existing, rx)
    }

    /// Drop subscriber channels whose receiver went away
    pub fn prune_subscribers(&self) {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
    }

    /// Close all subscriber channels; safe to call twice because the set is
    /// emptied on the first call.
    pub fn close_subscribers(&self) {
        let mut state = self.lock();
        state.subscribers.clear();
    }

    /// Set the status and broadcast it as a live event
    pub fn broadcast_status(&self, status: JobStatus) {
        let mut state = self.lock();
        state.status = status;
        Self::broadcast(&mut state, JobEvent::Status(status));
    }

    /// Set the status without emitting an event (re-queue path)
    pub fn set_status(&self, status: JobStatus) {
        self.lock().status = status;
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    pub fn error(&self) -> String {
        self.lock().error.clone()
    }

    pub fn done_at(&self) -> Option<DateTime<Utc>> {
        self.lock().done_at
    }

    /// Store the cancellation handle of the in-flight attempt
    pub fn set_cancel(&self, token: CancellationToken) {
        self.lock().cancel = Some(token);
    }

    /// Drop the cancellation handle once the attempt has returned
    pub fn clear_cancel(&self) {
        self.lock().cancel = None;
    }

    /// Fire the cancellation handle of the in-flight attempt, if any
    pub fn cancel_attempt(&self) {
        let state = self.lock();
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
    }

    /// Mark the job successfully finished
    pub fn mark_completed(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.status = JobStatus::Completed;
        state.done_at = Some(now);
        state.progress = 100.0;
    }

    /// Record a failed attempt: bump the counter and remember the error
    /// text (overwritten each attempt, last one wins). Returns the attempt
    /// number just consumed.
    pub fn record_attempt_failure(&self, error: &str) -> u32 {
        let mut state = self.lock();
        state.retry_count += 1;
        state.error = error.to_string();
        state.retry_count
    }

    /// Mark the job terminally failed after exhausting its attempts
    pub fn mark_failed(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.status = JobStatus::Failed;
        state.done_at = Some(now);
    }

    /// Enter the backoff pause: reset progress and announce `retrying`
    pub fn begin_backoff(&self) {
        let mut state = self.lock();
        state.status = JobStatus::Retrying;
        state.progress = 0.0;
        Self::broadcast(&mut state, JobEvent::Status(JobStatus::Retrying));
    }

    /// Reset a failed job so it can be re-admitted. Returns false when the
    /// job is not in the failed state.
    pub fn reset_for_retry(&self) -> bool {
        let mut state = self.lock();
        if state.status != JobStatus::Failed {
            return false;
        }
        state.error.clear();
        state.done_at = None;
        state.progress = 0.0;
        state.retry_count = 0;
        state.output.clear();
        true
    }

    pub fn summary(&self) -> JobSummary {
        let state = self.lock();
        JobSummary {
            id: self.id.clone(),
            url: self.url.clone(),
            status: state.status,
            created_at: self.created_at,
            done_at: state.done_at,
            error: state.error.clone(),
            progress: state.progress,
            retry_count: state.retry_count,
            max_retries: self.max_retries,
        }
    }

    pub fn detail(&self) -> JobDetail {
        let state = self.lock();
        JobDetail {
            summary: JobSummary {
                id: self.id.clone(),
                url: self.url.clone(),
                status: state.status,
                created_at: self.created_at,
                done_at: state.done_at,
                error: state.error.clone(),
                progress: state.progress,
                retry_count: state.retry_count,
                max_retries: self.max_retries,
            },
            output: state.output.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Non-blocking fan-out: an event for a full subscriber is dropped,
    /// and subscribers whose receiver is gone are pruned.
    fn broadcast(state: &mut JobState, event: JobEvent) {
        state.subscribers.retain(|tx| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                // Slow subscriber: drop the event, keep the channel
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Job summary for list responses and submission replies
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub progress: f64,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Full job detail including the output history
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub output: Vec<String>,
}

/// Request to submit a single download
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    #[validate(length(min = 1, message = "url is required"))]
    pub url: String,
}

/// Request to submit a batch of downloads
#[derive(Debug, Deserialize, Validate)]
pub struct BulkSubmitRequest {
    #[validate(length(min = 1, max = 500, message = "Must provide 1-500 urls"))]
    pub urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("1".to_string(), "https://example.com/v".to_string(), 3)
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Retrying).unwrap(),
            "\"retrying\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"queued\"").unwrap(),
            JobStatus::Queued
        );
    }

    #[test]
    fn test_status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_append_caps_output() {
        let j = job();
        for i in 0..(MAX_OUTPUT_LINES + 25) {
            j.append(&format!("line {i}"));
        }
        let detail = j.detail();
        assert_eq!(detail.output.len(), MAX_OUTPUT_LINES);
        // Oldest lines dropped
        assert_eq!(detail.output[0], "line 25");
        assert_eq!(
            detail.output.last().unwrap(),
            &format!("line {}", MAX_OUTPUT_LINES + 24)
        );
    }

    #[test]
    fn test_progress_extraction() {
        let j = job();
        let (_, mut rx) = j.subscribe();

        j.append("[download]  42.5% of 10MiB at 1MiB/s");

        assert_eq!(j.progress(), 42.5);
        assert_eq!(rx.try_recv().unwrap(), JobEvent::Progress("42.5".into()));
        assert!(matches!(rx.try_recv().unwrap(), JobEvent::Message(_)));
    }

    #[test]
    fn test_progress_extraction_idempotent() {
        let j = job();
        let (_, mut rx) = j.subscribe();

        j.append("[download]  42.5%");
        j.append("[download]  42.5%");

        let mut progress_events = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            if let JobEvent::Progress(p) = evt {
                progress_events.push(p);
            }
        }
        assert_eq!(progress_events, vec!["42.5", "42.5"]);
        assert_eq!(j.progress(), 42.5);
    }

    #[test]
    fn test_non_progress_line_leaves_progress() {
        let j = job();
        j.append("[download]  13.0%");
        j.append("Merging formats");
        assert_eq!(j.progress(), 13.0);
    }

    #[test]
    fn test_subscribe_snapshot_is_atomic() {
        let j = job();
        j.append("before");
        let (snapshot, mut rx) = j.subscribe();
        j.append("after");

        assert_eq!(snapshot, vec!["before"]);
        assert_eq!(rx.try_recv().unwrap(), JobEvent::Message("after".into()));
    }

    #[test]
    fn test_slow_subscriber_drops_events() {
        let j = job();
        let (_, mut rx) = j.subscribe();

        for i in 0..(SUBSCRIBER_CAPACITY + 40) {
            j.append(&format!("line {i}"));
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        // The channel held at most its capacity; the rest were dropped
        assert_eq!(received, SUBSCRIBER_CAPACITY);
        // But the output buffer kept everything (below the history cap)
        assert_eq!(j.detail().output.len(), SUBSCRIBER_CAPACITY + 40);
    }

    #[test]
    fn test_close_subscribers_is_safe_twice() {
        let j = job();
        let (_, mut rx) = j.subscribe();

        j.close_subscribers();
        j.close_subscribers();

        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_broadcast_prunes_dropped_receiver() {
        let j = job();
        let (_, rx) = j.subscribe();
        drop(rx);
        j.append("hello");

        // A fresh subscriber still works and the dead channel is gone
        let (snapshot, _rx2) = j.subscribe();
        assert_eq!(snapshot, vec!["hello"]);
    }

    #[test]
    fn test_reset_for_retry_requires_failed() {
        let j = job();
        assert!(!j.reset_for_retry());

        j.record_attempt_failure("boom");
        j.mark_failed(Utc::now());
        assert!(j.reset_for_retry());
        assert_eq!(j.retry_count(), 0);
        assert_eq!(j.error(), "");
        assert!(j.done_at().is_none());
        assert!(j.detail().output.is_empty());
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let j = job();
        let json = serde_json::to_value(j.summary()).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("retryCount").is_some());
        assert!(json.get("maxRetries").is_some());
        // Empty error and absent doneAt are omitted
        assert!(json.get("error").is_none());
        assert!(json.get("doneAt").is_none());
    }

    #[test]
    fn test_persisted_round_trip() {
        let j = job();
        j.append("one");
        j.record_attempt_failure("network unreachable");
        j.mark_failed(Utc::now());

        let restored = Job::from_persisted(j.to_persisted());
        assert_eq!(restored.id, j.id);
        assert_eq!(restored.url, j.url);
        assert_eq!(restored.status(), JobStatus::Failed);
        assert_eq!(restored.retry_count(), 1);
        assert_eq!(restored.error(), "network unreachable");
        assert_eq!(restored.detail().output, vec!["one"]);
    }
}
