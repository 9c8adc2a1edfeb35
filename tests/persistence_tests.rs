//! Persistence and crash-recovery tests

mod common;

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::{wait_until, TestEnv};
use mediaspool::manager::DownloadManager;
use mediaspool::models::JobStatus;
use mediaspool::persist::{self, PersistedJob, PersistedState};

fn persisted(id: &str, url: &str, status: JobStatus, age_secs: i64) -> PersistedJob {
    PersistedJob {
        id: id.to_string(),
        url: url.to_string(),
        status,
        created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        done_at: status.is_terminal().then(Utc::now),
        error: String::new(),
        progress: if status == JobStatus::Completed { 100.0 } else { 37.5 },
        retry_count: 0,
        max_retries: 3,
        output: vec!["earlier output".to_string()],
    }
}

#[tokio::test]
async fn test_terminal_jobs_survive_restart_verbatim() {
    let env = TestEnv::new();
    let stub = env.stub("dl.sh", "echo '[download] 100%'\nexit 0");
    let settings = env.download_settings(&stub);

    let shutdown = CancellationToken::new();
    let manager = DownloadManager::start(settings.clone(), shutdown.clone()).await;

    let a = manager.submit("https://example.com/a").unwrap();
    let b = manager.submit("https://example.com/b").unwrap();
    assert!(
        wait_until(
            || [&a, &b].iter().all(|j| j.status() == JobStatus::Completed),
            Duration::from_secs(10)
        )
        .await
    );

    shutdown.cancel();
    manager.shutdown().await;

    let before: Vec<_> = manager.list().iter().map(|j| j.to_persisted()).collect();

    // Restart on the same data dir
    let shutdown2 = CancellationToken::new();
    let restarted = DownloadManager::start(settings, shutdown2.clone()).await;
    let after: Vec<_> = restarted.list().iter().map(|j| j.to_persisted()).collect();

    assert_eq!(before.len(), after.len());
    for (x, y) in before.iter().zip(after.iter()) {
        assert_eq!(x.id, y.id);
        assert_eq!(x.url, y.url);
        assert_eq!(x.status, y.status);
        assert_eq!(x.created_at, y.created_at);
        assert_eq!(x.done_at, y.done_at);
        assert_eq!(x.error, y.error);
        assert_eq!(x.progress, y.progress);
        assert_eq!(x.retry_count, y.retry_count);
        assert_eq!(x.max_retries, y.max_retries);
        assert_eq!(x.output, y.output);
    }

    // Ids keep counting from where they left off
    let next = restarted.submit("https://example.com/c").unwrap();
    assert_eq!(next.id, "3");

    shutdown2.cancel();
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_non_terminal_jobs_requeue_in_submission_order() {
    let env = TestEnv::new();

    // Jobs persisted mid-flight in assorted states, created_at out of id
    // order on purpose
    let state = PersistedState {
        next_id: 9,
        jobs: vec![
            persisted("4", "https://example.com/d", JobStatus::Retrying, 10),
            persisted("2", "https://example.com/b", JobStatus::Running, 40),
            persisted("7", "https://example.com/done", JobStatus::Completed, 60),
            persisted("3", "https://example.com/c", JobStatus::Queued, 20),
            persisted("1", "https://example.com/a", JobStatus::Pending, 50),
        ],
    };
    persist::write_state(env.data_dir.path(), &state)
        .await
        .unwrap();

    // One slot and a hanging downloader keep everything else in the queue
    let stub = env.stub("dl.sh", "sleep 30");
    let mut settings = env.download_settings(&stub);
    settings.max_concurrent = 1;

    let shutdown = CancellationToken::new();
    let manager = DownloadManager::start(settings, shutdown.clone()).await;

    // Terminal job restored verbatim
    let done = manager.get("7").unwrap();
    assert_eq!(done.status(), JobStatus::Completed);
    assert_eq!(done.progress(), 100.0);

    // Oldest non-terminal job took the slot; the rest queue by created_at
    assert_eq!(manager.running_count(), 1);
    assert_eq!(
        manager.queued_ids(),
        vec!["2".to_string(), "3".to_string(), "4".to_string()]
    );
    for id in ["2", "3", "4"] {
        let job = manager.get(id).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.progress(), 0.0);
    }

    shutdown.cancel();
    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_mid_attempt_requeues_on_restart() {
    let env = TestEnv::new();
    let hang = env.stub("hang.sh", "sleep 30");
    let settings = env.download_settings(&hang);

    let shutdown = CancellationToken::new();
    let manager = DownloadManager::start(settings, shutdown.clone()).await;

    let job = manager.submit("https://example.com/v").unwrap();
    assert!(
        wait_until(|| job.status() == JobStatus::Running, Duration::from_secs(5)).await
    );

    // Shutdown kills the attempt but leaves the status alone so the final
    // snapshot records it as interrupted
    shutdown.cancel();
    manager.shutdown().await;

    let on_disk = persist::read_state(env.data_dir.path())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_disk.jobs.len(), 1);
    assert_eq!(on_disk.jobs[0].status, JobStatus::Running);

    // After restart the job is re-queued and runs to completion
    let quick = env.stub("quick.sh", "exit 0");
    let settings2 = env.download_settings(&quick);
    let shutdown2 = CancellationToken::new();
    let restarted = DownloadManager::start(settings2, shutdown2.clone()).await;

    let revived = restarted.get(&job.id).unwrap();
    assert!(
        wait_until(
            || revived.status() == JobStatus::Completed,
            Duration::from_secs(10)
        )
        .await,
        "re-queued job should finish after restart"
    );

    shutdown2.cancel();
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_empty_data_dir_disables_persistence() {
    let env = TestEnv::new();
    let stub = env.stub("dl.sh", "exit 0");
    let mut settings = env.download_settings(&stub);
    settings.data_dir = None;

    let shutdown = CancellationToken::new();
    let manager = DownloadManager::start(settings, shutdown.clone()).await;

    let job = manager.submit("https://example.com/v").unwrap();
    assert!(
        wait_until(|| job.status() == JobStatus::Completed, Duration::from_secs(10)).await
    );

    shutdown.cancel();
    manager.shutdown().await;

    assert!(!env.data_dir.path().join("jobs.json").exists());
}
