use std::time::Duration;

use crucible::{
    Outcome, ResourceLimits, Scheduler, SchedulerError, Submission, SubmissionError,
};

use super::test_config;

fn scheduler(root: &std::path::Path, workers: usize, queue: usize) -> Scheduler {
    Scheduler::from_config(test_config("process", root, workers, queue))
        .expect("process backend is always available")
}

fn workspaces_left(root: &std::path::Path) -> usize {
    std::fs::read_dir(root).map_or(0, |dir| dir.count())
}

#[tokio::test]
async fn hello_world() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new("sample", "echo hello"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.text(), "hello\n");
    assert!(result.compile_output.is_none());

    scheduler.shutdown().await;
    assert_eq!(workspaces_left(root.path()), 0);
}

#[tokio::test]
async fn stdin_is_piped() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new("sample", "read line; echo \"got $line\"").with_stdin("abc\n"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout.text(), "got abc\n");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn nonzero_exit_is_runtime_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new("sample", "echo oops >&2; exit 3"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stderr.text(), "oops\n");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn infinite_loop_times_out() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let started = std::time::Instant::now();
    let result = scheduler
        .run(Submission::new("sample", "while :; do :; done"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
    scheduler.shutdown().await;
    assert_eq!(workspaces_left(root.path()), 0);
}

#[tokio::test]
async fn wall_limit_is_enforced_promptly() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);
    let limits = ResourceLimits::unset()
        .with_time_limit(10.0)
        .with_wall_time_limit(2.0);

    let started = std::time::Instant::now();
    let result = scheduler
        .run(Submission::new("sample", "while :; do :; done").with_limits(limits))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.outcome, Outcome::Timeout);
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2500), "{elapsed:?}");
    scheduler.shutdown().await;
    assert_eq!(workspaces_left(root.path()), 0);
}

#[tokio::test]
async fn memory_hog_exceeds_limit() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);
    let limits = ResourceLimits::unset().with_memory_limit(32 * 1024);

    let result = scheduler
        .run(
            Submission::new("sample", "x=$(head -c 200000000 /dev/zero | tr '\\0' a)")
                .with_limits(limits),
        )
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::ResourceLimitExceeded);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn program_text_cannot_claim_a_limit() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new(
            "sample",
            "echo 'memory check failed' >&2; echo 'Time limit exceeded' >&2; exit 1",
        ))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::RuntimeError);
    assert_eq!(result.exit_code, Some(1));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn sleeping_past_wall_limit_times_out() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new("sample", "sleep 30"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Timeout);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn output_is_truncated_at_capture_limit() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new(
            "sample",
            "i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done; exit 0",
        ))
        .await
        .unwrap();

    assert!(result.stdout.truncated);
    assert!(result.stdout.bytes.len() <= 4096);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn syntax_error_is_compile_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new("sample-checked", "if then fi ("))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::CompileError);
    assert!(result.compile_output.is_some_and(|out| !out.is_empty()));
    assert!(result.stdout.is_empty());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn checked_language_runs_after_compile() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let result = scheduler
        .run(Submission::new("sample-checked", "echo checked"))
        .await
        .unwrap();

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.stdout.text(), "checked\n");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn unknown_language_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let err = scheduler
        .submit(Submission::new("cobol", "DISPLAY 'HI'."))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnsupportedLanguage(ref lang) if lang == "cobol"));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn saturated_queue_rejects_immediately() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 1);

    // One running, one queued
    let running = scheduler.submit(Submission::new("sample", "sleep 2")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let queued = scheduler.submit(Submission::new("sample", "echo queued")).unwrap();

    let rejected = scheduler.submit(Submission::new("sample", "echo rejected"));
    assert!(matches!(rejected, Err(SchedulerError::QueueFull(1))));

    assert_eq!(running.await.unwrap().outcome, Outcome::Success);
    assert_eq!(queued.await.unwrap().stdout.text(), "queued\n");
    scheduler.shutdown().await;
}

#[tokio::test]
async fn cancelled_run_is_torn_down() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 1, 4);

    let handle = scheduler.submit(Submission::new("sample", "sleep 30")).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(scheduler.cancel(handle.id()));

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancellation should finish promptly");
    assert!(matches!(result, Err(SubmissionError::Cancelled)));

    scheduler.shutdown().await;
    assert_eq!(workspaces_left(root.path()), 0);
}

#[tokio::test]
async fn concurrent_submissions_all_complete() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path(), 3, 16);

    let handles: Vec<_> = (0..8)
        .map(|n| {
            scheduler
                .submit(Submission::new("sample", format!("echo {n}")))
                .unwrap()
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
        assert_eq!(result.stdout.text(), format!("{n}\n"));
    }

    scheduler.shutdown().await;
    assert_eq!(workspaces_left(root.path()), 0);
}
