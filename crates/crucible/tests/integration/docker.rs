use crucible::{Outcome, ResourceLimits, Scheduler, Submission};

use super::test_config;

fn scheduler(root: &std::path::Path) -> Scheduler {
    Scheduler::from_config(test_config("docker", root, 2, 8)).expect("docker should be available")
}

#[tokio::test]
#[ignore = "requires docker"]
async fn hello_world_in_container() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let result = scheduler
        .run(Submission::new("sample", "echo hello"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success, "{result:?}");
    assert_eq!(result.stdout.text(), "hello\n");
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn network_is_disabled() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let result = scheduler
        .run(Submission::new(
            "sample",
            "wget -q -T 2 -O- http://1.1.1.1 >/dev/null 2>&1 && echo online || echo offline",
        ))
        .await
        .unwrap();
    assert_eq!(result.stdout.text(), "offline\n");
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn infinite_loop_times_out() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let result = scheduler
        .run(Submission::new("sample", "while :; do :; done"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::Timeout);
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn memory_hog_exceeds_limit() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let limits = ResourceLimits::unset().with_memory_limit(32 * ResourceLimits::MB);
    let result = scheduler
        .run(
            Submission::new("sample", "x=a; while :; do x=\"$x$x\"; done").with_limits(limits),
        )
        .await
        .unwrap();
    assert!(
        matches!(
            result.outcome,
            Outcome::ResourceLimitExceeded | Outcome::RuntimeError
        ),
        "{result:?}"
    );
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn syntax_error_is_compile_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let result = scheduler
        .run(Submission::new("sample-checked", "if then fi ("))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::CompileError);
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn images_are_built_once() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let first = scheduler.images().resolve("sample").await.unwrap();
    let second = scheduler.images().resolve("sample").await.unwrap();
    assert_eq!(first.reference, second.reference);
    assert_eq!(first.fingerprint, second.fingerprint);
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn daemon_lookalike_stderr_is_a_runtime_error() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let result = scheduler
        .run(Submission::new(
            "sample",
            "echo 'Error response from daemon: user text' >&2; exit 1",
        ))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::RuntimeError, "{result:?}");
    assert_eq!(result.exit_code, Some(1));
    scheduler.shutdown().await;
}
