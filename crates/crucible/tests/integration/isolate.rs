use std::time::{Duration, Instant};

use crucible::{Outcome, ResourceLimits, Scheduler, Submission};

use super::test_config;

fn scheduler(root: &std::path::Path) -> Scheduler {
    Scheduler::from_config(test_config("isolate", root, 2, 8))
        .expect("isolate should be available")
}

#[tokio::test]
#[ignore = "requires root"]
async fn hello_world_in_box() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let result = scheduler
        .run(Submission::new("sample", "echo hello").with_stdin("ignored\n"))
        .await
        .unwrap();
    assert_eq!(result.outcome, Outcome::Success, "{result:?}");
    assert_eq!(result.stdout.text(), "hello\n");
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn stdin_is_piped() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    let result = scheduler
        .run(Submission::new("sample", "read line; echo \"got $line\"").with_stdin("abc\n"))
        .await
        .unwrap();
    assert_eq!(result.stdout.text(), "got abc\n");
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires root"]
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
#[ignore = "requires root"]
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
#[ignore = "requires root"]
async fn boxes_are_reused_across_submissions() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());

    // More submissions than boxes: each box must be cleaned up and returned.
    for n in 0..5 {
        let result = scheduler
            .run(Submission::new("sample", format!("echo {n}")))
            .await
            .unwrap();
        assert_eq!(result.stdout.text(), format!("{n}\n"));
    }
    scheduler.shutdown().await;
}

#[tokio::test]
#[ignore = "requires root"]
async fn wall_limit_is_enforced_promptly() {
    let root = tempfile::tempdir().unwrap();
    let scheduler = scheduler(root.path());
    let limits = ResourceLimits::unset()
        .with_time_limit(10.0)
        .with_wall_time_limit(2.0);

    let started = Instant::now();
    let result = scheduler
        .run(Submission::new("sample", "sleep 30").with_limits(limits))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.outcome, Outcome::Timeout, "{result:?}");
    // extra_time is 0.2 in the test config
    assert!(elapsed < Duration::from_millis(2500), "{elapsed:?}");
    scheduler.shutdown().await;
}
