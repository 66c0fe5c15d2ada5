/// Integration tests against a live Docker daemon.
///
/// These exercise the full coordinator path: admission, provisioning,
/// sandboxed execution, normalization and teardown. They need the
/// neuroforge-python image present locally, so they are ignored by default:
///
///   cargo test -p neuroforge-engine --test docker_integration -- --ignored
use neuroforge_common::{Language, OutcomeStatus, ResourceLimits, Submission, TestCaseStatus};
use neuroforge_engine::{Coordinator, EngineConfig, LanguageCatalog, OutputOverflowPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn coordinator() -> Arc<Coordinator> {
    let config = EngineConfig {
        workspace_root: std::env::temp_dir().join(format!("nf-it-{}", Uuid::new_v4())),
        ..EngineConfig::default()
    };
    Arc::new(Coordinator::new(config, LanguageCatalog::builtin()).expect("docker available"))
}

fn python(code: &str) -> Submission {
    Submission::new("it-problem", Language::Python, code)
}

#[tokio::test]
#[ignore] // requires Docker and the neuroforge-python image
async fn hello_world_succeeds_with_exit_zero() {
    let coord = coordinator();

    let outcome = coord.execute(python(r#"print("hello")"#)).await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout, "hello\n");
    assert!(!outcome.stdout_truncated);
    assert_eq!(coord.active_workspaces(), 0);
}

#[tokio::test]
#[ignore] // requires Docker
async fn infinite_loop_times_out_near_the_deadline() {
    let coord = coordinator();
    let mut submission = python("while True:\n    pass\n");
    submission.limits = Some(ResourceLimits {
        wall_time_ms: 1_000,
        cpu_time_ms: 1_000,
        ..ResourceLimits::default()
    });

    let outcome = coord.execute(submission).await;

    assert_eq!(outcome.status, OutcomeStatus::Timeout);
    // Within the deadline plus a bounded grace, never unbounded.
    assert!(outcome.duration_ms >= 1_000);
    assert!(outcome.duration_ms < 4_000);
    assert_eq!(coord.active_workspaces(), 0);
}

#[tokio::test]
#[ignore] // requires Docker
async fn over_allocation_is_resource_exceeded() {
    let coord = coordinator();
    let mut submission = python("data = bytearray(1024 * 1024 * 1024)\nprint(len(data))\n");
    submission.limits = Some(ResourceLimits {
        memory_bytes: 100 * 1024 * 1024,
        ..ResourceLimits::default()
    });

    let outcome = coord.execute(submission).await;

    assert_eq!(outcome.status, OutcomeStatus::ResourceExceeded);
}

#[tokio::test]
#[ignore] // requires Docker
async fn runtime_error_surfaces_stderr_verbatim() {
    let coord = coordinator();

    let outcome = coord.execute(python("raise ValueError('boom')")).await;

    assert_eq!(outcome.status, OutcomeStatus::RuntimeError);
    assert!(outcome.stderr.contains("ValueError"));
    assert!(outcome.exit_code.unwrap_or(0) != 0);
}

#[tokio::test]
#[ignore] // requires Docker
async fn chatty_program_is_truncated_but_finishes() {
    let coord = coordinator();
    let mut submission = python("for _ in range(100000):\n    print('x' * 80)\n");
    submission.limits = Some(ResourceLimits {
        max_output_bytes: 4 * 1024,
        ..ResourceLimits::default()
    });

    let outcome = coord.execute(submission).await;

    // Discard policy: output is capped, the process still runs to completion.
    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert!(outcome.stdout_truncated);
    assert!(outcome.stdout.len() <= 4 * 1024);
}

#[tokio::test]
#[ignore] // requires Docker
async fn test_cases_run_in_order_with_per_case_verdicts() {
    let coord = coordinator();
    let mut submission = python("n = int(input())\nprint(n * 2)\n");
    submission.test_cases = vec![
        neuroforge_common::TestCase {
            id: 1,
            input: "5".into(),
            expected_output: "10".into(),
        },
        neuroforge_common::TestCase {
            id: 2,
            input: "7".into(),
            expected_output: "99".into(), // deliberate mismatch
        },
        neuroforge_common::TestCase {
            id: 3,
            input: "0".into(),
            expected_output: "0".into(),
        },
    ];

    let outcome = coord.execute(submission).await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.test_results.len(), 3);
    assert_eq!(outcome.test_results[0].status, TestCaseStatus::Passed);
    assert_eq!(outcome.test_results[1].status, TestCaseStatus::Failed);
    assert_eq!(outcome.test_results[2].status, TestCaseStatus::Passed);
}

#[tokio::test]
#[ignore] // requires Docker
async fn per_case_timeout_fails_only_that_case() {
    let coord = coordinator();
    let mut submission = python(
        "import time\nn = int(input())\nif n == 999:\n    time.sleep(30)\nprint(n)\n",
    );
    submission.limits = Some(ResourceLimits {
        wall_time_ms: 1_500,
        cpu_time_ms: 1_500,
        ..ResourceLimits::default()
    });
    submission.test_cases = vec![
        neuroforge_common::TestCase {
            id: 1,
            input: "999".into(),
            expected_output: "999".into(),
        },
        neuroforge_common::TestCase {
            id: 2,
            input: "7".into(),
            expected_output: "7".into(),
        },
    ];

    let outcome = coord.execute(submission).await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.test_results[0].status, TestCaseStatus::Timeout);
    // The case after the timeout still runs, with its own full wall budget.
    assert_eq!(outcome.test_results[1].status, TestCaseStatus::Passed);
}

#[tokio::test]
#[ignore] // requires Docker
async fn large_case_input_reaches_the_process_intact() {
    let coord = coordinator();
    let mut submission = python("import sys\ndata = sys.stdin.read()\nprint(len(data))\n");
    // Well past the kernel's single-argument size limit; the input has to
    // travel over the exec's stdin.
    let big = "x".repeat(512 * 1024);
    submission.test_cases = vec![neuroforge_common::TestCase {
        id: 1,
        expected_output: format!("{}", big.len()),
        input: big,
    }];

    let outcome = coord.execute(submission).await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.test_results[0].status, TestCaseStatus::Passed);
}

#[tokio::test]
#[ignore] // requires Docker
async fn kill_policy_terminates_at_the_output_cap() {
    let config = EngineConfig {
        output_overflow: OutputOverflowPolicy::Kill,
        workspace_root: std::env::temp_dir().join(format!("nf-it-{}", Uuid::new_v4())),
        ..EngineConfig::default()
    };
    let coord = Coordinator::new(config, LanguageCatalog::builtin()).expect("docker available");

    let mut submission = python("while True:\n    print('x' * 80)\n");
    submission.limits = Some(ResourceLimits {
        max_output_bytes: 4 * 1024,
        wall_time_ms: 20_000,
        cpu_time_ms: 20_000,
        ..ResourceLimits::default()
    });

    let outcome = coord.execute(submission).await;

    assert_eq!(outcome.status, OutcomeStatus::ResourceExceeded);
    assert!(outcome.stdout_truncated);
    // Killed at the cap, nowhere near the wall budget.
    assert!(outcome.duration_ms < 10_000);
    assert_eq!(coord.active_workspaces(), 0);
}

#[tokio::test]
#[ignore] // requires Docker
async fn concurrent_executions_do_not_share_a_workspace() {
    let coord = coordinator();
    // Each run writes a marker into its private /code and asserts it is the
    // only one there.
    let code = r#"
import os, sys, uuid
marker = "marker-" + str(uuid.uuid4())
open("/code/" + marker, "w").close()
markers = [f for f in os.listdir("/code") if f.startswith("marker-")]
sys.exit(0 if markers == [marker] else 1)
"#;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let coord = Arc::clone(&coord);
        let submission = python(code);
        tasks.push(tokio::spawn(async move { coord.execute(submission).await }));
    }

    for task in tasks {
        let outcome = task.await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Success);
    }
    assert_eq!(coord.active_workspaces(), 0);
}

#[tokio::test]
#[ignore] // requires Docker
async fn cancellation_mid_run_aborts_and_tears_down() {
    let coord = coordinator();
    let mut submission = python("import time\ntime.sleep(30)\n");
    submission.limits = Some(ResourceLimits {
        wall_time_ms: 40_000,
        cpu_time_ms: 40_000,
        ..ResourceLimits::default()
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let outcome = coord.execute_with_cancel(submission, cancel).await;

    assert_eq!(outcome.status, OutcomeStatus::Aborted);
    assert!(outcome.duration_ms < 30_000);
    assert_eq!(coord.active_workspaces(), 0);
}

#[tokio::test]
#[ignore] // requires Docker
async fn sandbox_has_no_network() {
    let coord = coordinator();
    let code = r#"
import socket, sys
try:
    socket.create_connection(("1.1.1.1", 53), timeout=2)
    sys.exit(1)
except OSError:
    sys.exit(0)
"#;

    let outcome = coord.execute(python(code)).await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
}
