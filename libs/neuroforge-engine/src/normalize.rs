//! Result Normalizer - pure mapping from raw process facts into the stable
//! outcome taxonomy. No I/O, never panics; anything unmappable becomes
//! `InternalError` with the raw detail preserved for operators.

use crate::runner::RawExecutionResult;
use chrono::Utc;
use neuroforge_common::{ExecutionOutcome, OutcomeStatus, TestCaseResult, TestCaseStatus};
use uuid::Uuid;

/// Classification shared by submission-level and per-case mapping.
///
/// Priority order matters: a cancelled run is `Aborted` even if it also timed
/// out, and a structural capture failure can never masquerade as `Success`.
fn classify(raw: &RawExecutionResult) -> (OutcomeStatus, Option<String>) {
    if raw.cancelled {
        return (OutcomeStatus::Aborted, None);
    }
    if let Some(detail) = &raw.capture_failed {
        return (
            OutcomeStatus::InternalError,
            Some(format!("output capture failed: {}", detail)),
        );
    }
    if raw.oom_killed {
        return (
            OutcomeStatus::ResourceExceeded,
            Some("killed by the memory controller".to_string()),
        );
    }
    if raw.timed_out {
        return (OutcomeStatus::Timeout, None);
    }
    if raw.output_killed {
        return (
            OutcomeStatus::ResourceExceeded,
            Some("terminated at the output byte cap".to_string()),
        );
    }

    match raw.exit_code {
        Some(0) => (OutcomeStatus::Success, None),
        // 128+signal vocabulary; 137 without the OOM flag is still a forced
        // kill under memory pressure often enough to classify as exceeded.
        Some(137) => (
            OutcomeStatus::ResourceExceeded,
            Some("exit 137 (SIGKILL, likely memory limit)".to_string()),
        ),
        Some(139) => (
            OutcomeStatus::RuntimeError,
            Some("exit 139 (SIGSEGV)".to_string()),
        ),
        Some(code) if code > 128 => (
            OutcomeStatus::RuntimeError,
            Some(format!("terminated by signal {}", code - 128)),
        ),
        Some(_) => (OutcomeStatus::RuntimeError, None),
        None => (
            OutcomeStatus::InternalError,
            Some("no exit status captured".to_string()),
        ),
    }
}

/// Map a raw submission-level result into the final outcome.
pub fn normalize(submission_id: Uuid, raw: RawExecutionResult) -> ExecutionOutcome {
    let (status, diagnostic) = classify(&raw);
    ExecutionOutcome {
        submission_id,
        status,
        stdout: raw.stdout,
        stderr: raw.stderr,
        stdout_truncated: raw.stdout_truncated,
        stderr_truncated: raw.stderr_truncated,
        exit_code: raw.exit_code,
        duration_ms: raw.duration_ms,
        finished_at: Utc::now(),
        test_results: Vec::new(),
        diagnostic,
    }
}

/// Map a raw per-case result into a verdict. Pass/fail uses trimmed equality
/// against the caller-supplied expected output; anything richer is the
/// caller's contract.
pub fn normalize_case(
    case_id: u32,
    expected_output: &str,
    raw: RawExecutionResult,
) -> TestCaseResult {
    let (status, _) = classify(&raw);
    let case_status = match status {
        OutcomeStatus::Success => {
            if raw.stdout.trim() == expected_output.trim() {
                TestCaseStatus::Passed
            } else {
                TestCaseStatus::Failed
            }
        }
        OutcomeStatus::Timeout => TestCaseStatus::Timeout,
        OutcomeStatus::ResourceExceeded => TestCaseStatus::ResourceExceeded,
        // Aborted/InternalError cases never reach this point; the
        // coordinator stops the case loop instead.
        _ => TestCaseStatus::RuntimeError,
    };

    TestCaseResult {
        case_id,
        status: case_status,
        stdout: raw.stdout,
        stderr: raw.stderr,
        stdout_truncated: raw.stdout_truncated,
        stderr_truncated: raw.stderr_truncated,
        duration_ms: raw.duration_ms,
    }
}
