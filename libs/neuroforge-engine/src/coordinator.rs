//! Execution Coordinator - one submission end to end.
//!
//! **State machine per call:**
//! `Pending -> Provisioning -> Running -> (Succeeded | Failed | TimedOut |
//! Aborted) -> Finalized`.
//!
//! The coordinator is the only owner of the sandbox handle; teardown runs
//! unconditionally before `execute` returns, whatever the terminal state.
//! Every call produces exactly one `ExecutionOutcome` - platform failures
//! become outcomes too, never bare errors.

use crate::catalog::{LanguageCatalog, LanguageSpec};
use crate::config::{AdmissionPolicy, EngineConfig};
use crate::limits::{self, EnforcementPlan};
use crate::normalize;
use crate::runner::{DockerRunner, ExecutionHandle, RawExecutionResult};
use crate::workspace::WorkspaceAllocator;
use chrono::Utc;
use neuroforge_common::{
    EngineError, ExecutionOutcome, OutcomeStatus, Submission, TestCaseResult,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Provisioning,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
    Finalized,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why the admission gate refused a caller.
#[derive(Debug, PartialEq, Eq)]
enum AdmissionRefusal {
    Overloaded,
    Cancelled,
}

/// Bounded concurrent-sandbox admission. The semaphore is the process-wide
/// count of simultaneously running isolation boundaries.
struct AdmissionGate {
    permits: Arc<Semaphore>,
    policy: AdmissionPolicy,
    wait: Duration,
}

impl AdmissionGate {
    fn new(bound: usize, policy: AdmissionPolicy, wait: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(bound.max(1))),
            policy,
            wait,
        }
    }

    async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, AdmissionRefusal> {
        match self.policy {
            AdmissionPolicy::Reject => self
                .permits
                .clone()
                .try_acquire_owned()
                .map_err(|_| AdmissionRefusal::Overloaded),
            AdmissionPolicy::Queue => {
                tokio::select! {
                    permit = self.permits.clone().acquire_owned() => {
                        // The semaphore is never closed.
                        permit.map_err(|_| AdmissionRefusal::Overloaded)
                    }
                    _ = tokio::time::sleep(self.wait) => Err(AdmissionRefusal::Overloaded),
                    _ = cancel.cancelled() => Err(AdmissionRefusal::Cancelled),
                }
            }
        }
    }
}

pub struct Coordinator {
    config: EngineConfig,
    catalog: LanguageCatalog,
    runner: DockerRunner,
    gate: AdmissionGate,
    workspaces: WorkspaceAllocator,
}

impl Coordinator {
    pub fn new(config: EngineConfig, catalog: LanguageCatalog) -> Result<Self, EngineError> {
        let runner = DockerRunner::connect()?;
        let workspaces =
            WorkspaceAllocator::new(&config.workspace_root).map_err(EngineError::Workspace)?;
        let gate = AdmissionGate::new(
            config.max_concurrent_sandboxes,
            config.admission_policy,
            config.admission_wait(),
        );
        info!(
            max_concurrent = config.max_concurrent_sandboxes,
            policy = ?config.admission_policy,
            languages = ?catalog.list(),
            "coordinator ready"
        );
        Ok(Self {
            config,
            catalog,
            runner,
            gate,
            workspaces,
        })
    }

    /// Workspaces currently leased to in-flight executions.
    pub fn active_workspaces(&self) -> usize {
        self.workspaces.active()
    }

    pub async fn execute(&self, submission: Submission) -> ExecutionOutcome {
        self.execute_with_cancel(submission, CancellationToken::new())
            .await
    }

    /// Execute one submission. A triggered token at any point transitions the
    /// call to `Aborted` and tears the sandbox down; the isolated process is
    /// terminated, never orphaned.
    #[instrument(
        skip(self, submission, cancel),
        fields(submission_id = %submission.id, language = %submission.language)
    )]
    pub async fn execute_with_cancel(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let mut phase = Phase::Pending;
        debug!(phase = %phase, "accepted");

        if cancel.is_cancelled() {
            return self.finish(submission.id, aborted_outcome(submission.id, 0, Vec::new()));
        }

        // Admission: block within the configured wait, or reject outright.
        let _permit = match self.gate.admit(&cancel).await {
            Ok(permit) => permit,
            Err(AdmissionRefusal::Overloaded) => {
                warn!("admission refused, engine at capacity");
                return self.finish(
                    submission.id,
                    ExecutionOutcome::platform_failure(
                        submission.id,
                        OutcomeStatus::Overloaded,
                        format!(
                            "admission bound {} reached, waited {}ms",
                            self.config.max_concurrent_sandboxes, self.config.admission_wait_ms
                        ),
                    ),
                );
            }
            Err(AdmissionRefusal::Cancelled) => {
                return self.finish(submission.id, aborted_outcome(submission.id, 0, Vec::new()));
            }
        };

        phase = Phase::Provisioning;
        debug!(phase = %phase, "provisioning sandbox");

        let (spec, plan) = match self.provision_checks(&submission) {
            Ok(parts) => parts,
            Err(e) => {
                // Misconfiguration and unsupported languages are platform
                // failures; no sandbox was provisioned.
                warn!(error = %e, "rejected before provisioning");
                return self.finish(
                    submission.id,
                    ExecutionOutcome::platform_failure(
                        submission.id,
                        OutcomeStatus::InternalError,
                        e.to_string(),
                    ),
                );
            }
        };

        let handle = match self.provision_sandbox(&submission, spec, &plan).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "sandbox provisioning failed");
                return self.finish(
                    submission.id,
                    ExecutionOutcome::platform_failure(
                        submission.id,
                        OutcomeStatus::InternalError,
                        e.to_string(),
                    ),
                );
            }
        };

        phase = Phase::Running;
        debug!(phase = %phase, container_id = %handle.container_id(), "submitted code has control");

        let outcome = self.run_phase(&submission, spec, &plan, &handle, &cancel).await;

        // Finalized: teardown is unconditional, independent of the terminal
        // state and of the caller still listening.
        self.runner.teardown(handle, plan.kill_grace).await;

        phase = match outcome.status {
            OutcomeStatus::Success => Phase::Succeeded,
            OutcomeStatus::Timeout => Phase::TimedOut,
            OutcomeStatus::Aborted => Phase::Aborted,
            _ => Phase::Failed,
        };
        debug!(phase = %phase, "terminal state reached");
        debug!(phase = %Phase::Finalized, "sandbox and workspace released");

        self.finish(submission.id, outcome)
    }

    /// Validation that must fail fast, before any resource is allocated.
    fn provision_checks(
        &self,
        submission: &Submission,
    ) -> Result<(&LanguageSpec, EnforcementPlan), EngineError> {
        let spec = self.catalog.get(submission.language)?;

        let ceilings = &self.config.ceilings;
        if submission.code.len() > ceilings.max_source_bytes {
            return Err(EngineError::OversizedInput(format!(
                "source is {} bytes, ceiling is {}",
                submission.code.len(),
                ceilings.max_source_bytes
            )));
        }
        for case in &submission.test_cases {
            if case.input.len() > ceilings.max_case_input_bytes {
                return Err(EngineError::OversizedInput(format!(
                    "test case {} input is {} bytes, ceiling is {}",
                    case.id,
                    case.input.len(),
                    ceilings.max_case_input_bytes
                )));
            }
        }

        let limits = submission.limits.unwrap_or(self.config.default_limits);
        limits::validate(&limits, ceilings)?;

        let plan = EnforcementPlan::new(
            &limits,
            self.config.kill_grace(),
            self.config.output_overflow,
        );
        Ok((spec, plan))
    }

    async fn provision_sandbox(
        &self,
        submission: &Submission,
        spec: &LanguageSpec,
        plan: &EnforcementPlan,
    ) -> Result<ExecutionHandle, EngineError> {
        // Compile plus every case each gets the full wall budget; the
        // container keepalive has to cover the sum.
        let steps =
            submission.test_cases.len().max(1) + usize::from(spec.compile_command.is_some());
        let lease = self.workspaces.allocate().map_err(EngineError::Workspace)?;
        self.runner
            .provision(&submission.code, spec, plan, plan.attempt_budget(steps), lease)
            .await
    }

    async fn run_phase(
        &self,
        submission: &Submission,
        spec: &LanguageSpec,
        plan: &EnforcementPlan,
        handle: &ExecutionHandle,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        // Compile step first for compiled languages; a failing compile is the
        // submitter's outcome, not a platform error.
        if spec.compile_command.is_some() {
            match self.runner.compile(handle, spec, plan, cancel).await {
                Ok(raw) if raw.cancelled => {
                    return aborted_outcome(submission.id, raw.duration_ms, Vec::new());
                }
                Ok(raw) if raw.timed_out || raw.oom_killed => {
                    return normalize::normalize(submission.id, raw);
                }
                Ok(raw) => match raw.exit_code {
                    Some(0) => {}
                    Some(_) => return compile_error_outcome(submission.id, raw),
                    None => {
                        return ExecutionOutcome::platform_failure(
                            submission.id,
                            OutcomeStatus::InternalError,
                            "compile step produced no exit status",
                        );
                    }
                },
                Err(e) => {
                    return ExecutionOutcome::platform_failure(
                        submission.id,
                        OutcomeStatus::InternalError,
                        format!("compile step failed to run: {}", e),
                    );
                }
            }
        }

        if submission.test_cases.is_empty() {
            return match self
                .runner
                .exec_case(handle, spec, "", plan.wall_time, plan, cancel)
                .await
            {
                Ok(raw) => normalize::normalize(submission.id, raw),
                Err(e) => ExecutionOutcome::platform_failure(
                    submission.id,
                    OutcomeStatus::InternalError,
                    e.to_string(),
                ),
            };
        }

        self.run_cases(submission, spec, plan, handle, cancel).await
    }

    /// Sequential per-case execution against the provisioned sandbox, in the
    /// order supplied. A case-level timeout or resource violation fails only
    /// that case; an infrastructure failure aborts the remaining cases.
    async fn run_cases(
        &self,
        submission: &Submission,
        spec: &LanguageSpec,
        plan: &EnforcementPlan,
        handle: &ExecutionHandle,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let mut results: Vec<TestCaseResult> = Vec::with_capacity(submission.test_cases.len());

        for case in &submission.test_cases {
            if cancel.is_cancelled() {
                debug!(completed = results.len(), "cancelled between cases");
                return aborted_outcome(submission.id, handle.age().as_millis() as u64, results);
            }

            // Each case gets the full wall budget; the runner kills a
            // timed-out process, so a Timeout verdict on one case never
            // bleeds into the next.
            match self
                .runner
                .exec_case(handle, spec, &case.input, plan.wall_time, plan, cancel)
                .await
            {
                Ok(raw) if raw.cancelled => {
                    return aborted_outcome(
                        submission.id,
                        handle.age().as_millis() as u64,
                        results,
                    );
                }
                Ok(raw) if raw.capture_failed.is_some() => {
                    let detail = raw.capture_failed.unwrap_or_default();
                    warn!(case_id = case.id, detail = %detail, "case aborted on capture failure");
                    let mut outcome = ExecutionOutcome::platform_failure(
                        submission.id,
                        OutcomeStatus::InternalError,
                        format!("case {}: {}", case.id, detail),
                    );
                    outcome.test_results = results;
                    outcome.duration_ms = handle.age().as_millis() as u64;
                    return outcome;
                }
                Ok(raw) => {
                    let verdict = normalize::normalize_case(case.id, &case.expected_output, raw);
                    debug!(case_id = case.id, status = ?verdict.status, duration_ms = verdict.duration_ms, "case finished");
                    results.push(verdict);
                }
                Err(e) => {
                    warn!(case_id = case.id, error = %e, "case aborted on engine error");
                    let mut outcome = ExecutionOutcome::platform_failure(
                        submission.id,
                        OutcomeStatus::InternalError,
                        format!("case {}: {}", case.id, e),
                    );
                    outcome.test_results = results;
                    outcome.duration_ms = handle.age().as_millis() as u64;
                    return outcome;
                }
            }
        }

        // All cases executed; individual verdicts carry their own failures.
        ExecutionOutcome {
            submission_id: submission.id,
            status: OutcomeStatus::Success,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: handle.age().as_millis() as u64,
            finished_at: Utc::now(),
            test_results: results,
            diagnostic: None,
        }
    }

    fn finish(&self, submission_id: Uuid, outcome: ExecutionOutcome) -> ExecutionOutcome {
        if outcome.status.is_platform_failure() {
            warn!(
                submission_id = %submission_id,
                status = %outcome.status,
                diagnostic = outcome.diagnostic.as_deref().unwrap_or(""),
                "platform failure"
            );
        } else {
            info!(
                submission_id = %submission_id,
                status = %outcome.status,
                duration_ms = outcome.duration_ms,
                cases = outcome.test_results.len(),
                "execution finished"
            );
        }
        outcome
    }
}

fn aborted_outcome(
    submission_id: Uuid,
    duration_ms: u64,
    results: Vec<TestCaseResult>,
) -> ExecutionOutcome {
    ExecutionOutcome {
        submission_id,
        status: OutcomeStatus::Aborted,
        stdout: String::new(),
        stderr: "execution aborted by caller".to_string(),
        stdout_truncated: false,
        stderr_truncated: false,
        exit_code: None,
        duration_ms,
        finished_at: Utc::now(),
        test_results: results,
        diagnostic: None,
    }
}

fn compile_error_outcome(submission_id: Uuid, raw: RawExecutionResult) -> ExecutionOutcome {
    ExecutionOutcome {
        submission_id,
        status: OutcomeStatus::CompileError,
        stdout: raw.stdout,
        stderr: raw.stderr,
        stdout_truncated: raw.stdout_truncated,
        stderr_truncated: raw.stderr_truncated,
        exit_code: raw.exit_code,
        duration_ms: raw.duration_ms,
        finished_at: Utc::now(),
        test_results: Vec::new(),
        diagnostic: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuroforge_common::{Language, ResourceLimits};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> EngineConfig {
        EngineConfig {
            workspace_root: std::env::temp_dir()
                .join(format!("nf-coord-test-{}", Uuid::new_v4())),
            ..EngineConfig::default()
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(test_config(), LanguageCatalog::builtin())
            .expect("coordinator construction needs no running daemon")
    }

    #[tokio::test]
    async fn invalid_limits_fail_before_any_sandbox() {
        let coord = coordinator();
        let mut submission = Submission::new("p-1", Language::Python, "print(1)");
        submission.limits = Some(ResourceLimits {
            wall_time_ms: 0,
            ..ResourceLimits::default()
        });

        let outcome = coord.execute(submission).await;

        assert_eq!(outcome.status, OutcomeStatus::InternalError);
        assert!(outcome.diagnostic.unwrap().contains("wall_time_ms"));
        assert_eq!(coord.active_workspaces(), 0);
    }

    #[tokio::test]
    async fn unsupported_language_fails_without_provisioning() {
        // Catalog configured for python only; java submissions have nowhere
        // to run.
        let catalog_path = std::env::temp_dir().join(format!("nf-cat-{}.json", Uuid::new_v4()));
        std::fs::write(
            &catalog_path,
            r#"{"languages":[{"name":"python","image":"neuroforge-python:latest","source_file":"main.py","run_command":["python3","-u","/code/main.py"]}]}"#,
        )
        .unwrap();
        let catalog = LanguageCatalog::load(&catalog_path).unwrap();
        std::fs::remove_file(&catalog_path).ok();

        let coord = Coordinator::new(test_config(), catalog).unwrap();
        let submission = Submission::new("p-1", Language::Java, "class Main {}");

        let outcome = coord.execute(submission).await;

        assert_eq!(outcome.status, OutcomeStatus::InternalError);
        assert!(outcome.diagnostic.unwrap().contains("java"));
        assert_eq!(coord.active_workspaces(), 0);
    }

    #[tokio::test]
    async fn oversized_source_fails_fast() {
        let coord = coordinator();
        let big = "a".repeat(coord.config.ceilings.max_source_bytes + 1);
        let submission = Submission::new("p-1", Language::Python, big);

        let outcome = coord.execute(submission).await;

        assert_eq!(outcome.status, OutcomeStatus::InternalError);
        assert_eq!(coord.active_workspaces(), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_call_aborts_without_provisioning() {
        let coord = coordinator();
        let submission = Submission::new("p-1", Language::Python, "print(1)");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = coord.execute_with_cancel(submission, cancel).await;

        assert_eq!(outcome.status, OutcomeStatus::Aborted);
        assert_eq!(coord.active_workspaces(), 0);
    }

    #[tokio::test]
    async fn gate_bounds_concurrency_without_losing_callers() {
        let gate = Arc::new(AdmissionGate::new(
            10,
            AdmissionPolicy::Queue,
            Duration::from_secs(5),
        ));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let gate = Arc::clone(&gate);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let permit = gate.admit(&CancellationToken::new()).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 10);
        assert!(peak.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn reject_policy_refuses_immediately_at_capacity() {
        let gate = AdmissionGate::new(1, AdmissionPolicy::Reject, Duration::from_secs(5));
        let held = gate.admit(&CancellationToken::new()).await.unwrap();

        let refused = gate.admit(&CancellationToken::new()).await;
        assert_eq!(refused.unwrap_err(), AdmissionRefusal::Overloaded);

        drop(held);
        assert!(gate.admit(&CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn queue_policy_gives_up_after_bounded_wait() {
        let gate = AdmissionGate::new(1, AdmissionPolicy::Queue, Duration::from_millis(20));
        let _held = gate.admit(&CancellationToken::new()).await.unwrap();

        let start = std::time::Instant::now();
        let refused = gate.admit(&CancellationToken::new()).await;

        assert_eq!(refused.unwrap_err(), AdmissionRefusal::Overloaded);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn queued_caller_observes_cancellation() {
        let gate = AdmissionGate::new(1, AdmissionPolicy::Queue, Duration::from_secs(5));
        let _held = gate.admit(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let refused = gate.admit(&cancel).await;

        assert_eq!(refused.unwrap_err(), AdmissionRefusal::Cancelled);
    }
}
