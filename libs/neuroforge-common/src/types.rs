use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Supported runtimes. Closed set: adding a language means adding a variant
/// here plus a catalog entry, so unsupported values are unrepresentable past
/// the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Rust,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Rust => "rust",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "rust" => Ok(Language::Rust),
            other => Err(format!("unknown language: {}", other)),
        }
    }
}

/// One input/expected-output pair supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
}

/// One submission, owned by exactly one coordinator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub problem_id: String,
    pub language: Language,
    pub code: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    /// Caller override; engine defaults apply when absent.
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl Submission {
    pub fn new(problem_id: impl Into<String>, language: Language, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            problem_id: problem_id.into(),
            language,
            code: code.into(),
            test_cases: Vec::new(),
            limits: None,
        }
    }
}

/// Resource budget for one execution attempt. Immutable once validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_ms: 2_000,
            wall_time_ms: 5_000,
            memory_bytes: 256 * 1024 * 1024,
            max_processes: 64,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Outcome taxonomy. Serialized as plain strings so the API layer can relay
/// the status verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    Overloaded,
    Aborted,
    InternalError,
}

impl OutcomeStatus {
    /// Platform failures carry a generic message to the submitter; detail is
    /// operator-only. Everything else is a routine submitted-code outcome
    /// surfaced verbatim.
    pub fn is_platform_failure(&self) -> bool {
        matches!(self, OutcomeStatus::InternalError | OutcomeStatus::Overloaded)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeStatus::Success => "Success",
            OutcomeStatus::CompileError => "CompileError",
            OutcomeStatus::RuntimeError => "RuntimeError",
            OutcomeStatus::Timeout => "Timeout",
            OutcomeStatus::ResourceExceeded => "ResourceExceeded",
            OutcomeStatus::Overloaded => "Overloaded",
            OutcomeStatus::Aborted => "Aborted",
            OutcomeStatus::InternalError => "InternalError",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestCaseStatus {
    Passed,
    Failed,
    RuntimeError,
    Timeout,
    ResourceExceeded,
}

/// Per-test-case verdict. A failing case does not fail the submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub case_id: u32,
    pub status: TestCaseStatus,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
}

/// Final result of one submission. Produced exactly once per `Submission`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub submission_id: Uuid,
    pub status: OutcomeStatus,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_results: Vec<TestCaseResult>,
    /// Raw platform detail for operators. The API layer must strip this
    /// before responding to the submitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl ExecutionOutcome {
    /// Outcome for a failure that happened before (or outside) the sandbox:
    /// generic message in stderr, full detail in `diagnostic`.
    pub fn platform_failure(
        submission_id: Uuid,
        status: OutcomeStatus,
        diagnostic: impl Into<String>,
    ) -> Self {
        debug_assert!(status.is_platform_failure());
        Self {
            submission_id,
            status,
            stdout: String::new(),
            stderr: match status {
                OutcomeStatus::Overloaded => "execution engine is at capacity, retry later".into(),
                _ => "the execution platform could not run this submission".into(),
            },
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: 0,
            finished_at: Utc::now(),
            test_results: Vec::new(),
            diagnostic: Some(diagnostic.into()),
        }
    }
}
