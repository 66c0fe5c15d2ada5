// Engine-wide configuration with environment overrides.
use neuroforge_common::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What to do with a caller once all sandbox slots are busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait up to `admission_wait_ms` for a slot, then resolve `Overloaded`.
    Queue,
    /// Resolve `Overloaded` immediately.
    Reject,
}

/// What to do once a stream hits `max_output_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputOverflowPolicy {
    /// Discard further output; the process runs on until time/memory limits.
    Discard,
    /// Terminate the process as soon as the cap is hit.
    Kill,
}

/// Host-protecting upper bounds. Caller-supplied limits above these are
/// rejected before any sandbox exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardCeilings {
    pub max_cpu_time_ms: u64,
    pub max_wall_time_ms: u64,
    pub max_memory_bytes: u64,
    pub max_processes: u64,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
    pub max_case_input_bytes: usize,
}

impl Default for HardCeilings {
    fn default() -> Self {
        Self {
            max_cpu_time_ms: 30_000,
            max_wall_time_ms: 60_000,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            max_processes: 512,
            max_output_bytes: 10 * 1024 * 1024,
            max_source_bytes: 1024 * 1024,
            max_case_input_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_limits: ResourceLimits,
    pub ceilings: HardCeilings,
    /// Admission bound: sandboxes permitted to run simultaneously.
    pub max_concurrent_sandboxes: usize,
    pub admission_policy: AdmissionPolicy,
    pub admission_wait_ms: u64,
    /// Grace between the graceful stop and the forced kill at teardown.
    pub kill_grace_ms: u64,
    pub output_overflow: OutputOverflowPolicy,
    /// Host directory under which per-execution workspaces are allocated.
    pub workspace_root: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_limits: ResourceLimits::default(),
            ceilings: HardCeilings::default(),
            max_concurrent_sandboxes: 8,
            admission_policy: AdmissionPolicy::Queue,
            admission_wait_ms: 10_000,
            kill_grace_ms: 2_000,
            output_overflow: OutputOverflowPolicy::Discard,
            workspace_root: std::env::temp_dir().join("neuroforge-workspaces"),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with NEUROFORGE_* environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("NEUROFORGE_MAX_CONCURRENT") {
            config.max_concurrent_sandboxes = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("NEUROFORGE_ADMISSION_WAIT_MS") {
            config.admission_wait_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("NEUROFORGE_KILL_GRACE_MS") {
            config.kill_grace_ms = ms;
        }
        if let Ok(policy) = std::env::var("NEUROFORGE_ADMISSION_POLICY") {
            match policy.to_lowercase().as_str() {
                "reject" => config.admission_policy = AdmissionPolicy::Reject,
                "queue" => config.admission_policy = AdmissionPolicy::Queue,
                _ => {}
            }
        }
        if let Ok(policy) = std::env::var("NEUROFORGE_OUTPUT_OVERFLOW") {
            match policy.to_lowercase().as_str() {
                "kill" => config.output_overflow = OutputOverflowPolicy::Kill,
                "discard" => config.output_overflow = OutputOverflowPolicy::Discard,
                _ => {}
            }
        }
        if let Ok(root) = std::env::var("NEUROFORGE_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }

        config
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
