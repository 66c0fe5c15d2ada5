//! Resource Limiter: fail-fast validation and the enforcement descriptor.
//!
//! Validation happens before any sandbox is provisioned; the limiter itself
//! never touches a process. The runner applies the resulting
//! [`EnforcementPlan`].

use crate::config::{HardCeilings, OutputOverflowPolicy};
use neuroforge_common::{EngineError, ResourceLimits};
use std::time::Duration;

/// Reject limits that are non-positive or exceed the configured ceilings.
pub fn validate(limits: &ResourceLimits, ceilings: &HardCeilings) -> Result<(), EngineError> {
    check_range("cpu_time_ms", limits.cpu_time_ms, ceilings.max_cpu_time_ms)?;
    check_range("wall_time_ms", limits.wall_time_ms, ceilings.max_wall_time_ms)?;
    check_range("memory_bytes", limits.memory_bytes, ceilings.max_memory_bytes)?;
    check_range("max_processes", limits.max_processes, ceilings.max_processes)?;
    check_range(
        "max_output_bytes",
        limits.max_output_bytes as u64,
        ceilings.max_output_bytes as u64,
    )?;

    if limits.cpu_time_ms > limits.wall_time_ms {
        return Err(EngineError::InvalidLimits(format!(
            "cpu_time_ms ({}) exceeds wall_time_ms ({})",
            limits.cpu_time_ms, limits.wall_time_ms
        )));
    }
    Ok(())
}

fn check_range(name: &str, value: u64, ceiling: u64) -> Result<(), EngineError> {
    if value == 0 {
        return Err(EngineError::InvalidLimits(format!("{} must be positive", name)));
    }
    if value > ceiling {
        return Err(EngineError::InvalidLimits(format!(
            "{} ({}) exceeds hard ceiling ({})",
            name, value, ceiling
        )));
    }
    Ok(())
}

/// Everything the runner needs to bound one execution attempt.
///
/// `wall_time` is a per-execution budget: the compile step and every test
/// case each get the full wall budget, measured against the monotonic clock
/// while the process runs. One slow case cannot starve the cases after it.
#[derive(Debug, Clone)]
pub struct EnforcementPlan {
    pub wall_time: Duration,
    pub kill_grace: Duration,
    pub memory_bytes: i64,
    /// Equal to `memory_bytes` so the kernel grants no swap headroom.
    pub memory_swap_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub max_output_bytes: usize,
    pub overflow: OutputOverflowPolicy,
}

impl EnforcementPlan {
    pub fn new(
        limits: &ResourceLimits,
        kill_grace: Duration,
        overflow: OutputOverflowPolicy,
    ) -> Self {
        let wall_time = Duration::from_millis(limits.wall_time_ms);
        Self {
            wall_time,
            kill_grace,
            memory_bytes: limits.memory_bytes as i64,
            memory_swap_bytes: limits.memory_bytes as i64,
            nano_cpus: nano_cpus_for(limits),
            pids_limit: limits.max_processes as i64,
            max_output_bytes: limits.max_output_bytes,
            overflow,
        }
    }

    /// Upper bound on how long the whole attempt may hold its container:
    /// every step granted the full wall budget, plus the teardown grace.
    pub fn attempt_budget(&self, steps: usize) -> Duration {
        self.wall_time * steps.max(1) as u32 + self.kill_grace
    }
}

/// Docker enforces CPU time as a rate, not a total. Granting
/// cpu_time_ms/wall_time_ms of a core makes the CPU budget run out no earlier
/// than the wall budget, so the wall deadline is the binding constraint.
fn nano_cpus_for(limits: &ResourceLimits) -> i64 {
    const FLOOR: f64 = 0.05;
    let ratio = (limits.cpu_time_ms as f64 / limits.wall_time_ms as f64).clamp(FLOOR, 1.0);
    (ratio * 1_000_000_000.0) as i64
}
