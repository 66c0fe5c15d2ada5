//! Shared value types for the NeuroForge execution engine.
//!
//! Defines only data and error vocabulary - no Docker, no I/O.
//! Ensures the engine and its callers never drift on the outcome taxonomy.

pub mod error;
pub mod types;

pub use error::EngineError;
pub use types::{
    ExecutionOutcome, Language, OutcomeStatus, ResourceLimits, Submission, TestCase,
    TestCaseResult, TestCaseStatus,
};
