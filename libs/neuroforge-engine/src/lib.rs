//! NeuroForge execution engine - sandboxed evaluation of untrusted code.
//!
//! The engine runs submitted source code inside hardened Docker containers,
//! bounds CPU, wall clock, memory, process count and captured output, and
//! maps every run into the stable outcome taxonomy defined in
//! `neuroforge-common`.
//!
//! # Architecture
//!
//! - **`limits`**: validates resource budgets and derives the enforcement
//!   plan the runner applies (per-execution wall budget, container resource
//!   fields).
//! - **`runner`**: owns the Docker sandbox lifecycle - provision, compile,
//!   execute, unconditional teardown.
//! - **`coordinator`**: orchestrates one submission end to end behind an
//!   admission gate, with cooperative cancellation.
//! - **`normalize`**: pure mapping from raw process results to outcomes.
//!
//! The HTTP layer is a caller, not a member: it builds a
//! [`Submission`](neuroforge_common::Submission), calls
//! [`Coordinator::execute`], and serializes the returned outcome.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod limits;
pub mod normalize;
pub mod runner;
pub mod workspace;

pub use catalog::{LanguageCatalog, LanguageSpec};
pub use config::{AdmissionPolicy, EngineConfig, HardCeilings, OutputOverflowPolicy};
pub use coordinator::Coordinator;
pub use limits::EnforcementPlan;
pub use runner::{DockerRunner, ExecutionHandle, RawExecutionResult};
