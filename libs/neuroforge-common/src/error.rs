use crate::types::Language;
use thiserror::Error;

/// Platform-side failures. Submitted-code failures are not errors; they are
/// routine `OutcomeStatus` values.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("language {0} is not configured on this host")]
    UnsupportedLanguage(Language),

    #[error("submission rejected: {0}")]
    OversizedInput(String),

    #[error("workspace allocation failed: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("sandbox launch failed: {0}")]
    Launch(String),

    #[error("docker transport error: {0}")]
    Docker(String),
}
