//! Typed error hierarchy for the VidForge pipeline.
//!
//! `PhaseError` covers everything that can fail a phase task: bad inputs,
//! integrity violations detected by the chunk scheduler, external model
//! failures and timeouts, ffmpeg failures, and the stitcher's wall-clock
//! budget. The HTTP layer has its own `ApiError` in `crate::api`.

use thiserror::Error;

/// Errors raised by phase runners, the chunk scheduler, and media tooling.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Phase {phase} input missing required field '{field}'")]
    MissingInput { phase: u8, field: &'static str },

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Stitch budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("{service} timed out after {seconds}s")]
    ExternalTimeout { service: String, seconds: u64 },

    #[error("{service} error: {message}")]
    External { service: String, message: String },

    #[error("Media tool failed: {0}")]
    Media(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PhaseError {
    /// Stable error-kind label recorded on phase outputs and in the
    /// progress cache.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::MissingInput { .. } => "validation",
            Self::Integrity(_) => "integrity",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::ExternalTimeout { .. } => "external_timeout",
            Self::External { .. } => "external_error",
            Self::Media(_) => "media",
            Self::Other(_) => "internal",
        }
    }

    pub fn external(service: impl Into<String>, message: impl ToString) -> Self {
        Self::External {
            service: service.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_input_carries_phase_and_field() {
        let err = PhaseError::MissingInput {
            phase: 3,
            field: "spec",
        };
        assert!(err.to_string().contains("Phase 3"));
        assert!(err.to_string().contains("spec"));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn budget_exceeded_is_matchable() {
        let err = PhaseError::BudgetExceeded("42s remaining".into());
        assert!(matches!(err, PhaseError::BudgetExceeded(_)));
        assert_eq!(err.kind(), "budget_exceeded");
    }

    #[test]
    fn external_timeout_kind() {
        let err = PhaseError::ExternalTimeout {
            service: "video-model".into(),
            seconds: 300,
        };
        assert_eq!(err.kind(), "external_timeout");
        assert!(err.to_string().contains("300"));
    }

    #[test]
    fn anyhow_converts_to_internal() {
        let err: PhaseError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), "internal");
    }
}
