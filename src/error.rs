use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::pipeline::{Stage, WorkflowState};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The generation or judgment call itself failed (timeout, network, bad transport).
    #[error("Stage {stage} execution failed: {message}")]
    Execution { stage: String, message: String },

    /// A response arrived but did not fit the stage's schema.
    #[error("Stage {stage} returned invalid output: {message}")]
    Validation { stage: String, message: String },

    #[error("Job {job_id} is not parked at {expected} (current state: {actual})")]
    StaleState {
        job_id: String,
        expected: WorkflowState,
        actual: WorkflowState,
    },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PipelineError {
    pub fn execution(stage: impl std::fmt::Display, message: impl Into<String>) -> Self {
        PipelineError::Execution {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::Validation {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Classifies the error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Execution { .. } => ErrorClass::Execution,
            PipelineError::Validation { .. } => ErrorClass::Validation,
            PipelineError::Anthropic(AnthropicError::RateLimited { .. }) => ErrorClass::Transient,
            PipelineError::Anthropic(AnthropicError::NetworkError(_)) => ErrorClass::Transient,
            PipelineError::Anthropic(e) if e.is_server_side() => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Classifies a failure for retry logic decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Backend call failed or timed out.
    Execution,
    /// Backend answered with output that failed schema checks.
    Validation,
    /// The judgment pass reported blocking issues.
    Audit,
    /// External service hiccup (rate limit, dropped connection).
    Transient,
    /// Anything else. Never retried.
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Execution => write!(f, "Execution"),
            ErrorClass::Validation => write!(f, "Validation"),
            ErrorClass::Audit => write!(f, "Audit"),
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::Permanent => write!(f, "Permanent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_retry_classes() {
        assert_eq!(
            PipelineError::execution(Stage::Tailoring, "timeout").class(),
            ErrorClass::Execution
        );
        assert_eq!(
            PipelineError::validation(Stage::Tailoring, "missing documents").class(),
            ErrorClass::Validation
        );
        assert_eq!(
            PipelineError::Anthropic(AnthropicError::RateLimited {
                retry_after_ms: 10
            })
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            PipelineError::Anthropic(AnthropicError::ApiError {
                status: 529,
                message: "overloaded".into()
            })
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            PipelineError::Anthropic(AnthropicError::ApiError {
                status: 400,
                message: "bad request".into()
            })
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            PipelineError::JobNotFound("x".into()).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn stale_state_message_names_both_states() {
        let err = PipelineError::StaleState {
            job_id: "job-1".into(),
            expected: WorkflowState::GapAnalysisReview,
            actual: WorkflowState::Interrogation,
        };
        assert_eq!(
            err.to_string(),
            "Job job-1 is not parked at gap_analysis_review (current state: interrogation)"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
    }
}
