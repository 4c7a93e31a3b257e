use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Coarse classification used by the runner to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal for the cell, never retried.
    Setup,
    /// Eligible for a bounded retry.
    Transient,
    /// The evaluator ran but its output could not be obtained.
    Evaluation,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Parameter artifact '{name}' is unavailable: {reason}")]
    ArtifactUnavailable { name: String, reason: String },

    #[error("Evaluator initialization failed: {0}")]
    EvaluatorInit(String),

    #[error("Type arity mismatch: declared {declared} types, got {found} ({context})")]
    ArityMismatch {
        declared: usize,
        found: usize,
        context: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Per-atom accumulator {id} was read before any run populated it")]
    StaleAccumulator { id: usize },

    #[error("Transient I/O failure: {0}")]
    Transient(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Failed to parse model file '{path}': {source}", path = .path.display())]
    ModelParsing {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse harness configuration '{path}': {source}", path = .path.display())]
    ConfigParsing {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Evaluation(_) | Self::Io(_) => ErrorClass::Evaluation,
            Self::ArtifactUnavailable { .. }
            | Self::EvaluatorInit(_)
            | Self::ArityMismatch { .. }
            | Self::InvalidConfiguration(_)
            | Self::StaleAccumulator { .. }
            | Self::ModelParsing { .. }
            | Self::ConfigParsing { .. } => ErrorClass::Setup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_setup_and_transient_failures() {
        let missing = HarnessError::ArtifactUnavailable {
            name: "model.json".into(),
            reason: "404".into(),
        };
        assert_eq!(missing.class(), ErrorClass::Setup);
        assert_ne!(missing.class(), ErrorClass::Transient);

        let flaky = HarnessError::Transient("connection reset".into());
        assert_eq!(flaky.class(), ErrorClass::Transient);

        let crashed = HarnessError::Evaluation("segfault".into());
        assert_eq!(crashed.class(), ErrorClass::Evaluation);
    }

    #[test]
    fn arity_message_names_both_counts() {
        let err = HarnessError::ArityMismatch {
            declared: 2,
            found: 3,
            context: "type names".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("declared 2"));
        assert!(msg.contains("got 3"));
    }
}
