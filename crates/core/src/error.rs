//! # Pipeline Errors
//!
//! Error taxonomy surfaced by the orchestrator. Every variant maps to a stable
//! reason tag so the HTTP boundary can pick a transport-level status code
//! without matching on message text.

use std::time::Duration;
use thiserror::Error;

use crate::capabilities::{CapabilityError, CapabilityRole};
use crate::pipeline::StageName;

/// Errors that can occur while running or recording a pipeline
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The generation backend could not be reached or refused the request
    #[error("capability `{role}` failed: {source}")]
    Capability {
        role: CapabilityRole,
        #[source]
        source: CapabilityError,
    },

    /// A stage call exceeded the configured per-stage timeout
    #[error("stage `{stage}` timed out after {after:?}")]
    StageTimeout { stage: StageName, after: Duration },

    /// The caller cancelled the run
    #[error("run cancelled before stage `{stage}` completed")]
    Cancelled { stage: StageName },

    /// Output could not be decoded even with fallback extraction
    #[error("stage `{stage}` produced undecodable output: {detail}")]
    Parse { stage: StageName, detail: String },

    /// The run store could not persist or read a record
    #[error("run store unavailable: {0}")]
    StorageUnavailable(String),

    /// The request was rejected before any stage ran
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No run with this identifier exists
    #[error("run {0} not found")]
    NotFound(i64),
}

impl PipelineError {
    /// Stable, machine-readable reason string
    pub fn reason_tag(&self) -> &'static str {
        match self {
            PipelineError::Capability { .. } => "capability_error",
            PipelineError::StageTimeout { .. } => "stage_timeout",
            PipelineError::Cancelled { .. } => "cancelled",
            PipelineError::Parse { .. } => "parse_error",
            PipelineError::StorageUnavailable(_) => "storage_unavailable",
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::NotFound(_) => "not_found",
        }
    }

    /// Whether this error stops stage progression
    ///
    /// Parse errors are only fatal when the orchestrator runs in fail-fast
    /// mode; that decision is made by the policy, not here.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::Parse { .. } | PipelineError::StorageUnavailable(_)
        )
    }

    /// Stage at which the error occurred, if any
    pub fn stage(&self) -> Option<StageName> {
        match self {
            PipelineError::StageTimeout { stage, .. }
            | PipelineError::Cancelled { stage }
            | PipelineError::Parse { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_tags_are_distinct() {
        let errors = vec![
            PipelineError::Capability {
                role: CapabilityRole::Researcher,
                source: CapabilityError::InvalidResponse("empty".to_string()),
            },
            PipelineError::StageTimeout {
                stage: StageName::Research,
                after: Duration::from_secs(5),
            },
            PipelineError::Cancelled {
                stage: StageName::Planning,
            },
            PipelineError::Parse {
                stage: StageName::Research,
                detail: "prose".to_string(),
            },
            PipelineError::StorageUnavailable("db locked".to_string()),
            PipelineError::InvalidInput("empty goal".to_string()),
            PipelineError::NotFound(7),
        ];

        let mut tags: Vec<_> = errors.iter().map(|e| e.reason_tag()).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), errors.len());
    }

    #[test]
    fn test_fatality() {
        assert!(PipelineError::Cancelled {
            stage: StageName::Drafting
        }
        .is_fatal());
        assert!(!PipelineError::StorageUnavailable("down".to_string()).is_fatal());
        assert!(!PipelineError::Parse {
            stage: StageName::Research,
            detail: String::new()
        }
        .is_fatal());
    }

    #[test]
    fn test_capability_error_message_names_role() {
        let err = PipelineError::Capability {
            role: CapabilityRole::TaskPlanner,
            source: CapabilityError::Api {
                status: 429,
                message: "quota exceeded".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("task_planner"));
        assert!(msg.contains("quota exceeded"));
    }
}
