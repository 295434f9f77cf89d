//! # Pipeline Events
//!
//! Progress notifications emitted while a run executes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::StageName;

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Run accepted and started
    RunStarted,
    /// Stage invocation started
    StageStarted,
    /// Stage produced usable output
    StageCompleted,
    /// Stage output could not be decoded; run continues
    StageDegraded,
    /// Stage aborted the run
    StageFailed,
    /// All stages finished
    RunCompleted,
    /// Run ended early
    RunFailed,
    /// Run record could not be stored
    PersistenceFailed,
    /// Message answered without a run
    RunBypassed,
}

/// An event in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    /// Key of the run that emitted the event
    #[serde(default)]
    pub run_key: Option<String>,
    /// Stage the event belongs to, if any
    #[serde(default)]
    pub stage: Option<StageName>,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            run_key: None,
            stage: None,
            data: None,
        }
    }

    pub fn for_stage(kind: PipelineEventKind, stage: StageName) -> Self {
        Self {
            stage: Some(stage),
            ..Self::new(kind)
        }
    }

    /// Tag the event with the run it belongs to
    pub fn with_run(mut self, run_key: &str) -> Self {
        self.run_key = Some(run_key.to_string());
        self
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = PipelineEvent::for_stage(PipelineEventKind::StageDegraded, StageName::Research)
            .with_data(serde_json::json!({"error_detail": "prose"}));

        assert_eq!(event.stage, Some(StageName::Research));
        assert_eq!(event.run_key, None);
        assert_eq!(
            event.clone().with_run("run-a").run_key.as_deref(),
            Some("run-a")
        );
        assert_eq!(event.data.unwrap()["error_detail"], "prose");
        assert_ne!(
            PipelineEvent::new(PipelineEventKind::RunStarted).id,
            PipelineEvent::new(PipelineEventKind::RunStarted).id
        );
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&PipelineEventKind::PersistenceFailed).unwrap();
        assert_eq!(json, "\"persistence_failed\"");
    }
}
