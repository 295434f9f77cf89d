//! # Stage Pipeline
//!
//! Sequences the six planning stages for a user goal.
//!
//! ## Pipeline Flow
//!
//! ```text
//! message → IntentClassifier ─┬─ canned reply (run_simple)
//!                             └─ Requirements → Planning → Research → Drafting
//!                                → ToolSelection → Evaluation → RunRecorder
//! ```

pub mod bundle;
pub mod events;
pub mod intent;
pub mod orchestrator;
pub mod output_parser;
pub mod stage;

pub use bundle::{FailureMarker, ResultBundle, StageEntry, StageMarker, StageResult};
pub use events::{PipelineEvent, PipelineEventKind};
pub use intent::{IntentClassifier, IntentDecision, KeywordGate};
pub use orchestrator::{Orchestrator, ParseFailurePolicy, PipelineConfig};
pub use output_parser::ParsedOutput;
pub use stage::{
    default_plan, validate_plan, InputSelector, OutputShape, PipelineRun, RunStatus,
    SelectorField, StageName, StageSpec,
};
