//! # Pipeline Stages
//!
//! Defines the stages of the planning pipeline, how each stage pulls its
//! inputs from earlier stages, and the lifecycle of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::capabilities::CapabilityRole;

/// Stage of the pipeline, in plan order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    /// Refine the goal into structured requirements
    Requirements,
    /// Break requirements into phases and tasks
    Planning,
    /// Market and competitor research
    Research,
    /// Write the product requirements document
    Drafting,
    /// Recommend stack and tooling
    ToolSelection,
    /// Assess everything produced so far
    Evaluation,
}

impl StageName {
    pub fn all() -> [StageName; 6] {
        [
            StageName::Requirements,
            StageName::Planning,
            StageName::Research,
            StageName::Drafting,
            StageName::ToolSelection,
            StageName::Evaluation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::Planning => "planning",
            Self::Research => "research",
            Self::Drafting => "drafting",
            Self::ToolSelection => "toolSelection",
            Self::Evaluation => "evaluation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::all().into_iter().find(|stage| stage.as_str() == s)
    }

    /// Heading used for this stage in the aggregate document
    pub fn title(&self) -> &'static str {
        match self {
            Self::Requirements => "需求分析",
            Self::Planning => "任务规划",
            Self::Research => "市场调研",
            Self::Drafting => "产品需求文档",
            Self::ToolSelection => "工具推荐",
            Self::Evaluation => "综合评估",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected form of a stage's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputShape {
    /// JSON object or array
    Structured,
    /// Prose or Markdown, passed through untouched
    FreeText,
}

/// Which part of an upstream output a selector takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorField {
    Whole,
    Key(&'static str),
}

/// Reads one value out of an earlier stage's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSelector {
    pub source: StageName,
    pub field: SelectorField,
    /// Template placeholder the resolved value is bound to
    pub binding: &'static str,
}

impl InputSelector {
    pub const fn whole(source: StageName, binding: &'static str) -> Self {
        Self {
            source,
            field: SelectorField::Whole,
            binding,
        }
    }

    pub const fn key(source: StageName, key: &'static str, binding: &'static str) -> Self {
        Self {
            source,
            field: SelectorField::Key(key),
            binding,
        }
    }
}

impl fmt::Display for InputSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            SelectorField::Whole => write!(f, "{}.*", self.source),
            SelectorField::Key(key) => write!(f, "{}.{}", self.source, key),
        }
    }
}

/// One step of the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: StageName,
    pub role: CapabilityRole,
    pub selectors: Vec<InputSelector>,
    pub shape: OutputShape,
}

/// The fixed six-stage plan
pub fn default_plan() -> Vec<StageSpec> {
    use StageName::*;

    vec![
        StageSpec {
            name: Requirements,
            role: CapabilityRole::RequirementAnalyst,
            selectors: Vec::new(),
            shape: OutputShape::Structured,
        },
        StageSpec {
            name: Planning,
            role: CapabilityRole::TaskPlanner,
            selectors: vec![InputSelector::whole(Requirements, "requirements")],
            shape: OutputShape::Structured,
        },
        StageSpec {
            name: Research,
            role: CapabilityRole::Researcher,
            selectors: vec![
                InputSelector::key(Requirements, "project_scope", "project_scope"),
                InputSelector::key(Requirements, "user_persona", "target_market"),
            ],
            shape: OutputShape::Structured,
        },
        StageSpec {
            name: Drafting,
            role: CapabilityRole::PrdWriter,
            selectors: vec![
                InputSelector::whole(Requirements, "requirements"),
                InputSelector::whole(Research, "market_report"),
            ],
            shape: OutputShape::FreeText,
        },
        StageSpec {
            name: ToolSelection,
            role: CapabilityRole::ToolFinder,
            selectors: vec![
                InputSelector::key(Requirements, "project_scope", "project_scope"),
                InputSelector::whole(Drafting, "prd"),
            ],
            shape: OutputShape::Structured,
        },
        StageSpec {
            name: Evaluation,
            role: CapabilityRole::Evaluator,
            selectors: vec![
                InputSelector::whole(Requirements, "requirements"),
                InputSelector::whole(Planning, "task_plan"),
                InputSelector::whole(Research, "market_report"),
                InputSelector::whole(Drafting, "prd"),
                InputSelector::whole(ToolSelection, "tool_selection"),
            ],
            shape: OutputShape::FreeText,
        },
    ]
}

/// Reject plans whose selectors look at the same or a later stage
pub fn validate_plan(plan: &[StageSpec]) -> Result<(), String> {
    if plan.is_empty() {
        return Err("plan has no stages".to_string());
    }

    for (idx, spec) in plan.iter().enumerate() {
        if plan[..idx].iter().any(|earlier| earlier.name == spec.name) {
            return Err(format!("stage `{}` appears more than once", spec.name));
        }

        for selector in &spec.selectors {
            let earlier = plan[..idx]
                .iter()
                .any(|candidate| candidate.name == selector.source);
            if !earlier {
                return Err(format!(
                    "stage `{}` selects `{}`, which does not run before it",
                    spec.name, selector
                ));
            }
        }
    }

    Ok(())
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Whether `self -> next` is a legal move
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single run owned by the orchestrator until it is recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique per run; stamped on every event the run emits
    pub key: String,
    pub goal: String,
    #[serde(default)]
    pub context: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(goal: &str, context: Option<&str>) -> Self {
        Self {
            key: uuid::Uuid::new_v4().to_string(),
            goal: goal.to_string(),
            context: context
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            status: RunStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Move to `next`, refusing illegal transitions
    pub fn transition(&mut self, next: RunStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "illegal run transition {} -> {}",
                self.status, next
            ));
        }
        self.status = next;
        Ok(())
    }
}
