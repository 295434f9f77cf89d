//! # ThinkTank Capabilities
//!
//! Text-generation capabilities addressed by role.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//!   └── PromptLibrary (role template + resolved stage inputs -> prompt)
//!         └── CapabilityProvider::invoke(role, prompt) -> raw text
//! ```
//!
//! The role set is closed: one variant per specialist of the six-stage plan,
//! plus `Intake`, which turns a chat message into a goal/context pair before
//! a run starts.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod intake;
pub mod openai;
pub mod prompts;
pub mod provider;

pub use intake::{IntakeParser, ParsedMessage};
pub use openai::OpenAiProvider;
pub use prompts::{PromptLibrary, PromptVars};
pub use provider::{CapabilityError, CapabilityProvider};

/// Specialist role a capability call is made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRole {
    /// Refines the user goal into structured requirements
    RequirementAnalyst,
    /// Breaks requirements into a task tree
    TaskPlanner,
    /// Market and competitor research
    Researcher,
    /// Drafts the product requirements document
    PrdWriter,
    /// Recommends stack, tooling and services
    ToolFinder,
    /// Scores the combined output against the goal
    Evaluator,
    /// Extracts goal and context from a chat message
    Intake,
}

impl CapabilityRole {
    pub fn all() -> [CapabilityRole; 7] {
        [
            CapabilityRole::RequirementAnalyst,
            CapabilityRole::TaskPlanner,
            CapabilityRole::Researcher,
            CapabilityRole::PrdWriter,
            CapabilityRole::ToolFinder,
            CapabilityRole::Evaluator,
            CapabilityRole::Intake,
        ]
    }

    /// Stable identifier used for prompt slugs, config keys and storage
    pub fn slug(&self) -> &'static str {
        match self {
            CapabilityRole::RequirementAnalyst => "requirement_analyst",
            CapabilityRole::TaskPlanner => "task_planner",
            CapabilityRole::Researcher => "researcher",
            CapabilityRole::PrdWriter => "prd_writer",
            CapabilityRole::ToolFinder => "tool_finder",
            CapabilityRole::Evaluator => "evaluator",
            CapabilityRole::Intake => "intake",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::all().into_iter().find(|role| role.slug() == slug)
    }
}

impl fmt::Display for CapabilityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}
