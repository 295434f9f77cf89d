//! Default prompt templates bundled at compile time.
//!
//! These are used for seeding the database on first run. At runtime the
//! orchestrator renders templates from a `PromptLibrary`, which prefers
//! database overrides and falls back to these defaults.
//!
//! Templates reference stage inputs as `{{binding}}` placeholders; unknown
//! placeholders render as empty strings.

use anyhow::Result;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use super::CapabilityRole;
use crate::state::ThinkTankDb;

/// Requirement analyst - refines the goal into structured requirements
pub const REQUIREMENT_ANALYST: &str = include_str!("defaults/requirement_analyst.md");

/// Task planner - phases and tasks
pub const TASK_PLANNER: &str = include_str!("defaults/task_planner.md");

/// Researcher - market research
pub const RESEARCHER: &str = include_str!("defaults/researcher.md");

/// PRD writer - product requirements document
pub const PRD_WRITER: &str = include_str!("defaults/prd_writer.md");

/// Tool finder - stack and tooling recommendations
pub const TOOL_FINDER: &str = include_str!("defaults/tool_finder.md");

/// Evaluator - overall assessment
pub const EVALUATOR: &str = include_str!("defaults/evaluator.md");

/// Intake - chat message to goal/context
pub const INTAKE: &str = include_str!("defaults/intake.md");

/// Template variables: binding name -> rendered value
pub type PromptVars = BTreeMap<&'static str, String>;

/// Default template for a role
pub fn default_for(role: CapabilityRole) -> &'static str {
    match role {
        CapabilityRole::RequirementAnalyst => REQUIREMENT_ANALYST,
        CapabilityRole::TaskPlanner => TASK_PLANNER,
        CapabilityRole::Researcher => RESEARCHER,
        CapabilityRole::PrdWriter => PRD_WRITER,
        CapabilityRole::ToolFinder => TOOL_FINDER,
        CapabilityRole::Evaluator => EVALUATOR,
        CapabilityRole::Intake => INTAKE,
    }
}

/// All default prompts with their slugs for seeding
pub fn all_defaults() -> Vec<(&'static str, &'static str)> {
    CapabilityRole::all()
        .into_iter()
        .map(|role| (role.slug(), default_for(role)))
        .collect()
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Substitute `{{name}}` placeholders
pub fn render_template(template: &str, vars: &PromptVars) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Role templates used to build stage prompts
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<CapabilityRole, String>,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::defaults()
    }
}

impl PromptLibrary {
    /// Library built from the bundled defaults only
    pub fn defaults() -> Self {
        let templates = CapabilityRole::all()
            .into_iter()
            .map(|role| (role, default_for(role).to_string()))
            .collect();
        Self { templates }
    }

    /// Library with database overrides applied on top of the defaults
    pub fn load(db: &ThinkTankDb) -> Result<Self> {
        let mut library = Self::defaults();
        for (slug, _version) in db.list_prompts()? {
            match CapabilityRole::from_slug(&slug) {
                Some(role) => {
                    let content = db.get_prompt(&slug)?;
                    library.templates.insert(role, content);
                }
                None => tracing::debug!("Ignoring prompt '{}' with no matching role", slug),
            }
        }
        Ok(library)
    }

    /// Replace the template for one role
    pub fn with_template(mut self, role: CapabilityRole, template: impl Into<String>) -> Self {
        self.templates.insert(role, template.into());
        self
    }

    pub fn template(&self, role: CapabilityRole) -> &str {
        self.templates
            .get(&role)
            .map(String::as_str)
            .unwrap_or_else(|| default_for(role))
    }

    /// Build the prompt for a role from resolved inputs
    pub fn render(&self, role: CapabilityRole, vars: &PromptVars) -> String {
        render_template(self.template(role), vars)
    }
}
