//! # Result Bundle
//!
//! The caller-visible outcome of a run: every stage result in order, a
//! per-stage marker map, the aggregate document and any failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::stage::{RunStatus, StageName, StageSpec};
use crate::error::PipelineError;

/// Output of one stage invocation; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub raw: String,
    /// Present only for structured stages that parsed successfully
    #[serde(default)]
    pub parsed: Option<Value>,
    pub ok: bool,
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// Per-stage status in the bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMarker {
    Completed,
    /// Ran, but the output could not be decoded
    Degraded,
    Failed,
    NotReached,
    Bypassed,
}

/// One entry of the per-stage map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub marker: StageMarker,
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub parsed: Option<Value>,
    pub ok: bool,
    #[serde(default)]
    pub error_detail: Option<String>,
}

impl StageEntry {
    fn from_result(result: &StageResult, marker: StageMarker) -> Self {
        Self {
            marker,
            raw: Some(result.raw.clone()),
            parsed: result.parsed.clone(),
            ok: result.ok,
            error_detail: result.error_detail.clone(),
        }
    }

    fn empty(marker: StageMarker, error_detail: Option<String>) -> Self {
        Self {
            marker,
            raw: None,
            parsed: None,
            ok: false,
            error_detail,
        }
    }
}

/// Why and where a run was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMarker {
    #[serde(default)]
    pub stage: Option<StageName>,
    /// Stable reason tag, see [`PipelineError::reason_tag`]
    pub reason: String,
    pub message: String,
}

impl From<&PipelineError> for FailureMarker {
    fn from(err: &PipelineError) -> Self {
        Self {
            stage: err.stage(),
            reason: err.reason_tag().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub run_id: Option<i64>,
    /// Matches `run_key` on the run's events
    #[serde(default)]
    pub run_key: Option<String>,
    pub status: RunStatus,
    pub aggregate_result: String,
    pub stage_results: Vec<StageResult>,
    pub per_stage: BTreeMap<StageName, StageEntry>,
    #[serde(default)]
    pub failure: Option<FailureMarker>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ResultBundle {
    /// Build the bundle for a run that reached the end of the plan or aborted
    ///
    /// `failed_at` is the stage that raised `failure`, when there is one.
    pub fn assemble(
        goal: &str,
        plan: &[StageSpec],
        stage_results: Vec<StageResult>,
        failure: Option<(Option<StageName>, PipelineError)>,
    ) -> Self {
        let failed_stage = failure.as_ref().and_then(|(stage, _)| *stage);

        let mut per_stage = BTreeMap::new();
        for spec in plan {
            let produced = stage_results.iter().find(|r| r.stage == spec.name);
            let entry = match produced {
                Some(result) if failed_stage == Some(spec.name) => {
                    StageEntry::from_result(result, StageMarker::Failed)
                }
                Some(result) if result.ok => StageEntry::from_result(result, StageMarker::Completed),
                Some(result) => StageEntry::from_result(result, StageMarker::Degraded),
                None if failed_stage == Some(spec.name) => StageEntry::empty(
                    StageMarker::Failed,
                    failure.as_ref().map(|(_, err)| err.to_string()),
                ),
                None => StageEntry::empty(StageMarker::NotReached, None),
            };
            per_stage.insert(spec.name, entry);
        }

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        Self {
            run_id: None,
            run_key: None,
            status,
            aggregate_result: render_aggregate(goal, &stage_results),
            stage_results,
            per_stage,
            failure: failure.map(|(stage, err)| FailureMarker {
                stage,
                ..FailureMarker::from(&err)
            }),
            warnings: Vec::new(),
        }
    }

    /// Bundle for a request refused before any stage ran
    pub fn rejected(plan: &[StageSpec], err: &PipelineError) -> Self {
        let per_stage = plan
            .iter()
            .map(|spec| (spec.name, StageEntry::empty(StageMarker::NotReached, None)))
            .collect();

        Self {
            run_id: None,
            run_key: None,
            status: RunStatus::Failed,
            aggregate_result: String::new(),
            stage_results: Vec::new(),
            per_stage,
            failure: Some(FailureMarker::from(err)),
            warnings: Vec::new(),
        }
    }

    /// Bundle for a message answered without running the pipeline
    pub fn bypassed(plan: &[StageSpec], reply: &str) -> Self {
        let per_stage = plan
            .iter()
            .map(|spec| (spec.name, StageEntry::empty(StageMarker::Bypassed, None)))
            .collect();

        Self {
            run_id: None,
            run_key: None,
            status: RunStatus::Completed,
            aggregate_result: reply.to_string(),
            stage_results: Vec::new(),
            per_stage,
            failure: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failure.is_none()
    }

    pub fn result(&self, stage: StageName) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == stage)
    }

    pub fn marker(&self, stage: StageName) -> Option<StageMarker> {
        self.per_stage.get(&stage).map(|entry| entry.marker)
    }
}

/// Markdown document with one section per produced stage
pub fn render_aggregate(goal: &str, results: &[StageResult]) -> String {
    if results.is_empty() {
        return String::new();
    }

    let mut doc = format!("# 项目规划：{}\n", goal.trim());
    for result in results {
        doc.push_str(&format!("\n## {}\n\n", result.stage.title()));
        match &result.parsed {
            Some(value) => {
                let pretty =
                    serde_json::to_string_pretty(value).unwrap_or_else(|_| result.raw.clone());
                doc.push_str(&format!("```json\n{}\n```\n", pretty));
            }
            None => {
                if !result.ok {
                    doc.push_str("> 输出未能解析为结构化数据，以下为原始内容。\n\n");
                }
                doc.push_str(result.raw.trim());
                doc.push('\n');
            }
        }
    }
    doc
}
