//! # Run Recorder
//!
//! Converts a finished run and its bundle into one stored record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::db::ThinkTankDb;
use super::store::{
    NewRunRecord, NewStageOutput, NewTaskRow, RunRecord, RunStore, SqliteRunStore,
    StageOutputRow, StoreError,
};
use crate::error::PipelineError;
use crate::pipeline::{PipelineRun, ResultBundle, StageName};

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::StorageUnavailable(err.to_string())
    }
}

/// Stored run plus its stage and task rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub record: RunRecord,
    pub stage_outputs: Vec<StageOutputRow>,
}

#[derive(Clone)]
pub struct RunRecorder {
    store: Arc<dyn RunStore>,
}

impl RunRecorder {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Recorder over the SQLite store of `db`
    pub fn sqlite(db: &ThinkTankDb) -> Self {
        Self::new(Arc::new(SqliteRunStore::new(db)))
    }

    /// Append exactly one record for this run
    pub fn save(&self, run: &PipelineRun, bundle: &ResultBundle) -> Result<i64, PipelineError> {
        let record = Self::to_record(run, bundle);
        let id = self.store.append(record)?;
        tracing::info!(run_id = id, status = %bundle.status, "Run recorded");
        Ok(id)
    }

    /// Status snapshot of a stored run
    pub fn status(&self, id: i64) -> Result<RunRecord, PipelineError> {
        self.store.fetch(id)?.ok_or(PipelineError::NotFound(id))
    }

    /// Full stored run including stage rows
    pub fn detail(&self, id: i64) -> Result<RunDetail, PipelineError> {
        let record = self.status(id)?;
        let stage_outputs = self.store.stage_outputs(id)?;
        Ok(RunDetail {
            record,
            stage_outputs,
        })
    }

    fn to_record(run: &PipelineRun, bundle: &ResultBundle) -> NewRunRecord {
        // one row per stage that produced output, in plan order
        let stages = bundle
            .per_stage
            .iter()
            .filter_map(|(stage, entry)| {
                let raw = entry.raw.clone()?;
                let tasks = match (stage, &entry.parsed) {
                    (StageName::Planning, Some(parsed)) => planning_tasks(parsed),
                    _ => Vec::new(),
                };
                Some(NewStageOutput {
                    stage: *stage,
                    marker: entry.marker,
                    raw,
                    parsed: entry.parsed.clone(),
                    ok: entry.ok,
                    error_detail: entry.error_detail.clone(),
                    tasks,
                })
            })
            .collect();

        NewRunRecord {
            goal: run.goal.clone(),
            context: run.context.clone(),
            status: bundle.status,
            aggregate_result: bundle.aggregate_result.clone(),
            failure_stage: bundle.failure.as_ref().and_then(|f| f.stage),
            failure_reason: bundle.failure.as_ref().map(|f| f.reason.clone()),
            failure_message: bundle.failure.as_ref().map(|f| f.message.clone()),
            warnings: bundle.warnings.clone(),
            created_at: run.created_at,
            stages,
        }
    }
}

/// Flatten `{phases: [{name, tasks: [{name, description}]}]}` (or a bare
/// `{tasks: [...]}`) into task rows
pub fn planning_tasks(parsed: &Value) -> Vec<NewTaskRow> {
    let phases: Vec<&Value> = match parsed.get("phases").and_then(Value::as_array) {
        Some(phases) => phases.iter().collect(),
        None => vec![parsed],
    };

    let mut tasks = Vec::new();
    for phase in phases {
        let phase_name = phase.get("name").and_then(Value::as_str);
        let Some(items) = phase.get("tasks").and_then(Value::as_array) else {
            continue;
        };
        for item in items {
            let (name, description) = match item {
                Value::String(text) => (text.clone(), String::new()),
                other => (
                    text_field(other, &["name", "title"]).unwrap_or_default(),
                    text_field(other, &["description", "detail"]).unwrap_or_default(),
                ),
            };
            if name.is_empty() {
                continue;
            }
            let title = match phase_name {
                Some(phase) => format!("{} / {}", phase, name),
                None => name,
            };
            tasks.push(NewTaskRow { title, description });
        }
    }
    tasks
}

fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{default_plan, RunStatus, StageResult};
    use serde_json::json;

    struct UnavailableStore;

    impl RunStore for UnavailableStore {
        fn append(&self, _record: NewRunRecord) -> Result<i64, StoreError> {
            Err(StoreError::Lock("database is locked".to_string()))
        }

        fn fetch(&self, _id: i64) -> Result<Option<RunRecord>, StoreError> {
            Ok(None)
        }

        fn stage_outputs(&self, _run_id: i64) -> Result<Vec<StageOutputRow>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn completed_bundle(goal: &str) -> (PipelineRun, ResultBundle) {
        let mut run = PipelineRun::new(goal, None);
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Completed).unwrap();

        let plan = json!({"phases": [{"name": "MVP", "tasks": [
            {"name": "登录", "description": "手机号登录"},
            "课程列表"
        ]}]});
        let results = vec![StageResult {
            stage: StageName::Planning,
            raw: plan.to_string(),
            parsed: Some(plan),
            ok: true,
            error_detail: None,
        }];
        let bundle = ResultBundle::assemble(goal, &default_plan(), results, None);
        (run, bundle)
    }

    #[test]
    fn test_save_writes_one_record_per_call() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        let recorder = RunRecorder::sqlite(&db);

        let (run, bundle) = completed_bundle("开发一个在线教育平台");
        let first = recorder.save(&run, &bundle).unwrap();
        let second = recorder.save(&run, &bundle).unwrap();
        assert_ne!(first, second);

        let detail = recorder.detail(first).unwrap();
        assert_eq!(detail.record.status, RunStatus::Completed);
        // planning row + two task rows
        assert_eq!(detail.stage_outputs.len(), 3);
        assert_eq!(
            detail.stage_outputs[1].title.as_deref(),
            Some("MVP / 登录")
        );
    }

    #[test]
    fn test_missing_run_is_not_found() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        let recorder = RunRecorder::sqlite(&db);
        assert_eq!(recorder.status(42), Err(PipelineError::NotFound(42)));
    }

    #[test]
    fn test_store_failure_maps_to_storage_unavailable() {
        let recorder = RunRecorder::new(Arc::new(UnavailableStore));
        let (run, bundle) = completed_bundle("开发一个在线教育平台");

        let err = recorder.save(&run, &bundle).unwrap_err();
        assert_eq!(err.reason_tag(), "storage_unavailable");
    }

    #[test]
    fn test_planning_tasks_without_phases() {
        let tasks = planning_tasks(&json!({"tasks": [{"title": "部署", "detail": "上线"}]}));
        assert_eq!(
            tasks,
            vec![NewTaskRow {
                title: "部署".to_string(),
                description: "上线".to_string()
            }]
        );
        assert!(planning_tasks(&json!({"goal": "x"})).is_empty());
    }
}
