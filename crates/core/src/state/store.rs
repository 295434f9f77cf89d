//! # Run Store
//!
//! Append-only persistence for finished runs. A run and all of its stage rows
//! are written in one transaction; nothing is ever updated afterwards.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::db::ThinkTankDb;
use crate::pipeline::{RunStatus, StageMarker, StageName};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock error: {0}")]
    Lock(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Row kind in `stage_outputs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Stage,
    Task,
}

impl RowKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Task => "task",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "task" => Self::Task,
            _ => Self::Stage,
        }
    }
}

/// Child task extracted from the planning stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskRow {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStageOutput {
    pub stage: StageName,
    pub marker: StageMarker,
    pub raw: String,
    pub parsed: Option<Value>,
    pub ok: bool,
    pub error_detail: Option<String>,
    pub tasks: Vec<NewTaskRow>,
}

/// Everything needed to append one run
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunRecord {
    pub goal: String,
    pub context: Option<String>,
    pub status: RunStatus,
    pub aggregate_result: String,
    pub failure_stage: Option<StageName>,
    pub failure_reason: Option<String>,
    pub failure_message: Option<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub stages: Vec<NewStageOutput>,
}

/// A stored run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub goal: String,
    pub context: Option<String>,
    pub status: RunStatus,
    pub aggregate_result: String,
    pub failure_stage: Option<StageName>,
    pub failure_reason: Option<String>,
    pub failure_message: Option<String>,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored stage or task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutputRow {
    pub id: i64,
    pub run_id: i64,
    pub parent_id: Option<i64>,
    pub position: i64,
    pub kind: RowKind,
    pub stage: StageName,
    pub marker: StageMarker,
    pub title: Option<String>,
    pub raw: Option<String>,
    pub parsed: Option<Value>,
    pub ok: bool,
    pub error_detail: Option<String>,
}

/// Durable, append-only storage for runs
pub trait RunStore: Send + Sync {
    /// Write a run and its stage rows; returns the new run id
    fn append(&self, record: NewRunRecord) -> Result<i64, StoreError>;

    fn fetch(&self, id: i64) -> Result<Option<RunRecord>, StoreError>;

    /// Stage and task rows of a run, in insertion order
    fn stage_outputs(&self, run_id: i64) -> Result<Vec<StageOutputRow>, StoreError>;
}

/// SQLite-backed run store
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStore {
    pub fn new(db: &ThinkTankDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn marker_str(marker: StageMarker) -> &'static str {
        match marker {
            StageMarker::Completed => "completed",
            StageMarker::Degraded => "degraded",
            StageMarker::Failed => "failed",
            StageMarker::NotReached => "not_reached",
            StageMarker::Bypassed => "bypassed",
        }
    }

    fn marker_from_str(s: &str) -> Result<StageMarker, StoreError> {
        match s {
            "completed" => Ok(StageMarker::Completed),
            "degraded" => Ok(StageMarker::Degraded),
            "failed" => Ok(StageMarker::Failed),
            "not_reached" => Ok(StageMarker::NotReached),
            "bypassed" => Ok(StageMarker::Bypassed),
            other => Err(StoreError::Corrupt(format!("unknown marker '{}'", other))),
        }
    }

    fn stage_from_str(s: &str) -> Result<StageName, StoreError> {
        StageName::from_str(s).ok_or_else(|| StoreError::Corrupt(format!("unknown stage '{}'", s)))
    }

    fn row_to_record(row: &Row<'_>) -> Result<RunRecord, StoreError> {
        let status: String = row.get(3)?;
        let failure_stage: Option<String> = row.get(5)?;
        let warnings_json: String = row.get(8)?;
        let created_at: String = row.get(9)?;

        Ok(RunRecord {
            id: row.get(0)?,
            goal: row.get(1)?,
            context: row.get(2)?,
            status: RunStatus::from_str(&status),
            aggregate_result: row.get(4)?,
            failure_stage: failure_stage.as_deref().map(Self::stage_from_str).transpose()?,
            failure_reason: row.get(6)?,
            failure_message: row.get(7)?,
            warnings: serde_json::from_str(&warnings_json)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt(format!("bad created_at: {}", e)))?,
        })
    }

    fn row_to_output(row: &Row<'_>) -> Result<StageOutputRow, StoreError> {
        let kind: String = row.get(4)?;
        let stage: String = row.get(5)?;
        let marker: String = row.get(6)?;
        let parsed_json: Option<String> = row.get(9)?;

        Ok(StageOutputRow {
            id: row.get(0)?,
            run_id: row.get(1)?,
            parent_id: row.get(2)?,
            position: row.get(3)?,
            kind: RowKind::from_str(&kind),
            stage: Self::stage_from_str(&stage)?,
            marker: Self::marker_from_str(&marker)?,
            title: row.get(7)?,
            raw: row.get(8)?,
            parsed: parsed_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            ok: row.get(10)?,
            error_detail: row.get(11)?,
        })
    }
}

impl RunStore for SqliteRunStore {
    fn append(&self, record: NewRunRecord) -> Result<i64, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;

        let tx = conn.transaction()?;
        let created_at = record.created_at.to_rfc3339();

        tx.execute(
            r#"
            INSERT INTO runs (goal, context, status, aggregate_result, failure_stage,
                              failure_reason, failure_message, warnings_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.goal,
                record.context,
                record.status.as_str(),
                record.aggregate_result,
                record.failure_stage.map(|s| s.as_str()),
                record.failure_reason,
                record.failure_message,
                serde_json::to_string(&record.warnings)?,
                created_at,
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        let mut position: i64 = 0;
        for stage in &record.stages {
            let parsed_json = stage.parsed.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                r#"
                INSERT INTO stage_outputs (run_id, parent_id, position, kind, stage, marker,
                                           title, raw, parsed_json, ok, error_detail, created_at)
                VALUES (?1, NULL, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    run_id,
                    position,
                    RowKind::Stage.as_str(),
                    stage.stage.as_str(),
                    Self::marker_str(stage.marker),
                    stage.raw,
                    parsed_json,
                    stage.ok,
                    stage.error_detail,
                    created_at,
                ],
            )?;
            let parent_id = tx.last_insert_rowid();
            position += 1;

            for task in &stage.tasks {
                tx.execute(
                    r#"
                    INSERT INTO stage_outputs (run_id, parent_id, position, kind, stage, marker,
                                               title, raw, parsed_json, ok, error_detail, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, 1, NULL, ?9)
                    "#,
                    params![
                        run_id,
                        parent_id,
                        position,
                        RowKind::Task.as_str(),
                        stage.stage.as_str(),
                        Self::marker_str(stage.marker),
                        task.title,
                        task.description,
                        created_at,
                    ],
                )?;
                position += 1;
            }
        }

        tx.commit()?;
        tracing::debug!(run_id, rows = position, "append: run recorded");
        Ok(run_id)
    }

    fn fetch(&self, id: i64) -> Result<Option<RunRecord>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, goal, context, status, aggregate_result, failure_stage,
                   failure_reason, failure_message, warnings_json, created_at
            FROM runs WHERE id = ?1
            "#,
        )?;

        let mut rows = stmt.query(params![id])?;
        let record = match rows.next()? {
            Some(row) => Some(Self::row_to_record(row)?),
            None => None,
        };
        Ok(record)
    }

    fn stage_outputs(&self, run_id: i64) -> Result<Vec<StageOutputRow>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, run_id, parent_id, position, kind, stage, marker,
                   title, raw, parsed_json, ok, error_detail
            FROM stage_outputs WHERE run_id = ?1 ORDER BY position
            "#,
        )?;

        let mut rows = stmt.query(params![run_id])?;
        let mut outputs = Vec::new();
        while let Some(row) = rows.next()? {
            outputs.push(Self::row_to_output(row)?);
        }
        Ok(outputs)
    }
}

/// Number of stored runs
pub fn count_runs(db: &ThinkTankDb) -> Result<i64, StoreError> {
    let conn = db.connection();
    let conn = conn.lock().map_err(|e| StoreError::Lock(e.to_string()))?;
    let count = conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(goal: &str) -> NewRunRecord {
        NewRunRecord {
            goal: goal.to_string(),
            context: None,
            status: RunStatus::Completed,
            aggregate_result: format!("# {}", goal),
            failure_stage: None,
            failure_reason: None,
            failure_message: None,
            warnings: Vec::new(),
            created_at: Utc::now(),
            stages: vec![
                NewStageOutput {
                    stage: StageName::Requirements,
                    marker: StageMarker::Completed,
                    raw: "{\"project_scope\":\"K12\"}".to_string(),
                    parsed: Some(json!({"project_scope": "K12"})),
                    ok: true,
                    error_detail: None,
                    tasks: Vec::new(),
                },
                NewStageOutput {
                    stage: StageName::Planning,
                    marker: StageMarker::Completed,
                    raw: "{}".to_string(),
                    parsed: Some(json!({})),
                    ok: true,
                    error_detail: None,
                    tasks: vec![
                        NewTaskRow {
                            title: "登录".to_string(),
                            description: "手机号登录".to_string(),
                        },
                        NewTaskRow {
                            title: "课程".to_string(),
                            description: "课程列表".to_string(),
                        },
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_append_and_fetch() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        let store = SqliteRunStore::new(&db);

        let id = store.append(record("在线教育")).unwrap();
        let fetched = store.fetch(id).unwrap().unwrap();

        assert_eq!(fetched.goal, "在线教育");
        assert_eq!(fetched.status, RunStatus::Completed);
        assert_eq!(fetched.aggregate_result, "# 在线教育");
        assert!(store.fetch(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_task_rows_link_to_planning_row() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        let store = SqliteRunStore::new(&db);
        let id = store.append(record("在线教育")).unwrap();

        let rows = store.stage_outputs(id).unwrap();
        assert_eq!(rows.len(), 4);

        let planning = rows
            .iter()
            .find(|r| r.kind == RowKind::Stage && r.stage == StageName::Planning)
            .unwrap();
        let tasks: Vec<_> = rows.iter().filter(|r| r.kind == RowKind::Task).collect();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| t.parent_id == Some(planning.id)));
        assert_eq!(tasks[0].title.as_deref(), Some("登录"));
        assert_eq!(rows[0].parsed, Some(json!({"project_scope": "K12"})));
    }

    #[test]
    fn test_appends_never_touch_earlier_records() {
        let db = ThinkTankDb::open_in_memory().unwrap();
        let store = SqliteRunStore::new(&db);

        let first = store.append(record("第一个项目")).unwrap();
        let before = store.fetch(first).unwrap().unwrap();
        let second = store.append(record("第二个项目")).unwrap();

        assert_ne!(first, second);
        assert_eq!(store.fetch(first).unwrap().unwrap(), before);
        assert_eq!(count_runs(&db).unwrap(), 2);
    }
}
