pub mod db;
pub mod recorder;
pub mod store;

pub use db::ThinkTankDb;

pub use recorder::{RunDetail, RunRecorder};
pub use store::{
    NewRunRecord, NewStageOutput, NewTaskRow, RowKind, RunRecord, RunStore, SqliteRunStore,
    StageOutputRow, StoreError,
};
