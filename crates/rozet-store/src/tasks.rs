use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use rozet_core::ids::{SessionId, TaskId};
use rozet_core::status::TaskStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Structured task specification: files the task touches and how to judge it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub session_id: SessionId,
    pub description: String,
    pub spec: Option<TaskSpec>,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

pub struct TaskRepo {
    db: Database,
}

const SELECT_COLS: &str =
    "id, session_id, description, spec, status, result, error, created_at, started_at, completed_at";

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, spec), fields(session_id = %session_id))]
    pub fn create(
        &self,
        session_id: &SessionId,
        description: &str,
        spec: Option<TaskSpec>,
    ) -> Result<TaskRow, StoreError> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();
        let spec_json = spec.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, session_id, description, spec, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5)",
                rusqlite::params![id.as_str(), session_id.as_str(), description, spec_json, now],
            )?;

            Ok(TaskRow {
                id,
                session_id: session_id.clone(),
                description: description.to_string(),
                spec,
                status: TaskStatus::Queued,
                result: None,
                error: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, task_id = %id))]
    pub fn get(&self, session_id: &SessionId, id: &TaskId) -> Result<TaskRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM tasks WHERE id = ?1 AND session_id = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("task {id}"))),
            }
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(
        &self,
        session_id: &SessionId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params): (String, Vec<String>) = match status {
                Some(s) => (
                    format!(
                        "SELECT {SELECT_COLS} FROM tasks WHERE session_id = ?1 AND status = ?2
                         ORDER BY created_at DESC"
                    ),
                    vec![session_id.as_str().to_string(), s.to_string()],
                ),
                None => (
                    format!(
                        "SELECT {SELECT_COLS} FROM tasks WHERE session_id = ?1
                         ORDER BY created_at DESC"
                    ),
                    vec![session_id.as_str().to_string()],
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> = params
                .iter()
                .map(|p| p as &dyn rusqlite::types::ToSql)
                .collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_task(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    pub fn mark_running(&self, id: &TaskId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("queued task {id}")));
            }
            Ok(())
        })
    }

    /// Record a terminal outcome. Terminal states are write-once: a late
    /// cancel racing a success loses, so a completed result is never
    /// overwritten.
    #[instrument(skip(self, result, error), fields(task_id = %id, status = %status))]
    pub fn complete(
        &self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Database(format!(
                "complete() requires a terminal status, got {status}"
            )));
        }
        let result_json = result.as_ref().map(serde_json::to_string).transpose()?;
        let error_json = error.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE tasks SET status = ?1, result = ?2, error = ?3, completed_at = ?4
                 WHERE id = ?5 AND status IN ('queued', 'running')",
                rusqlite::params![status.to_string(), result_json, error_json, now, id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<TaskRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "tasks", "status")?;
    let spec_raw: Option<String> = row_helpers::get_opt(row, 3, "tasks", "spec")?;
    let spec = spec_raw
        .map(|s| {
            serde_json::from_str::<TaskSpec>(&s).map_err(|e| StoreError::CorruptRow {
                table: "tasks",
                column: "spec",
                detail: format!("invalid JSON: {e}"),
            })
        })
        .transpose()?;

    Ok(TaskRow {
        id: TaskId::from_raw(row_helpers::get::<String>(row, 0, "tasks", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "tasks", "session_id")?),
        description: row_helpers::get(row, 2, "tasks", "description")?,
        spec,
        status: row_helpers::parse_enum(&status_str, "tasks", "status")?,
        result: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 5, "tasks", "result")?,
            "tasks",
            "result",
        )?,
        error: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 6, "tasks", "error")?,
            "tasks",
            "error",
        )?,
        created_at: row_helpers::get(row, 7, "tasks", "created_at")?,
        started_at: row_helpers::get_opt(row, 8, "tasks", "started_at")?,
        completed_at: row_helpers::get_opt(row, 9, "tasks", "completed_at")?,
    })
}
