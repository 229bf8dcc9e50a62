use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use rozet_core::ids::{validate_id, CommandId, OperationId, SessionId};
use rozet_core::status::{CommandStatus, OperationStatus};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// How long a finished (or abandoned) operation remains queryable.
pub const DEFAULT_OPERATION_TTL_DAYS: i64 = 14;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationRow {
    pub id: OperationId,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub op_type: String,
    pub target_id: Option<String>,
    pub status: OperationStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub expires_at: String,
}

pub struct OperationRepo {
    db: Database,
}

const SELECT_COLS: &str = "id, session_id, type, target_id, status, result, error, created_at, \
                           updated_at, completed_at, expires_at";

impl OperationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create an operation in `queued` with the default retention window.
    #[instrument(skip(self), fields(session_id = %session_id, op_type, target_id))]
    pub fn create(
        &self,
        session_id: &SessionId,
        op_type: &str,
        target_id: Option<&str>,
    ) -> Result<OperationRow, StoreError> {
        if let Some(target) = target_id {
            if !validate_id(target) {
                return Err(StoreError::InvalidId(format!("target_id {target}")));
            }
        }

        let id = OperationId::new();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let expires_at = (now + Duration::days(DEFAULT_OPERATION_TTL_DAYS)).to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO operations (id, session_id, type, target_id, status, created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?5, ?6)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    op_type,
                    target_id,
                    now_str,
                    expires_at,
                ],
            )?;

            Ok(OperationRow {
                id,
                session_id: session_id.clone(),
                op_type: op_type.to_string(),
                target_id: target_id.map(String::from),
                status: OperationStatus::Queued,
                result: None,
                error: None,
                created_at: now_str.clone(),
                updated_at: now_str,
                completed_at: None,
                expires_at,
            })
        })
    }

    /// Get an operation scoped to its session. Past `expires_at` the row
    /// answers `Gone` even before the sweep physically removes it.
    #[instrument(skip(self), fields(session_id = %session_id, operation_id = %id))]
    pub fn get(&self, session_id: &SessionId, id: &OperationId) -> Result<OperationRow, StoreError> {
        let row = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM operations WHERE id = ?1 AND session_id = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_operation(row),
                None => Err(StoreError::NotFound(format!("operation {id}"))),
            }
        })?;

        if row.expires_at.as_str() < Utc::now().to_rfc3339().as_str() {
            return Err(StoreError::Gone(format!("operation {id} expired")));
        }
        Ok(row)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(
        &self,
        session_id: &SessionId,
        status: Option<OperationStatus>,
    ) -> Result<Vec<OperationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params): (String, Vec<String>) = match status {
                Some(s) => (
                    format!(
                        "SELECT {SELECT_COLS} FROM operations WHERE session_id = ?1 AND status = ?2
                         ORDER BY created_at DESC"
                    ),
                    vec![session_id.as_str().to_string(), s.to_string()],
                ),
                None => (
                    format!(
                        "SELECT {SELECT_COLS} FROM operations WHERE session_id = ?1
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
                results.push(row_to_operation(row)?);
            }
            Ok(results)
        })
    }

    /// Apply a status transition under the connection lock. The current
    /// status is read and checked against the FSM inside the same critical
    /// section, so no interleaving transition can regress a terminal state.
    #[instrument(skip(self, result, error), fields(operation_id = %id, to = %to))]
    pub fn transition(
        &self,
        id: &OperationId,
        to: OperationStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<OperationRow, StoreError> {
        let result_json = result.as_ref().map(serde_json::to_string).transpose()?;
        let error_json = error.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            let current_str: String = conn
                .query_row(
                    "SELECT status FROM operations WHERE id = ?1",
                    [id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("operation {id}")))?;
            let current: OperationStatus =
                row_helpers::parse_enum(&current_str, "operations", "status")?;

            if !current.can_transition(to) {
                return Err(StoreError::InvalidTransition { from: current, to });
            }

            let now = Utc::now().to_rfc3339();
            let completed_at = to.is_terminal().then(|| now.clone());
            conn.execute(
                "UPDATE operations SET status = ?1, result = COALESCE(?2, result),
                        error = COALESCE(?3, error), updated_at = ?4,
                        completed_at = COALESCE(?5, completed_at)
                 WHERE id = ?6",
                rusqlite::params![
                    to.to_string(),
                    result_json,
                    error_json,
                    now,
                    completed_at,
                    id.as_str(),
                ],
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM operations WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_operation(row),
                None => Err(StoreError::NotFound(format!("operation {id}"))),
            }
        })
    }

    /// Resolve a command and its wrapping operation in one transaction, so a
    /// crash can never leave a finished command with a dangling queued
    /// operation. Both writes honor the same terminal guards as the
    /// single-table paths.
    #[instrument(skip(self, result, error, log), fields(operation_id = %op_id, command_id = %command_id))]
    pub fn complete_with_command(
        &self,
        op_id: &OperationId,
        command_id: &CommandId,
        command_status: CommandStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        log: Option<&str>,
    ) -> Result<OperationRow, StoreError> {
        if !command_status.is_terminal() {
            return Err(StoreError::Database(format!(
                "complete_with_command() requires a terminal status, got {command_status}"
            )));
        }
        let op_status = match command_status {
            CommandStatus::Succeeded => OperationStatus::Succeeded,
            _ => OperationStatus::Failed,
        };
        let result_json = result.as_ref().map(serde_json::to_string).transpose()?;
        let error_json = error.as_ref().map(serde_json::to_string).transpose()?;
        let (inline_log, log_ref) = crate::commands::split_log(&self.db, command_id, log)?;
        let spill = log_ref.clone();

        let outcome = self.db.with_tx(|tx| {
            let now = Utc::now().to_rfc3339();

            let changed = tx.execute(
                "UPDATE commands SET status = ?1, result = ?2, error = ?3, log = ?4, log_ref = ?5, completed_at = ?6
                 WHERE id = ?7 AND status IN ('queued', 'running')",
                rusqlite::params![
                    command_status.to_string(),
                    result_json,
                    error_json,
                    inline_log,
                    log_ref,
                    now,
                    command_id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "command {command_id} already in a terminal state"
                )));
            }

            let current_str: String = tx
                .query_row(
                    "SELECT status FROM operations WHERE id = ?1",
                    [op_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|_| StoreError::NotFound(format!("operation {op_id}")))?;
            let current: OperationStatus =
                row_helpers::parse_enum(&current_str, "operations", "status")?;
            if !current.can_transition(op_status) {
                return Err(StoreError::InvalidTransition { from: current, to: op_status });
            }

            tx.execute(
                "UPDATE operations SET status = ?1, result = COALESCE(?2, result),
                        error = COALESCE(?3, error), updated_at = ?4, completed_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    op_status.to_string(),
                    result_json,
                    error_json,
                    now,
                    op_id.as_str(),
                ],
            )?;

            let mut stmt = tx.prepare(&format!(
                "SELECT {SELECT_COLS} FROM operations WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([op_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_operation(row),
                None => Err(StoreError::NotFound(format!("operation {op_id}"))),
            }
        });

        // The spill file is written before the transaction; a rolled-back
        // write must not leave it orphaned on disk.
        if outcome.is_err() {
            if let Some(path) = spill {
                let _ = std::fs::remove_file(path);
            }
        }
        outcome
    }

    /// Delete operations past their retention window. Returns how many rows
    /// were removed.
    #[instrument(skip(self))]
    pub fn delete_expired(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let deleted = conn.execute("DELETE FROM operations WHERE expires_at < ?1", [now])?;
            Ok(deleted)
        })
    }
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> Result<OperationRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "operations", "status")?;

    Ok(OperationRow {
        id: OperationId::from_raw(row_helpers::get::<String>(row, 0, "operations", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "operations", "session_id")?),
        op_type: row_helpers::get(row, 2, "operations", "type")?,
        target_id: row_helpers::get_opt(row, 3, "operations", "target_id")?,
        status: row_helpers::parse_enum(&status_str, "operations", "status")?,
        result: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 5, "operations", "result")?,
            "operations",
            "result",
        )?,
        error: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 6, "operations", "error")?,
            "operations",
            "error",
        )?,
        created_at: row_helpers::get(row, 7, "operations", "created_at")?,
        updated_at: row_helpers::get(row, 8, "operations", "updated_at")?,
        completed_at: row_helpers::get_opt(row, 9, "operations", "completed_at")?,
        expires_at: row_helpers::get(row, 10, "operations", "expires_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone())
            .create(None, "/w", None, serde_json::json!({}))
            .unwrap();
        (db, session.id)
    }

    fn force_expiry(db: &Database, id: &OperationId) {
        let past = (Utc::now() - Duration::days(1)).to_rfc3339();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE operations SET expires_at = ?1 WHERE id = ?2",
                rusqlite::params![past, id.as_str()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn create_operation_queued_with_expiry() {
        let (db, sid) = setup();
        let repo = OperationRepo::new(db);
        let op = repo.create(&sid, "session.terminate", Some(sid.as_str())).unwrap();
        assert!(op.id.as_str().starts_with("op_"));
        assert_eq!(op.status, OperationStatus::Queued);
        assert!(op.expires_at > op.created_at);
    }

    #[test]
    fn create_rejects_bad_target_id() {
        let (db, sid) = setup();
        let repo = OperationRepo::new(db);
        let result = repo.create(&sid, "x", Some("no spaces allowed"));
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
    }

    #[test]
    fn full_forward_transition_path() {
        let (db, sid) = setup();
        let repo = OperationRepo::new(db);
        let op = repo.create(&sid, "command.dispatch", None).unwrap();

        let running = repo.transition(&op.id, OperationStatus::Running, None, None).unwrap();
        assert_eq!(running.status, OperationStatus::Running);
        assert!(running.completed_at.is_none());

        let done = repo
            .transition(
                &op.id,
                OperationStatus::Succeeded,
                Some(serde_json::json!({"exit": 0})),
                None,
            )
            .unwrap();
        assert_eq!(done.status, OperationStatus::Succeeded);
        assert!(done.completed_at.is_some());
        assert_eq!(done.result.unwrap()["exit"], 0);
    }

    #[test]
    fn terminal_state_never_regresses() {
        let (db, sid) = setup();
        let repo = OperationRepo::new(db);
        let op = repo.create(&sid, "x", None).unwrap();
        repo.transition(&op.id, OperationStatus::Cancelled, None, None).unwrap();

        for to in [
            OperationStatus::Queued,
            OperationStatus::Running,
            OperationStatus::Succeeded,
            OperationStatus::Failed,
        ] {
            let result = repo.transition(&op.id, to, None, None);
            assert!(
                matches!(result, Err(StoreError::InvalidTransition { .. })),
                "cancelled -> {to} must fail"
            );
        }
        assert_eq!(
            repo.get(&sid, &op.id).unwrap().status,
            OperationStatus::Cancelled
        );
    }

    #[test]
    fn failed_records_error_payload() {
        let (db, sid) = setup();
        let repo = OperationRepo::new(db);
        let op = repo.create(&sid, "x", None).unwrap();
        repo.transition(&op.id, OperationStatus::Running, None, None).unwrap();
        let failed = repo
            .transition(
                &op.id,
                OperationStatus::Failed,
                None,
                Some(serde_json::json!({"code": "ORCHESTRATOR_FAILURE"})),
            )
            .unwrap();
        assert_eq!(failed.error.unwrap()["code"], "ORCHESTRATOR_FAILURE");
    }

    #[test]
    fn expired_operation_is_gone_then_deleted() {
        let (db, sid) = setup();
        let repo = OperationRepo::new(db.clone());
        let op = repo.create(&sid, "x", None).unwrap();
        force_expiry(&db, &op.id);

        assert!(matches!(repo.get(&sid, &op.id), Err(StoreError::Gone(_))));

        let deleted = repo.delete_expired().unwrap();
        assert_eq!(deleted, 1);
        assert!(matches!(repo.get(&sid, &op.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn command_and_operation_resolve_atomically() {
        use crate::agents::AgentRepo;
        use crate::commands::CommandRepo;
        use rozet_core::capability::CapabilitySet;

        let (db, sid) = setup();
        let agent = AgentRepo::new(db.clone())
            .create(&sid, "a", None, "m", CapabilitySet::empty(), None)
            .unwrap();
        let commands = CommandRepo::new(db.clone());
        let cmd = commands.create(&sid, &agent.id, "analyze", None).unwrap();
        let repo = OperationRepo::new(db);
        let op = repo.create(&sid, "command.dispatch", Some(cmd.id.as_str())).unwrap();
        repo.transition(&op.id, OperationStatus::Running, None, None).unwrap();
        commands.mark_running(&cmd.id).unwrap();

        let resolved = repo
            .complete_with_command(
                &op.id,
                &cmd.id,
                CommandStatus::Succeeded,
                Some(serde_json::json!({"exit": 0})),
                None,
                Some("done"),
            )
            .unwrap();
        assert_eq!(resolved.status, OperationStatus::Succeeded);
        assert_eq!(
            commands.get(&sid, &cmd.id).unwrap().status,
            CommandStatus::Succeeded
        );

        // Second resolution conflicts and leaves both rows untouched.
        let again = repo.complete_with_command(
            &op.id,
            &cmd.id,
            CommandStatus::Failed,
            None,
            Some(serde_json::json!({"code": "E"})),
            None,
        );
        assert!(matches!(again, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn conflicting_resolution_cleans_up_spilled_log() {
        use crate::agents::AgentRepo;
        use crate::commands::{CommandRepo, LOG_SPILL_THRESHOLD};
        use rozet_core::capability::CapabilitySet;

        let (db, sid) = setup();
        let agent = AgentRepo::new(db.clone())
            .create(&sid, "a", None, "m", CapabilitySet::empty(), None)
            .unwrap();
        let commands = CommandRepo::new(db.clone());
        let cmd = commands.create(&sid, &agent.id, "x", None).unwrap();
        let repo = OperationRepo::new(db);
        let op = repo.create(&sid, "command.dispatch", Some(cmd.id.as_str())).unwrap();

        commands
            .complete(&cmd.id, CommandStatus::Succeeded, None, None, None)
            .unwrap();

        let big = "x".repeat(LOG_SPILL_THRESHOLD + 1);
        let again = repo.complete_with_command(
            &op.id,
            &cmd.id,
            CommandStatus::Failed,
            None,
            None,
            Some(&big),
        );
        assert!(matches!(again, Err(StoreError::Conflict(_))));

        // In-memory databases spill next to the temp dir.
        let spill = std::env::temp_dir()
            .join("command-logs")
            .join(format!("{}.log", cmd.id));
        assert!(!spill.exists());
    }

    #[test]
    fn list_by_status() {
        let (db, sid) = setup();
        let repo = OperationRepo::new(db);
        let op1 = repo.create(&sid, "a", None).unwrap();
        repo.create(&sid, "b", None).unwrap();
        repo.transition(&op1.id, OperationStatus::Succeeded, None, None).unwrap();

        assert_eq!(repo.list_for_session(&sid, None).unwrap().len(), 2);
        assert_eq!(
            repo.list_for_session(&sid, Some(OperationStatus::Queued)).unwrap().len(),
            1
        );
    }
}
