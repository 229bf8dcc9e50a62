use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use rozet_core::ids::{AgentId, CommandId, SessionId};
use rozet_core::status::CommandStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Logs above this size are spilled to a file next to the database and the
/// row keeps only a `log_ref` pointer.
pub const LOG_SPILL_THRESHOLD: usize = 16 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: CommandId,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub command: String,
    pub arguments: Option<serde_json::Value>,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub log: Option<String>,
    pub log_ref: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

pub struct CommandRepo {
    db: Database,
}

const SELECT_COLS: &str = "id, session_id, agent_id, command, arguments, status, result, error, \
                           log, log_ref, created_at, started_at, completed_at";

impl CommandRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a command in `queued`.
    #[instrument(skip(self, arguments), fields(session_id = %session_id, agent_id = %agent_id, command))]
    pub fn create(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CommandRow, StoreError> {
        let id = CommandId::new();
        let now = Utc::now().to_rfc3339();
        let args_json = arguments
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO commands (id, session_id, agent_id, command, arguments, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    agent_id.as_str(),
                    command,
                    args_json,
                    now,
                ],
            )?;

            Ok(CommandRow {
                id,
                session_id: session_id.clone(),
                agent_id: agent_id.clone(),
                command: command.to_string(),
                arguments,
                status: CommandStatus::Queued,
                result: None,
                error: None,
                log: None,
                log_ref: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            })
        })
    }

    /// Get a command scoped to its session.
    #[instrument(skip(self), fields(session_id = %session_id, command_id = %id))]
    pub fn get(&self, session_id: &SessionId, id: &CommandId) -> Result<CommandRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM commands WHERE id = ?1 AND session_id = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_command(row),
                None => Err(StoreError::NotFound(format!("command {id}"))),
            }
        })
    }

    #[instrument(skip(self), fields(command_id = %id))]
    pub fn mark_running(&self, id: &CommandId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE commands SET status = 'running', started_at = ?1 WHERE id = ?2 AND status = 'queued'",
                rusqlite::params![now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("queued command {id}")));
            }
            Ok(())
        })
    }

    /// Record the terminal outcome. Oversized logs go to a spill file and the
    /// row stores only the pointer.
    #[instrument(skip(self, result, error, log), fields(command_id = %id, status = %status))]
    pub fn complete(
        &self,
        id: &CommandId,
        status: CommandStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        log: Option<&str>,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Database(format!(
                "complete() requires a terminal status, got {status}"
            )));
        }

        let (inline_log, log_ref) = split_log(&self.db, id, log)?;
        let spill = log_ref.clone();

        let result_json = result.as_ref().map(serde_json::to_string).transpose()?;
        let error_json = error.as_ref().map(serde_json::to_string).transpose()?;

        let outcome = self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE commands SET status = ?1, result = ?2, error = ?3, log = ?4, log_ref = ?5, completed_at = ?6
                 WHERE id = ?7 AND status IN ('queued', 'running')",
                rusqlite::params![
                    status.to_string(),
                    result_json,
                    error_json,
                    inline_log,
                    log_ref,
                    now,
                    id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "command {id} already in a terminal state"
                )));
            }
            Ok(())
        });

        // Spilled before the guarded write; a rejected write must not leave
        // the file orphaned.
        if outcome.is_err() {
            if let Some(path) = spill {
                let _ = std::fs::remove_file(path);
            }
        }
        outcome
    }

}

/// Split a log into (inline, spill pointer), spilling oversized text to a
/// file next to the database.
pub(crate) fn split_log(
    db: &Database,
    id: &CommandId,
    log: Option<&str>,
) -> Result<(Option<String>, Option<String>), StoreError> {
    match log {
        Some(text) if text.len() > LOG_SPILL_THRESHOLD => {
            let dir = db
                .path()
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
                .join("command-logs");
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(format!("spill dir: {e}")))?;
            let path = dir.join(format!("{id}.log"));
            std::fs::write(&path, text).map_err(|e| StoreError::Io(format!("spill log: {e}")))?;
            Ok((None, Some(path.to_string_lossy().into_owned())))
        }
        Some(text) => Ok((Some(text.to_string()), None)),
        None => Ok((None, None)),
    }
}

fn row_to_command(row: &rusqlite::Row<'_>) -> Result<CommandRow, StoreError> {
    let status_str: String = row_helpers::get(row, 5, "commands", "status")?;

    Ok(CommandRow {
        id: CommandId::from_raw(row_helpers::get::<String>(row, 0, "commands", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "commands", "session_id")?),
        agent_id: AgentId::from_raw(row_helpers::get::<String>(row, 2, "commands", "agent_id")?),
        command: row_helpers::get(row, 3, "commands", "command")?,
        arguments: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 4, "commands", "arguments")?,
            "commands",
            "arguments",
        )?,
        status: row_helpers::parse_enum(&status_str, "commands", "status")?,
        result: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 6, "commands", "result")?,
            "commands",
            "result",
        )?,
        error: row_helpers::parse_json_opt(
            row_helpers::get_opt(row, 7, "commands", "error")?,
            "commands",
            "error",
        )?,
        log: row_helpers::get_opt(row, 8, "commands", "log")?,
        log_ref: row_helpers::get_opt(row, 9, "commands", "log_ref")?,
        created_at: row_helpers::get(row, 10, "commands", "created_at")?,
        started_at: row_helpers::get_opt(row, 11, "commands", "started_at")?,
        completed_at: row_helpers::get_opt(row, 12, "commands", "completed_at")?,
    })
}
