use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use rozet_core::capability::CapabilitySet;
use rozet_core::ids::{AgentId, CommandId, SessionId};
use rozet_core::metrics::AgentMetrics;
use rozet_core::status::AgentStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRow {
    pub id: AgentId,
    pub session_id: SessionId,
    pub name: String,
    pub system_prompt: Option<String>,
    pub model: String,
    pub status: AgentStatus,
    pub capabilities: CapabilitySet,
    pub max_context: Option<i64>,
    pub current_command_id: Option<CommandId>,
    pub metrics: AgentMetrics,
    pub created_at: String,
    pub updated_at: String,
}

pub struct AgentRepo {
    db: Database,
}

const SELECT_COLS: &str = "id, session_id, name, system_prompt, model, status, capabilities, \
                           max_context, current_command_id, input_tokens, output_tokens, \
                           cost_cents, created_at, updated_at";

impl AgentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create an agent. Name uniqueness within the session is case-insensitive
    /// and checked before the insert so the caller gets a structured conflict
    /// with nothing persisted. The NOCASE unique index is the backstop for
    /// racing writers.
    #[instrument(skip(self, system_prompt), fields(session_id = %session_id, name))]
    pub fn create(
        &self,
        session_id: &SessionId,
        name: &str,
        system_prompt: Option<&str>,
        model: &str,
        capabilities: CapabilitySet,
        max_context: Option<i64>,
    ) -> Result<AgentRow, StoreError> {
        let id = AgentId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let session_exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    [session_id.as_str()],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !session_exists {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }

            let duplicate: bool = conn
                .query_row(
                    "SELECT 1 FROM agents WHERE session_id = ?1 AND name = ?2 COLLATE NOCASE",
                    rusqlite::params![session_id.as_str(), name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "agent name '{name}' already exists in session {session_id}"
                )));
            }

            conn.execute(
                "INSERT INTO agents (id, session_id, name, system_prompt, model, status, capabilities, max_context, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'idle', ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    name,
                    system_prompt,
                    model,
                    capabilities.bits(),
                    max_context,
                    now,
                    now,
                ],
            )?;

            Ok(AgentRow {
                id,
                session_id: session_id.clone(),
                name: name.to_string(),
                system_prompt: system_prompt.map(String::from),
                model: model.to_string(),
                status: AgentStatus::Idle,
                capabilities,
                max_context,
                current_command_id: None,
                metrics: AgentMetrics::default(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get an agent scoped to its session.
    #[instrument(skip(self), fields(session_id = %session_id, agent_id = %agent_id))]
    pub fn get(&self, session_id: &SessionId, agent_id: &AgentId) -> Result<AgentRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM agents WHERE id = ?1 AND session_id = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![agent_id.as_str(), session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_agent(row),
                None => Err(StoreError::NotFound(format!("agent {agent_id}"))),
            }
        })
    }

    /// Full roster for a session, creation order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<AgentRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM agents WHERE session_id = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_agent(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(agent_id = %agent_id, status = %status))]
    pub fn update_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE agents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, agent_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("agent {agent_id}")));
            }
            Ok(())
        })
    }

    /// Point the agent at its in-flight command (or clear it).
    pub fn set_current_command(
        &self,
        agent_id: &AgentId,
        command_id: Option<&CommandId>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE agents SET current_command_id = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![command_id.map(|c| c.as_str()), now, agent_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Add usage deltas to the agent's accumulators.
    #[instrument(skip(self, delta), fields(agent_id = %agent_id))]
    pub fn record_metrics(
        &self,
        agent_id: &AgentId,
        delta: &AgentMetrics,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE agents SET
                    input_tokens = input_tokens + ?1,
                    output_tokens = output_tokens + ?2,
                    cost_cents = cost_cents + ?3,
                    updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![
                    delta.input_tokens as i64,
                    delta.output_tokens as i64,
                    delta.cost_cents,
                    now,
                    agent_id.as_str(),
                ],
            )?;
            Ok(())
        })
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> Result<AgentRow, StoreError> {
    let status_str: String = row_helpers::get(row, 5, "agents", "status")?;
    let cap_bits: i64 = row_helpers::get(row, 6, "agents", "capabilities")?;

    Ok(AgentRow {
        id: AgentId::from_raw(row_helpers::get::<String>(row, 0, "agents", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "agents", "session_id")?),
        name: row_helpers::get(row, 2, "agents", "name")?,
        system_prompt: row_helpers::get_opt(row, 3, "agents", "system_prompt")?,
        model: row_helpers::get(row, 4, "agents", "model")?,
        status: row_helpers::parse_enum(&status_str, "agents", "status")?,
        capabilities: CapabilitySet::from_bits(cap_bits as u8),
        max_context: row_helpers::get_opt(row, 7, "agents", "max_context")?,
        current_command_id: row_helpers::get_opt::<String>(row, 8, "agents", "current_command_id")?
            .map(CommandId::from_raw),
        metrics: AgentMetrics {
            input_tokens: row_helpers::get::<i64>(row, 9, "agents", "input_tokens")? as u64,
            output_tokens: row_helpers::get::<i64>(row, 10, "agents", "output_tokens")? as u64,
            cost_cents: row_helpers::get(row, 11, "agents", "cost_cents")?,
        },
        created_at: row_helpers::get(row, 12, "agents", "created_at")?,
        updated_at: row_helpers::get(row, 13, "agents", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use rozet_core::capability::Capability;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone())
            .create(None, "/w", None, serde_json::json!({}))
            .unwrap();
        (db, session.id)
    }

    fn caps() -> CapabilitySet {
        [Capability::Read, Capability::Bash].into_iter().collect()
    }

    #[test]
    fn create_agent_idle_with_capabilities() {
        let (db, sid) = setup();
        let repo = AgentRepo::new(db);
        let agent = repo
            .create(&sid, "qa-1", Some("review code"), "gpt-4o-mini", caps(), Some(128_000))
            .unwrap();
        assert!(agent.id.as_str().starts_with("agent_"));
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.capabilities.contains(Capability::Bash));
        assert!(!agent.capabilities.contains(Capability::Write));
    }

    #[test]
    fn duplicate_name_is_conflict_case_insensitive() {
        let (db, sid) = setup();
        let repo = AgentRepo::new(db);
        repo.create(&sid, "qa-1", None, "m", caps(), None).unwrap();

        let dup = repo.create(&sid, "QA-1", None, "m", caps(), None);
        assert!(matches!(dup, Err(StoreError::Conflict(_))));

        // Conflict happened before any write
        let roster = repo.list_for_session(&sid).unwrap();
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn same_name_allowed_across_sessions() {
        let (db, sid_a) = setup();
        let sid_b = SessionRepo::new(db.clone())
            .create(None, "/other", None, serde_json::json!({}))
            .unwrap()
            .id;
        let repo = AgentRepo::new(db);
        repo.create(&sid_a, "worker", None, "m", caps(), None).unwrap();
        repo.create(&sid_b, "worker", None, "m", caps(), None).unwrap();
    }

    #[test]
    fn create_in_missing_session_fails() {
        let (db, _) = setup();
        let repo = AgentRepo::new(db);
        let result = repo.create(
            &SessionId::from_raw("sess_missing"),
            "a",
            None,
            "m",
            caps(),
            None,
        );
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn get_is_session_scoped() {
        let (db, sid) = setup();
        let other = SessionRepo::new(db.clone())
            .create(None, "/other", None, serde_json::json!({}))
            .unwrap()
            .id;
        let repo = AgentRepo::new(db);
        let agent = repo.create(&sid, "a", None, "m", caps(), None).unwrap();

        assert!(repo.get(&sid, &agent.id).is_ok());
        assert!(matches!(repo.get(&other, &agent.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn status_and_current_command_updates() {
        let (db, sid) = setup();
        let repo = AgentRepo::new(db);
        let agent = repo.create(&sid, "a", None, "m", caps(), None).unwrap();

        let cmd = CommandId::new();
        repo.update_status(&agent.id, AgentStatus::Executing).unwrap();
        repo.set_current_command(&agent.id, Some(&cmd)).unwrap();

        let fetched = repo.get(&sid, &agent.id).unwrap();
        assert_eq!(fetched.status, AgentStatus::Executing);
        assert_eq!(fetched.current_command_id.as_ref(), Some(&cmd));

        repo.set_current_command(&agent.id, None).unwrap();
        assert!(repo.get(&sid, &agent.id).unwrap().current_command_id.is_none());
    }

    #[test]
    fn metrics_accumulate() {
        let (db, sid) = setup();
        let repo = AgentRepo::new(db.clone());
        let agent = repo.create(&sid, "a", None, "m", caps(), None).unwrap();

        let delta = AgentMetrics { input_tokens: 100, output_tokens: 40, cost_cents: 0.5 };
        repo.record_metrics(&agent.id, &delta).unwrap();
        repo.record_metrics(&agent.id, &delta).unwrap();

        let fetched = repo.get(&sid, &agent.id).unwrap();
        assert_eq!(fetched.metrics.input_tokens, 200);
        assert_eq!(fetched.metrics.output_tokens, 80);

        // Session aggregate sees the sum
        let total = SessionRepo::new(db).aggregate_metrics(&sid).unwrap();
        assert_eq!(total.input_tokens, 200);
    }
}
