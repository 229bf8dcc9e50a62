use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use rozet_core::ids::{validate_id, SessionId};
use rozet_core::metrics::AgentMetrics;
use rozet_core::status::SessionStatus;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub tenant_id: Option<String>,
    pub working_dir: String,
    pub provider_config: Option<String>,
    pub status: SessionStatus,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
    pub archived_at: Option<String>,
}

pub struct SessionRepo {
    db: Database,
}

const SELECT_COLS: &str = "id, tenant_id, working_dir, provider_config, status, metadata, \
                           created_at, updated_at, archived_at";

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new session in `active`.
    #[instrument(skip(self, metadata), fields(tenant_id, working_dir))]
    pub fn create(
        &self,
        tenant_id: Option<&str>,
        working_dir: &str,
        provider_config: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<SessionRow, StoreError> {
        if let Some(tenant) = tenant_id {
            if !validate_id(tenant) {
                return Err(StoreError::InvalidId(format!("tenant_id {tenant}")));
            }
        }

        let id = SessionId::new();
        let now = Utc::now().to_rfc3339();
        let metadata_json = serde_json::to_string(&metadata)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, tenant_id, working_dir, provider_config, status, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    tenant_id,
                    working_dir,
                    provider_config,
                    metadata_json,
                    now,
                    now,
                ],
            )?;

            Ok(SessionRow {
                id,
                tenant_id: tenant_id.map(String::from),
                working_dir: working_dir.to_string(),
                provider_config: provider_config.map(String::from),
                status: SessionStatus::Active,
                metadata,
                created_at: now.clone(),
                updated_at: now,
                archived_at: None,
            })
        })
    }

    /// Get a session by ID. Archived sessions are still retrievable, with
    /// `archived_at` populated.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        if !validate_id(id.as_str()) {
            return Err(StoreError::InvalidId(format!("session id {id}")));
        }
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {SELECT_COLS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// List sessions, newest first. Archived sessions are excluded unless
    /// `include_archived` is set. Optional tenant and status filters back the
    /// (tenant_id, status) index.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        tenant_id: Option<&str>,
        status: Option<SessionStatus>,
        include_archived: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut sql = format!("SELECT {SELECT_COLS} FROM sessions WHERE 1=1");
            let mut params: Vec<String> = Vec::new();

            if let Some(tenant) = tenant_id {
                params.push(tenant.to_string());
                sql.push_str(&format!(" AND tenant_id = ?{}", params.len()));
            }
            if let Some(s) = status {
                params.push(s.to_string());
                sql.push_str(&format!(" AND status = ?{}", params.len()));
            }
            if !include_archived {
                sql.push_str(" AND archived_at IS NULL");
            }
            params.push(limit.to_string());
            sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", params.len()));
            params.push(offset.to_string());
            sql.push_str(&format!(" OFFSET ?{}", params.len()));

            let mut stmt = conn.prepare(&sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> = params
                .iter()
                .map(|p| p as &dyn rusqlite::types::ToSql)
                .collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Update session status.
    #[instrument(skip(self), fields(session_id = %session_id, status = %status))]
    pub fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, session_id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
    }

    /// Mark a session archived (30-day idle policy). Never hard-deletes.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn set_archived(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET archived_at = ?1, updated_at = ?1 WHERE id = ?2 AND archived_at IS NULL",
                rusqlite::params![now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Bump `updated_at` so the retention sweep sees activity.
    pub fn touch(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![now, session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Sessions with no activity since `cutoff` that are not yet archived.
    #[instrument(skip(self))]
    pub fn idle_before(&self, cutoff: &str) -> Result<Vec<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE updated_at < ?1 AND archived_at IS NULL",
            )?;
            let ids = stmt
                .query_map([cutoff], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(SessionId::from_raw)
                .collect();
            Ok(ids)
        })
    }

    /// Sum of agent usage counters across the session's roster.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn aggregate_metrics(&self, session_id: &SessionId) -> Result<AgentMetrics, StoreError> {
        self.db.with_conn(|conn| {
            let (input, output, cost): (i64, i64, f64) = conn.query_row(
                "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cost_cents), 0.0)
                 FROM agents WHERE session_id = ?1",
                [session_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(AgentMetrics {
                input_tokens: input as u64,
                output_tokens: output as u64,
                cost_cents: cost,
            })
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let status_str: String = row_helpers::get(row, 4, "sessions", "status")?;
    let metadata_raw: String = row_helpers::get(row, 5, "sessions", "metadata")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        tenant_id: row_helpers::get_opt(row, 1, "sessions", "tenant_id")?,
        working_dir: row_helpers::get(row, 2, "sessions", "working_dir")?,
        provider_config: row_helpers::get_opt(row, 3, "sessions", "provider_config")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        metadata: row_helpers::parse_json(&metadata_raw, "sessions", "metadata")?,
        created_at: row_helpers::get(row, 6, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 7, "sessions", "updated_at")?,
        archived_at: row_helpers::get_opt(row, 8, "sessions", "archived_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn create_session_is_active() {
        let repo = repo();
        let session = repo
            .create(Some("tenant-a"), "/workspace/proj", None, serde_json::json!({}))
            .unwrap();
        assert!(session.id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.archived_at.is_none());
    }

    #[test]
    fn create_rejects_bad_tenant_id() {
        let repo = repo();
        let result = repo.create(Some("bad tenant!"), "/w", None, serde_json::json!({}));
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
    }

    #[test]
    fn get_roundtrips_metadata() {
        let repo = repo();
        let meta = serde_json::json!({"purpose": "qa", "priority": 2});
        let session = repo.create(None, "/w", Some("openai"), meta.clone()).unwrap();
        let fetched = repo.get(&session.id).unwrap();
        assert_eq!(fetched.metadata, meta);
        assert_eq!(fetched.provider_config.as_deref(), Some("openai"));
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = repo();
        let result = repo.get(&SessionId::from_raw("sess_nonexistent"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_excludes_archived_by_default() {
        let repo = repo();
        let s1 = repo.create(None, "/a", None, serde_json::json!({})).unwrap();
        repo.create(None, "/b", None, serde_json::json!({})).unwrap();
        repo.set_archived(&s1.id).unwrap();

        let visible = repo.list(None, None, false, 100, 0).unwrap();
        assert_eq!(visible.len(), 1);

        let all = repo.list(None, None, true, 100, 0).unwrap();
        assert_eq!(all.len(), 2);

        // Still retrievable directly, with archived_at set
        let archived = repo.get(&s1.id).unwrap();
        assert!(archived.archived_at.is_some());
    }

    #[test]
    fn list_filters_by_tenant() {
        let repo = repo();
        repo.create(Some("t1"), "/a", None, serde_json::json!({})).unwrap();
        repo.create(Some("t2"), "/b", None, serde_json::json!({})).unwrap();
        let t1 = repo.list(Some("t1"), None, false, 100, 0).unwrap();
        assert_eq!(t1.len(), 1);
    }

    #[test]
    fn list_pagination() {
        let repo = repo();
        for _ in 0..5 {
            repo.create(None, "/w", None, serde_json::json!({})).unwrap();
        }
        assert_eq!(repo.list(None, None, false, 2, 0).unwrap().len(), 2);
        assert_eq!(repo.list(None, None, false, 2, 4).unwrap().len(), 1);
    }

    #[test]
    fn update_status_lifecycle() {
        let repo = repo();
        let session = repo.create(None, "/w", None, serde_json::json!({})).unwrap();
        repo.update_status(&session.id, SessionStatus::Terminating).unwrap();
        assert_eq!(repo.get(&session.id).unwrap().status, SessionStatus::Terminating);
        repo.update_status(&session.id, SessionStatus::Completed).unwrap();
        assert_eq!(repo.get(&session.id).unwrap().status, SessionStatus::Completed);
    }

    #[test]
    fn update_status_unknown_session_fails() {
        let repo = repo();
        let result =
            repo.update_status(&SessionId::from_raw("sess_missing"), SessionStatus::Completed);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn idle_before_finds_stale_sessions() {
        let repo = repo();
        let session = repo.create(None, "/w", None, serde_json::json!({})).unwrap();
        let future = (Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        let idle = repo.idle_before(&future).unwrap();
        assert_eq!(idle, vec![session.id.clone()]);

        // Archived sessions drop out of the idle scan
        repo.set_archived(&session.id).unwrap();
        let idle = repo.idle_before(&future).unwrap();
        assert!(idle.is_empty());
    }

    #[test]
    fn aggregate_metrics_empty_roster_is_zero() {
        let repo = repo();
        let session = repo.create(None, "/w", None, serde_json::json!({})).unwrap();
        let metrics = repo.aggregate_metrics(&session.id).unwrap();
        assert_eq!(metrics.input_tokens, 0);
        assert_eq!(metrics.cost_cents, 0.0);
    }
}
