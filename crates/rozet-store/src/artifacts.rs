use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use rozet_core::ids::{AgentId, ArtifactId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Per-tenant storage budget. Creation past this is rejected outright rather
/// than queued, so callers get immediate back-pressure.
pub const DEFAULT_TENANT_QUOTA_BYTES: i64 = 10 * 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactTier {
    Hot,
    Cold,
}

impl std::fmt::Display for ArtifactTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ArtifactTier::Hot => "hot",
            ArtifactTier::Cold => "cold",
        })
    }
}

impl std::str::FromStr for ArtifactTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(ArtifactTier::Hot),
            "cold" => Ok(ArtifactTier::Cold),
            other => Err(format!("unknown artifact tier: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub id: ArtifactId,
    pub session_id: SessionId,
    pub agent_id: Option<AgentId>,
    pub path: String,
    pub storage_url: Option<String>,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub tier: ArtifactTier,
    pub cold_since: Option<String>,
    pub force_retain: bool,
    pub created_at: String,
}

pub struct ArtifactRepo {
    db: Database,
    quota_bytes: i64,
}

const SELECT_COLS: &str = "id, session_id, agent_id, path, storage_url, size_bytes, \
                           content_type, tier, cold_since, force_retain, created_at";

impl ArtifactRepo {
    pub fn new(db: Database) -> Self {
        Self::with_quota(db, DEFAULT_TENANT_QUOTA_BYTES)
    }

    pub fn with_quota(db: Database, quota_bytes: i64) -> Self {
        Self { db, quota_bytes }
    }

    /// Create an artifact in the hot tier, enforcing the tenant quota.
    #[instrument(skip(self), fields(session_id = %session_id, path, size_bytes))]
    pub fn create(
        &self,
        session_id: &SessionId,
        agent_id: Option<&AgentId>,
        path: &str,
        storage_url: Option<&str>,
        size_bytes: i64,
        content_type: Option<&str>,
    ) -> Result<ArtifactRow, StoreError> {
        let id = ArtifactId::new();
        let now = Utc::now().to_rfc3339();
        let quota = self.quota_bytes;

        self.db.with_conn(|conn| {
            // Usage is summed across every session of the owning tenant, so a
            // tenant cannot dodge the budget by spreading artifacts out.
            let used: i64 = conn.query_row(
                "SELECT COALESCE(SUM(a.size_bytes), 0)
                 FROM artifacts a
                 JOIN sessions s ON s.id = a.session_id
                 WHERE s.tenant_id IS (SELECT tenant_id FROM sessions WHERE id = ?1)",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            if used + size_bytes > quota {
                return Err(StoreError::QuotaExceeded(format!(
                    "tenant storage quota exceeded: {used} + {size_bytes} > {quota} bytes"
                )));
            }

            conn.execute(
                "INSERT INTO artifacts (id, session_id, agent_id, path, storage_url, size_bytes, content_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    session_id.as_str(),
                    agent_id.map(|a| a.as_str()),
                    path,
                    storage_url,
                    size_bytes,
                    content_type,
                    now,
                ],
            )?;

            Ok(ArtifactRow {
                id,
                session_id: session_id.clone(),
                agent_id: agent_id.cloned(),
                path: path.to_string(),
                storage_url: storage_url.map(String::from),
                size_bytes,
                content_type: content_type.map(String::from),
                tier: ArtifactTier::Hot,
                cold_since: None,
                force_retain: false,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, artifact_id = %id))]
    pub fn get(&self, session_id: &SessionId, id: &ArtifactId) -> Result<ArtifactRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM artifacts WHERE id = ?1 AND session_id = ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), session_id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_artifact(row),
                None => Err(StoreError::NotFound(format!("artifact {id}"))),
            }
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(&self, session_id: &SessionId) -> Result<Vec<ArtifactRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM artifacts WHERE session_id = ?1 ORDER BY created_at DESC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_artifact(row)?);
            }
            Ok(results)
        })
    }

    /// Demote every hot artifact of a session to cold. Runs at session
    /// completion and again from the retention sweep for archived sessions.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn move_to_cold(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE artifacts SET tier = 'cold', cold_since = ?1
                 WHERE session_id = ?2 AND tier = 'hot'",
                rusqlite::params![now, session_id.as_str()],
            )?;
            Ok(changed)
        })
    }

    /// Delete cold artifacts past the window. Force-retained rows survive.
    #[instrument(skip(self))]
    pub fn purge_cold(&self, cutoff: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM artifacts
                 WHERE tier = 'cold' AND cold_since < ?1 AND force_retain = 0",
                [cutoff],
            )?;
            Ok(deleted)
        })
    }

    #[instrument(skip(self), fields(artifact_id = %id, retain))]
    pub fn set_force_retain(&self, id: &ArtifactId, retain: bool) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE artifacts SET force_retain = ?1 WHERE id = ?2",
                rusqlite::params![retain as i64, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("artifact {id}")));
            }
            Ok(())
        })
    }

    /// Delete one artifact. Force-retained rows refuse unless `force` is set.
    #[instrument(skip(self), fields(session_id = %session_id, artifact_id = %id, force))]
    pub fn delete(
        &self,
        session_id: &SessionId,
        id: &ArtifactId,
        force: bool,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let retained: Option<i64> = conn
                .query_row(
                    "SELECT force_retain FROM artifacts WHERE id = ?1 AND session_id = ?2",
                    rusqlite::params![id.as_str(), session_id.as_str()],
                    |row| row.get(0),
                )
                .ok();
            match retained {
                None => Err(StoreError::NotFound(format!("artifact {id}"))),
                Some(1) if !force => Err(StoreError::Conflict(format!(
                    "artifact {id} is force-retained, pass force=true to delete"
                ))),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM artifacts WHERE id = ?1 AND session_id = ?2",
                        rusqlite::params![id.as_str(), session_id.as_str()],
                    )?;
                    Ok(())
                }
            }
        })
    }
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> Result<ArtifactRow, StoreError> {
    let tier_str: String = row_helpers::get(row, 7, "artifacts", "tier")?;
    let force_retain: i64 = row_helpers::get(row, 9, "artifacts", "force_retain")?;

    Ok(ArtifactRow {
        id: ArtifactId::from_raw(row_helpers::get::<String>(row, 0, "artifacts", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "artifacts", "session_id")?),
        agent_id: row_helpers::get_opt::<String>(row, 2, "artifacts", "agent_id")?.map(AgentId::from_raw),
        path: row_helpers::get(row, 3, "artifacts", "path")?,
        storage_url: row_helpers::get_opt(row, 4, "artifacts", "storage_url")?,
        size_bytes: row_helpers::get(row, 5, "artifacts", "size_bytes")?,
        content_type: row_helpers::get_opt(row, 6, "artifacts", "content_type")?,
        tier: row_helpers::parse_enum(&tier_str, "artifacts", "tier")?,
        cold_since: row_helpers::get_opt(row, 8, "artifacts", "cold_since")?,
        force_retain: force_retain != 0,
        created_at: row_helpers::get(row, 10, "artifacts", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone())
            .create(Some("acme"), "/w", None, serde_json::json!({}))
            .unwrap();
        (db, session.id)
    }

    #[test]
    fn create_hot_artifact() {
        let (db, sid) = setup();
        let repo = ArtifactRepo::new(db);
        let art = repo
            .create(&sid, None, "out/report.md", None, 512, Some("text/markdown"))
            .unwrap();
        assert!(art.id.as_str().starts_with("art_"));
        assert_eq!(art.tier, ArtifactTier::Hot);
        assert!(!art.force_retain);
    }

    #[test]
    fn quota_rejects_before_write() {
        let (db, sid) = setup();
        let repo = ArtifactRepo::with_quota(db, 1000);
        repo.create(&sid, None, "a", None, 600, None).unwrap();

        let over = repo.create(&sid, None, "b", None, 500, None);
        assert!(matches!(over, Err(StoreError::QuotaExceeded(_))));
        assert_eq!(repo.list_for_session(&sid).unwrap().len(), 1);
    }

    #[test]
    fn quota_spans_sessions_of_one_tenant() {
        let (db, sid) = setup();
        let other = SessionRepo::new(db.clone())
            .create(Some("acme"), "/w2", None, serde_json::json!({}))
            .unwrap()
            .id;
        let repo = ArtifactRepo::with_quota(db, 1000);
        repo.create(&sid, None, "a", None, 600, None).unwrap();

        let over = repo.create(&other, None, "b", None, 500, None);
        assert!(matches!(over, Err(StoreError::QuotaExceeded(_))));
    }

    #[test]
    fn move_to_cold_then_purge() {
        let (db, sid) = setup();
        let repo = ArtifactRepo::new(db);
        repo.create(&sid, None, "a", None, 10, None).unwrap();
        let kept = repo.create(&sid, None, "b", None, 10, None).unwrap();
        repo.set_force_retain(&kept.id, true).unwrap();

        assert_eq!(repo.move_to_cold(&sid).unwrap(), 2);
        let cold = repo.list_for_session(&sid).unwrap();
        assert!(cold.iter().all(|a| a.tier == ArtifactTier::Cold && a.cold_since.is_some()));

        // cutoff in the future: everything cold is past the window
        let cutoff = (Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        assert_eq!(repo.purge_cold(&cutoff).unwrap(), 1);
        let remaining = repo.list_for_session(&sid).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);
    }

    #[test]
    fn delete_respects_force_retain() {
        let (db, sid) = setup();
        let repo = ArtifactRepo::new(db);
        let art = repo.create(&sid, None, "a", None, 10, None).unwrap();
        repo.set_force_retain(&art.id, true).unwrap();

        assert!(matches!(
            repo.delete(&sid, &art.id, false),
            Err(StoreError::Conflict(_))
        ));
        repo.delete(&sid, &art.id, true).unwrap();
        assert!(matches!(repo.get(&sid, &art.id), Err(StoreError::NotFound(_))));
    }
}
