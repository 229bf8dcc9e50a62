use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{instrument, warn};

use rozet_core::events::ControlEvent;
use rozet_core::ids::SessionId;
use rozet_core::metrics::AgentMetrics;
use rozet_core::status::{AgentStatus, OperationStatus, SessionStatus};
use rozet_core::ApiError;
use rozet_store::agents::{AgentRepo, AgentRow};
use rozet_store::artifacts::ArtifactRepo;
use rozet_store::operations::OperationRow;
use rozet_store::sessions::{SessionRepo, SessionRow};
use rozet_store::Database;

use crate::engine::ExecutionEngine;
use crate::error::store_to_api;
use crate::hub::EventHub;
use crate::tracker::OperationTracker;

/// How long to wait for an engine interrupt acknowledgement per agent.
const INTERRUPT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: SessionRow,
    pub agents: Vec<AgentRow>,
    pub metrics: AgentMetrics,
}

pub struct SessionManager {
    sessions: SessionRepo,
    agents: AgentRepo,
    artifacts: ArtifactRepo,
    tracker: Arc<OperationTracker>,
    hub: Arc<EventHub>,
    engine: Arc<dyn ExecutionEngine>,
    workspace_root: PathBuf,
}

impl SessionManager {
    pub fn new(
        db: Database,
        tracker: Arc<OperationTracker>,
        hub: Arc<EventHub>,
        engine: Arc<dyn ExecutionEngine>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            agents: AgentRepo::new(db.clone()),
            artifacts: ArtifactRepo::new(db),
            tracker,
            hub,
            engine,
            workspace_root,
        }
    }

    /// Synchronous create: path containment is the only slow check.
    #[instrument(skip(self, metadata), fields(tenant_id, working_dir))]
    pub fn create(
        &self,
        tenant_id: Option<&str>,
        working_dir: &str,
        provider_config: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<SessionRow, ApiError> {
        let resolved = resolve_working_dir(&self.workspace_root, working_dir)?;
        let row = self
            .sessions
            .create(
                tenant_id,
                &resolved.to_string_lossy(),
                provider_config,
                metadata,
            )
            .map_err(store_to_api)?;

        self.hub.publish(ControlEvent::SessionCreated {
            session_id: row.id.clone(),
        });
        Ok(row)
    }

    pub fn list(
        &self,
        tenant_id: Option<&str>,
        status: Option<SessionStatus>,
        include_archived: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SessionRow>, ApiError> {
        self.sessions
            .list(tenant_id, status, include_archived, limit, offset)
            .map_err(store_to_api)
    }

    /// Detail view: roster plus aggregate metrics. Archived sessions stay
    /// retrievable here with `archived_at` populated.
    pub fn get(&self, id: &SessionId) -> Result<SessionDetail, ApiError> {
        let session = self.sessions.get(id).map_err(store_to_api)?;
        let agents = self.agents.list_for_session(id).map_err(store_to_api)?;
        let metrics = self.sessions.aggregate_metrics(id).map_err(store_to_api)?;
        Ok(SessionDetail {
            session,
            agents,
            metrics,
        })
    }

    /// Async terminate: 202 contract. Flips to Terminating, then a background
    /// task interrupts every agent, completes the session, chills its
    /// artifacts, and resolves the operation.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn terminate(
        self: &Arc<Self>,
        id: &SessionId,
        reason: Option<String>,
    ) -> Result<OperationRow, ApiError> {
        let session = self.sessions.get(id).map_err(store_to_api)?;
        if session.status != SessionStatus::Active {
            return Err(ApiError::Conflict(format!(
                "session {id} is {}, not active",
                session.status
            )));
        }

        let op = self.tracker.create(id, "session.terminate", Some(id.as_str()))?;
        self.sessions
            .update_status(id, SessionStatus::Terminating)
            .map_err(store_to_api)?;
        self.hub.publish(ControlEvent::SessionTerminating {
            session_id: id.clone(),
            reason,
        });

        let manager = Arc::clone(self);
        let session_id = id.clone();
        let op_id = op.id.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.drive_termination(&session_id, &op_id).await {
                warn!(session_id = %session_id, error = %e, "session termination failed");
            }
        });
        Ok(op)
    }

    async fn drive_termination(
        &self,
        session_id: &SessionId,
        op_id: &rozet_core::ids::OperationId,
    ) -> Result<(), ApiError> {
        self.tracker
            .transition(op_id, OperationStatus::Running, None, None)?;

        let roster = self
            .agents
            .list_for_session(session_id)
            .map_err(store_to_api)?;
        let mut failures = Vec::new();

        for agent in roster {
            if agent.status == AgentStatus::Stopped {
                continue;
            }
            self.hub.publish(ControlEvent::AgentStopping {
                session_id: session_id.clone(),
                agent_id: agent.id.clone(),
                reason: Some("session terminating".into()),
            });
            let interrupt = tokio::time::timeout(
                INTERRUPT_ACK_TIMEOUT,
                self.engine.interrupt_agent(session_id, &agent.id),
            )
            .await;
            match interrupt {
                Ok(Ok(())) => {
                    self.agents
                        .update_status(&agent.id, AgentStatus::Stopped)
                        .map_err(store_to_api)?;
                    self.hub.publish(ControlEvent::AgentStopped {
                        session_id: session_id.clone(),
                        agent_id: agent.id.clone(),
                    });
                }
                Ok(Err(e)) => failures.push(format!("agent {}: {e}", agent.id)),
                Err(_) => failures.push(format!("agent {}: interrupt ack timed out", agent.id)),
            }
        }

        if !failures.is_empty() {
            // Session stays Terminating so an operator retry can finish the job.
            self.tracker.transition(
                op_id,
                OperationStatus::Failed,
                None,
                Some(ApiError::Orchestrator(failures.join("; ")).to_payload()),
            )?;
            return Ok(());
        }

        self.sessions
            .update_status(session_id, SessionStatus::Completed)
            .map_err(store_to_api)?;
        self.artifacts
            .move_to_cold(session_id)
            .map_err(store_to_api)?;
        self.hub.publish(ControlEvent::SessionTerminated {
            session_id: session_id.clone(),
        });
        self.tracker.transition(
            op_id,
            OperationStatus::Succeeded,
            Some(serde_json::json!({ "session_id": session_id.as_str() })),
            None,
        )?;
        Ok(())
    }
}

/// Lexically resolve `requested` against the workspace root. Relative paths
/// join the root; traversal escaping the root is rejected.
fn resolve_working_dir(root: &Path, requested: &str) -> Result<PathBuf, ApiError> {
    if requested.is_empty() {
        return Err(ApiError::Validation("working_dir must not be empty".into()));
    }
    let candidate = {
        let p = Path::new(requested);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };

    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ApiError::Validation(format!(
                        "working_dir {requested} escapes the workspace root"
                    )));
                }
            }
            other => normalized.push(other),
        }
    }

    if !normalized.starts_with(root) {
        return Err(ApiError::Validation(format!(
            "working_dir {requested} is outside the workspace root"
        )));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoopEngine;

    fn manager() -> Arc<SessionManager> {
        let db = Database::in_memory().unwrap();
        let hub = EventHub::start(64, None);
        let tracker = Arc::new(OperationTracker::new(db.clone(), Arc::clone(&hub)));
        Arc::new(SessionManager::new(
            db,
            tracker,
            hub,
            Arc::new(NoopEngine),
            PathBuf::from("/workspaces"),
        ))
    }

    #[test]
    fn resolve_accepts_paths_under_root() {
        let root = Path::new("/workspaces");
        assert_eq!(
            resolve_working_dir(root, "proj/a").unwrap(),
            PathBuf::from("/workspaces/proj/a")
        );
        assert_eq!(
            resolve_working_dir(root, "/workspaces/proj/./b").unwrap(),
            PathBuf::from("/workspaces/proj/b")
        );
    }

    #[test]
    fn resolve_rejects_traversal() {
        let root = Path::new("/workspaces");
        assert!(resolve_working_dir(root, "../etc").is_err());
        assert!(resolve_working_dir(root, "/workspaces/../etc/passwd").is_err());
        assert!(resolve_working_dir(root, "/etc/passwd").is_err());
        assert!(resolve_working_dir(root, "proj/../../other").is_err());
    }

    #[tokio::test]
    async fn create_validates_and_persists() {
        let mgr = manager();
        let row = mgr
            .create(Some("acme"), "proj", None, serde_json::json!({"k": 1}))
            .unwrap();
        assert_eq!(row.status, SessionStatus::Active);
        assert_eq!(row.working_dir, "/workspaces/proj");

        let err = mgr
            .create(None, "../outside", None, serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn get_returns_roster_and_metrics() {
        let mgr = manager();
        let session = mgr.create(None, "p", None, serde_json::json!({})).unwrap();
        mgr.agents
            .create(&session.id, "scout", None, "m-1", Default::default(), None)
            .unwrap();

        let detail = mgr.get(&session.id).unwrap();
        assert_eq!(detail.agents.len(), 1);
        assert_eq!(detail.metrics.input_tokens, 0);
    }

    #[tokio::test]
    async fn terminate_drives_to_completed() {
        let mgr = manager();
        let session = mgr.create(None, "p", None, serde_json::json!({})).unwrap();
        mgr.agents
            .create(&session.id, "scout", None, "m-1", Default::default(), None)
            .unwrap();

        let op = mgr.terminate(&session.id, Some("test".into())).unwrap();
        assert_eq!(op.status, OperationStatus::Queued);

        match mgr
            .tracker
            .wait(&session.id, &op.id, Some(Duration::from_secs(5)))
            .await
            .unwrap()
        {
            crate::tracker::WaitOutcome::Completed(row) => {
                assert_eq!(row.status, OperationStatus::Succeeded)
            }
            other => panic!("termination did not resolve: {other:?}"),
        }

        let detail = mgr.get(&session.id).unwrap();
        assert_eq!(detail.session.status, SessionStatus::Completed);
        assert!(detail
            .agents
            .iter()
            .all(|a| a.status == AgentStatus::Stopped));
    }

    #[tokio::test]
    async fn terminate_twice_is_conflict() {
        let mgr = manager();
        let session = mgr.create(None, "p", None, serde_json::json!({})).unwrap();
        mgr.terminate(&session.id, None).unwrap();
        let err = mgr.terminate(&session.id, None).unwrap_err();
        assert_eq!(err.code(), "RESOURCE_CONFLICT");
    }
}
