use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{instrument, warn};

use rozet_core::capability::CapabilitySet;
use rozet_core::events::ControlEvent;
use rozet_core::ids::{AgentId, SessionId};
use rozet_core::status::{AgentStatus, OperationStatus, SessionStatus};
use rozet_core::ApiError;
use rozet_store::agents::{AgentRepo, AgentRow};
use rozet_store::operations::OperationRow;
use rozet_store::sessions::SessionRepo;
use rozet_store::Database;

use crate::engine::ExecutionEngine;
use crate::error::store_to_api;
use crate::hub::EventHub;
use crate::tracker::OperationTracker;

const INTERRUPT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AgentRegistry {
    agents: AgentRepo,
    sessions: SessionRepo,
    tracker: Arc<OperationTracker>,
    hub: Arc<EventHub>,
    engine: Arc<dyn ExecutionEngine>,
    /// Serializes concurrent creates within one session so the dup-name
    /// pre-check and the insert act as one step.
    creation_locks: DashMap<SessionId, Arc<tokio::sync::Mutex<()>>>,
}

impl AgentRegistry {
    pub fn new(
        db: Database,
        tracker: Arc<OperationTracker>,
        hub: Arc<EventHub>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            agents: AgentRepo::new(db.clone()),
            sessions: SessionRepo::new(db),
            tracker,
            hub,
            engine,
            creation_locks: DashMap::new(),
        }
    }

    #[instrument(skip(self, system_prompt), fields(session_id = %session_id, name))]
    pub async fn create(
        &self,
        session_id: &SessionId,
        name: &str,
        system_prompt: Option<&str>,
        model: &str,
        capabilities: CapabilitySet,
        max_context: Option<i64>,
    ) -> Result<AgentRow, ApiError> {
        let session = self.sessions.get(session_id).map_err(store_to_api)?;
        if session.status != SessionStatus::Active {
            return Err(ApiError::Conflict(format!(
                "session {session_id} is {}, agents can only join active sessions",
                session.status
            )));
        }

        let lock = self
            .creation_locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let row = self
            .agents
            .create(session_id, name, system_prompt, model, capabilities, max_context)
            .map_err(store_to_api)?;

        self.hub.publish(ControlEvent::AgentCreated {
            session_id: session_id.clone(),
            agent_id: row.id.clone(),
            name: row.name.clone(),
        });
        Ok(row)
    }

    pub fn get(&self, session_id: &SessionId, agent_id: &AgentId) -> Result<AgentRow, ApiError> {
        self.agents.get(session_id, agent_id).map_err(store_to_api)
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<AgentRow>, ApiError> {
        self.agents.list_for_session(session_id).map_err(store_to_api)
    }

    /// Async stop: 202 contract. `agent.stopping` always precedes
    /// `agent.stopped`.
    #[instrument(skip(self), fields(session_id = %session_id, agent_id = %agent_id))]
    pub fn delete(
        self: &Arc<Self>,
        session_id: &SessionId,
        agent_id: &AgentId,
        reason: Option<String>,
    ) -> Result<OperationRow, ApiError> {
        let agent = self.agents.get(session_id, agent_id).map_err(store_to_api)?;
        if agent.status == AgentStatus::Stopped {
            return Err(ApiError::Conflict(format!("agent {agent_id} already stopped")));
        }

        let op = self
            .tracker
            .create(session_id, "agent.stop", Some(agent_id.as_str()))?;
        self.hub.publish(ControlEvent::AgentStopping {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            reason,
        });

        let registry = Arc::clone(self);
        let session_id = session_id.clone();
        let agent_id = agent_id.clone();
        let op_id = op.id.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.drive_stop(&session_id, &agent_id, &op_id).await {
                warn!(agent_id = %agent_id, error = %e, "agent stop failed");
            }
        });
        Ok(op)
    }

    async fn drive_stop(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        op_id: &rozet_core::ids::OperationId,
    ) -> Result<(), ApiError> {
        self.tracker
            .transition(op_id, OperationStatus::Running, None, None)?;

        let interrupt = tokio::time::timeout(
            INTERRUPT_ACK_TIMEOUT,
            self.engine.interrupt_agent(session_id, agent_id),
        )
        .await;
        let failure = match interrupt {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("interrupt ack timed out".into()),
        };

        if let Some(detail) = failure {
            self.agents
                .update_status(agent_id, AgentStatus::Error)
                .map_err(store_to_api)?;
            self.tracker.transition(
                op_id,
                OperationStatus::Failed,
                None,
                Some(ApiError::Orchestrator(detail).to_payload()),
            )?;
            return Ok(());
        }

        self.agents
            .update_status(agent_id, AgentStatus::Stopped)
            .map_err(store_to_api)?;
        self.hub.publish(ControlEvent::AgentStopped {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
        });
        self.tracker.transition(
            op_id,
            OperationStatus::Succeeded,
            Some(serde_json::json!({ "agent_id": agent_id.as_str() })),
            None,
        )?;
        Ok(())
    }
}
