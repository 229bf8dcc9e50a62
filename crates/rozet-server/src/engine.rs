use async_trait::async_trait;

use rozet_core::ids::{AgentId, SessionId, TaskId};
use rozet_core::metrics::AgentMetrics;
use rozet_store::tasks::TaskSpec;

/// Outcome reported by the engine when a command or task finishes.
#[derive(Clone, Debug, Default)]
pub struct EngineReport {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub log: Option<String>,
    pub metrics: Option<AgentMetrics>,
}

impl EngineReport {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failure(error: serde_json::Value) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Seam between the control plane and whatever actually runs the work.
/// An `Err` from execute_* means the handoff itself failed; the dispatcher
/// records it as an orchestrator failure on the wrapping operation.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    async fn execute_command(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        command: &str,
        arguments: Option<&serde_json::Value>,
    ) -> anyhow::Result<EngineReport>;

    async fn execute_task(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        description: &str,
        spec: Option<&TaskSpec>,
    ) -> anyhow::Result<EngineReport>;

    /// Stop whatever the agent is doing. Must return once the interrupt is
    /// acknowledged, not once the work has fully unwound.
    async fn interrupt_agent(&self, session_id: &SessionId, agent_id: &AgentId)
        -> anyhow::Result<()>;

    async fn cancel_task(&self, session_id: &SessionId, task_id: &TaskId) -> anyhow::Result<()>;
}

/// Engine that acknowledges everything immediately. Wired in by the binary
/// until a real orchestrator lands; also handy as a test baseline.
pub struct NoopEngine;

#[async_trait]
impl ExecutionEngine for NoopEngine {
    async fn execute_command(
        &self,
        _session_id: &SessionId,
        _agent_id: &AgentId,
        command: &str,
        _arguments: Option<&serde_json::Value>,
    ) -> anyhow::Result<EngineReport> {
        Ok(EngineReport::success(
            serde_json::json!({ "acknowledged": command }),
        ))
    }

    async fn execute_task(
        &self,
        _session_id: &SessionId,
        _task_id: &TaskId,
        description: &str,
        _spec: Option<&TaskSpec>,
    ) -> anyhow::Result<EngineReport> {
        Ok(EngineReport::success(
            serde_json::json!({ "acknowledged": description }),
        ))
    }

    async fn interrupt_agent(
        &self,
        _session_id: &SessionId,
        _agent_id: &AgentId,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cancel_task(&self, _session_id: &SessionId, _task_id: &TaskId) -> anyhow::Result<()> {
        Ok(())
    }
}
