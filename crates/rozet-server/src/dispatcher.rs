use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, instrument, warn};

use rozet_core::events::ControlEvent;
use rozet_core::ids::{AgentId, CommandId, OperationId, SessionId, TaskId};
use rozet_core::status::{AgentStatus, CommandStatus, OperationStatus, SessionStatus, TaskStatus};
use rozet_core::ApiError;
use rozet_store::agents::AgentRepo;
use rozet_store::commands::{CommandRepo, CommandRow};
use rozet_store::operations::{OperationRepo, OperationRow};
use rozet_store::sessions::SessionRepo;
use rozet_store::tasks::{TaskRepo, TaskRow, TaskSpec};
use rozet_store::Database;

use crate::engine::{EngineReport, ExecutionEngine};
use crate::error::store_to_api;
use crate::hub::EventHub;
use crate::tracker::OperationTracker;

/// Routes accepted work to the execution engine and owns the bookkeeping
/// around it: agent busy-state, command/task rows, wrapping operations,
/// lifecycle events.
pub struct Dispatcher {
    sessions: SessionRepo,
    agents: AgentRepo,
    commands: CommandRepo,
    tasks: TaskRepo,
    operations: OperationRepo,
    tracker: Arc<OperationTracker>,
    hub: Arc<EventHub>,
    engine: Arc<dyn ExecutionEngine>,
    /// Operation wrapping each in-flight task, for the cancel path.
    task_ops: DashMap<TaskId, OperationId>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        tracker: Arc<OperationTracker>,
        hub: Arc<EventHub>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            agents: AgentRepo::new(db.clone()),
            commands: CommandRepo::new(db.clone()),
            tasks: TaskRepo::new(db.clone()),
            operations: OperationRepo::new(db),
            tracker,
            hub,
            engine,
            task_ops: DashMap::new(),
        }
    }

    fn require_active_session(&self, session_id: &SessionId) -> Result<(), ApiError> {
        let session = self.sessions.get(session_id).map_err(store_to_api)?;
        if session.status != SessionStatus::Active {
            return Err(ApiError::Conflict(format!(
                "session {session_id} is {}, not accepting new work",
                session.status
            )));
        }
        Ok(())
    }

    /// Dispatch a command to an idle agent. Persistence order is fixed: agent
    /// marked Executing, command row, operation row, `command.queued` event.
    #[instrument(skip(self, arguments), fields(session_id = %session_id, agent_id = %agent_id, command))]
    pub fn command(
        self: &Arc<Self>,
        session_id: &SessionId,
        agent_id: &AgentId,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<(CommandRow, OperationRow), ApiError> {
        self.require_active_session(session_id)?;

        let agent = self.agents.get(session_id, agent_id).map_err(store_to_api)?;
        if agent.status != AgentStatus::Idle {
            return Err(ApiError::AgentBusy(format!(
                "agent {agent_id} is {}",
                agent.status
            )));
        }

        self.agents
            .update_status(agent_id, AgentStatus::Executing)
            .map_err(store_to_api)?;
        let cmd = self
            .commands
            .create(session_id, agent_id, command, arguments.clone())
            .map_err(store_to_api)?;
        self.agents
            .set_current_command(agent_id, Some(&cmd.id))
            .map_err(store_to_api)?;
        let op = self
            .tracker
            .create(session_id, "command.dispatch", Some(cmd.id.as_str()))?;

        self.hub.publish(ControlEvent::CommandQueued {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            command_id: cmd.id.clone(),
            command: command.to_string(),
        });

        let dispatcher = Arc::clone(self);
        let sid = session_id.clone();
        let aid = agent_id.clone();
        let cmd_id = cmd.id.clone();
        let op_id = op.id.clone();
        let command = command.to_string();
        tokio::spawn(async move {
            dispatcher
                .run_command(&sid, &aid, &cmd_id, &op_id, &command, arguments)
                .await;
        });

        Ok((cmd, op))
    }

    async fn run_command(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        command_id: &CommandId,
        op_id: &OperationId,
        command: &str,
        arguments: Option<serde_json::Value>,
    ) {
        if let Err(e) = self.start_command(session_id, agent_id, command_id, op_id) {
            warn!(command_id = %command_id, error = %e, "command start failed");
            return;
        }

        let report = match self
            .engine
            .execute_command(session_id, agent_id, command, arguments.as_ref())
            .await
        {
            Ok(report) => report,
            Err(e) => EngineReport::failure(ApiError::Orchestrator(e.to_string()).to_payload()),
        };

        if let Err(e) = self.finish_command(session_id, agent_id, command_id, op_id, report) {
            warn!(command_id = %command_id, error = %e, "command completion failed");
        }
    }

    fn start_command(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        command_id: &CommandId,
        op_id: &OperationId,
    ) -> Result<(), ApiError> {
        self.commands.mark_running(command_id).map_err(store_to_api)?;
        self.tracker
            .transition(op_id, OperationStatus::Running, None, None)?;
        self.hub.publish(ControlEvent::CommandUpdate {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            command_id: command_id.clone(),
            status: CommandStatus::Running,
        });
        Ok(())
    }

    /// Command and operation resolve in one store transaction; the agent
    /// then returns to Idle no matter which way it went.
    fn finish_command(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        command_id: &CommandId,
        op_id: &OperationId,
        report: EngineReport,
    ) -> Result<(), ApiError> {
        let status = if report.success {
            CommandStatus::Succeeded
        } else {
            CommandStatus::Failed
        };

        let op_row = self
            .operations
            .complete_with_command(
                op_id,
                command_id,
                status,
                report.result,
                report.error,
                report.log.as_deref(),
            )
            .map_err(store_to_api)?;

        if let Some(delta) = &report.metrics {
            self.agents.record_metrics(agent_id, delta).map_err(store_to_api)?;
        }
        self.agents
            .set_current_command(agent_id, None)
            .map_err(store_to_api)?;
        self.agents
            .update_status(agent_id, AgentStatus::Idle)
            .map_err(store_to_api)?;

        self.hub.publish(ControlEvent::CommandUpdate {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            command_id: command_id.clone(),
            status,
        });
        self.tracker.notify(&op_row);
        Ok(())
    }

    pub fn get_command(
        &self,
        session_id: &SessionId,
        id: &CommandId,
    ) -> Result<CommandRow, ApiError> {
        self.commands.get(session_id, id).map_err(store_to_api)
    }

    /// Session-granular task with the same 202 contract as commands.
    #[instrument(skip(self, spec), fields(session_id = %session_id))]
    pub fn task(
        self: &Arc<Self>,
        session_id: &SessionId,
        description: &str,
        spec: Option<TaskSpec>,
    ) -> Result<(TaskRow, OperationRow), ApiError> {
        self.require_active_session(session_id)?;

        let task = self
            .tasks
            .create(session_id, description, spec.clone())
            .map_err(store_to_api)?;
        let op = self
            .tracker
            .create(session_id, "task.run", Some(task.id.as_str()))?;
        self.task_ops.insert(task.id.clone(), op.id.clone());

        self.hub.publish(ControlEvent::TaskCreated {
            session_id: session_id.clone(),
            task_id: task.id.clone(),
        });

        let dispatcher = Arc::clone(self);
        let sid = session_id.clone();
        let task_id = task.id.clone();
        let op_id = op.id.clone();
        let description = description.to_string();
        tokio::spawn(async move {
            dispatcher
                .run_task(&sid, &task_id, &op_id, &description, spec)
                .await;
        });

        Ok((task, op))
    }

    async fn run_task(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        op_id: &OperationId,
        description: &str,
        spec: Option<TaskSpec>,
    ) {
        if let Err(e) = self.start_task(session_id, task_id, op_id) {
            // A cancel can land before the task ever starts; that is normal.
            debug!(task_id = %task_id, error = %e, "task start skipped");
            self.task_ops.remove(task_id);
            return;
        }

        let report = match self
            .engine
            .execute_task(session_id, task_id, description, spec.as_ref())
            .await
        {
            Ok(report) => report,
            Err(e) => EngineReport::failure(ApiError::Orchestrator(e.to_string()).to_payload()),
        };

        if let Err(e) = self.finish_task(session_id, task_id, op_id, report) {
            warn!(task_id = %task_id, error = %e, "task completion failed");
        }
        self.task_ops.remove(task_id);
    }

    fn start_task(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        op_id: &OperationId,
    ) -> Result<(), ApiError> {
        self.tasks.mark_running(task_id).map_err(store_to_api)?;
        self.tracker
            .transition(op_id, OperationStatus::Running, None, None)?;
        self.hub.publish(ControlEvent::TaskUpdate {
            session_id: session_id.clone(),
            task_id: task_id.clone(),
            status: TaskStatus::Running,
        });
        Ok(())
    }

    fn finish_task(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        op_id: &OperationId,
        report: EngineReport,
    ) -> Result<(), ApiError> {
        let intended = if report.success {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };
        // Write-once terminal: if a cancel won the race this is a no-op and
        // the cancel path has already announced the terminal state.
        let applied = self
            .tasks
            .complete(task_id, intended, report.result, report.error)
            .map_err(store_to_api)?;
        let row = self.tasks.get(session_id, task_id).map_err(store_to_api)?;

        if applied {
            self.hub.publish(ControlEvent::TaskUpdate {
                session_id: session_id.clone(),
                task_id: task_id.clone(),
                status: row.status,
            });
        }

        let op_status = match row.status {
            TaskStatus::Succeeded => OperationStatus::Succeeded,
            TaskStatus::Cancelled => OperationStatus::Cancelled,
            _ => OperationStatus::Failed,
        };
        match self
            .tracker
            .transition(op_id, op_status, row.result.clone(), row.error.clone())
        {
            Ok(_) => {}
            // The cancel path may have resolved the operation already.
            Err(e) if e.http_status() == 409 => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub fn get_task(&self, session_id: &SessionId, id: &TaskId) -> Result<TaskRow, ApiError> {
        self.tasks.get(session_id, id).map_err(store_to_api)
    }

    pub fn list_tasks(
        &self,
        session_id: &SessionId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRow>, ApiError> {
        self.tasks.list_for_session(session_id, status).map_err(store_to_api)
    }

    /// Cancel a queued or running task. 202 contract: returns its own
    /// operation. A cancel racing a success is a no-op and the cancel
    /// operation still resolves with `applied: false`.
    #[instrument(skip(self), fields(session_id = %session_id, task_id = %task_id))]
    pub fn cancel_task(
        self: &Arc<Self>,
        session_id: &SessionId,
        task_id: &TaskId,
        reason: Option<String>,
    ) -> Result<OperationRow, ApiError> {
        let task = self.tasks.get(session_id, task_id).map_err(store_to_api)?;
        if task.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }

        let op = self
            .tracker
            .create(session_id, "task.cancel", Some(task_id.as_str()))?;
        self.hub.publish(ControlEvent::TaskCancelling {
            session_id: session_id.clone(),
            task_id: task_id.clone(),
        });

        let dispatcher = Arc::clone(self);
        let sid = session_id.clone();
        let tid = task_id.clone();
        let cancel_op = op.id.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.drive_cancel(&sid, &tid, &cancel_op, reason).await {
                warn!(task_id = %tid, error = %e, "task cancel failed");
            }
        });
        Ok(op)
    }

    async fn drive_cancel(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        cancel_op: &OperationId,
        reason: Option<String>,
    ) -> Result<(), ApiError> {
        self.tracker
            .transition(cancel_op, OperationStatus::Running, None, None)?;

        if let Err(e) = self.engine.cancel_task(session_id, task_id).await {
            self.tracker.transition(
                cancel_op,
                OperationStatus::Failed,
                None,
                Some(ApiError::Orchestrator(e.to_string()).to_payload()),
            )?;
            return Ok(());
        }

        let error = reason
            .map(|r| serde_json::json!({ "code": "CANCELLED", "message": r }));
        let applied = self
            .tasks
            .complete(task_id, TaskStatus::Cancelled, None, error)
            .map_err(store_to_api)?;

        if applied {
            self.hub.publish(ControlEvent::TaskUpdate {
                session_id: session_id.clone(),
                task_id: task_id.clone(),
                status: TaskStatus::Cancelled,
            });
            if let Some((_, task_op)) = self.task_ops.remove(task_id) {
                match self
                    .tracker
                    .transition(&task_op, OperationStatus::Cancelled, None, None)
                {
                    Ok(_) => {}
                    Err(e) if e.http_status() == 409 => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.tracker.transition(
            cancel_op,
            OperationStatus::Succeeded,
            Some(serde_json::json!({ "applied": applied })),
            None,
        )?;
        Ok(())
    }
}
