use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, CommandId, OperationId, SessionId, TaskId};
use crate::status::{CommandStatus, OperationStatus, TaskStatus};

/// Wire envelope version. Bumped on breaking envelope changes.
pub const ENVELOPE_VERSION: u32 = 1;

/// Control-plane lifecycle events. Every state transition in the session,
/// agent, command, task, and operation machinery produces exactly one of
/// these; the hub fans them out to WebSocket subscribers and the telemetry
/// bridge mirrors them to the external collector.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session_id: SessionId },

    #[serde(rename = "session.terminating")]
    SessionTerminating {
        session_id: SessionId,
        reason: Option<String>,
    },

    #[serde(rename = "session.terminated")]
    SessionTerminated { session_id: SessionId },

    #[serde(rename = "agent.created")]
    AgentCreated {
        session_id: SessionId,
        agent_id: AgentId,
        name: String,
    },

    /// MUST precede AgentStopped for the same agent.
    #[serde(rename = "agent.stopping")]
    AgentStopping {
        session_id: SessionId,
        agent_id: AgentId,
        reason: Option<String>,
    },

    #[serde(rename = "agent.stopped")]
    AgentStopped {
        session_id: SessionId,
        agent_id: AgentId,
    },

    #[serde(rename = "command.queued")]
    CommandQueued {
        session_id: SessionId,
        agent_id: AgentId,
        command_id: CommandId,
        command: String,
    },

    #[serde(rename = "command.update")]
    CommandUpdate {
        session_id: SessionId,
        agent_id: AgentId,
        command_id: CommandId,
        status: CommandStatus,
    },

    #[serde(rename = "task.created")]
    TaskCreated {
        session_id: SessionId,
        task_id: TaskId,
    },

    /// MUST precede the terminal task.update when a cancel is in flight.
    #[serde(rename = "task.cancelling")]
    TaskCancelling {
        session_id: SessionId,
        task_id: TaskId,
    },

    #[serde(rename = "task.update")]
    TaskUpdate {
        session_id: SessionId,
        task_id: TaskId,
        status: TaskStatus,
    },

    #[serde(rename = "operation.update")]
    OperationUpdate {
        session_id: SessionId,
        operation_id: OperationId,
        status: OperationStatus,
    },
}

impl ControlEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionCreated { session_id }
            | Self::SessionTerminating { session_id, .. }
            | Self::SessionTerminated { session_id }
            | Self::AgentCreated { session_id, .. }
            | Self::AgentStopping { session_id, .. }
            | Self::AgentStopped { session_id, .. }
            | Self::CommandQueued { session_id, .. }
            | Self::CommandUpdate { session_id, .. }
            | Self::TaskCreated { session_id, .. }
            | Self::TaskCancelling { session_id, .. }
            | Self::TaskUpdate { session_id, .. }
            | Self::OperationUpdate { session_id, .. } => session_id,
        }
    }

    /// Agent the event concerns, when it concerns one.
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::AgentCreated { agent_id, .. }
            | Self::AgentStopping { agent_id, .. }
            | Self::AgentStopped { agent_id, .. }
            | Self::CommandQueued { agent_id, .. }
            | Self::CommandUpdate { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionTerminating { .. } => "session.terminating",
            Self::SessionTerminated { .. } => "session.terminated",
            Self::AgentCreated { .. } => "agent.created",
            Self::AgentStopping { .. } => "agent.stopping",
            Self::AgentStopped { .. } => "agent.stopped",
            Self::CommandQueued { .. } => "command.queued",
            Self::CommandUpdate { .. } => "command.update",
            Self::TaskCreated { .. } => "task.created",
            Self::TaskCancelling { .. } => "task.cancelling",
            Self::TaskUpdate { .. } => "task.update",
            Self::OperationUpdate { .. } => "operation.update",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Event,
    Heartbeat,
    Error,
}

/// Envelope carried on the WebSocket wire: `{version, kind, timestamp, data}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub kind: EnvelopeKind,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn event(event: &ControlEvent) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: EnvelopeKind::Event,
            timestamp: Utc::now().to_rfc3339(),
            data: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: EnvelopeKind::Heartbeat,
            timestamp: Utc::now().to_rfc3339(),
            data: serde_json::Value::Null,
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind: EnvelopeKind::Error,
            timestamp: Utc::now().to_rfc3339(),
            data: serde_json::json!({ "code": code, "message": message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_carries_session_id() {
        let sid = SessionId::new();
        let evt = ControlEvent::SessionTerminating {
            session_id: sid.clone(),
            reason: Some("user request".into()),
        };
        assert_eq!(evt.session_id(), &sid);
        assert_eq!(evt.event_type(), "session.terminating");
    }

    #[test]
    fn agent_scoped_events_expose_agent_id() {
        let aid = AgentId::new();
        let evt = ControlEvent::CommandQueued {
            session_id: SessionId::new(),
            agent_id: aid.clone(),
            command_id: CommandId::new(),
            command: "analyze".into(),
        };
        assert_eq!(evt.agent_id(), Some(&aid));

        let evt = ControlEvent::TaskCreated {
            session_id: SessionId::new(),
            task_id: TaskId::new(),
        };
        assert_eq!(evt.agent_id(), None);
    }

    #[test]
    fn serde_tag_matches_event_type() {
        let evt = ControlEvent::OperationUpdate {
            session_id: SessionId::new(),
            operation_id: OperationId::new(),
            status: OperationStatus::Succeeded,
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], evt.event_type());
        assert_eq!(json["status"], "succeeded");
    }

    #[test]
    fn event_envelope_shape() {
        let evt = ControlEvent::SessionCreated {
            session_id: SessionId::new(),
        };
        let env = Envelope::event(&evt);
        assert_eq!(env.version, ENVELOPE_VERSION);
        assert_eq!(env.kind, EnvelopeKind::Event);
        assert_eq!(env.data["type"], "session.created");
    }

    #[test]
    fn heartbeat_envelope_has_null_data() {
        let env = Envelope::heartbeat();
        assert_eq!(env.kind, EnvelopeKind::Heartbeat);
        assert!(env.data.is_null());
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "heartbeat");
    }

    #[test]
    fn error_envelope_carries_code() {
        let env = Envelope::error("VALIDATION_ERROR", "bad subscribe");
        assert_eq!(env.data["code"], "VALIDATION_ERROR");
    }

    #[test]
    fn serde_roundtrip() {
        let evt = ControlEvent::AgentStopping {
            session_id: SessionId::new(),
            agent_id: AgentId::new(),
            reason: None,
        };
        let json = serde_json::to_string(&evt).unwrap();
        let parsed: ControlEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "agent.stopping");
    }
}
