use serde::{Deserialize, Serialize};

macro_rules! status_enum {
    ($name:ident { $($variant:ident => $text:expr),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant,)+
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($text),)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

status_enum!(SessionStatus {
    Active => "active",
    Terminating => "terminating",
    Completed => "completed",
});

status_enum!(AgentStatus {
    Idle => "idle",
    Executing => "executing",
    Stopped => "stopped",
    Error => "error",
});

status_enum!(CommandStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

status_enum!(TaskStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

status_enum!(OperationStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    Cancelled => "cancelled",
    Expired => "expired",
});

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// Operation state machine:
    /// `queued -> running -> {succeeded, failed}`, `queued|running -> cancelled`.
    /// Terminal states never regress. `Expired` is applied only by the
    /// retention sweep and only to non-terminal operations.
    pub fn can_transition(self, to: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, to) {
            (Queued, Running) => true,
            (Queued | Running, Succeeded | Failed | Cancelled) => true,
            (Queued | Running, Expired) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        for s in [
            SessionStatus::Active,
            SessionStatus::Terminating,
            SessionStatus::Completed,
        ] {
            let parsed: SessionStatus = s.to_string().parse().unwrap();
            assert_eq!(parsed, s);
        }
        let parsed: AgentStatus = "executing".parse().unwrap();
        assert_eq!(parsed, AgentStatus::Executing);
    }

    #[test]
    fn unknown_status_rejected() {
        assert!("ACTIVE".parse::<SessionStatus>().is_err());
        assert!("nope".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn operation_fsm_forward_paths() {
        use OperationStatus::*;
        assert!(Queued.can_transition(Running));
        assert!(Queued.can_transition(Succeeded));
        assert!(Queued.can_transition(Failed));
        assert!(Queued.can_transition(Cancelled));
        assert!(Running.can_transition(Succeeded));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Cancelled));
    }

    #[test]
    fn operation_fsm_terminal_states_never_regress() {
        use OperationStatus::*;
        for terminal in [Succeeded, Failed, Cancelled, Expired] {
            for to in [Queued, Running, Succeeded, Failed, Cancelled, Expired] {
                assert!(
                    !terminal.can_transition(to),
                    "{terminal} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn operation_fsm_no_backward_to_queued() {
        use OperationStatus::*;
        assert!(!Running.can_transition(Queued));
    }

    #[test]
    fn terminal_classification() {
        assert!(!OperationStatus::Queued.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
        assert!(OperationStatus::Expired.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
    }
}
