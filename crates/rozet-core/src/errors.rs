/// API-facing error taxonomy. Synchronously detectable failures map straight
/// to an HTTP status; failures discovered during asynchronous execution are
/// recorded on the wrapping Operation instead.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("not permitted: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Operation existed but passed its retention window.
    #[error("gone: {0}")]
    Gone(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("agent busy: {0}")]
    AgentBusy(String),

    /// Tenant storage quota would be exceeded. Back-pressure, not a queue.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The execution engine rejected or failed the handoff.
    #[error("orchestrator failure: {0}")]
    Orchestrator(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code surfaced in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authentication(_) => "AUTHENTICATION_REQUIRED",
            Self::Authorization(_) => "NOT_PERMITTED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Gone(_) => "OPERATION_EXPIRED",
            Self::Conflict(_) => "RESOURCE_CONFLICT",
            Self::AgentBusy(_) => "AGENT_BUSY",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Orchestrator(_) => "ORCHESTRATOR_FAILURE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Authentication(_) => 401,
            Self::Authorization(_) => 403,
            Self::NotFound(_) => 404,
            Self::Gone(_) => 410,
            Self::Conflict(_) | Self::AgentBusy(_) => 409,
            Self::QuotaExceeded(_) => 429,
            Self::Orchestrator(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// Error payload recorded on a failed Operation.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}
