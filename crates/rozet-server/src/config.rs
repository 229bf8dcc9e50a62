use std::path::PathBuf;
use std::time::Duration;

/// Bearer token validation settings. The payload is decoded without signature
/// verification; the gateway in front of this service verifies signatures.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Expected `iss` claim. Unset skips the check.
    pub issuer: Option<String>,
    /// Expected `aud` claim. Unset skips the check.
    pub audience: Option<String>,
    /// Dev escape hatch: requests get a fixed principal, no token needed.
    pub disabled: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: env_opt("ROZET_AUTH_ISSUER"),
            audience: env_opt("ROZET_AUTH_AUDIENCE"),
            disabled: env_flag("ROZET_AUTH_DISABLED"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetentionConfig {
    pub idle_archive_days: i64,
    pub cold_window_days: i64,
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            idle_archive_days: env_i64("ROZET_IDLE_ARCHIVE_DAYS")
                .unwrap_or(rozet_store::retention::DEFAULT_IDLE_ARCHIVE_DAYS),
            cold_window_days: env_i64("ROZET_COLD_WINDOW_DAYS")
                .unwrap_or(rozet_store::retention::DEFAULT_COLD_WINDOW_DAYS),
            sweep_interval: Duration::from_secs(
                env_i64("ROZET_SWEEP_INTERVAL_SECS")
                    .map(|v| v.max(1) as u64)
                    .unwrap_or(rozet_store::retention::DEFAULT_SWEEP_INTERVAL_SECS),
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Every session working_dir must resolve inside this root.
    pub workspace_root: PathBuf,
    /// Per-subscriber WebSocket send queue depth.
    pub max_send_queue: usize,
    pub auth: AuthConfig,
    pub retention: RetentionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: env_i64("ROZET_PORT").map(|v| v as u16).unwrap_or(9290),
            workspace_root: env_opt("ROZET_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspaces")),
            max_send_queue: env_i64("ROZET_MAX_SEND_QUEUE")
                .map(|v| v.max(1) as usize)
                .unwrap_or(256),
            auth: AuthConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
