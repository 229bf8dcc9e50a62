use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::artifacts::ArtifactRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::operations::OperationRepo;
use crate::sessions::SessionRepo;

/// Sessions idle this long get archived and their artifacts demoted to cold.
pub const DEFAULT_IDLE_ARCHIVE_DAYS: i64 = 30;
/// Cold artifacts older than this are purged unless force-retained.
pub const DEFAULT_COLD_WINDOW_DAYS: i64 = 90;
/// How often the background sweep runs.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;

#[derive(Clone, Copy, Debug)]
pub struct RetentionPolicy {
    pub idle_archive_days: i64,
    pub cold_window_days: i64,
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            idle_archive_days: DEFAULT_IDLE_ARCHIVE_DAYS,
            cold_window_days: DEFAULT_COLD_WINDOW_DAYS,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Outcome of one sweep pass, for logging and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_archived: usize,
    pub artifacts_chilled: usize,
    pub artifacts_purged: usize,
    pub operations_deleted: usize,
}

pub struct RetentionSweeper {
    sessions: SessionRepo,
    artifacts: ArtifactRepo,
    operations: OperationRepo,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(db: Database, policy: RetentionPolicy) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            artifacts: ArtifactRepo::new(db.clone()),
            operations: OperationRepo::new(db),
            policy,
        }
    }

    /// One full retention pass: archive idle sessions and chill their
    /// artifacts, purge cold artifacts past the window, drop expired
    /// operations.
    #[instrument(skip(self))]
    pub fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let idle_cutoff = (now - chrono::Duration::days(self.policy.idle_archive_days)).to_rfc3339();
        for session_id in self.sessions.idle_before(&idle_cutoff)? {
            self.sessions.set_archived(&session_id)?;
            report.artifacts_chilled += self.artifacts.move_to_cold(&session_id)?;
            report.sessions_archived += 1;
        }

        let cold_cutoff = (now - chrono::Duration::days(self.policy.cold_window_days)).to_rfc3339();
        report.artifacts_purged = self.artifacts.purge_cold(&cold_cutoff)?;
        report.operations_deleted = self.operations.delete_expired()?;

        if report != SweepReport::default() {
            info!(
                sessions_archived = report.sessions_archived,
                artifacts_chilled = report.artifacts_chilled,
                artifacts_purged = report.artifacts_purged,
                operations_deleted = report.operations_deleted,
                "retention sweep applied"
            );
        }
        Ok(report)
    }

    /// Run sweeps on an interval until the token is cancelled. A failing
    /// sweep is logged and retried on the next tick.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.policy.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once() {
                            warn!(error = %e, "retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}
