use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::instrument;

use rozet_core::events::ControlEvent;
use rozet_core::ids::{OperationId, SessionId};
use rozet_core::status::OperationStatus;
use rozet_core::ApiError;
use rozet_store::operations::{OperationRepo, OperationRow};
use rozet_store::Database;

use crate::error::store_to_api;
use crate::hub::EventHub;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(60);
pub const MAX_WAIT: Duration = Duration::from_secs(300);
/// Backoff hint returned with a wait timeout. Clients are expected to retry
/// with bounded exponential backoff (base 1s, cap 10s, max 10 attempts);
/// that contract lives in the API docs, not in server enforcement.
pub const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug)]
pub enum WaitOutcome {
    Completed(OperationRow),
    TimedOut { retry_after_secs: u64 },
}

/// Tracks async operations: persistence via the repo, completion signaling
/// via per-operation watch channels, lifecycle events via the hub.
pub struct OperationTracker {
    repo: OperationRepo,
    hub: Arc<EventHub>,
    waiters: DashMap<OperationId, watch::Sender<()>>,
}

impl OperationTracker {
    pub fn new(db: Database, hub: Arc<EventHub>) -> Self {
        Self {
            repo: OperationRepo::new(db),
            hub,
            waiters: DashMap::new(),
        }
    }

    #[instrument(skip(self), fields(session_id = %session_id, op_type))]
    pub fn create(
        &self,
        session_id: &SessionId,
        op_type: &str,
        target_id: Option<&str>,
    ) -> Result<OperationRow, ApiError> {
        self.repo
            .create(session_id, op_type, target_id)
            .map_err(store_to_api)
    }

    pub fn get(&self, session_id: &SessionId, id: &OperationId) -> Result<OperationRow, ApiError> {
        self.repo.get(session_id, id).map_err(store_to_api)
    }

    pub fn list_for_session(
        &self,
        session_id: &SessionId,
        status: Option<OperationStatus>,
    ) -> Result<Vec<OperationRow>, ApiError> {
        self.repo
            .list_for_session(session_id, status)
            .map_err(store_to_api)
    }

    /// Apply a transition, emit `operation.update`, and wake waiters on
    /// terminal states. The FSM check lives in the store.
    #[instrument(skip(self, result, error), fields(operation_id = %id, to = %to))]
    pub fn transition(
        &self,
        id: &OperationId,
        to: OperationStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<OperationRow, ApiError> {
        let row = self
            .repo
            .transition(id, to, result, error)
            .map_err(store_to_api)?;
        self.notify(&row);
        Ok(row)
    }

    /// Publish `operation.update` and wake waiters for a transition that was
    /// applied elsewhere (e.g. atomically alongside a command update).
    pub fn notify(&self, row: &OperationRow) {
        self.hub.publish(ControlEvent::OperationUpdate {
            session_id: row.session_id.clone(),
            operation_id: row.id.clone(),
            status: row.status,
        });

        if row.status.is_terminal() {
            if let Some((_, tx)) = self.waiters.remove(&row.id) {
                let _ = tx.send(());
            }
        }
    }

    /// Block until the operation reaches a terminal state or the timeout
    /// elapses. Timeout defaults to 60s and clamps at 300s. A timeout is an
    /// outcome, not an error.
    #[instrument(skip(self), fields(session_id = %session_id, operation_id = %id))]
    pub async fn wait(
        &self,
        session_id: &SessionId,
        id: &OperationId,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, ApiError> {
        let timeout = timeout.unwrap_or(DEFAULT_WAIT).min(MAX_WAIT);

        // Register before the snapshot so a transition racing this call is
        // never missed.
        let mut rx = self
            .waiters
            .entry(id.clone())
            .or_insert_with(|| watch::channel(()).0)
            .subscribe();

        let snapshot = self.get(session_id, id)?;
        if snapshot.status.is_terminal() {
            return Ok(WaitOutcome::Completed(snapshot));
        }

        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(_) => Ok(WaitOutcome::Completed(self.get(session_id, id)?)),
            Err(_) => {
                // Last waiter out removes the channel, so operations that
                // never resolve through the tracker (swept, orphaned) do not
                // pin map entries forever.
                drop(rx);
                self.waiters.remove_if(id, |_, tx| tx.receiver_count() == 0);
                Ok(WaitOutcome::TimedOut {
                    retry_after_secs: RETRY_AFTER_SECS,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rozet_store::sessions::SessionRepo;

    fn setup() -> (Arc<OperationTracker>, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone())
            .create(None, "/w", None, serde_json::json!({}))
            .unwrap();
        let hub = EventHub::start(16, None);
        (Arc::new(OperationTracker::new(db, hub)), session.id)
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_terminal() {
        let (tracker, sid) = setup();
        let op = tracker.create(&sid, "x", None).unwrap();
        tracker
            .transition(&op.id, OperationStatus::Succeeded, None, None)
            .unwrap();

        match tracker.wait(&sid, &op.id, None).await.unwrap() {
            WaitOutcome::Completed(row) => assert_eq!(row.status, OperationStatus::Succeeded),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_wakes_on_transition() {
        let (tracker, sid) = setup();
        let op = tracker.create(&sid, "x", None).unwrap();

        let bg = Arc::clone(&tracker);
        let bg_id = op.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            bg.transition(&bg_id, OperationStatus::Running, None, None).unwrap();
            bg.transition(
                &bg_id,
                OperationStatus::Succeeded,
                Some(serde_json::json!({"ok": 1})),
                None,
            )
            .unwrap();
        });

        match tracker
            .wait(&sid, &op.id, Some(Duration::from_secs(5)))
            .await
            .unwrap()
        {
            WaitOutcome::Completed(row) => {
                assert_eq!(row.status, OperationStatus::Succeeded);
                assert_eq!(row.result.unwrap()["ok"], 1);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_retry_hint() {
        let (tracker, sid) = setup();
        let op = tracker.create(&sid, "x", None).unwrap();

        let started = tokio::time::Instant::now();
        match tracker
            .wait(&sid, &op.id, Some(Duration::from_secs(1)))
            .await
            .unwrap()
        {
            WaitOutcome::TimedOut { retry_after_secs } => {
                assert_eq!(retry_after_secs, RETRY_AFTER_SECS);
                assert!(started.elapsed() >= Duration::from_secs(1));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_clamps_oversized_timeout() {
        let (tracker, sid) = setup();
        let op = tracker.create(&sid, "x", None).unwrap();
        tracker
            .transition(&op.id, OperationStatus::Cancelled, None, None)
            .unwrap();

        // An absurd timeout is clamped; terminal op still resolves instantly.
        let outcome = tracker
            .wait(&sid, &op.id, Some(Duration::from_secs(100_000)))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_waiter_sheds_its_entry() {
        let (tracker, sid) = setup();
        let op = tracker.create(&sid, "x", None).unwrap();

        let outcome = tracker
            .wait(&sid, &op.id, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut { .. }));
        assert!(tracker.waiters.is_empty());
    }

    #[tokio::test]
    async fn terminal_transition_drops_waiter_entry() {
        let (tracker, sid) = setup();
        let op = tracker.create(&sid, "x", None).unwrap();

        let bg = Arc::clone(&tracker);
        let bg_sid = sid.clone();
        let bg_id = op.id.clone();
        let waiter = tokio::spawn(async move {
            bg.wait(&bg_sid, &bg_id, Some(Duration::from_secs(5))).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tracker
            .transition(&op.id, OperationStatus::Failed, None, Some(serde_json::json!({"code": "E"})))
            .unwrap();
        waiter.await.unwrap().unwrap();
        assert!(tracker.waiters.is_empty());
    }
}
