use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use rozet_core::events::{ControlEvent, Envelope};
use rozet_core::ids::{AgentId, SessionId};
use rozet_telemetry::TelemetryBridgeHandle;

/// Subscribers whose queue overflows this many times in a row are dropped.
const MAX_STRIKES: u32 = 8;
/// Clients reconnect after 60s of silence, so beat well inside that.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// What a subscriber wants to see. `agent_ids` restricts agent-scoped events
/// to those agents; session-level events always pass. `event_types` is an
/// allow-list on the event tag.
#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionFilter {
    pub session_id: SessionId,
    #[serde(default)]
    pub agent_ids: Option<Vec<AgentId>>,
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &ControlEvent) -> bool {
        if event.session_id() != &self.session_id {
            return false;
        }
        if let Some(agents) = &self.agent_ids {
            if let Some(agent_id) = event.agent_id() {
                if !agents.contains(agent_id) {
                    return false;
                }
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Envelope>,
    strikes: AtomicU32,
}

/// Fan-out hub. Producers push onto an unbounded internal queue; a single
/// consumer task wraps each event in an envelope and try_sends to every
/// matching subscriber, so per-session emission order is exactly publish
/// order. A slow subscriber accumulates strikes and is dropped rather than
/// ever blocking the loop.
pub struct EventHub {
    event_tx: mpsc::UnboundedSender<ControlEvent>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    queue_depth: usize,
    stop: CancellationToken,
}

impl EventHub {
    pub fn start(queue_depth: usize, bridge: Option<TelemetryBridgeHandle>) -> Arc<Self> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ControlEvent>();
        let subscribers: Arc<DashMap<u64, Subscriber>> = Arc::new(DashMap::new());
        let stop = CancellationToken::new();

        let fan_out = Arc::clone(&subscribers);
        let fan_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = fan_stop.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Some(bridge) = &bridge {
                    bridge.publish(event.clone());
                }
                let envelope = Envelope::event(&event);
                deliver(&fan_out, &envelope, |sub| sub.filter.matches(&event));
            }
        });

        let beat = Arc::clone(&subscribers);
        let beat_stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
                HEARTBEAT_INTERVAL,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = beat_stop.cancelled() => break,
                    _ = ticker.tick() => deliver(&beat, &Envelope::heartbeat(), |_| true),
                }
            }
        });

        Arc::new(Self {
            event_tx,
            subscribers,
            next_id: AtomicU64::new(1),
            queue_depth,
            stop,
        })
    }

    /// Stop the fan-out and heartbeat tasks, releasing everything they hold
    /// (including the collector handle). Still-queued events are discarded.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Queue an event for fan-out. Never blocks the caller.
    pub fn publish(&self, event: ControlEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> (u64, mpsc::Receiver<Envelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.subscribers.insert(
            id,
            Subscriber {
                filter,
                tx,
                strikes: AtomicU32::new(0),
            },
        );
        debug!(subscriber = id, "hub subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
        debug!(subscriber = id, "hub subscriber removed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

fn deliver<F>(subscribers: &DashMap<u64, Subscriber>, envelope: &Envelope, wants: F)
where
    F: Fn(&Subscriber) -> bool,
{
    let mut evicted = Vec::new();
    for entry in subscribers.iter() {
        if !wants(entry.value()) {
            continue;
        }
        match entry.value().tx.try_send(envelope.clone()) {
            Ok(()) => {
                entry.value().strikes.store(0, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let strikes = entry.value().strikes.fetch_add(1, Ordering::Relaxed) + 1;
                if strikes >= MAX_STRIKES {
                    evicted.push(*entry.key());
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                evicted.push(*entry.key());
            }
        }
    }
    for id in evicted {
        subscribers.remove(&id);
        info!(subscriber = id, "hub subscriber dropped (overflow or closed)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rozet_core::ids::{CommandId, OperationId};
    use rozet_core::status::OperationStatus;

    fn filter(session_id: &SessionId) -> SubscriptionFilter {
        SubscriptionFilter {
            session_id: session_id.clone(),
            agent_ids: None,
            event_types: None,
        }
    }

    #[tokio::test]
    async fn events_reach_matching_subscriber_in_order() {
        let hub = EventHub::start(16, None);
        let sid = SessionId::new();
        let (_, mut rx) = hub.subscribe(filter(&sid));

        for status in [OperationStatus::Running, OperationStatus::Succeeded] {
            hub.publish(ControlEvent::OperationUpdate {
                session_id: sid.clone(),
                operation_id: OperationId::new(),
                status,
            });
        }

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.data["status"], "running");
        assert_eq!(second.data["status"], "succeeded");
    }

    #[tokio::test]
    async fn other_sessions_are_filtered_out() {
        let hub = EventHub::start(16, None);
        let mine = SessionId::new();
        let theirs = SessionId::new();
        let (_, mut rx) = hub.subscribe(filter(&mine));

        hub.publish(ControlEvent::SessionCreated { session_id: theirs });
        hub.publish(ControlEvent::SessionCreated { session_id: mine.clone() });

        let only = rx.recv().await.unwrap();
        assert_eq!(only.data["session_id"], mine.to_string());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn agent_filter_passes_session_level_events() {
        let hub = EventHub::start(16, None);
        let sid = SessionId::new();
        let watched = AgentId::new();
        let unwatched = AgentId::new();
        let (_, mut rx) = hub.subscribe(SubscriptionFilter {
            session_id: sid.clone(),
            agent_ids: Some(vec![watched.clone()]),
            event_types: None,
        });

        hub.publish(ControlEvent::CommandQueued {
            session_id: sid.clone(),
            agent_id: unwatched,
            command_id: CommandId::new(),
            command: "x".into(),
        });
        hub.publish(ControlEvent::CommandQueued {
            session_id: sid.clone(),
            agent_id: watched.clone(),
            command_id: CommandId::new(),
            command: "y".into(),
        });
        hub.publish(ControlEvent::SessionTerminated { session_id: sid });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.data["agent_id"], watched.to_string());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.data["type"], "session.terminated");
    }

    #[tokio::test]
    async fn event_type_filter_applies() {
        let hub = EventHub::start(16, None);
        let sid = SessionId::new();
        let (_, mut rx) = hub.subscribe(SubscriptionFilter {
            session_id: sid.clone(),
            agent_ids: None,
            event_types: Some(vec!["session.terminated".into()]),
        });

        hub.publish(ControlEvent::SessionCreated { session_id: sid.clone() });
        hub.publish(ControlEvent::SessionTerminated { session_id: sid });

        let only = rx.recv().await.unwrap();
        assert_eq!(only.data["type"], "session.terminated");
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped() {
        let hub = EventHub::start(1, None);
        let sid = SessionId::new();
        let (_, rx) = hub.subscribe(filter(&sid));
        // Receiver kept alive but never drained.
        let _rx = rx;

        for _ in 0..(MAX_STRIKES + 2) {
            hub.publish(ControlEvent::SessionCreated { session_id: sid.clone() });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_collector_handle() {
        use rozet_telemetry::{TelemetryBridge, TracingSink};

        let bridge = TelemetryBridge::start(Arc::new(TracingSink));
        let hub = EventHub::start(16, Some(bridge.handle()));
        hub.publish(ControlEvent::SessionCreated { session_id: SessionId::new() });

        // The fan-out task owns a bridge handle; once the hub stops, the
        // bridge's channel closes and its drain can finish.
        hub.shutdown();
        tokio::time::timeout(Duration::from_secs(2), bridge.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_are_periodic() {
        let hub = EventHub::start(16, None);
        let sid = SessionId::new();
        let (_, mut rx) = hub.subscribe(filter(&sid));

        tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_secs(1)).await;
        let beat = rx.recv().await.unwrap();
        assert_eq!(
            serde_json::to_value(&beat.kind).unwrap(),
            serde_json::json!("heartbeat")
        );
    }
}
