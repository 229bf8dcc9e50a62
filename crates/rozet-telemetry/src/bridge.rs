use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rozet_core::events::ControlEvent;

/// Current collector wire schema. Version 2 added `agent_id` and
/// `attributes`; a sink that still speaks version 1 gets records with those
/// fields omitted instead of an error.
pub const COLLECTOR_SCHEMA_VERSION: u32 = 2;

const BRIDGE_BUFFER: usize = 1024;

/// One record in the external collector schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectorRecord {
    pub schema_version: u32,
    pub event_type: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
}

impl CollectorRecord {
    fn from_event(event: &ControlEvent, sink_version: u32) -> Self {
        let schema_version = sink_version.min(COLLECTOR_SCHEMA_VERSION);
        let (agent_id, attributes) = if schema_version >= 2 {
            let attrs = serde_json::to_value(event).ok();
            (event.agent_id().map(|a| a.to_string()), attrs)
        } else {
            (None, None)
        };
        Self {
            schema_version,
            event_type: event.event_type().to_string(),
            session_id: event.session_id().to_string(),
            agent_id,
            timestamp: Utc::now().to_rfc3339(),
            attributes,
        }
    }
}

/// Destination for collector records. Implementations declare which schema
/// version they accept.
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    fn schema_version(&self) -> u32 {
        COLLECTOR_SCHEMA_VERSION
    }

    async fn emit(&self, record: CollectorRecord) -> anyhow::Result<()>;
}

/// Default sink: structured log lines. Keeps the bridge exercised even when
/// no external collector is configured.
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn emit(&self, record: CollectorRecord) -> anyhow::Result<()> {
        info!(
            target: "rozet::collector",
            event_type = %record.event_type,
            session_id = %record.session_id,
            schema_version = record.schema_version,
            "control event"
        );
        Ok(())
    }
}

/// Handle used by producers. Publishing never blocks and never fails the
/// caller; when the buffer is full the event is counted and dropped.
#[derive(Clone)]
pub struct TelemetryBridgeHandle {
    tx: mpsc::Sender<ControlEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryBridgeHandle {
    pub fn publish(&self, event: ControlEvent) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total.is_power_of_two() {
                warn!(dropped_total = total, "telemetry buffer full, dropping events");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bridges control events to an external collector through a bounded buffer
/// and a background drain task. Sink failures are logged, never surfaced.
pub struct TelemetryBridge {
    handle: TelemetryBridgeHandle,
    drain: tokio::task::JoinHandle<()>,
}

impl TelemetryBridge {
    pub fn start(sink: Arc<dyn TelemetrySink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ControlEvent>(BRIDGE_BUFFER);
        let sink_version = sink.schema_version();

        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let record = CollectorRecord::from_event(&event, sink_version);
                if let Err(e) = sink.emit(record).await {
                    debug!(error = %e, event_type = event.event_type(), "collector emit failed");
                }
            }
        });

        Self {
            handle: TelemetryBridgeHandle {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            drain,
        }
    }

    pub fn handle(&self) -> TelemetryBridgeHandle {
        self.handle.clone()
    }

    /// Drop the producer side and wait for the drain task to flush.
    pub async fn shutdown(self) {
        drop(self.handle);
        let _ = self.drain.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rozet_core::ids::SessionId;

    struct CaptureSink {
        version: u32,
        records: Mutex<Vec<CollectorRecord>>,
    }

    impl CaptureSink {
        fn new(version: u32) -> Arc<Self> {
            Arc::new(Self {
                version,
                records: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TelemetrySink for CaptureSink {
        fn schema_version(&self) -> u32 {
            self.version
        }

        async fn emit(&self, record: CollectorRecord) -> anyhow::Result<()> {
            self.records.lock().push(record);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl TelemetrySink for FailingSink {
        async fn emit(&self, _record: CollectorRecord) -> anyhow::Result<()> {
            anyhow::bail!("collector unreachable")
        }
    }

    #[tokio::test]
    async fn events_reach_the_sink() {
        let sink = CaptureSink::new(COLLECTOR_SCHEMA_VERSION);
        let bridge = TelemetryBridge::start(sink.clone());
        let handle = bridge.handle();

        let sid = SessionId::new();
        handle.publish(ControlEvent::SessionCreated { session_id: sid.clone() });
        drop(handle);
        bridge.shutdown().await;

        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "session.created");
        assert_eq!(records[0].session_id, sid.to_string());
        assert_eq!(records[0].schema_version, COLLECTOR_SCHEMA_VERSION);
        assert!(records[0].attributes.is_some());
    }

    #[tokio::test]
    async fn old_collector_gets_newer_fields_omitted() {
        let sink = CaptureSink::new(1);
        let bridge = TelemetryBridge::start(sink.clone());
        let handle = bridge.handle();

        handle.publish(ControlEvent::SessionCreated { session_id: SessionId::new() });
        drop(handle);
        bridge.shutdown().await;

        let records = sink.records.lock();
        assert_eq!(records[0].schema_version, 1);
        assert!(records[0].agent_id.is_none());
        assert!(records[0].attributes.is_none());
    }

    #[tokio::test]
    async fn sink_failure_never_surfaces() {
        let bridge = TelemetryBridge::start(Arc::new(FailingSink));
        let handle = bridge.handle();
        handle.publish(ControlEvent::SessionCreated { session_id: SessionId::new() });
        drop(handle);
        bridge.shutdown().await;
        // Reaching here without panic is the assertion.
    }
}
