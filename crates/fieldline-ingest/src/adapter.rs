use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use fieldline_bus::{BusError, DurableBus};
use fieldline_core::{DeviceFrame, Message};
use fieldline_transport::{FrameHandler, PubSubTransport, TransportError};

/// Callback invoked for each accepted device frame, after validation and
/// conversion. Runs on the external transport's delivery thread.
pub type AcceptedHandler = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Topics the adapter listens on and the internal topic it republishes to.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub device_topic_filters: Vec<String>,
    pub ingest_topic: String,
}

struct AdapterInner {
    transport: Arc<dyn PubSubTransport>,
    config: IngestConfig,
    handler: Mutex<Option<AcceptedHandler>>,
}

/// Bridges the external device broker into the internal bus.
///
/// Inbound frames are parsed and schema-validated; malformed frames are
/// dropped at this boundary with a debug log and never enter the pipeline.
/// Accepted frames become messages on the configured ingest topic.
pub struct IngestAdapter {
    inner: Arc<AdapterInner>,
}

impl IngestAdapter {
    /// Builds an adapter whose accepted frames are republished on `bus`.
    pub fn new(transport: Arc<dyn PubSubTransport>, bus: Arc<DurableBus>, config: IngestConfig) -> Self {
        Self::with_handler(
            transport,
            config,
            Arc::new(move |message: Message| {
                if let Err(err) = bus.publish(&message) {
                    warn!(id = %message.id, error = %err, "republish of accepted frame failed");
                }
            }),
        )
    }

    /// Builds an adapter with a custom accepted-frame callback.
    pub fn with_handler(
        transport: Arc<dyn PubSubTransport>,
        config: IngestConfig,
        handler: AcceptedHandler,
    ) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                transport,
                config,
                handler: Mutex::new(Some(handler)),
            }),
        }
    }

    /// Replaces the accepted-frame callback.
    pub fn set_handler(&self, handler: AcceptedHandler) {
        *self.inner.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Connects the external transport and subscribes every device filter.
    pub fn start(&self) -> Result<(), IngestError> {
        self.inner.transport.connect()?;
        for filter in &self.inner.config.device_topic_filters {
            let inner = Arc::clone(&self.inner);
            let frame_handler: FrameHandler = Arc::new(move |topic: &str, bytes: &[u8]| {
                inner.on_frame(topic, bytes);
            });
            self.inner.transport.subscribe(filter, frame_handler)?;
        }
        info!(
            filters = ?self.inner.config.device_topic_filters,
            ingest_topic = %self.inner.config.ingest_topic,
            "ingest adapter started"
        );
        Ok(())
    }

    /// Unsubscribes every device filter. The transport connection is left to
    /// its owner.
    pub fn stop(&self) -> Result<(), IngestError> {
        for filter in &self.inner.config.device_topic_filters {
            self.inner.transport.unsubscribe(filter)?;
        }
        info!("ingest adapter stopped");
        Ok(())
    }
}

impl AdapterInner {
    fn on_frame(&self, topic: &str, bytes: &[u8]) {
        let frame = match DeviceFrame::parse(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%topic, error = %err, "dropping malformed device frame");
                return;
            }
        };
        let message = frame.into_message(&self.config.ingest_topic);
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use fieldline_bus::DurableBus;
    use fieldline_core::Message;
    use fieldline_transport::{InMemoryBroker, PubSubTransport};

    use super::{IngestAdapter, IngestConfig};

    fn config() -> IngestConfig {
        IngestConfig {
            device_topic_filters: vec!["devices/#".to_string()],
            ingest_topic: "ingest/deviceData".to_string(),
        }
    }

    #[test]
    fn accepted_frames_reach_the_handler() {
        let broker = InMemoryBroker::shared();
        let seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let adapter = IngestAdapter::with_handler(
            broker.clone(),
            config(),
            Arc::new(move |message| {
                sink.lock().expect("lock should hold").push(message);
            }),
        );
        adapter.start().expect("start should succeed");

        let frame = json!({
            "id": "sensor-1",
            "tenant": "acme",
            "branch": "hq",
            "data": {"temperature": 21.5}
        });
        broker
            .publish("devices/sensor-1/telemetry", frame.to_string().as_bytes())
            .expect("publish should succeed");

        let seen = seen.lock().expect("lock should hold");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "ingest/deviceData");
        assert_eq!(seen[0].tenant.0, "acme");
        assert_eq!(seen[0].event, "deviceData");
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let broker = InMemoryBroker::shared();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);
        let adapter = IngestAdapter::with_handler(
            broker.clone(),
            config(),
            Arc::new(move |_| {
                handler_hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        adapter.start().expect("start should succeed");

        broker
            .publish("devices/sensor-1/telemetry", b"not json")
            .expect("publish should succeed");
        broker
            .publish(
                "devices/sensor-1/telemetry",
                json!({"id": "", "tenant": "acme", "branch": "hq", "data": {}})
                    .to_string()
                    .as_bytes(),
            )
            .expect("publish should succeed");

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_handler_republishes_on_the_bus() {
        let device_broker = InMemoryBroker::shared();
        let bus_broker = InMemoryBroker::shared();
        let bus = Arc::new(DurableBus::new(bus_broker.clone()));

        let adapter = IngestAdapter::new(device_broker.clone(), bus, config());
        adapter.start().expect("start should succeed");

        let frame = json!({
            "id": "sensor-1",
            "tenant": "acme",
            "branch": "hq",
            "data": {"temperature": 21.5}
        });
        device_broker
            .publish("devices/sensor-1/telemetry", frame.to_string().as_bytes())
            .expect("publish should succeed");

        assert_eq!(bus_broker.published_on("ingest/deviceData").len(), 1);
    }

    #[test]
    fn stop_removes_device_subscriptions() {
        let broker = InMemoryBroker::shared();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);
        let adapter = IngestAdapter::with_handler(
            broker.clone(),
            config(),
            Arc::new(move |_| {
                handler_hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        adapter.start().expect("start should succeed");
        adapter.stop().expect("stop should succeed");

        let frame = json!({
            "id": "sensor-1",
            "tenant": "acme",
            "branch": "hq",
            "data": {}
        });
        broker
            .publish("devices/sensor-1/telemetry", frame.to_string().as_bytes())
            .expect("publish should succeed");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
