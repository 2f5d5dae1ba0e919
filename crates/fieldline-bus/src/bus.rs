use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use fieldline_core::{CodecError, DeliveryStatus, Message, MessageId, WireEnvelope};
use fieldline_transport::{PubSubTransport, TransportError};

use crate::ledger::{LedgerError, MessageLedger, StoredRecord};

/// Callback invoked for each decoded envelope on a subscribed topic. Errors
/// are logged and swallowed; a failing handler never tears down the
/// subscription.
pub type BusHandler =
    Arc<dyn Fn(WireEnvelope) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Errors raised by the durable bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport is not connected")]
    NotConnected,
    #[error("a bus handler already exists for topic {topic}")]
    AlreadySubscribed { topic: String },
    #[error("no bus handler exists for topic {topic}")]
    NotSubscribed { topic: String },
    #[error(transparent)]
    Transport(TransportError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<TransportError> for BusError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => BusError::NotConnected,
            TransportError::AlreadySubscribed { filter } => {
                BusError::AlreadySubscribed { topic: filter }
            }
            TransportError::NotSubscribed { filter } => BusError::NotSubscribed { topic: filter },
            other => BusError::Transport(other),
        }
    }
}

/// Publish bus layered over a pub/sub transport with an optional ledger.
///
/// With a ledger attached, `publish` records the message as `Pending` before
/// the transmission attempt and settles it to `Sent` or `Failed` before
/// returning. Without one, the bus is a thin codec wrapper over the
/// transport.
pub struct DurableBus {
    transport: Arc<dyn PubSubTransport>,
    ledger: Option<Arc<dyn MessageLedger>>,
    topics: Mutex<HashSet<String>>,
}

impl DurableBus {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            transport,
            ledger: None,
            topics: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_ledger(transport: Arc<dyn PubSubTransport>, ledger: Arc<dyn MessageLedger>) -> Self {
        Self {
            transport,
            ledger: Some(ledger),
            topics: Mutex::new(HashSet::new()),
        }
    }

    pub fn connect(&self) -> Result<(), BusError> {
        self.transport.connect()?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Publishes a message on its topic, returning its id.
    ///
    /// Publishing never leaves a ledger record in `Pending`: the record
    /// settles to `Sent` on success or `Failed` when the transport rejects
    /// the frame, and the transport error is returned to the caller.
    pub fn publish(&self, message: &Message) -> Result<MessageId, BusError> {
        let envelope = WireEnvelope::from_message(message)?;
        let frame = envelope.encode()?;

        if let Some(ledger) = &self.ledger {
            ledger.append(&StoredRecord::pending(message, envelope.data.clone()))?;
        }

        match self.transport.publish(&message.topic, &frame) {
            Ok(()) => {
                self.settle(&message.id, DeliveryStatus::Sent);
                debug!(id = %message.id, topic = %message.topic, "message published");
                Ok(message.id.clone())
            }
            Err(err) => {
                self.settle(&message.id, DeliveryStatus::Failed);
                warn!(id = %message.id, topic = %message.topic, error = %err, "publish failed");
                Err(err.into())
            }
        }
    }

    fn settle(&self, id: &MessageId, status: DeliveryStatus) {
        if let Some(ledger) = &self.ledger {
            if let Err(err) = ledger.update_status(id, status) {
                warn!(%id, error = %err, "ledger status update failed");
            }
        }
    }

    /// Registers the single handler for `topic`. Frames that fail envelope
    /// decoding are dropped with a debug log; handler errors are logged and
    /// do not affect the subscription.
    pub fn subscribe(&self, topic: &str, handler: BusHandler) -> Result<(), BusError> {
        // The lock is held across check, transport call, and insert so the
        // topic set never disagrees with the transport's handler table.
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if topics.contains(topic) {
            return Err(BusError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }

        let frame_handler: fieldline_transport::FrameHandler =
            Arc::new(move |topic: &str, bytes: &[u8]| {
                let envelope = match WireEnvelope::decode(bytes) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        debug!(%topic, error = %err, "dropping undecodable frame");
                        return;
                    }
                };
                if let Err(err) = handler(envelope) {
                    warn!(%topic, error = %err, "bus handler failed");
                }
            });
        self.transport.subscribe(topic, frame_handler)?;
        topics.insert(topic.to_string());
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if !topics.contains(topic) {
            return Err(BusError::NotSubscribed {
                topic: topic.to_string(),
            });
        }
        // The topic stays tracked until the transport actually releases the
        // handler, so a failed unsubscribe can be retried.
        self.transport.unsubscribe(topic)?;
        topics.remove(topic);
        Ok(())
    }

    /// Topics with a registered handler.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn close(&self) -> Result<(), BusError> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.transport.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use fieldline_core::{BranchId, DeliveryStatus, MapPayload, Message, TenantId};
    use fieldline_transport::{FrameHandler, InMemoryBroker, PubSubTransport, TransportError};

    use super::{BusError, DurableBus};
    use crate::ledger::{MemoryLedger, MessageLedger};

    struct FlakyTransport {
        inner: Arc<InMemoryBroker>,
        fail_unsubscribe: AtomicBool,
    }

    impl PubSubTransport for FlakyTransport {
        fn connect(&self) -> Result<(), TransportError> {
            self.inner.connect()
        }

        fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
            self.inner.publish(topic, payload)
        }

        fn subscribe(&self, filter: &str, handler: FrameHandler) -> Result<(), TransportError> {
            self.inner.subscribe(filter, handler)
        }

        fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
            if self.fail_unsubscribe.load(Ordering::SeqCst) {
                return Err(TransportError::Io("link reset".to_string()));
            }
            self.inner.unsubscribe(filter)
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn close(&self) -> Result<(), TransportError> {
            self.inner.close()
        }
    }

    fn sample_message(topic: &str) -> Message {
        let mut payload = MapPayload::new();
        payload.insert("tenant", json!("acme"));
        payload.insert("branch", json!("hq"));
        payload.insert("data", json!({"temperature": 21.5}));
        Message::new(
            topic,
            TenantId::new("acme"),
            BranchId::new("hq"),
            payload,
            "deviceData",
        )
    }

    #[test]
    fn publish_settles_ledger_record_to_sent() {
        let broker = InMemoryBroker::shared();
        let ledger = Arc::new(MemoryLedger::new());
        let bus = DurableBus::with_ledger(broker.clone(), ledger.clone());

        let message = sample_message("ingest/deviceData");
        let id = bus.publish(&message).expect("publish should succeed");

        let record = ledger.get(&id).expect("record should exist");
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(broker.published_on("ingest/deviceData").len(), 1);
    }

    #[test]
    fn failed_publish_settles_ledger_record_to_failed() {
        let broker = InMemoryBroker::shared();
        broker.set_connected(false);
        let ledger = Arc::new(MemoryLedger::new());
        let bus = DurableBus::with_ledger(broker, ledger.clone());

        let message = sample_message("ingest/deviceData");
        let err = bus
            .publish(&message)
            .expect_err("disconnected publish should fail");
        assert!(matches!(err, BusError::NotConnected));

        let record = ledger.get(&message.id).expect("record should exist");
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert!(ledger
            .with_status(DeliveryStatus::Pending)
            .expect("query should succeed")
            .is_empty());
    }

    #[test]
    fn subscriber_receives_decoded_envelopes() {
        let broker = InMemoryBroker::shared();
        let bus = DurableBus::new(broker);
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);

        bus.subscribe(
            "ingest/deviceData",
            Arc::new(move |envelope| {
                assert_eq!(envelope.event, "deviceData");
                handler_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .expect("subscribe should succeed");

        bus.publish(&sample_message("ingest/deviceData"))
            .expect("publish should succeed");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undecodable_frames_are_dropped() {
        let broker = InMemoryBroker::shared();
        let bus = DurableBus::new(broker.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = Arc::clone(&hits);

        bus.subscribe(
            "ingest/deviceData",
            Arc::new(move |_| {
                handler_hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .expect("subscribe should succeed");

        broker
            .publish("ingest/deviceData", b"not json")
            .expect("raw publish should succeed");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn one_handler_per_topic() {
        let broker = InMemoryBroker::shared();
        let bus = DurableBus::new(broker);

        bus.subscribe("stream/measure", Arc::new(|_| Ok(())))
            .expect("first subscribe should succeed");
        let err = bus
            .subscribe("stream/measure", Arc::new(|_| Ok(())))
            .expect_err("second subscribe should fail");
        assert!(matches!(err, BusError::AlreadySubscribed { .. }));

        bus.unsubscribe("stream/measure")
            .expect("unsubscribe should succeed");
        assert!(matches!(
            bus.unsubscribe("stream/measure"),
            Err(BusError::NotSubscribed { .. })
        ));
    }

    #[test]
    fn failed_transport_unsubscribe_keeps_the_topic_tracked() {
        let transport = Arc::new(FlakyTransport {
            inner: InMemoryBroker::shared(),
            fail_unsubscribe: AtomicBool::new(true),
        });
        let bus = DurableBus::new(transport.clone());
        bus.subscribe("stream/measure", Arc::new(|_| Ok(())))
            .expect("subscribe should succeed");

        let err = bus
            .unsubscribe("stream/measure")
            .expect_err("unsubscribe should surface the transport error");
        assert!(matches!(err, BusError::Transport(_)));

        // The transport handler is still live, so the bus keeps tracking it.
        assert_eq!(bus.subscribed_topics(), vec!["stream/measure".to_string()]);
        assert!(matches!(
            bus.subscribe("stream/measure", Arc::new(|_| Ok(()))),
            Err(BusError::AlreadySubscribed { .. })
        ));

        transport.fail_unsubscribe.store(false, Ordering::SeqCst);
        bus.unsubscribe("stream/measure")
            .expect("retried unsubscribe should succeed");
        assert!(bus.subscribed_topics().is_empty());
    }
}
