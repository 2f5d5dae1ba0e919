use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use fieldline_bus::{BusError, DurableBus};
use fieldline_core::{Message, MessageId, TenantId, UserId};
use fieldline_transport::topic_matches;

use crate::hub::Hub;
use crate::protocol::ServerMessage;
use crate::subscriptions::SubscriptionIndex;
use crate::values::LatestValues;

/// How messages on a routed topic are fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Deliver to users subscribed to the message's subject.
    Subscribers,
    /// Deliver to the single addressed user.
    Direct,
    /// Deliver to every connected user of the tenant partition.
    TenantBroadcast,
}

struct BridgeInner {
    bus: Arc<DurableBus>,
    hub: Arc<Hub>,
    subscriptions: Arc<SubscriptionIndex>,
    latest: Arc<LatestValues>,
    routes: RwLock<HashMap<String, RouteKind>>,
}

/// Subscribes to routed bus topics and fans messages out to live
/// connections, marshaling each outbound protocol message once per message
/// rather than once per recipient.
pub struct StreamBridge {
    inner: Arc<BridgeInner>,
}

impl StreamBridge {
    pub fn new(
        bus: Arc<DurableBus>,
        hub: Arc<Hub>,
        subscriptions: Arc<SubscriptionIndex>,
        latest: Arc<LatestValues>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                bus,
                hub,
                subscriptions,
                latest,
                routes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Routes a topic filter with the given fanout strategy; `+`/`#`
    /// wildcards are honored. Takes effect on the next `start`.
    pub fn register_route(&self, filter: &str, kind: RouteKind) {
        self.inner
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(filter.to_string(), kind);
    }

    /// Subscribes one bus handler per routed topic.
    pub fn start(&self) -> Result<(), BusError> {
        let topics: Vec<String> = {
            let routes = self.inner.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.keys().cloned().collect()
        };
        for topic in topics {
            let inner = Arc::clone(&self.inner);
            self.inner.bus.subscribe(
                &topic,
                Arc::new(move |envelope| {
                    let message = Message::from_envelope(&envelope)?;
                    inner.dispatch(&message);
                    Ok(())
                }),
            )?;
        }
        info!("stream bridge started");
        Ok(())
    }

    /// Unsubscribes every routed topic.
    pub fn stop(&self) -> Result<(), BusError> {
        let topics: Vec<String> = {
            let routes = self.inner.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.keys().cloned().collect()
        };
        for topic in topics {
            self.inner.bus.unsubscribe(&topic)?;
        }
        info!("stream bridge stopped");
        Ok(())
    }

    /// Publishes an outbound message on the bus; it fans out to live
    /// connections through this bridge's own subscription.
    pub fn send_message(&self, message: &Message) -> Result<MessageId, BusError> {
        self.inner.bus.publish(message)
    }
}

impl BridgeInner {
    fn dispatch(&self, message: &Message) {
        // Exact route wins over a wildcard filter route.
        let kind = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.get(&message.topic).copied().or_else(|| {
                routes
                    .iter()
                    .find(|(filter, _)| topic_matches(filter, &message.topic))
                    .map(|(_, kind)| *kind)
            })
        };
        let Some(kind) = kind else {
            debug!(topic = %message.topic, "dropping message on unrouted topic");
            return;
        };
        let partition = message.tenant.with_branch(&message.branch);
        match kind {
            RouteKind::Subscribers => self.dispatch_to_subscribers(&partition, message),
            RouteKind::Direct => self.dispatch_direct(&partition, message),
            RouteKind::TenantBroadcast => self.dispatch_broadcast(&partition, message),
        }
    }

    fn dispatch_to_subscribers(&self, partition: &TenantId, message: &Message) {
        let subject = match message
            .payload
            .get_str("subject")
            .or_else(|| message.payload.get_str("id"))
        {
            Some(subject) => subject.to_string(),
            None => {
                debug!(topic = %message.topic, "dropping measure update without subject");
                return;
            }
        };
        let payload = message.payload.to_value();
        self.latest.record(partition, &subject, payload.clone());

        let text = match (ServerMessage::MeasureUpdate {
            subject: subject.clone(),
            payload,
        })
        .to_json()
        {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "measure update marshaling failed");
                return;
            }
        };
        // Zero subscribed users is the normal idle case, not an error.
        for user in self.subscriptions.resolve(partition, &subject) {
            self.hub.send_to_user(partition, &user, &text);
        }
    }

    fn dispatch_direct(&self, partition: &TenantId, message: &Message) {
        let user = message
            .user
            .clone()
            .or_else(|| message.payload.get_str("user").map(UserId::new))
            .or_else(|| message.payload.get_str("to_user").map(UserId::new));
        let Some(user) = user else {
            warn!(topic = %message.topic, id = %message.id, "dropping direct message without addressee");
            return;
        };
        let text = match (ServerMessage::DirectMessage {
            payload: message.payload.to_value(),
        })
        .to_json()
        {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "direct message marshaling failed");
                return;
            }
        };
        self.hub.send_to_user(partition, &user, &text);
    }

    fn dispatch_broadcast(&self, partition: &TenantId, message: &Message) {
        let text = match (ServerMessage::Broadcast {
            payload: message.payload.to_value(),
        })
        .to_json()
        {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "broadcast marshaling failed");
                return;
            }
        };
        for user in self.hub.connected_users(partition) {
            self.hub.send_to_user(partition, &user, &text);
        }
    }
}
