use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::filter::topic_matches;
use crate::pubsub::{FrameHandler, PubSubTransport, TransportError};

/// In-memory broker for tests, simulations, and single-process deployments.
///
/// Publishing dispatches synchronously to every matching subscription on the
/// caller's thread, which therefore acts as the delivery thread. Handlers are
/// invoked outside the broker's lock, so they may publish back into the same
/// broker without deadlocking.
pub struct InMemoryBroker {
    subscriptions: Mutex<HashMap<String, FrameHandler>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    connected: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for the usual shared-handle form.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Toggles the simulated link state. Publishing while disconnected fails
    /// with [`TransportError::NotConnected`].
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Returns every payload published on `topic` so far.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Drains and returns all published frames captured so far.
    pub fn take_published(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.published.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl PubSubTransport for InMemoryBroker {
    fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), payload.to_vec()));

        let matching: Vec<FrameHandler> = {
            let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in matching {
            handler(topic, payload);
        }
        Ok(())
    }

    fn subscribe(&self, filter: &str, handler: FrameHandler) -> Result<(), TransportError> {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if subscriptions.contains_key(filter) {
            return Err(TransportError::AlreadySubscribed {
                filter: filter.to_string(),
            });
        }
        subscriptions.insert(filter.to_string(), handler);
        Ok(())
    }

    fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if subscriptions.remove(filter).is_none() {
            return Err(TransportError::NotSubscribed {
                filter: filter.to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
