use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fieldline_core::{TenantId, UserId};

/// A registered live connection. It owns the only strong sender feeding the
/// connection's writer pump, so dropping it (on replacement or eviction)
/// ends the pump and closes the socket. Callers keep a [`ConnectionHandle`]
/// for cleanup, never the connection itself.
pub struct Connection {
    pub tenant: TenantId,
    pub user: UserId,
    sender: mpsc::Sender<String>,
}

impl Connection {
    /// Creates a connection with a bounded outbound queue, returning the
    /// receiver for the writer pump.
    pub fn new(
        tenant: TenantId,
        user: UserId,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        (
            Self {
                tenant,
                user,
                sender,
            },
            receiver,
        )
    }

    /// Identity handle for later [`Hub::unregister`].
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            tenant: self.tenant.clone(),
            user: self.user.clone(),
            sender: self.sender.downgrade(),
        }
    }
}

/// Identity of a registered connection. Holds only a weak sender, so a
/// retained handle cannot keep a replaced connection's queue open.
#[derive(Clone)]
pub struct ConnectionHandle {
    tenant: TenantId,
    user: UserId,
    sender: mpsc::WeakSender<String>,
}

/// Result of a fanout attempt toward one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    NoConnection,
    /// The connection's queue was full or closed; it has been evicted.
    Evicted,
}

/// Per-tenant registry of live connections, at most one per (tenant, user).
///
/// One RwLock guards the whole registry; fanout takes the read side and only
/// upgrades to a write lock to evict a dead or saturated connection.
#[derive(Default)]
pub struct Hub {
    connections: RwLock<HashMap<TenantId, HashMap<UserId, Connection>>>,
    sends: AtomicU64,
    evictions: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. An existing connection for the same
    /// (tenant, user) is replaced; dropping its sender force-closes it.
    pub fn register(&self, connection: Connection) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        let tenant = connection.tenant.clone();
        let user = connection.user.clone();
        let replaced = connections
            .entry(tenant.clone())
            .or_default()
            .insert(user.clone(), connection);
        if replaced.is_some() {
            info!(%tenant, %user, "replacing existing live connection");
        } else {
            debug!(%tenant, %user, "connection registered");
        }
    }

    /// Removes the connection `handle` refers to if it is still the
    /// registered one for its (tenant, user). A replaced connection's only
    /// strong sender was dropped on replacement, so its stale handle fails
    /// to upgrade and the call is a no-op.
    pub fn unregister(&self, handle: &ConnectionHandle) {
        let Some(sender) = handle.sender.upgrade() else {
            return;
        };
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(users) = connections.get_mut(&handle.tenant) {
            let matches = users
                .get(&handle.user)
                .map(|current| current.sender.same_channel(&sender))
                .unwrap_or(false);
            if matches {
                users.remove(&handle.user);
                debug!(tenant = %handle.tenant, user = %handle.user, "connection unregistered");
            }
            if users.is_empty() {
                connections.remove(&handle.tenant);
            }
        }
    }

    /// Attempts a non-blocking delivery to one user. A full or closed queue
    /// evicts the connection rather than blocking the caller.
    pub fn send_to_user(&self, tenant: &TenantId, user: &UserId, text: &str) -> SendOutcome {
        let sender = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            match connections.get(tenant).and_then(|users| users.get(user)) {
                Some(connection) => connection.sender.clone(),
                None => return SendOutcome::NoConnection,
            }
        };

        match sender.try_send(text.to_string()) {
            Ok(()) => {
                self.sends.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Delivered
            }
            Err(err) => {
                warn!(%tenant, %user, error = %err, "evicting unresponsive connection");
                self.evict(tenant, user, &sender);
                SendOutcome::Evicted
            }
        }
    }

    fn evict(&self, tenant: &TenantId, user: &UserId, sender: &mpsc::Sender<String>) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(users) = connections.get_mut(tenant) {
            let matches = users
                .get(user)
                .map(|current| current.sender.same_channel(sender))
                .unwrap_or(false);
            if matches {
                users.remove(user);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            if users.is_empty() {
                connections.remove(tenant);
            }
        }
    }

    /// Users currently connected under `tenant`.
    pub fn connected_users(&self, tenant: &TenantId) -> Vec<UserId> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, tenant: &TenantId, user: &UserId) -> bool {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant)
            .map(|users| users.contains_key(user))
            .unwrap_or(false)
    }

    /// Total live connections across all tenants.
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn delivered_total(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    pub fn evicted_total(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;

    use fieldline_core::{TenantId, UserId};

    use super::{Connection, Hub, SendOutcome};

    fn tenant() -> TenantId {
        TenantId::new("acme:hq")
    }

    fn user() -> UserId {
        UserId::new("u1")
    }

    #[test]
    fn delivery_reaches_the_registered_connection() {
        let hub = Hub::new();
        let (connection, mut rx) = Connection::new(tenant(), user(), 4);
        hub.register(connection);

        assert_eq!(
            hub.send_to_user(&tenant(), &user(), "hello"),
            SendOutcome::Delivered
        );
        assert_eq!(rx.try_recv().expect("message should arrive"), "hello");
        assert_eq!(hub.delivered_total(), 1);
    }

    #[test]
    fn missing_connection_reports_no_connection() {
        let hub = Hub::new();
        assert_eq!(
            hub.send_to_user(&tenant(), &user(), "hello"),
            SendOutcome::NoConnection
        );
    }

    #[test]
    fn re_registration_replaces_and_closes_the_old_connection() {
        let hub = Hub::new();
        let (old, mut old_rx) = Connection::new(tenant(), user(), 4);
        let (new, mut new_rx) = Connection::new(tenant(), user(), 4);
        hub.register(old);
        hub.register(new);

        assert_eq!(hub.connection_count(), 1);
        assert_eq!(
            hub.send_to_user(&tenant(), &user(), "hello"),
            SendOutcome::Delivered
        );
        assert_eq!(new_rx.try_recv().expect("message should arrive"), "hello");
        // The old sender was dropped on replacement, so its receiver ends.
        assert!(matches!(
            old_rx.try_recv(),
            Err(TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn replacement_closes_the_old_queue_despite_a_retained_handle() {
        let hub = Hub::new();
        let (old, mut old_rx) = Connection::new(tenant(), user(), 4);
        // Socket tasks keep a handle for cleanup; it must not hold the
        // queue open once the registry drops the connection.
        let _old_handle = old.handle();
        hub.register(old);

        let (new, _new_rx) = Connection::new(tenant(), user(), 4);
        hub.register(new);

        assert!(matches!(
            old_rx.try_recv(),
            Err(TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn full_queue_evicts_without_blocking() {
        let hub = Hub::new();
        let (connection, _rx) = Connection::new(tenant(), user(), 1);
        hub.register(connection);

        assert_eq!(
            hub.send_to_user(&tenant(), &user(), "first"),
            SendOutcome::Delivered
        );
        // The receiver is never drained, so the queue stays full.
        assert_eq!(
            hub.send_to_user(&tenant(), &user(), "second"),
            SendOutcome::Evicted
        );
        assert!(!hub.is_connected(&tenant(), &user()));
        assert_eq!(hub.evicted_total(), 1);
    }

    #[test]
    fn unregister_ignores_an_already_replaced_connection() {
        let hub = Hub::new();
        let (old, _old_rx) = Connection::new(tenant(), user(), 4);
        let (new, _new_rx) = Connection::new(tenant(), user(), 4);
        let stale = old.handle();
        hub.register(old);
        hub.register(new);

        hub.unregister(&stale);
        assert!(hub.is_connected(&tenant(), &user()));
    }

    #[test]
    fn unregister_prunes_empty_tenant_entries() {
        let hub = Hub::new();
        let (connection, _rx) = Connection::new(tenant(), user(), 4);
        let handle = connection.handle();
        hub.register(connection);
        hub.unregister(&handle);

        assert_eq!(hub.connection_count(), 0);
        assert!(hub.connected_users(&tenant()).is_empty());
    }

    #[test]
    fn tenants_are_isolated() {
        let hub = Hub::new();
        let (a, mut a_rx) = Connection::new(TenantId::new("acme:hq"), user(), 4);
        let (b, mut b_rx) = Connection::new(TenantId::new("globex:hq"), user(), 4);
        hub.register(a);
        hub.register(b);

        hub.send_to_user(&TenantId::new("acme:hq"), &user(), "for acme");
        assert_eq!(a_rx.try_recv().expect("message should arrive"), "for acme");
        assert!(b_rx.try_recv().is_err());
    }
}
