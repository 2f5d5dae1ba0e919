use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use fieldline_core::{TenantId, UserId};

/// Per-tenant index of subject subscriptions, maintained alongside the
/// connection lifecycle: a user's entries are cleared on disconnect.
#[derive(Default)]
pub struct SubscriptionIndex {
    inner: RwLock<HashMap<TenantId, HashMap<String, HashSet<UserId>>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, tenant: &TenantId, subject: &str, user: &UserId) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tenant.clone())
            .or_default()
            .entry(subject.to_string())
            .or_default()
            .insert(user.clone());
    }

    pub fn unsubscribe(&self, tenant: &TenantId, subject: &str, user: &UserId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subjects) = inner.get_mut(tenant) {
            if let Some(users) = subjects.get_mut(subject) {
                users.remove(user);
                if users.is_empty() {
                    subjects.remove(subject);
                }
            }
            if subjects.is_empty() {
                inner.remove(tenant);
            }
        }
    }

    /// Users of `tenant` subscribed to `subject`.
    pub fn resolve(&self, tenant: &TenantId, subject: &str) -> Vec<UserId> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant)
            .and_then(|subjects| subjects.get(subject))
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every subscription held by `user`, across all subjects.
    pub fn clear_user(&self, tenant: &TenantId, user: &UserId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subjects) = inner.get_mut(tenant) {
            subjects.retain(|_, users| {
                users.remove(user);
                !users.is_empty()
            });
            if subjects.is_empty() {
                inner.remove(tenant);
            }
        }
    }
}
