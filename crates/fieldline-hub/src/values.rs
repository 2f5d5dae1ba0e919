use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

use fieldline_core::TenantId;

/// Last observed value per (tenant, subject), updated by the bridge on every
/// measure update. Backs the client protocol's current-value request.
#[derive(Default)]
pub struct LatestValues {
    inner: RwLock<HashMap<(TenantId, String), Value>>,
}

impl LatestValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tenant: &TenantId, subject: &str, value: Value) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((tenant.clone(), subject.to_string()), value);
    }

    pub fn get(&self, tenant: &TenantId, subject: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(tenant.clone(), subject.to_string()))
            .cloned()
    }
}
