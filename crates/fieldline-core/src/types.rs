use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Tenant partition identifier.
///
/// Live-connection partitions are keyed by tenant *and* branch; use
/// [`TenantId::with_branch`] to derive the combined partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

/// Branch identifier within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub String);

/// End-user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Unique message identifier, generated at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derives the branch-scoped partition key used by the connection hub.
    pub fn with_branch(&self, branch: &BranchId) -> TenantId {
        TenantId(format!("{}:{}", self.0, branch.0))
    }
}

impl BranchId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh 16-byte random identifier, hex-encoded.
    pub fn generate() -> Self {
        let mut raw = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(hex::encode(raw))
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{BranchId, MessageId, TenantId};

    #[test]
    fn generated_message_ids_are_unique_hex() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
        assert_eq!(a.0.len(), 32);
        assert!(a.0.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn partition_key_combines_tenant_and_branch() {
        let tenant = TenantId::new("acme");
        let branch = BranchId::new("hq");
        assert_eq!(tenant.with_branch(&branch), TenantId::new("acme:hq"));
    }
}
