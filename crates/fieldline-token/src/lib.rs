//! Ephemeral, single-use connection credentials.
//!
//! A token is bound to one (tenant, branch, user), survives at most its
//! configured lifetime, and is consumed by its first successful validation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use fieldline_core::{now_millis, BranchId, TenantId, UserId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token not found")]
    NotFound,
    #[error("token was issued for a different tenant or branch")]
    TenantMismatch,
    #[error("token has expired")]
    Expired,
}

/// A freshly issued credential, handed to the client for its next
/// WebSocket connect.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    /// Unix timestamp in milliseconds.
    pub expires_at: u64,
}

struct TokenRecord {
    tenant: TenantId,
    branch: BranchId,
    user: UserId,
    expires_at: u64,
}

/// In-memory issuer of single-use connection tokens.
pub struct TokenIssuer {
    lifetime: Duration,
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl TokenIssuer {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a token for one upcoming connection by `user`.
    pub fn issue(&self, tenant: TenantId, branch: BranchId, user: UserId) -> IssuedToken {
        let mut raw = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let expires_at = now_millis() + self.lifetime.as_millis() as u64;
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).insert(
            token.clone(),
            TokenRecord {
                tenant,
                branch,
                user,
                expires_at,
            },
        );
        IssuedToken { token, expires_at }
    }

    /// Validates and consumes a token.
    ///
    /// A tenant or branch mismatch leaves the record in place so the
    /// rightful owner can still use it; an expired record is deleted on
    /// sight. Success deletes the record: a token validates exactly once.
    pub fn validate(
        &self,
        tenant: &TenantId,
        branch: &BranchId,
        token: &str,
    ) -> Result<UserId, TokenError> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let record = tokens.get(token).ok_or(TokenError::NotFound)?;
        if record.tenant != *tenant || record.branch != *branch {
            return Err(TokenError::TenantMismatch);
        }
        if now_millis() >= record.expires_at {
            tokens.remove(token);
            return Err(TokenError::Expired);
        }
        let record = tokens.remove(token).ok_or(TokenError::NotFound)?;
        Ok(record.user)
    }

    /// Deletes a token before use. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token)
            .is_some()
    }

    /// Deletes every expired record, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let before = tokens.len();
        tokens.retain(|_, record| record.expires_at > now);
        before - tokens.len()
    }

    pub fn outstanding(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Handle to the background expiry sweeper.
pub struct SweeperGuard {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SweeperGuard {
    pub async fn stop(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Spawns the periodic expiry sweep. Must be called inside a tokio runtime.
pub fn spawn_sweeper(issuer: Arc<TokenIssuer>, sweep_interval: Duration) -> SweeperGuard {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => {
                    let removed = issuer.sweep_expired();
                    if removed > 0 {
                        debug!(removed, "swept expired tokens");
                    }
                }
            }
        }
        info!("token sweeper stopped");
    });
    SweeperGuard {
        shutdown_tx: Some(shutdown_tx),
        handle: Some(handle),
    }
}
