//! Temporary credentials handed to clients over the relay and redeemed
//! once over the direct channel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Pending single-use credentials with a time to live.
#[derive(Debug)]
pub struct CredentialStore {
    ttl: Duration,
    pending: Mutex<HashMap<String, Instant>>,
}

impl CredentialStore {
    pub fn new(ttl: Duration) -> Self {
        CredentialStore {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a fresh credential.
    pub fn issue(&self) -> String {
        let credential = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        pending.insert(credential.clone(), Instant::now() + self.ttl);
        debug!(pending = pending.len(), "Issued direct credential");
        credential
    }

    /// Consumes a credential. Unknown, used and expired credentials are all
    /// `Unauthorized`.
    pub fn redeem(&self, credential: &str) -> SyncResult<()> {
        let expires_at = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(credential);
        match expires_at {
            Some(at) if Instant::now() < at => Ok(()),
            Some(_) => Err(SyncError::Unauthorized("credential expired".to_string())),
            None => Err(SyncError::Unauthorized(
                "unknown or already used credential".to_string(),
            )),
        }
    }

    /// Drops expired credentials and returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let before = pending.len();
        pending.retain(|_, at| now < *at);
        before - pending.len()
    }

    /// Forgets every pending credential.
    pub fn clear(&self) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_is_single_use() {
        let store = CredentialStore::new(Duration::from_secs(60));
        let credential = store.issue();
        assert_eq!(credential.len(), 64);

        store.redeem(&credential).unwrap();
        let err = store.redeem(&credential).unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credentials() {
        let store = CredentialStore::new(Duration::from_secs(30));
        let stale = store.issue();
        let other = store.issue();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(store.redeem(&stale), Err(SyncError::Unauthorized(_))));
        assert_eq!(store.purge_expired(), 1);

        let fresh = store.issue();
        store.clear();
        assert!(store.redeem(&fresh).is_err());
        assert!(store.redeem(&other).is_err());
    }
}
