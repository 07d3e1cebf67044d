//! Revoked-token set.
//!
//! Tokens land here on logout and stay until the sweeper sees that their own expiry has
//! passed; after that the signature check rejects them anyway. Between sweeps the set
//! grows with the logout rate.

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::token::TokenCodec;
use crate::shutdown::Cancellation;

/// Default time between two sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Concurrent set of revoked token strings.
///
/// Every lock is held for a single map operation only, so readers are never held up
/// behind a sweep.
#[derive(Debug, Default)]
pub struct RevocationStore {
    // token -> moment of revocation
    revoked: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl RevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as revoked. Revoking an already revoked token keeps the first entry.
    pub fn revoke(&self, token: &str) {
        self.revoked
            .write()
            .entry(token.to_string())
            .or_insert_with(Utc::now);
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        self.revoked.read().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.revoked.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry whose token expired before `now` and returns how many went.
    ///
    /// Entries for which `expiry_of` returns `None` are kept.
    pub fn sweep_expired<F>(&self, now: DateTime<Utc>, expiry_of: F) -> usize
    where
        F: Fn(&str) -> Option<DateTime<Utc>>,
    {
        let expired: Vec<String> = {
            let revoked = self.revoked.read();
            revoked
                .keys()
                .filter(|token| matches!(expiry_of(token.as_str()), Some(expiry) if expiry < now))
                .cloned()
                .collect()
        };

        if expired.is_empty() {
            return 0;
        }

        let mut revoked = self.revoked.write();
        for token in &expired {
            revoked.remove(token);
        }
        expired.len()
    }

    /// Spawns the periodic sweep. The loop stops when `cancellation` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        codec: TokenCodec,
        period: Duration,
        cancellation: Cancellation,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Revocation sweeper started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired(Utc::now(), |token| codec.expiry_of(token));
                        debug!(
                            "Revocation sweep removed {} expired tokens, {} remain",
                            removed,
                            store.len()
                        );
                    }
                    _ = cancellation.cancelled() => {
                        info!("Revocation sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
