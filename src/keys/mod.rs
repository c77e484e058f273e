//! Key lifecycle: issuance, extension, deletion and the expiry sweep.
//!
//! [`KeyManager`] is the only component that decides *when* a key is
//! created or moved; [`KeyStore`] decides *how* that reaches disk.
//!
//! 1. **Issuance** is idempotent per identity: a client that already holds an
//!    active key gets the same key back, so retried requests never mint
//!    duplicates.
//! 2. **Custom keys** are created by an administrator with a chosen token,
//!    lifetime and seat count, under the [`ADMIN_IDENTITY`] sentinel. They
//!    are never deduplicated by identity.
//! 3. **Extension** only ever touches keys that have not expired yet.
//! 4. **Sweeping** removes expired keys, either before an admin listing or
//!    on a periodic timer ([`spawn_sweeper`]). Validation checks expiry on
//!    its own, so the sweep is housekeeping rather than a correctness step.

pub mod store;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::debug;

use crate::admin::AdminCapability;
use crate::audit::{self, AuditEvent};
use crate::clock::Clock;
use crate::{Error, Result};

pub use store::{Admission, Key, KeyStore, NewKey};

/// Identity recorded on keys created through the admin surface.
pub const ADMIN_IDENTITY: &str = "admin";

/// Issuance defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    /// Lifetime of keys issued to clients.
    pub ttl: TimeDelta,
    /// Seats on keys issued to clients.
    pub max_users: u32,
    /// Seats on custom keys when the admin does not say.
    pub custom_max_users: u32,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            ttl: TimeDelta::hours(24),
            max_users: 2,
            custom_max_users: 1,
        }
    }
}

/// Convert whole hours into a delta, rejecting overflow.
fn hours(h: i64) -> Result<TimeDelta> {
    TimeDelta::try_hours(h).ok_or_else(|| out_of_range(h))
}

fn out_of_range(h: i64) -> Error {
    Error::InvalidInput(format!("hours out of range: {h}"))
}

/// Shift a key's expiry, leaving it untouched if the result is not a
/// representable instant.
fn shift_expiry(key: &mut Key, delta: TimeDelta, delta_hours: i64) -> Result<()> {
    key.expires_at = key
        .expires_at
        .checked_add_signed(delta)
        .ok_or_else(|| out_of_range(delta_hours))?;
    Ok(())
}

/// Key lifecycle manager.
pub struct KeyManager {
    store: Arc<KeyStore>,
    clock: Arc<dyn Clock>,
    policy: KeyPolicy,
}

impl KeyManager {
    /// Wire the manager to its store and clock.
    pub fn new(store: Arc<KeyStore>, clock: Arc<dyn Clock>, policy: KeyPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<KeyStore> {
        &self.store
    }

    /// Issue a key for `identity` with the default seat count.
    pub async fn issue(&self, identity: &str) -> Result<Key> {
        self.issue_with(identity, self.policy.max_users).await
    }

    /// Issue a key for `identity`, reusing its active key if it has one.
    pub async fn issue_with(&self, identity: &str, max_users: u32) -> Result<Key> {
        let draft = NewKey {
            token: None,
            identity: identity.to_string(),
            max_users,
            ttl: self.policy.ttl,
        };
        let (key, created) = self.store.find_or_create(draft, self.clock.now()).await?;

        if created {
            audit::emit(&AuditEvent::key_issued(&key));
        } else {
            audit::emit(&AuditEvent::key_reused(&key));
        }
        Ok(key)
    }

    /// Issue (or reuse) a standard key for the admin sentinel identity.
    pub async fn issue_admin(&self, _cap: &AdminCapability) -> Result<Key> {
        self.issue(ADMIN_IDENTITY).await
    }

    /// Create an admin key with an explicit token.
    ///
    /// `duration_hours` must be positive. `max_users` falls back to the
    /// policy's custom default.
    pub async fn issue_custom(
        &self,
        _cap: &AdminCapability,
        token: &str,
        duration_hours: i64,
        max_users: Option<u32>,
    ) -> Result<Key> {
        if duration_hours <= 0 {
            return Err(Error::InvalidDuration(format!(
                "{duration_hours} hours (must be positive)"
            )));
        }
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::InvalidInput("custom key token is empty".to_string()));
        }

        let draft = NewKey {
            token: Some(token.to_string()),
            identity: ADMIN_IDENTITY.to_string(),
            max_users: max_users.unwrap_or(self.policy.custom_max_users),
            ttl: hours(duration_hours)?,
        };
        let key = self.store.create(draft, self.clock.now()).await?;
        audit::emit(&AuditEvent::key_issued(&key));
        Ok(key)
    }

    /// The identity's active key, if any.
    pub async fn current(&self, identity: &str) -> Option<Key> {
        self.store
            .find_active_by_identity(identity, self.clock.now())
            .await
    }

    /// Move an active key's expiry by `delta_hours`.
    ///
    /// Unknown or expired tokens are left alone and yield `Ok(None)`.
    pub async fn extend(
        &self,
        _cap: &AdminCapability,
        token: &str,
        delta_hours: i64,
    ) -> Result<Option<Key>> {
        let delta = hours(delta_hours)?;
        let now = self.clock.now();

        if !self
            .store
            .find_by_token(token)
            .await
            .is_some_and(|k| k.is_active(now))
        {
            return Ok(None);
        }

        let updated = self
            .store
            .update(token, |key| {
                // Re-checked under the store lock.
                if !key.is_active(now) {
                    return Ok(None);
                }
                shift_expiry(key, delta, delta_hours)?;
                Ok(Some(key.clone()))
            })
            .await?
            .flatten();

        if let Some(ref key) = updated {
            audit::emit(&AuditEvent::key_extended(key));
        }
        Ok(updated)
    }

    /// Move every active key's expiry by `delta_hours`. Returns how many
    /// keys were extended.
    pub async fn extend_all(&self, _cap: &AdminCapability, delta_hours: i64) -> Result<usize> {
        let delta = hours(delta_hours)?;
        let count = self
            .store
            .update_active(self.clock.now(), |key| {
                shift_expiry(key, delta, delta_hours)
            })
            .await?;
        debug!(count, delta_hours, "Extended all active keys");
        Ok(count)
    }

    /// Delete one key. `Ok(false)` if the token is unknown.
    pub async fn delete(&self, _cap: &AdminCapability, token: &str) -> Result<bool> {
        let removed = self.store.delete(token).await?;
        if removed {
            audit::emit(&AuditEvent::key_deleted(token));
        }
        Ok(removed)
    }

    /// Delete every key.
    pub async fn delete_all(&self, _cap: &AdminCapability) -> Result<usize> {
        let count = self.store.delete_all().await?;
        audit::emit(&AuditEvent::keys_purged(count, "all"));
        Ok(count)
    }

    /// Remove expired keys.
    pub async fn purge_expired(&self) -> Result<usize> {
        let count = self.store.delete_expired(self.clock.now()).await?;
        if count > 0 {
            audit::emit(&AuditEvent::keys_purged(count, "expired"));
        }
        Ok(count)
    }

    /// Sweep, then list what is left (admin listing).
    pub async fn list(&self, _cap: &AdminCapability) -> Result<Vec<Key>> {
        self.purge_expired().await?;
        Ok(self.store.list().await)
    }
}

/// Spawn a background task that purges expired keys every `interval`.
///
/// The task exits when the `shutdown` receiver fires. A failed sweep is
/// logged and retried on the next tick.
pub fn spawn_sweeper(
    manager: Arc<KeyManager>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match manager.purge_expired().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Swept expired keys"),
                        Err(e) => tracing::warn!(error = %e, "Key sweep failed"),
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Key sweeper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminToken;
    use crate::clock::ManualClock;
    use crate::snapshot::MemorySnapshot;
    use chrono::{DateTime, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn admin() -> AdminCapability {
        AdminToken::new("secret").verify("secret").unwrap()
    }

    async fn manager() -> (KeyManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = KeyStore::open(
            Arc::new(MemorySnapshot::<Key>::new()),
            Arc::new(MemorySnapshot::<String>::new()),
            "key_",
        )
        .await
        .unwrap();
        let mgr = KeyManager::new(
            Arc::new(store),
            Arc::clone(&clock) as Arc<dyn Clock>,
            KeyPolicy::default(),
        );
        (mgr, clock)
    }

    #[tokio::test]
    async fn issue_is_idempotent_per_identity() {
        // GIVEN: a fresh manager
        let (mgr, clock) = manager().await;

        // WHEN: the same identity asks twice
        let first = mgr.issue("1.2.3.4").await.unwrap();
        clock.advance(TimeDelta::minutes(10));
        let second = mgr.issue("1.2.3.4").await.unwrap();

        // THEN: the same key comes back, unchanged
        assert_eq!(first, second);
        assert_eq!(first.max_users, 2);
        assert_eq!(first.expires_at, t0() + TimeDelta::hours(24));
    }

    #[tokio::test]
    async fn issue_after_expiry_mints_new_key() {
        let (mgr, clock) = manager().await;
        let first = mgr.issue("1.2.3.4").await.unwrap();

        clock.advance(TimeDelta::hours(24));
        let second = mgr.issue("1.2.3.4").await.unwrap();

        assert_ne!(first.token, second.token);
    }

    #[tokio::test]
    async fn different_identities_get_different_keys() {
        let (mgr, _) = manager().await;
        let a = mgr.issue("1.1.1.1").await.unwrap();
        let b = mgr.issue("2.2.2.2").await.unwrap();
        assert_ne!(a.token, b.token);
    }

    #[tokio::test]
    async fn custom_keys_bypass_identity_dedup() {
        let (mgr, _) = manager().await;
        let cap = admin();

        let a = mgr.issue_custom(&cap, "VIP-1", 48, Some(5)).await.unwrap();
        let b = mgr.issue_custom(&cap, "VIP-2", 1, None).await.unwrap();

        assert_eq!(a.identity, ADMIN_IDENTITY);
        assert_eq!(b.identity, ADMIN_IDENTITY);
        assert_eq!(a.max_users, 5);
        assert_eq!(b.max_users, 1);
        assert_eq!(a.expires_at, t0() + TimeDelta::hours(48));
        assert_eq!(mgr.store().len().await, 2);
    }

    #[tokio::test]
    async fn custom_key_requires_positive_duration() {
        let (mgr, _) = manager().await;
        let cap = admin();

        for bad in [0, -3] {
            let result = mgr.issue_custom(&cap, "VIP", bad, Some(1)).await;
            assert!(matches!(result, Err(Error::InvalidDuration(_))));
        }
        assert!(mgr.store().is_empty().await);
    }

    #[tokio::test]
    async fn custom_key_rejects_taken_token() {
        let (mgr, _) = manager().await;
        let cap = admin();
        mgr.issue_custom(&cap, "VIP", 1, None).await.unwrap();

        let again = mgr.issue_custom(&cap, "VIP", 1, None).await;
        assert!(matches!(again, Err(Error::DuplicateToken(_))));
    }

    #[tokio::test]
    async fn extend_adds_exactly_one_hour() {
        let (mgr, _) = manager().await;
        let key = mgr.issue("1.2.3.4").await.unwrap();

        let extended = mgr.extend(&admin(), &key.token, 1).await.unwrap().unwrap();

        assert_eq!(
            (extended.expires_at - key.expires_at).num_milliseconds(),
            3_600_000
        );
        assert_eq!(extended.created_at, key.created_at);
    }

    #[tokio::test]
    async fn extend_ignores_unknown_and_expired() {
        let (mgr, clock) = manager().await;
        let key = mgr.issue("1.2.3.4").await.unwrap();

        assert!(mgr.extend(&admin(), "missing", 1).await.unwrap().is_none());

        clock.advance(TimeDelta::hours(25));
        assert!(mgr.extend(&admin(), &key.token, 1).await.unwrap().is_none());
        let stored = mgr.store().find_by_token(&key.token).await.unwrap();
        assert_eq!(stored.expires_at, key.expires_at);
    }

    #[tokio::test]
    async fn extend_all_touches_only_active_keys() {
        // GIVEN: one key that will expire and one that stays active
        let (mgr, clock) = manager().await;
        let cap = admin();
        let short = mgr.issue_custom(&cap, "short", 1, None).await.unwrap();
        let long = mgr.issue("1.2.3.4").await.unwrap();
        clock.advance(TimeDelta::hours(2));

        // WHEN: extending everything by 3h
        let count = mgr.extend_all(&cap, 3).await.unwrap();

        // THEN: only the active key moved
        assert_eq!(count, 1);
        let short_after = mgr.store().find_by_token(&short.token).await.unwrap();
        let long_after = mgr.store().find_by_token(&long.token).await.unwrap();
        assert_eq!(short_after.expires_at, short.expires_at);
        assert_eq!(long_after.expires_at, long.expires_at + TimeDelta::hours(3));
    }

    const HUGE_HOURS: i64 = 1_000_000_000_000;

    #[tokio::test]
    async fn extend_past_the_calendar_is_rejected() {
        let (mgr, _) = manager().await;
        let key = mgr.issue("1.2.3.4").await.unwrap();

        let result = mgr.extend(&admin(), &key.token, HUGE_HOURS).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(mgr.store().find_by_token(&key.token).await, Some(key));
    }

    #[tokio::test]
    async fn extend_all_past_the_calendar_changes_nothing() {
        let (mgr, _) = manager().await;
        let a = mgr.issue("1.1.1.1").await.unwrap();
        let b = mgr.issue("2.2.2.2").await.unwrap();

        let result = mgr.extend_all(&admin(), HUGE_HOURS).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(mgr.store().find_by_token(&a.token).await, Some(a));
        assert_eq!(mgr.store().find_by_token(&b.token).await, Some(b));
    }

    #[tokio::test]
    async fn custom_key_past_the_calendar_is_rejected() {
        let (mgr, _) = manager().await;

        let result = mgr.issue_custom(&admin(), "VIP", HUGE_HOURS, None).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(mgr.store().is_empty().await);
    }

    #[tokio::test]
    async fn list_sweeps_expired_first() {
        let (mgr, clock) = manager().await;
        let cap = admin();
        mgr.issue_custom(&cap, "short", 1, None).await.unwrap();
        let long = mgr.issue("1.2.3.4").await.unwrap();
        clock.advance(TimeDelta::hours(1));

        let keys = mgr.list(&cap).await.unwrap();

        assert_eq!(keys, vec![long]);
    }

    #[tokio::test]
    async fn delete_and_delete_all() {
        let (mgr, _) = manager().await;
        let cap = admin();
        let a = mgr.issue("1.1.1.1").await.unwrap();
        mgr.issue("2.2.2.2").await.unwrap();
        mgr.issue("3.3.3.3").await.unwrap();

        assert!(mgr.delete(&cap, &a.token).await.unwrap());
        assert!(!mgr.delete(&cap, &a.token).await.unwrap());
        assert_eq!(mgr.delete_all(&cap).await.unwrap(), 2);
        assert!(mgr.store().is_empty().await);
    }

    #[tokio::test]
    async fn current_returns_active_key_only() {
        let (mgr, clock) = manager().await;
        assert!(mgr.current("1.2.3.4").await.is_none());

        let key = mgr.issue("1.2.3.4").await.unwrap();
        assert_eq!(mgr.current("1.2.3.4").await, Some(key));

        clock.advance(TimeDelta::hours(24));
        assert!(mgr.current("1.2.3.4").await.is_none());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let (mgr, clock) = manager().await;
        mgr.issue_custom(&admin(), "short", 1, None).await.unwrap();
        clock.advance(TimeDelta::hours(2));
        let mgr = Arc::new(mgr);

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let handle = spawn_sweeper(Arc::clone(&mgr), Duration::from_millis(10), rx);

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mgr.store().is_empty().await);

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
