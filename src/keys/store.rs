//! Key store: the durable collection of issued keys.
//!
//! # Design
//!
//! Keys live in an in-memory index keyed by **token** (validation, admin
//! mutation) with a secondary index by **identity** (idempotent issuance).
//! A single async mutex guards the whole index, and every mutation holds it
//! across the snapshot write: "mutate, persist" is one critical section, so
//! two concurrent validations can never both pass a seat check before either
//! writes.
//!
//! When a snapshot write fails the in-memory change is rolled back, so memory
//! always matches the last collection that reached disk.
//!
//! Tokens that leave the collection (delete, bulk delete, sweep) are retired
//! and never handed out again.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::token;
use crate::snapshot::Snapshot;
use crate::{Error, Result};

/// An issued access key.
///
/// Serialized field names match the on-disk collection format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Key {
    /// The opaque credential presented by clients.
    #[serde(rename = "key")]
    pub token: String,
    /// Client IP (or the admin sentinel) that owns the key.
    #[serde(rename = "ip")]
    pub identity: String,
    /// Cap on distinct consuming players.
    #[serde(deserialize_with = "lenient_count")]
    pub max_users: u32,
    /// Creation instant (immutable).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Expiry instant; moves forward on extension.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Legacy flag kept for file compatibility. Expiry is always decided
    /// from `expires_at`.
    #[serde(default)]
    pub expired: bool,
    /// `true` once at least one player has been admitted.
    #[serde(default)]
    pub in_use: bool,
    /// Players admitted under this key.
    #[serde(rename = "usedBy", default)]
    pub consumed_by: BTreeSet<String>,
}

impl Key {
    /// `true` while `expires_at` is strictly in the future.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Seats still available.
    #[must_use]
    pub fn seats_left(&self) -> u32 {
        let used = u32::try_from(self.consumed_by.len()).unwrap_or(u32::MAX);
        self.max_users.saturating_sub(used)
    }

    /// Time until expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.expires_at - now).max(TimeDelta::zero())
    }
}

/// `maxUsers` written by older admin forms may be a numeric string.
fn lenient_count<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Parameters for a key about to be created.
#[derive(Debug, Clone)]
pub struct NewKey {
    /// Explicit token (admin custom keys). `None` generates one.
    pub token: Option<String>,
    /// Owning identity.
    pub identity: String,
    /// Seat cap, at least 1.
    pub max_users: u32,
    /// Lifetime, strictly positive.
    pub ttl: TimeDelta,
}

/// Outcome of trying to seat a player on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Token unknown or expired.
    Invalid,
    /// Player was already seated; nothing written.
    Readmitted(Key),
    /// Player took a free seat; the collection was persisted.
    Admitted(Key),
    /// All seats are taken by other players.
    Full(Key),
}

#[derive(Default)]
struct KeyIndex {
    by_token: HashMap<String, Key>,
    /// identity -> tokens, in creation order
    by_identity: HashMap<String, Vec<String>>,
    retired: HashSet<String>,
}

impl KeyIndex {
    fn insert(&mut self, key: Key) {
        self.by_identity
            .entry(key.identity.clone())
            .or_default()
            .push(key.token.clone());
        self.by_token.insert(key.token.clone(), key);
    }

    fn remove(&mut self, token: &str) -> Option<Key> {
        let key = self.by_token.remove(token)?;
        if let Some(tokens) = self.by_identity.get_mut(&key.identity) {
            tokens.retain(|t| t != token);
            if tokens.is_empty() {
                self.by_identity.remove(&key.identity);
            }
        }
        Some(key)
    }

    /// Put back keys saved before an in-place mutation.
    fn restore(&mut self, keys: Vec<Key>) {
        for key in keys {
            self.by_token.insert(key.token.clone(), key);
        }
    }

    fn is_taken(&self, token: &str) -> bool {
        self.by_token.contains_key(token) || self.retired.contains(token)
    }

    fn find_active_by_identity(&self, identity: &str, now: DateTime<Utc>) -> Option<&Key> {
        self.by_identity
            .get(identity)?
            .iter()
            .filter_map(|t| self.by_token.get(t))
            .find(|k| k.is_active(now))
    }

    /// Collection order: oldest first, token as tie-breaker.
    fn sorted(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.by_token.values().cloned().collect();
        keys.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.token.cmp(&b.token))
        });
        keys
    }
}

/// The durable key collection.
pub struct KeyStore {
    index: Mutex<KeyIndex>,
    keys: Arc<dyn Snapshot<Key>>,
    retired: Arc<dyn Snapshot<String>>,
    token_prefix: String,
}

impl KeyStore {
    /// Load both collections and build the indices.
    pub async fn open(
        keys: Arc<dyn Snapshot<Key>>,
        retired: Arc<dyn Snapshot<String>>,
        token_prefix: impl Into<String>,
    ) -> Result<Self> {
        let mut index = KeyIndex::default();
        for key in keys.load().await? {
            if index.by_token.contains_key(&key.token) {
                warn!(token = %key.token, "Duplicate token in key collection, keeping first");
                continue;
            }
            index.insert(key);
        }
        index.retired = retired.load().await?.into_iter().collect();
        debug!(
            keys = index.by_token.len(),
            retired = index.retired.len(),
            "Key store loaded"
        );

        Ok(Self {
            index: Mutex::new(index),
            keys,
            retired,
            token_prefix: token_prefix.into(),
        })
    }

    /// Create a key. Generated tokens are regenerated on collision; an
    /// explicit token that is live or retired fails with
    /// [`Error::DuplicateToken`].
    pub async fn create(&self, draft: NewKey, now: DateTime<Utc>) -> Result<Key> {
        let mut index = self.index.lock().await;
        self.create_locked(&mut index, draft, now).await
    }

    /// Return the identity's active key, or create one from `draft`.
    ///
    /// The lookup and the insert happen under one lock, so concurrent
    /// issuance for the same identity yields a single key. The flag is `true`
    /// when a new key was created.
    pub async fn find_or_create(&self, draft: NewKey, now: DateTime<Utc>) -> Result<(Key, bool)> {
        let mut index = self.index.lock().await;
        if let Some(existing) = index.find_active_by_identity(&draft.identity, now) {
            return Ok((existing.clone(), false));
        }
        let key = self.create_locked(&mut index, draft, now).await?;
        Ok((key, true))
    }

    async fn create_locked(
        &self,
        index: &mut KeyIndex,
        draft: NewKey,
        now: DateTime<Utc>,
    ) -> Result<Key> {
        if draft.max_users == 0 {
            return Err(Error::InvalidMaxUsers);
        }
        if draft.ttl <= TimeDelta::zero() {
            return Err(Error::InvalidDuration(format!(
                "{} ms",
                draft.ttl.num_milliseconds()
            )));
        }

        let token = match draft.token {
            Some(t) if index.is_taken(&t) => return Err(Error::DuplicateToken(t)),
            Some(t) => t,
            None => loop {
                let candidate = token::generate(&self.token_prefix);
                if !index.is_taken(&candidate) {
                    break candidate;
                }
                debug!("Generated token collided, regenerating");
            },
        };

        let expires_at = now.checked_add_signed(draft.ttl).ok_or_else(|| {
            Error::InvalidInput(format!(
                "duration out of range: {} hours",
                draft.ttl.num_hours()
            ))
        })?;

        let key = Key {
            token: token.clone(),
            identity: draft.identity,
            max_users: draft.max_users,
            created_at: now,
            expires_at,
            expired: false,
            in_use: false,
            consumed_by: BTreeSet::new(),
        };
        index.insert(key.clone());

        if let Err(e) = self.keys.save(&index.sorted()).await {
            index.remove(&token);
            return Err(e);
        }
        Ok(key)
    }

    /// First key for `identity` that has not expired at `now`.
    pub async fn find_active_by_identity(&self, identity: &str, now: DateTime<Utc>) -> Option<Key> {
        let index = self.index.lock().await;
        index.find_active_by_identity(identity, now).cloned()
    }

    /// Exact token lookup, regardless of expiry.
    pub async fn find_by_token(&self, token: &str) -> Option<Key> {
        self.index.lock().await.by_token.get(token).cloned()
    }

    /// Apply `mutate` to the key and persist. `Ok(None)` if the token is
    /// unknown.
    ///
    /// The mutator must not change `token` or `identity`. If it fails the
    /// key is restored and nothing is written.
    pub async fn update<F, R>(&self, token: &str, mutate: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut Key) -> Result<R>,
    {
        let mut index = self.index.lock().await;
        let Some(key) = index.by_token.get_mut(token) else {
            return Ok(None);
        };
        let before = key.clone();
        let out = match mutate(key) {
            Ok(out) => out,
            Err(e) => {
                *key = before;
                return Err(e);
            }
        };
        debug_assert_eq!(key.token, before.token);
        debug_assert_eq!(key.identity, before.identity);

        if let Err(e) = self.keys.save(&index.sorted()).await {
            index.by_token.insert(before.token.clone(), before);
            return Err(e);
        }
        Ok(Some(out))
    }

    /// Apply `mutate` to every key active at `now` and persist once.
    /// Returns how many keys were touched.
    ///
    /// All or nothing: if `mutate` fails on any key, every key is restored
    /// and nothing is written.
    pub async fn update_active<F>(&self, now: DateTime<Utc>, mut mutate: F) -> Result<usize>
    where
        F: FnMut(&mut Key) -> Result<()>,
    {
        let mut index = self.index.lock().await;
        let mut before = Vec::new();
        let mut failed = None;
        for key in index.by_token.values_mut().filter(|k| k.is_active(now)) {
            before.push(key.clone());
            if let Err(e) = mutate(key) {
                failed = Some(e);
                break;
            }
        }
        if let Some(e) = failed {
            index.restore(before);
            return Err(e);
        }
        if before.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.keys.save(&index.sorted()).await {
            index.restore(before);
            return Err(e);
        }
        Ok(before.len())
    }

    /// Seat `player` on the key, enforcing expiry and the seat cap.
    ///
    /// Check and write run in one critical section.
    pub async fn admit(&self, token: &str, player: &str, now: DateTime<Utc>) -> Result<Admission> {
        let mut index = self.index.lock().await;
        let Some(key) = index.by_token.get_mut(token) else {
            return Ok(Admission::Invalid);
        };
        if !key.is_active(now) {
            return Ok(Admission::Invalid);
        }
        if key.consumed_by.contains(player) {
            return Ok(Admission::Readmitted(key.clone()));
        }
        if key.seats_left() == 0 {
            return Ok(Admission::Full(key.clone()));
        }

        let before = key.clone();
        key.consumed_by.insert(player.to_string());
        key.in_use = true;
        let admitted = key.clone();

        if let Err(e) = self.keys.save(&index.sorted()).await {
            index.by_token.insert(before.token.clone(), before);
            return Err(e);
        }
        Ok(Admission::Admitted(admitted))
    }

    /// Remove one key. `Ok(false)` if the token is unknown.
    pub async fn delete(&self, token: &str) -> Result<bool> {
        let mut index = self.index.lock().await;
        let Some(key) = index.remove(token) else {
            return Ok(false);
        };
        self.retire_locked(&mut index, vec![key]).await?;
        Ok(true)
    }

    /// Remove every key.
    pub async fn delete_all(&self) -> Result<usize> {
        let mut index = self.index.lock().await;
        let tokens: Vec<String> = index.by_token.keys().cloned().collect();
        let removed: Vec<Key> = tokens.iter().filter_map(|t| index.remove(t)).collect();
        let count = removed.len();
        self.retire_locked(&mut index, removed).await?;
        Ok(count)
    }

    /// Remove every key whose `expires_at <= now`.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut index = self.index.lock().await;
        let expired: Vec<String> = index
            .by_token
            .values()
            .filter(|k| !k.is_active(now))
            .map(|k| k.token.clone())
            .collect();
        let removed: Vec<Key> = expired.iter().filter_map(|t| index.remove(t)).collect();
        let count = removed.len();
        self.retire_locked(&mut index, removed).await?;
        Ok(count)
    }

    /// Persist removal of `removed` (already taken out of the index).
    ///
    /// The retired list is written first: a retired token that is still live
    /// is harmless, a deleted token that was never retired is not.
    async fn retire_locked(&self, index: &mut KeyIndex, removed: Vec<Key>) -> Result<()> {
        if removed.is_empty() {
            return Ok(());
        }

        let newly_retired: Vec<String> = removed
            .iter()
            .map(|k| k.token.clone())
            .filter(|t| !index.retired.contains(t))
            .collect();
        if !newly_retired.is_empty() {
            let mut retired: Vec<String> = index.retired.iter().cloned().collect();
            retired.extend(newly_retired.iter().cloned());
            retired.sort();
            if let Err(e) = self.retired.save(&retired).await {
                for key in removed {
                    index.insert(key);
                }
                return Err(e);
            }
            index.retired.extend(newly_retired);
        }

        if let Err(e) = self.keys.save(&index.sorted()).await {
            for key in removed {
                index.insert(key);
            }
            return Err(e);
        }
        Ok(())
    }

    /// All keys, oldest first.
    pub async fn list(&self) -> Vec<Key> {
        self.index.lock().await.sorted()
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.index.lock().await.by_token.len()
    }

    /// `true` when no keys are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
