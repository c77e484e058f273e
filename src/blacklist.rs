//! Blacklist: IP and player-name bans.
//!
//! A ban either lasts forever ([`BanExpiry::Permanent`]) or until an instant.
//! Expired timed bans are never swept: they simply stop matching and stay in
//! the collection until an administrator removes them.
//!
//! Bans are keyed by `value`. Adding a ban for a value that is already banned
//! replaces the existing entry, so there is at most one ban per value.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::snapshot::Snapshot;
use crate::Result;

/// What a ban applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanScope {
    /// Client IP, compared exactly.
    Ip,
    /// Player name, compared case-insensitively.
    Player,
}

impl fmt::Display for BanScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => write!(f, "ip"),
            Self::Player => write!(f, "player"),
        }
    }
}

impl std::str::FromStr for BanScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(Self::Ip),
            "player" => Ok(Self::Player),
            other => Err(format!("unknown ban type '{other}' (expected 'ip' or 'player')")),
        }
    }
}

/// When a ban stops applying.
///
/// Stored as the string `"permanent"` or epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawExpiry", into = "RawExpiry")]
pub enum BanExpiry {
    /// Never expires.
    Permanent,
    /// Applies while `now < instant`.
    Until(DateTime<Utc>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawExpiry {
    Millis(i64),
    Tag(String),
}

impl TryFrom<RawExpiry> for BanExpiry {
    type Error = String;

    fn try_from(raw: RawExpiry) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawExpiry::Tag(t) if t.eq_ignore_ascii_case("permanent") => Ok(Self::Permanent),
            RawExpiry::Tag(t) => Err(format!("invalid ban expiry '{t}'")),
            RawExpiry::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .map(Self::Until)
                .ok_or_else(|| format!("ban expiry out of range: {ms}")),
        }
    }
}

impl From<BanExpiry> for RawExpiry {
    fn from(expiry: BanExpiry) -> Self {
        match expiry {
            BanExpiry::Permanent => Self::Tag("permanent".to_string()),
            BanExpiry::Until(at) => Self::Millis(at.timestamp_millis()),
        }
    }
}

impl BanExpiry {
    /// `true` if the ban still applies at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Permanent => true,
            Self::Until(at) => *at > now,
        }
    }
}

impl fmt::Display for BanExpiry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent => write!(f, "permanent"),
            Self::Until(at) => write!(f, "{}", format_instant(*at)),
        }
    }
}

/// Long human-readable form, e.g. `Tuesday, November 14, 2023 10:13 PM UTC`.
#[must_use]
pub fn format_instant(at: DateTime<Utc>) -> String {
    at.format("%A, %B %-d, %Y %-I:%M %p UTC").to_string()
}

/// A blacklist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    /// IP or player ban.
    #[serde(rename = "type")]
    pub scope: BanScope,
    /// The banned IP or player name.
    pub value: String,
    /// When the ban lapses.
    pub expiry: BanExpiry,
}

impl Ban {
    /// Permanent ban.
    pub fn permanent(scope: BanScope, value: impl Into<String>) -> Self {
        Self {
            scope,
            value: value.into(),
            expiry: BanExpiry::Permanent,
        }
    }

    /// Ban lasting until `at`.
    pub fn until(scope: BanScope, value: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            scope,
            value: value.into(),
            expiry: BanExpiry::Until(at),
        }
    }

    /// Does this entry name `value`? Player names ignore case.
    #[must_use]
    pub fn targets(&self, value: &str) -> bool {
        match self.scope {
            BanScope::Ip => self.value == value,
            BanScope::Player => {
                self.value == value
                    || self
                        .value
                        .chars()
                        .flat_map(char::to_lowercase)
                        .eq(value.chars().flat_map(char::to_lowercase))
            }
        }
    }

    /// Does this entry reject `value` in `scope` at `now`?
    #[must_use]
    pub fn matches(&self, scope: BanScope, value: &str, now: DateTime<Utc>) -> bool {
        self.scope == scope && self.targets(value) && self.expiry.is_active(now)
    }
}

/// The durable ban collection.
pub struct BlacklistStore {
    bans: Mutex<Vec<Ban>>,
    snapshot: Arc<dyn Snapshot<Ban>>,
}

impl BlacklistStore {
    /// Load the collection.
    pub async fn open(snapshot: Arc<dyn Snapshot<Ban>>) -> Result<Self> {
        let bans = snapshot.load().await?;
        debug!(bans = bans.len(), "Blacklist loaded");
        Ok(Self {
            bans: Mutex::new(bans),
            snapshot,
        })
    }

    /// Add or replace the ban for `ban.value`. Returns `true` if an existing
    /// entry was replaced.
    pub async fn add(&self, ban: Ban) -> Result<bool> {
        let mut bans = self.bans.lock().await;
        let previous = bans.clone();

        let before = bans.len();
        bans.retain(|b| !b.targets(&ban.value) && !ban.targets(&b.value));
        let replaced = bans.len() != before;
        bans.push(ban);

        if let Err(e) = self.snapshot.save(&bans).await {
            *bans = previous;
            return Err(e);
        }
        Ok(replaced)
    }

    /// Remove every entry naming `value`. Returns how many were removed;
    /// zero is not an error.
    pub async fn remove(&self, value: &str) -> Result<usize> {
        let mut bans = self.bans.lock().await;
        let previous = bans.clone();

        bans.retain(|b| !b.targets(value));
        let removed = previous.len() - bans.len();
        if removed == 0 {
            return Ok(0);
        }

        if let Err(e) = self.snapshot.save(&bans).await {
            *bans = previous;
            return Err(e);
        }
        Ok(removed)
    }

    /// The ban rejecting `value` in `scope` at `now`, if any.
    pub async fn find_active(&self, scope: BanScope, value: &str, now: DateTime<Utc>) -> Option<Ban> {
        self.bans
            .lock()
            .await
            .iter()
            .find(|b| b.matches(scope, value, now))
            .cloned()
    }

    /// Shift a timed ban: new expiry = max(now, current) + `delta_hours`.
    ///
    /// `delta_hours` may be negative. Permanent bans and unknown values are
    /// left alone and yield `Ok(None)`.
    pub async fn adjust_expiry(
        &self,
        value: &str,
        delta_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Ban>> {
        let mut bans = self.bans.lock().await;
        let Some(pos) = bans.iter().position(|b| b.targets(value)) else {
            return Ok(None);
        };
        let BanExpiry::Until(current) = bans[pos].expiry else {
            return Ok(None);
        };

        let previous = bans[pos].clone();
        let delta = TimeDelta::try_hours(delta_hours).unwrap_or(if delta_hours < 0 {
            TimeDelta::MIN
        } else {
            TimeDelta::MAX
        });
        let base = current.max(now);
        let shifted = base.checked_add_signed(delta).unwrap_or(if delta_hours < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        });
        bans[pos].expiry = BanExpiry::Until(shifted);
        let adjusted = bans[pos].clone();

        if let Err(e) = self.snapshot.save(&bans).await {
            bans[pos] = previous;
            return Err(e);
        }
        Ok(Some(adjusted))
    }

    /// All entries in insertion order, including lapsed ones.
    pub async fn list(&self) -> Vec<Ban> {
        self.bans.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshot;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    async fn empty() -> (BlacklistStore, Arc<MemorySnapshot<Ban>>) {
        let snap = Arc::new(MemorySnapshot::new());
        let store = BlacklistStore::open(Arc::clone(&snap) as Arc<dyn Snapshot<Ban>>)
            .await
            .unwrap();
        (store, snap)
    }

    #[tokio::test]
    async fn player_bans_ignore_case() {
        // GIVEN: a permanent ban on player "Foo"
        let (store, _) = empty().await;
        store.add(Ban::permanent(BanScope::Player, "Foo")).await.unwrap();

        // WHEN/THEN: every casing matches
        for name in ["Foo", "foo", "FOO"] {
            assert!(store.find_active(BanScope::Player, name, t0()).await.is_some());
        }
        // AND: the ban does not leak into IP scope
        assert!(store.find_active(BanScope::Ip, "foo", t0()).await.is_none());
    }

    #[test]
    fn player_targets_fold_unicode_case_only() {
        let ban = Ban::permanent(BanScope::Player, "Émile");

        assert!(ban.targets("ÉMILE"));
        assert!(ban.targets("émile"));
        assert!(!ban.targets("Emile"));
        assert!(!ban.targets("Émil"));
        assert!(!ban.targets("Émiles"));
    }

    #[tokio::test]
    async fn ip_bans_are_exact() {
        let (store, _) = empty().await;
        store.add(Ban::permanent(BanScope::Ip, "1.2.3.4")).await.unwrap();

        assert!(store.find_active(BanScope::Ip, "1.2.3.4", t0()).await.is_some());
        assert!(store.find_active(BanScope::Ip, "1.2.3.40", t0()).await.is_none());
    }

    #[tokio::test]
    async fn timed_ban_stops_matching_but_stays_stored() {
        let (store, snap) = empty().await;
        let until = t0() + TimeDelta::hours(1);
        store.add(Ban::until(BanScope::Ip, "1.2.3.4", until)).await.unwrap();

        assert!(store.find_active(BanScope::Ip, "1.2.3.4", t0()).await.is_some());
        assert!(store.find_active(BanScope::Ip, "1.2.3.4", until).await.is_none());
        assert_eq!(snap.items().len(), 1);
    }

    #[tokio::test]
    async fn add_upserts_by_value() {
        // GIVEN: a timed ban on "Foo"
        let (store, snap) = empty().await;
        store
            .add(Ban::until(BanScope::Player, "Foo", t0() + TimeDelta::hours(1)))
            .await
            .unwrap();

        // WHEN: banning "foo" permanently
        let replaced = store.add(Ban::permanent(BanScope::Player, "foo")).await.unwrap();

        // THEN: a single permanent entry remains
        assert!(replaced);
        assert_eq!(snap.items(), vec![Ban::permanent(BanScope::Player, "foo")]);
    }

    #[tokio::test]
    async fn remove_unknown_is_noop() {
        let (store, _) = empty().await;
        assert_eq!(store.remove("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let (store, snap) = empty().await;
        store.add(Ban::permanent(BanScope::Ip, "1.2.3.4")).await.unwrap();

        assert_eq!(store.remove("1.2.3.4").await.unwrap(), 1);
        assert!(snap.items().is_empty());
    }

    #[tokio::test]
    async fn adjust_extends_from_later_of_now_and_expiry() {
        let (store, _) = empty().await;
        // Live ban: shift from its own expiry
        store
            .add(Ban::until(BanScope::Ip, "live", t0() + TimeDelta::hours(2)))
            .await
            .unwrap();
        // Lapsed ban: shift from now
        store
            .add(Ban::until(BanScope::Ip, "lapsed", t0() - TimeDelta::hours(5)))
            .await
            .unwrap();

        let live = store.adjust_expiry("live", 3, t0()).await.unwrap().unwrap();
        let lapsed = store.adjust_expiry("lapsed", 1, t0()).await.unwrap().unwrap();

        assert_eq!(live.expiry, BanExpiry::Until(t0() + TimeDelta::hours(5)));
        assert_eq!(lapsed.expiry, BanExpiry::Until(t0() + TimeDelta::hours(1)));
    }

    #[tokio::test]
    async fn adjust_can_shorten() {
        let (store, _) = empty().await;
        store
            .add(Ban::until(BanScope::Player, "Foo", t0() + TimeDelta::hours(10)))
            .await
            .unwrap();

        let ban = store.adjust_expiry("foo", -4, t0()).await.unwrap().unwrap();

        assert_eq!(ban.expiry, BanExpiry::Until(t0() + TimeDelta::hours(6)));
    }

    #[tokio::test]
    async fn adjust_leaves_permanent_bans_alone() {
        let (store, snap) = empty().await;
        store.add(Ban::permanent(BanScope::Ip, "1.2.3.4")).await.unwrap();

        let out = store.adjust_expiry("1.2.3.4", -100, t0()).await.unwrap();

        assert!(out.is_none());
        assert_eq!(snap.items()[0].expiry, BanExpiry::Permanent);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_add() {
        let (store, snap) = empty().await;
        snap.fail_writes(true);

        assert!(store.add(Ban::permanent(BanScope::Ip, "1.2.3.4")).await.is_err());
        assert!(store.list().await.is_empty());
    }

    #[test]
    fn expiry_serializes_like_the_collection_file() {
        let permanent = serde_json::to_value(Ban::permanent(BanScope::Ip, "1.2.3.4")).unwrap();
        assert_eq!(
            permanent,
            serde_json::json!({"type": "ip", "value": "1.2.3.4", "expiry": "permanent"})
        );

        let timed = serde_json::to_value(Ban::until(BanScope::Player, "Foo", t0())).unwrap();
        assert_eq!(timed["type"], "player");
        assert_eq!(timed["expiry"], 1_700_000_000_000_i64);

        let back: Ban = serde_json::from_value(timed).unwrap();
        assert_eq!(back.expiry, BanExpiry::Until(t0()));
    }

    #[test]
    fn scope_parses_case_insensitively() {
        assert_eq!("IP".parse::<BanScope>().unwrap(), BanScope::Ip);
        assert_eq!("player".parse::<BanScope>().unwrap(), BanScope::Player);
        assert!("user".parse::<BanScope>().is_err());
    }

    #[test]
    fn instant_formats_long_form() {
        assert_eq!(format_instant(t0()), "Tuesday, November 14, 2023 10:13 PM UTC");
    }
}
