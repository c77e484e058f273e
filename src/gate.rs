//! Access gate: the single allow/deny decision for a presented key.
//!
//! Checks run in a fixed order and the first match wins:
//!
//! 1. active IP ban on the caller's identity
//! 2. active player ban on the player name (case-insensitive)
//! 3. token must exist and not be expired
//! 4. player already seated on the key → allow
//! 5. no free seat → deny
//! 6. seat the player, persist, allow
//!
//! A banned caller is therefore rejected even while holding a perfectly valid
//! key. Denials are ordinary [`Verdict`]s; only storage failures are errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{self, AuditEvent};
use crate::blacklist::{BanExpiry, BanScope, BlacklistStore};
use crate::clock::Clock;
use crate::keys::{Admission, Key, KeyStore};
use crate::Result;

/// Why a verdict came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    /// Player took a new seat.
    Admitted,
    /// Player was already seated.
    Readmitted,
    /// Caller's IP is banned.
    IpBanned,
    /// Player name is banned.
    PlayerBanned,
    /// Unknown or expired token.
    InvalidOrExpired,
    /// Every seat is taken.
    LimitReached,
}

/// Outcome of a validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    /// Whether access is granted.
    pub allowed: bool,
    /// Human-readable explanation.
    pub reason: String,
    /// Machine-readable cause.
    pub kind: VerdictKind,
}

impl Verdict {
    fn allow(kind: VerdictKind) -> Self {
        Self {
            allowed: true,
            reason: "Key is valid.".to_string(),
            kind,
        }
    }

    fn deny(kind: VerdictKind, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            kind,
        }
    }
}

fn until_suffix(expiry: BanExpiry) -> String {
    match expiry {
        BanExpiry::Permanent => String::new(),
        BanExpiry::Until(_) => format!(" until {expiry}"),
    }
}

/// Combines blacklist and key lookups into a verdict.
pub struct AccessGate {
    keys: Arc<KeyStore>,
    blacklist: Arc<BlacklistStore>,
    clock: Arc<dyn Clock>,
}

impl AccessGate {
    /// Wire the gate to both stores.
    pub fn new(keys: Arc<KeyStore>, blacklist: Arc<BlacklistStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            blacklist,
            clock,
        }
    }

    /// Validate `token` for `player` connecting from `identity`, now.
    pub async fn validate(&self, token: &str, player: &str, identity: &str) -> Result<Verdict> {
        self.validate_at(token, player, identity, self.clock.now()).await
    }

    /// Validate at an explicit instant.
    pub async fn validate_at(
        &self,
        token: &str,
        player: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let (verdict, seated) = self.decide(token, player, identity, now).await?;

        match seated {
            Some(key) => audit::emit(&AuditEvent::access_granted(&key, player, identity)),
            None if !verdict.allowed => audit::emit(&AuditEvent::access_denied(
                token,
                player,
                identity,
                &verdict.reason,
            )),
            None => {}
        }
        Ok(verdict)
    }

    /// The verdict, plus the key when a new seat was taken.
    async fn decide(
        &self,
        token: &str,
        player: &str,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<(Verdict, Option<Key>)> {
        if let Some(ban) = self.blacklist.find_active(BanScope::Ip, identity, now).await {
            return Ok((
                Verdict::deny(
                    VerdictKind::IpBanned,
                    format!("Your IP has been blacklisted{}", until_suffix(ban.expiry)),
                ),
                None,
            ));
        }

        if let Some(ban) = self.blacklist.find_active(BanScope::Player, player, now).await {
            return Ok((
                Verdict::deny(
                    VerdictKind::PlayerBanned,
                    format!("You have been blacklisted{}", until_suffix(ban.expiry)),
                ),
                None,
            ));
        }

        Ok(match self.keys.admit(token, player, now).await? {
            Admission::Invalid => (
                Verdict::deny(VerdictKind::InvalidOrExpired, "Key is invalid or expired."),
                None,
            ),
            Admission::Full(_) => (
                Verdict::deny(VerdictKind::LimitReached, "Key has reached its user limit."),
                None,
            ),
            Admission::Readmitted(_) => (Verdict::allow(VerdictKind::Readmitted), None),
            Admission::Admitted(key) => (Verdict::allow(VerdictKind::Admitted), Some(key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Ban;
    use crate::clock::ManualClock;
    use crate::keys::NewKey;
    use crate::snapshot::MemorySnapshot;
    use chrono::TimeDelta;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    struct Fixture {
        gate: AccessGate,
        keys: Arc<KeyStore>,
        bans: Arc<BlacklistStore>,
        key_snap: Arc<MemorySnapshot<Key>>,
    }

    async fn fixture() -> Fixture {
        let key_snap = Arc::new(MemorySnapshot::new());
        let keys = Arc::new(
            KeyStore::open(
                Arc::clone(&key_snap) as Arc<dyn crate::snapshot::Snapshot<Key>>,
                Arc::new(MemorySnapshot::<String>::new()),
                "key_",
            )
            .await
            .unwrap(),
        );
        let bans = Arc::new(
            BlacklistStore::open(Arc::new(MemorySnapshot::<Ban>::new()))
                .await
                .unwrap(),
        );
        let clock = Arc::new(ManualClock::new(t0()));
        let gate = AccessGate::new(Arc::clone(&keys), Arc::clone(&bans), clock);
        Fixture {
            gate,
            keys,
            bans,
            key_snap,
        }
    }

    async fn two_seat_key(keys: &KeyStore) -> Key {
        keys.create(
            NewKey {
                token: None,
                identity: "1.2.3.4".to_string(),
                max_users: 2,
                ttl: TimeDelta::hours(24),
            },
            t0(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn seats_fill_up_then_only_seated_players_pass() {
        // GIVEN: a 2-seat key
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;

        // WHEN: A, B, C validate and A comes back
        let a = f.gate.validate(&key.token, "A", "1.2.3.4").await.unwrap();
        let b = f.gate.validate(&key.token, "B", "1.2.3.4").await.unwrap();
        let c = f.gate.validate(&key.token, "C", "1.2.3.4").await.unwrap();
        let a_again = f.gate.validate(&key.token, "A", "1.2.3.4").await.unwrap();

        // THEN
        assert!(a.allowed);
        assert_eq!(a.kind, VerdictKind::Admitted);
        assert!(b.allowed);
        assert!(!c.allowed);
        assert_eq!(c.kind, VerdictKind::LimitReached);
        assert!(c.reason.contains("limit"));
        assert!(a_again.allowed);
        assert_eq!(a_again.kind, VerdictKind::Readmitted);
    }

    #[tokio::test]
    async fn seat_is_persisted_with_in_use_flag() {
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;

        f.gate.validate(&key.token, "Steve", "9.9.9.9").await.unwrap();

        let saved = &f.key_snap.items()[0];
        assert!(saved.in_use);
        assert!(saved.consumed_by.contains("Steve"));
    }

    #[tokio::test]
    async fn expired_key_fails_regardless_of_capacity() {
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;

        let verdict = f
            .gate
            .validate_at(&key.token, "A", "1.2.3.4", key.expires_at)
            .await
            .unwrap();

        assert!(!verdict.allowed);
        assert_eq!(verdict.kind, VerdictKind::InvalidOrExpired);
    }

    #[tokio::test]
    async fn unknown_token_is_denied() {
        let f = fixture().await;
        let verdict = f.gate.validate("key_nope", "A", "1.2.3.4").await.unwrap();
        assert_eq!(verdict.kind, VerdictKind::InvalidOrExpired);
        assert!(verdict.reason.contains("invalid or expired"));
    }

    #[tokio::test]
    async fn ip_ban_wins_over_valid_key() {
        // GIVEN: a valid, empty key and a permanent IP ban on the caller
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;
        f.bans.add(Ban::permanent(BanScope::Ip, "1.2.3.4")).await.unwrap();

        // WHEN
        let verdict = f.gate.validate(&key.token, "A", "1.2.3.4").await.unwrap();

        // THEN: denied without consuming a seat
        assert!(!verdict.allowed);
        assert_eq!(verdict.kind, VerdictKind::IpBanned);
        assert_eq!(verdict.reason, "Your IP has been blacklisted");
        let stored = f.keys.find_by_token(&key.token).await.unwrap();
        assert!(stored.consumed_by.is_empty());
    }

    #[tokio::test]
    async fn ip_ban_is_checked_before_player_ban() {
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;
        f.bans.add(Ban::permanent(BanScope::Ip, "1.2.3.4")).await.unwrap();
        f.bans.add(Ban::permanent(BanScope::Player, "Foo")).await.unwrap();

        let verdict = f.gate.validate(&key.token, "Foo", "1.2.3.4").await.unwrap();
        assert_eq!(verdict.kind, VerdictKind::IpBanned);
    }

    #[tokio::test]
    async fn player_ban_ignores_case_and_shows_expiry() {
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;
        f.bans
            .add(Ban::until(BanScope::Player, "Foo", t0() + TimeDelta::hours(1)))
            .await
            .unwrap();

        for name in ["foo", "FOO"] {
            let verdict = f.gate.validate(&key.token, name, "5.5.5.5").await.unwrap();
            assert!(!verdict.allowed);
            assert_eq!(verdict.kind, VerdictKind::PlayerBanned);
            assert_eq!(
                verdict.reason,
                "You have been blacklisted until Tuesday, November 14, 2023 11:13 PM UTC"
            );
        }
    }

    #[tokio::test]
    async fn lapsed_ban_no_longer_blocks() {
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;
        f.bans
            .add(Ban::until(BanScope::Ip, "1.2.3.4", t0() - TimeDelta::minutes(1)))
            .await
            .unwrap();

        let verdict = f.gate.validate(&key.token, "A", "1.2.3.4").await.unwrap();
        assert!(verdict.allowed);
    }

    #[tokio::test]
    async fn storage_failure_surfaces_as_error() {
        let f = fixture().await;
        let key = two_seat_key(&f.keys).await;
        f.key_snap.fail_writes(true);

        let result = f.gate.validate(&key.token, "A", "1.2.3.4").await;
        assert!(result.is_err());
    }
}
