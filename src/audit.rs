//! Audit logging for key and blacklist lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `key.issued` | A new key is created (issuance or admin custom key) |
//! | `key.reused` | Issuance returned the identity's existing active key |
//! | `key.extended` | An admin moved a key's expiry |
//! | `key.deleted` | An admin deleted a single key |
//! | `keys.purged` | Expired or all keys were removed in bulk |
//! | `access.granted` | A validation succeeded |
//! | `access.denied` | A validation was rejected (ban, expiry, seat limit) |
//! | `ban.added` / `ban.removed` / `ban.adjusted` | Blacklist mutations |
//! | `notice.posted` | A notification or kick message was queued |
//!
//! Tokens are credentials, so events carry only a short prefix of them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::blacklist::{Ban, BanExpiry, BanScope};
use crate::keys::Key;

/// How many leading characters of a token end up in the audit log.
const TOKEN_PREFIX_CHARS: usize = 8;

/// Structured audit event.
#[derive(Debug, Default, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"key.issued"`).
    pub event: &'static str,
    /// Redacted token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Client identity involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Player name involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    /// Key expiry after the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Seat cap of the key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_users: Option<u32>,
    /// Ban scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<BanScope>,
    /// Banned value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Ban expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_expiry: Option<BanExpiry>,
    /// Number of affected entries for bulk events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Human-readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shorten a token for logging.
#[must_use]
pub fn redact(token: &str) -> String {
    let mut chars = token.chars();
    let head: String = chars.by_ref().take(TOKEN_PREFIX_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

impl AuditEvent {
    fn for_key(event: &'static str, key: &Key) -> Self {
        Self {
            event,
            token: Some(redact(&key.token)),
            identity: Some(key.identity.clone()),
            expires_at: Some(key.expires_at),
            max_users: Some(key.max_users),
            ..Self::default()
        }
    }

    fn for_ban(event: &'static str, ban: &Ban) -> Self {
        Self {
            event,
            scope: Some(ban.scope),
            value: Some(ban.value.clone()),
            ban_expiry: Some(ban.expiry),
            ..Self::default()
        }
    }

    /// Construct a `key.issued` event.
    #[must_use]
    pub fn key_issued(key: &Key) -> Self {
        Self::for_key("key.issued", key)
    }

    /// Construct a `key.reused` event.
    #[must_use]
    pub fn key_reused(key: &Key) -> Self {
        Self::for_key("key.reused", key)
    }

    /// Construct a `key.extended` event.
    #[must_use]
    pub fn key_extended(key: &Key) -> Self {
        Self::for_key("key.extended", key)
    }

    /// Construct a `key.deleted` event.
    #[must_use]
    pub fn key_deleted(token: &str) -> Self {
        Self {
            event: "key.deleted",
            token: Some(redact(token)),
            ..Self::default()
        }
    }

    /// Construct a `keys.purged` event.
    #[must_use]
    pub fn keys_purged(count: usize, reason: &str) -> Self {
        Self {
            event: "keys.purged",
            count: Some(count),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Construct an `access.granted` event.
    #[must_use]
    pub fn access_granted(key: &Key, player: &str, identity: &str) -> Self {
        Self {
            player: Some(player.to_string()),
            identity: Some(identity.to_string()),
            ..Self::for_key("access.granted", key)
        }
    }

    /// Construct an `access.denied` event.
    #[must_use]
    pub fn access_denied(token: &str, player: &str, identity: &str, reason: &str) -> Self {
        Self {
            event: "access.denied",
            token: Some(redact(token)),
            player: Some(player.to_string()),
            identity: Some(identity.to_string()),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Construct a `ban.added` event.
    #[must_use]
    pub fn ban_added(ban: &Ban) -> Self {
        Self::for_ban("ban.added", ban)
    }

    /// Construct a `ban.adjusted` event.
    #[must_use]
    pub fn ban_adjusted(ban: &Ban) -> Self {
        Self::for_ban("ban.adjusted", ban)
    }

    /// Construct a `ban.removed` event.
    #[must_use]
    pub fn ban_removed(value: &str, count: usize) -> Self {
        Self {
            event: "ban.removed",
            value: Some(value.to_string()),
            count: Some(count),
            ..Self::default()
        }
    }

    /// Construct a `notice.posted` event.
    #[must_use]
    pub fn notice_posted(kind: &str) -> Self {
        Self {
            event: "notice.posted",
            reason: Some(kind.to_string()),
            ..Self::default()
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO keygate::audit audit={"event":"key.issued","token":"key_AbCd…",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "keygate audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
