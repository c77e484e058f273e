//! keygate library
//!
//! Time-bounded access keys with per-key seat limits, administrator
//! overrides, an IP/player blacklist and a small notice queue, served over
//! HTTP.
//!
//! # Components
//!
//! - **Keys**: idempotent issuance per client, custom admin keys, extension,
//!   deletion and a periodic expiry sweep ([`keys`])
//! - **Blacklist**: permanent or timed bans on IPs and player names ([`blacklist`])
//! - **Access gate**: the single allow/deny decision for a presented key ([`gate`])
//! - **Mailbox**: notifications and kick messages for polling clients ([`mailbox`])
//! - **Persistence**: every collection is a JSON file rewritten atomically on
//!   each mutation ([`snapshot`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod audit;
pub mod blacklist;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod keys;
pub mod mailbox;
pub mod server;
pub mod snapshot;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
    }

    Ok(())
}
