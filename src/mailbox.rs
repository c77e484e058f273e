//! One-way mailbox for notification and kick messages.
//!
//! Admins post, a poller reads the pending list and clears it once handled.
//! The queue is FIFO and has no coupling to key or blacklist state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::snapshot::Snapshot;
use crate::Result;

/// Kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// Informational message shown to players.
    Notification,
    /// Instruction to disconnect players, with a message.
    Kick,
}

impl fmt::Display for NoticeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notification => write!(f, "notification"),
            Self::Kick => write!(f, "kick"),
        }
    }
}

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Message text.
    pub message: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: NoticeKind,
}

/// The durable notice queue.
pub struct Mailbox {
    queue: Mutex<Vec<Notice>>,
    snapshot: Arc<dyn Snapshot<Notice>>,
}

impl Mailbox {
    /// Load pending notices.
    pub async fn open(snapshot: Arc<dyn Snapshot<Notice>>) -> Result<Self> {
        let queue = snapshot.load().await?;
        Ok(Self {
            queue: Mutex::new(queue),
            snapshot,
        })
    }

    /// Append a notice.
    pub async fn post(&self, kind: NoticeKind, message: impl Into<String>) -> Result<()> {
        let mut queue = self.queue.lock().await;
        queue.push(Notice {
            message: message.into(),
            kind,
        });
        if let Err(e) = self.snapshot.save(&queue).await {
            queue.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Pending notices, oldest first. Reading does not consume them.
    pub async fn pending(&self) -> Vec<Notice> {
        self.queue.lock().await.clone()
    }

    /// Drop every pending notice. Returns how many were dropped.
    pub async fn clear(&self) -> Result<usize> {
        Ok(self.drain().await?.len())
    }

    /// Take every pending notice, leaving the queue empty.
    pub async fn drain(&self) -> Result<Vec<Notice>> {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return Ok(Vec::new());
        }
        self.snapshot.save(&[]).await?;
        Ok(std::mem::take(&mut *queue))
    }
}
