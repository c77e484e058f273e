//! Durable collections: whole-array JSON snapshots.
//!
//! Every store keeps its working set in memory and hands the full collection
//! to a [`Snapshot`] after each mutation. The on-disk shape is a plain JSON
//! array so files stay readable and compatible with older deployments.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Load/save a whole collection.
///
/// `save` either replaces the durable collection completely or fails leaving
/// the previous one in place.
#[async_trait::async_trait]
pub trait Snapshot<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Read the full collection. A collection that was never written is empty.
    async fn load(&self) -> Result<Vec<T>>;

    /// Replace the full collection.
    async fn save(&self, items: &[T]) -> Result<()>;
}

/// A JSON array stored in a single file, rewritten via temp file + rename.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    /// Bind to `path`. Nothing is touched on disk until [`ensure_exists`](Self::ensure_exists) or a save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The bound file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the parent directory and an empty `[]` file if missing.
    pub async fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(parent, e))?;
        }
        if tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| Error::storage(&self.path, e))?
        {
            return Ok(());
        }
        debug!(path = %self.path.display(), "Creating empty collection file");
        self.write_atomic(b"[]").await
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "collection".into(), |n| n.to_string_lossy().into_owned());
        self.path.with_file_name(format!(".{name}.tmp"))
    }

    async fn write_atomic(&self, bytes: &[u8]) -> Result<()> {
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::storage(&tmp, e))?;

        // Owner read/write only: the collection holds live credentials.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await
            {
                warn!(path = %tmp.display(), error = %e, "Failed to restrict collection file permissions");
            }
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::storage(&self.path, e))
    }
}

#[async_trait::async_trait]
impl<T> Snapshot<T> for JsonFile
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Vec<T>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::storage(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, items: &[T]) -> Result<()> {
        let json = serde_json::to_vec_pretty(items)?;
        self.write_atomic(&json).await
    }
}

/// In-memory snapshot target, used by tests and ephemeral deployments.
///
/// [`fail_writes`](Self::fail_writes) makes every subsequent save fail, which
/// lets callers exercise storage-failure paths.
#[derive(Debug)]
pub struct MemorySnapshot<T> {
    items: Mutex<Vec<T>>,
    fail: AtomicBool,
}

impl<T: Clone> MemorySnapshot<T> {
    /// Empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Toggle save failures.
    pub fn fail_writes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// What was last saved.
    #[must_use]
    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}

impl<T: Clone> Default for MemorySnapshot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<T> Snapshot<T> for MemorySnapshot<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn load(&self) -> Result<Vec<T>> {
        Ok(self.items.lock().clone())
    }

    async fn save(&self, items: &[T]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::storage(
                "memory",
                std::io::Error::other("simulated write failure"),
            ));
        }
        *self.items.lock() = items.to_vec();
        Ok(())
    }
}
