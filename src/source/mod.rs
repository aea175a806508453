pub mod local;

use crate::error::Result;
use crate::fileinfo::FileRecord;
use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Uniform interface over a record backing: a local directory tree or an
/// object-store repository. The traverser and the higher-level commands
/// only speak this vocabulary.
#[async_trait]
pub trait Source: Send + Sync {
    /// Render a relative path for display (absolute path or store URI).
    fn full_path(&self, path: &str) -> String;

    /// Whether `FileRecord::dev` is meaningful for this backing; the
    /// same-device traversal option needs it.
    fn has_device_ids(&self) -> bool;

    fn is_object_store(&self) -> bool;

    /// lstat semantics: symlinks are reported as links, never followed.
    /// Device records come back with `special` already populated.
    async fn stat(&self, path: &str) -> Result<FileRecord>;

    async fn read_link(&self, path: &str) -> Result<String>;

    /// Child entry names (not paths), unsorted.
    async fn read_dir(&self, path: &str) -> Result<Vec<String>>;

    async fn open(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Idempotent: removing an absent path succeeds.
    async fn remove(&self, path: &str) -> Result<()>;
}
