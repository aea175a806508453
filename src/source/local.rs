use super::Source;
use crate::error::{QfsError, Result};
use crate::fileinfo::{FileRecord, FileType, PERMISSION_MASK};
use async_trait::async_trait;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

/// A directory tree on the local filesystem.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path == "." {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }
}

/// Build a record from lstat results. Used by the local source and by the
/// repository `store` operation, which stats local files directly.
pub(crate) fn record_from_metadata(path: &str, md: &std::fs::Metadata) -> FileRecord {
    let mode = md.mode();
    let file_type = FileType::from_mode(mode);
    let special = if file_type.is_device() {
        let rdev = md.rdev() as libc::dev_t;
        format!("{},{}", libc::major(rdev), libc::minor(rdev))
    } else {
        String::new()
    };
    FileRecord {
        path: path.to_string(),
        file_type,
        mod_time: md.mtime() * 1000 + md.mtime_nsec() / 1_000_000,
        size: if file_type.is_file() { md.size() as i64 } else { 0 },
        permissions: mode & PERMISSION_MASK,
        uid: md.uid(),
        gid: md.gid(),
        special,
        dev: Some(md.dev()),
        object_time: None,
    }
}

#[async_trait]
impl Source for LocalSource {
    fn full_path(&self, path: &str) -> String {
        self.resolve(path).display().to_string()
    }

    fn has_device_ids(&self) -> bool {
        true
    }

    fn is_object_store(&self) -> bool {
        false
    }

    async fn stat(&self, path: &str) -> Result<FileRecord> {
        let full = self.resolve(path);
        let md = tokio::fs::symlink_metadata(&full)
            .await
            .map_err(|e| QfsError::path_io(full.display().to_string(), e))?;
        Ok(record_from_metadata(path, &md))
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        let target = tokio::fs::read_link(&full)
            .await
            .map_err(|e| QfsError::path_io(full.display().to_string(), e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let full = self.resolve(path);
        let mut dir = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| QfsError::path_io(full.display().to_string(), e))?;
        let mut names = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| QfsError::path_io(full.display().to_string(), e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn open(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let full = self.resolve(path);
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| QfsError::path_io(full.display().to_string(), e))?;
        Ok(Box::new(file))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QfsError::path_io(full.display().to_string(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_stat_regular_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("file.txt"), "content").unwrap();

        let source = LocalSource::new(temp.path());
        let rec = source.stat("file.txt").await.unwrap();
        assert_eq!(rec.path, "file.txt");
        assert_eq!(rec.file_type, FileType::File);
        assert_eq!(rec.size, 7);
        assert!(rec.dev.is_some());
        assert!(rec.mod_time > 0);
        assert_eq!(rec.special, "");
    }

    #[tokio::test]
    async fn test_stat_root_dot() {
        let temp = TempDir::new().unwrap();
        let source = LocalSource::new(temp.path());
        let rec = source.stat(".").await.unwrap();
        assert_eq!(rec.file_type, FileType::Directory);
        assert_eq!(rec.size, 0);
    }

    #[tokio::test]
    async fn test_stat_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let source = LocalSource::new(temp.path());
        let err = source.stat("absent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_symlink_not_followed() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("target"), "x").unwrap();
        std::os::unix::fs::symlink("target", temp.path().join("link")).unwrap();

        let source = LocalSource::new(temp.path());
        let rec = source.stat("link").await.unwrap();
        assert_eq!(rec.file_type, FileType::Link);
        assert_eq!(source.read_link("link").await.unwrap(), "target");
    }

    #[tokio::test]
    async fn test_read_dir_names() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b"), "").unwrap();
        fs::write(temp.path().join("a"), "").unwrap();
        fs::create_dir(temp.path().join("c")).unwrap();

        let source = LocalSource::new(temp.path());
        let mut names = source.read_dir(".").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_open_reads_contents() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("data"), "hello").unwrap();

        let source = LocalSource::new(temp.path());
        let mut reader = source.open("data").await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("junk~"), "").unwrap();

        let source = LocalSource::new(temp.path());
        source.remove("junk~").await.unwrap();
        assert!(!temp.path().join("junk~").exists());
        source.remove("junk~").await.unwrap();
    }
}
