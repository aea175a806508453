//! Object-store repository: file records encoded into object keys, with a
//! reference database kept consistent with the store.

pub mod keys;
pub mod lister;
pub mod store;

use crate::db::Database;
use crate::error::{QfsError, Result};
use crate::fileinfo::{system_time_from_millis, FileRecord, FileType};
use crate::source::local::record_from_metadata;
use crate::source::Source;
use async_trait::async_trait;
use filetime::FileTime;
use lister::ListerOptions;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use store::{list_page_with_retry, ObjectStore, PutBody};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RefState {
    reference: Option<Database>,
    /// Keys that decode to a shadowed or undecodable record; cleanup
    /// candidates.
    extra_keys: Vec<String>,
}

/// A repository rooted at `prefix` inside an object store.
pub struct StoreSource {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    lister_options: ListerOptions,
    /// Guards the reference database and the orphan list together.
    state: Mutex<RefState>,
    /// Serializes local-filesystem mutations in `retrieve`; released
    /// around the body download so transfers overlap.
    fs_lock: tokio::sync::Mutex<()>,
}

impl StoreSource {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        lister_options: ListerOptions,
    ) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self {
            store,
            prefix,
            lister_options,
            state: Mutex::new(RefState::default()),
            fs_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The listing prefix covering every key of this repository.
    fn list_root(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    /// Seed the reference database (e.g. from a previously written
    /// snapshot) so lookups skip the store.
    pub fn attach_database(&self, db: Database) {
        self.state.lock().unwrap().reference = Some(db);
    }

    pub fn take_extra_keys(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().unwrap().extra_keys)
    }

    /// Delete every orphan key recorded by the last `database` pass.
    /// Returns how many objects were removed.
    pub async fn clean_extra_keys(&self) -> Result<usize> {
        let extra = self.take_extra_keys();
        for key in &extra {
            tracing::info!(%key, "removing orphan object");
            self.store.delete(key).await?;
        }
        Ok(extra.len())
    }

    /// Resolve one path to its current record: from the reference
    /// database when possible, otherwise by listing the store. Among
    /// several entries for the same path the latest `mod_time` is
    /// canonical; the rest are orphans.
    pub async fn file_info(&self, path: &str) -> Result<FileRecord> {
        if let Some(db) = &self.state.lock().unwrap().reference {
            if let Some(rec) = db.get(path) {
                return Ok(rec.clone());
            }
        }

        let list_prefix = keys::path_prefix(&self.prefix, path);
        let mut newest: Option<FileRecord> = None;
        let mut start_after = String::new();
        loop {
            let page = list_page_with_retry(
                self.store.as_ref(),
                &list_prefix,
                &start_after,
                self.lister_options.page_size.max(1),
            )
            .await?;
            for obj in &page.objects {
                let Some(rec) = keys::decode(&self.prefix, &obj.key, obj.size, obj.last_modified)
                else {
                    continue;
                };
                if rec.path != path {
                    continue;
                }
                if newest.as_ref().map_or(true, |cur| rec.mod_time > cur.mod_time) {
                    newest = Some(rec);
                }
            }
            match page.objects.last() {
                Some(last) if page.truncated => start_after = last.key.clone(),
                _ => break,
            }
        }

        let rec = newest.ok_or_else(|| QfsError::NotFound {
            path: path.to_string(),
        })?;
        if let Some(db) = &mut self.state.lock().unwrap().reference {
            db.insert(rec.clone());
        }
        Ok(rec)
    }

    /// Open the current object for a path as a streaming reader.
    pub async fn open_path(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let rec = self.file_info(path).await?;
        let key = keys::encode(&self.prefix, &rec)?;
        self.store.get(&key).await
    }

    /// Remove a path's object. Absent paths are a success.
    pub async fn remove_path(&self, path: &str) -> Result<()> {
        let rec = match self.file_info(path).await {
            Ok(rec) => rec,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let key = keys::encode(&self.prefix, &rec)?;
        self.store.delete(&key).await?;
        if let Some(db) = &mut self.state.lock().unwrap().reference {
            db.remove(path);
        }
        Ok(())
    }

    /// Upload a local file, directory, or symlink under `repo_path`,
    /// replacing whatever object previously represented that path.
    pub async fn store_path(&self, local_path: &Path, repo_path: &str) -> Result<()> {
        let md = tokio::fs::symlink_metadata(local_path)
            .await
            .map_err(|e| QfsError::path_io(local_path.display().to_string(), e))?;
        let mut rec = record_from_metadata(repo_path, &md);
        rec.dev = None;
        match rec.file_type {
            FileType::File | FileType::Directory => {}
            FileType::Link => {
                let target = tokio::fs::read_link(local_path)
                    .await
                    .map_err(|e| QfsError::path_io(local_path.display().to_string(), e))?;
                rec.special = target.to_string_lossy().into_owned();
            }
            _ => {
                return Err(QfsError::Other(format!(
                    "{}: can only store files, directories, and links",
                    local_path.display()
                )))
            }
        }

        self.remove_path(repo_path).await?;
        let key = keys::encode(&self.prefix, &rec)?;
        let body = if rec.file_type.is_file() {
            PutBody::File(local_path.to_path_buf())
        } else {
            PutBody::Empty
        };
        self.store.put(&key, body).await?;

        if let Some(db) = &mut self.state.lock().unwrap().reference {
            db.insert(rec);
        }
        Ok(())
    }

    /// Reconcile a local path with the repository record. Returns whether
    /// anything changed.
    pub async fn retrieve(&self, repo_path: &str, local_path: &Path) -> Result<bool> {
        let rec = self.file_info(repo_path).await?;
        let io = |e: std::io::Error| QfsError::path_io(local_path.display().to_string(), e);

        match rec.file_type {
            FileType::Link => {
                let _guard = self.fs_lock.lock().await;
                if let Ok(current) = tokio::fs::read_link(local_path).await {
                    if current.to_string_lossy() == rec.special {
                        return Ok(false);
                    }
                }
                if let Some(parent) = local_path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io)?;
                }
                remove_any(local_path).await?;
                tokio::fs::symlink(&rec.special, local_path)
                    .await
                    .map_err(io)?;
                Ok(true)
            }
            FileType::Directory => {
                let _guard = self.fs_lock.lock().await;
                if let Ok(md) = tokio::fs::symlink_metadata(local_path).await {
                    if md.is_dir() && md.permissions().mode() & 0o7777 == rec.permissions {
                        return Ok(false);
                    }
                    if !md.is_dir() {
                        remove_any(local_path).await?;
                    }
                }
                tokio::fs::create_dir_all(local_path).await.map_err(io)?;
                tokio::fs::set_permissions(
                    local_path,
                    std::fs::Permissions::from_mode(rec.permissions),
                )
                .await
                .map_err(io)?;
                Ok(true)
            }
            FileType::File => {
                let mut file = {
                    let _guard = self.fs_lock.lock().await;
                    if let Ok(md) = tokio::fs::symlink_metadata(local_path).await {
                        let local = record_from_metadata(repo_path, &md);
                        if local.file_type.is_file()
                            && local.size == rec.size
                            && local.mod_time == rec.mod_time
                        {
                            return Ok(false);
                        }
                        if local.file_type.is_file() && local.permissions & 0o200 == 0 {
                            tokio::fs::set_permissions(
                                local_path,
                                std::fs::Permissions::from_mode(local.permissions | 0o200),
                            )
                            .await
                            .map_err(io)?;
                        }
                        if !local.file_type.is_file() {
                            remove_any(local_path).await?;
                        }
                    }
                    if let Some(parent) = local_path.parent() {
                        tokio::fs::create_dir_all(parent).await.map_err(io)?;
                    }
                    tokio::fs::File::create(local_path).await.map_err(io)?
                };

                // The download itself happens without the filesystem
                // lock so other retrieves proceed in parallel.
                let key = keys::encode(&self.prefix, &rec)?;
                let mut body = self.store.get(&key).await?;
                tokio::io::copy(&mut body, &mut file).await.map_err(io)?;
                drop(file);

                let _guard = self.fs_lock.lock().await;
                filetime::set_file_mtime(
                    local_path,
                    FileTime::from_system_time(system_time_from_millis(rec.mod_time)),
                )
                .map_err(io)?;
                tokio::fs::set_permissions(
                    local_path,
                    std::fs::Permissions::from_mode(rec.permissions),
                )
                .await
                .map_err(io)?;
                Ok(true)
            }
            other => Err(QfsError::Other(format!(
                "{}: cannot retrieve a {} entry",
                repo_path, other
            ))),
        }
    }

    /// Enumerate the whole repository and rebuild the reference database.
    /// The newest entry per path wins; shadowed and undecodable keys are
    /// collected as extra keys for later cleanup.
    pub async fn database(&self, cancel: &CancellationToken) -> Result<Database> {
        #[derive(Default)]
        struct Collected {
            by_path: HashMap<String, (FileRecord, String)>,
            orphans: Vec<String>,
        }

        let collected = Arc::new(Mutex::new(Collected::default()));
        let sink_state = collected.clone();
        let prefix = self.prefix.clone();
        lister::list_prefix(
            self.store.clone(),
            &self.list_root(),
            &self.lister_options,
            cancel,
            move |obj| {
                let mut state = sink_state.lock().unwrap();
                let state = &mut *state;
                match keys::decode(&prefix, &obj.key, obj.size, obj.last_modified) {
                    Some(rec) => match state.by_path.entry(rec.path.clone()) {
                        Entry::Occupied(mut entry) => {
                            if rec.mod_time > entry.get().0.mod_time {
                                let (_, old_key) = entry.insert((rec, obj.key));
                                state.orphans.push(old_key);
                            } else {
                                state.orphans.push(obj.key);
                            }
                        }
                        Entry::Vacant(entry) => {
                            entry.insert((rec, obj.key));
                        }
                    },
                    None => state.orphans.push(obj.key),
                }
            },
        )
        .await?;

        let mut collected = collected.lock().unwrap();
        let db = Database::from_records(
            collected.by_path.drain().map(|(_, (rec, _))| rec),
        );
        let orphans = std::mem::take(&mut collected.orphans);
        tracing::debug!(
            records = db.len(),
            orphans = orphans.len(),
            "rebuilt reference database"
        );

        let mut state = self.state.lock().unwrap();
        state.reference = Some(db.clone());
        state.extra_keys = orphans;
        Ok(db)
    }
}

async fn remove_any(path: &Path) -> Result<()> {
    let md = match tokio::fs::symlink_metadata(path).await {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(QfsError::path_io(path.display().to_string(), e)),
    };
    let result = if md.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    result.map_err(|e| QfsError::path_io(path.display().to_string(), e))
}

#[async_trait]
impl Source for StoreSource {
    fn full_path(&self, path: &str) -> String {
        self.store.uri(&keys::join_key(&self.prefix, path))
    }

    fn has_device_ids(&self) -> bool {
        false
    }

    fn is_object_store(&self) -> bool {
        true
    }

    async fn stat(&self, path: &str) -> Result<FileRecord> {
        self.file_info(path).await
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let rec = self.file_info(path).await?;
        if rec.file_type == FileType::Link {
            Ok(rec.special)
        } else {
            Err(QfsError::Other(format!("{}: not a symlink", path)))
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        let db = {
            let state = self.state.lock().unwrap();
            state.reference.clone()
        };
        let db = match db {
            Some(db) => db,
            None => self.database(&CancellationToken::new()).await?,
        };

        let dir_prefix = if path == "." {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut names = Vec::new();
        let mut last: Option<String> = None;
        for p in db.paths() {
            let Some(rest) = p.strip_prefix(&dir_prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let name = rest.split('/').next().unwrap_or(rest);
            if last.as_deref() != Some(name) {
                names.push(name.to_string());
                last = Some(name.to_string());
            }
        }
        Ok(names)
    }

    async fn open(&self, path: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        self.open_path(path).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.remove_path(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::store::memory::MemoryStore;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn source(store: Arc<MemoryStore>) -> StoreSource {
        StoreSource::new(
            store,
            "repo",
            ListerOptions {
                threads: 4,
                page_size: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_store_and_file_info() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("hello.txt"), "hello repo").unwrap();

        let store = Arc::new(MemoryStore::new());
        let src = source(store.clone());
        src.store_path(&temp.path().join("hello.txt"), "docs/hello.txt")
            .await
            .unwrap();

        let keys = store.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("repo/docs/hello.txt@f,"));

        let rec = src.file_info("docs/hello.txt").await.unwrap();
        assert_eq!(rec.file_type, FileType::File);
        assert_eq!(rec.size, 10);

        let err = src.file_info("docs/absent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_store_replaces_prior_object() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("f");
        fs::write(&local, "one").unwrap();

        let store = Arc::new(MemoryStore::new());
        let src = source(store.clone());
        src.store_path(&local, "f").await.unwrap();

        // Backdate the mtime so the second store produces a new key.
        fs::write(&local, "two!").unwrap();
        filetime::set_file_mtime(&local, FileTime::from_unix_time(1_000_000, 0)).unwrap();
        src.store_path(&local, "f").await.unwrap();

        assert_eq!(store.keys().len(), 1, "prior object was not unlinked");
        let rec = src.file_info("f").await.unwrap();
        assert_eq!(rec.size, 4);
    }

    #[tokio::test]
    async fn test_store_rejects_special_files() {
        let store = Arc::new(MemoryStore::new());
        let src = source(store);
        let err = src
            .store_path(Path::new("/dev/null"), "dev/null")
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("can only store files, directories, and links"));
    }

    #[tokio::test]
    async fn test_open_and_remove_idempotent() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("f"), "contents").unwrap();

        let store = Arc::new(MemoryStore::new());
        let src = source(store.clone());
        src.store_path(&temp.path().join("f"), "f").await.unwrap();

        let mut reader = src.open_path("f").await.unwrap();
        let mut buf = String::new();
        reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "contents");

        src.remove_path("f").await.unwrap();
        assert!(store.keys().is_empty());
        // Removing again is fine.
        src.remove_path("f").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_info_prefers_newest_and_reference_cache() {
        let store = Arc::new(MemoryStore::new());
        store.insert("repo/a@f,1000,0644", b"old");
        store.insert("repo/a@f,2000,0600", b"newer");

        let src = source(store.clone());
        let rec = src.file_info("a").await.unwrap();
        assert_eq!(rec.mod_time, 2000);
        assert_eq!(rec.permissions, 0o600);

        // With a reference database attached, lookups stop hitting the
        // store entirely.
        let db = src.database(&CancellationToken::new()).await.unwrap();
        assert_eq!(db.len(), 1);
        let calls_before = store.list_calls();
        let rec = src.file_info("a").await.unwrap();
        assert_eq!(rec.mod_time, 2000);
        assert_eq!(store.list_calls(), calls_before);
    }

    #[tokio::test]
    async fn test_database_collects_orphans() {
        let store = Arc::new(MemoryStore::new());
        store.insert("repo/a@f,1000,0644", b"old");
        store.insert("repo/a@f,2000,0644", b"new");
        store.insert("repo/sub@d,500,0755", b"");
        store.insert("repo/not-a-record", b"junk");

        let src = source(store);
        let db = src.database(&CancellationToken::new()).await.unwrap();
        assert_eq!(db.len(), 2);
        assert_eq!(db.get("a").unwrap().mod_time, 2000);
        assert_eq!(db.get("sub").unwrap().file_type, FileType::Directory);

        let mut extra = src.take_extra_keys();
        extra.sort();
        assert_eq!(extra, vec!["repo/a@f,1000,0644", "repo/not-a-record"]);
        // Taking drains the list.
        assert!(src.take_extra_keys().is_empty());
    }

    #[tokio::test]
    async fn test_attached_database_short_circuits_lookups() {
        let store = Arc::new(MemoryStore::new());
        let src = source(store.clone());

        let mut rec = FileRecord::new("cached/file", FileType::File);
        rec.mod_time = 42;
        rec.size = 7;
        rec.permissions = 0o644;
        src.attach_database(Database::from_records(vec![rec]));

        let rec = src.file_info("cached/file").await.unwrap();
        assert_eq!(rec.mod_time, 42);
        assert_eq!(store.list_calls(), 0, "lookup must not touch the store");
    }

    #[tokio::test]
    async fn test_clean_extra_keys_deletes_orphans() {
        let store = Arc::new(MemoryStore::new());
        store.insert("repo/a@f,1000,0644", b"old");
        store.insert("repo/a@f,2000,0644", b"new");
        store.insert("repo/garbage", b"x");

        let src = source(store.clone());
        src.database(&CancellationToken::new()).await.unwrap();
        let removed = src.clean_extra_keys().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.keys(), vec!["repo/a@f,2000,0644"]);
        // Nothing left to clean.
        assert_eq!(src.clean_extra_keys().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retrieve_file_roundtrip_and_noop() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("src/data.bin");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, "payload").unwrap();
        filetime::set_file_mtime(&original, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let store = Arc::new(MemoryStore::new());
        let src = source(store);
        src.store_path(&original, "data.bin").await.unwrap();

        let dest = temp.path().join("out/data.bin");
        assert!(src.retrieve("data.bin", &dest).await.unwrap());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "payload");

        let md = fs::metadata(&dest).unwrap();
        let rec = src.file_info("data.bin").await.unwrap();
        assert_eq!(
            crate::fileinfo::millis_from_system_time(md.modified().unwrap()),
            rec.mod_time
        );
        assert_eq!(md.permissions().mode() & 0o7777, rec.permissions);

        // Size and mtime now match: second retrieve is a no-op.
        assert!(!src.retrieve("data.bin", &dest).await.unwrap());

        // Local edits (different mtime) trigger a re-download.
        fs::write(&dest, "locally changed").unwrap();
        assert!(src.retrieve("data.bin", &dest).await.unwrap());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_retrieve_replaces_read_only_file() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("f");
        fs::write(&original, "fresh").unwrap();

        let store = Arc::new(MemoryStore::new());
        let src = source(store);
        src.store_path(&original, "f").await.unwrap();

        let dest = temp.path().join("dest/f");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, "stale").unwrap();
        fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o444)).unwrap();

        assert!(src.retrieve("f", &dest).await.unwrap());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_retrieve_directory_and_symlink() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("adir");
        fs::create_dir(&dir).unwrap();
        fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o750)).unwrap();
        let link = temp.path().join("alink");
        std::os::unix::fs::symlink("adir/target", &link).unwrap();

        let store = Arc::new(MemoryStore::new());
        let src = source(store);
        src.store_path(&dir, "adir").await.unwrap();
        src.store_path(&link, "alink").await.unwrap();

        let dest_dir = temp.path().join("out/adir");
        assert!(src.retrieve("adir", &dest_dir).await.unwrap());
        let md = fs::metadata(&dest_dir).unwrap();
        assert!(md.is_dir());
        assert_eq!(md.permissions().mode() & 0o7777, 0o750);
        // Matching directory: no-op.
        assert!(!src.retrieve("adir", &dest_dir).await.unwrap());

        let dest_link = temp.path().join("out/alink");
        assert!(src.retrieve("alink", &dest_link).await.unwrap());
        assert_eq!(
            fs::read_link(&dest_link).unwrap().to_string_lossy(),
            "adir/target"
        );
        // Correct target already: no-op.
        assert!(!src.retrieve("alink", &dest_link).await.unwrap());

        // Wrong target gets replaced.
        fs::remove_file(&dest_link).unwrap();
        std::os::unix::fs::symlink("elsewhere", &dest_link).unwrap();
        assert!(src.retrieve("alink", &dest_link).await.unwrap());
        assert_eq!(
            fs::read_link(&dest_link).unwrap().to_string_lossy(),
            "adir/target"
        );
    }

    #[tokio::test]
    async fn test_source_trait_read_dir() {
        let store = Arc::new(MemoryStore::new());
        store.insert("repo/top@d,1,0755", b"");
        store.insert("repo/top/a@f,2,0644", b"x");
        store.insert("repo/top/b@f,3,0644", b"y");
        store.insert("repo/top/sub@d,4,0755", b"");
        store.insert("repo/top/sub/deep@f,5,0644", b"z");

        let src = source(store);
        let mut names = src.read_dir("top").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "sub"]);

        let mut top = src.read_dir(".").await.unwrap();
        top.sort();
        assert_eq!(top, vec!["top"]);
    }
}
