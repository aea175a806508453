pub mod codec;

use crate::error::Result;
use crate::fileinfo::{FileRecord, FileType};
use crate::filter::{self, Filter};
use std::collections::BTreeMap;
use std::path::Path;

/// Options shared by all filtered record iterations (database, codec
/// reader, diff input).
#[derive(Debug, Clone, Copy)]
pub struct IterOptions<'a> {
    pub filters: &'a [Filter],
    pub repo_rules: bool,
    /// Skip directories.
    pub files_only: bool,
    /// Skip everything that is neither a regular file nor a directory.
    pub no_special: bool,
}

impl Default for IterOptions<'_> {
    fn default() -> Self {
        Self {
            filters: &[],
            repo_rules: false,
            files_only: false,
            no_special: false,
        }
    }
}

impl IterOptions<'_> {
    pub(crate) fn admits(&self, rec: &FileRecord) -> bool {
        if self.files_only && rec.file_type.is_dir() {
            return false;
        }
        if self.no_special
            && !matches!(rec.file_type, FileType::File | FileType::Directory)
        {
            return false;
        }
        if self.filters.is_empty() && !self.repo_rules {
            return true;
        }
        filter::is_included(&rec.path, self.filters, self.repo_rules).0
    }
}

/// In-memory database: path-keyed records with sorted iteration. The
/// BTreeMap gives the sorted-path ordering every consumer relies on.
#[derive(Debug, Clone, Default)]
pub struct Database {
    records: BTreeMap<String, FileRecord>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk load from any record provider. Later duplicates replace
    /// earlier ones.
    pub fn from_records(records: impl IntoIterator<Item = FileRecord>) -> Self {
        let mut db = Self::new();
        for rec in records {
            db.insert(rec);
        }
        db
    }

    /// Read a database file, keeping only records admitted by `opts`.
    pub fn load(path: &Path, opts: &IterOptions) -> Result<Database> {
        let mut reader = codec::DbReader::open(path)?;
        let mut db = Database::new();
        reader.for_each(opts, |rec| {
            db.insert(rec.clone());
            Ok(())
        })?;
        Ok(db)
    }

    /// Write all records to `path` in the canonical format.
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .map_err(|e| crate::error::QfsError::path_io(path.display().to_string(), e))?;
        let mut writer = codec::DbWriter::new(std::io::BufWriter::new(file));
        for rec in self.iter() {
            writer.write_record(rec)?;
        }
        writer.finish()?;
        Ok(())
    }

    pub fn insert(&mut self, rec: FileRecord) -> Option<FileRecord> {
        self.records.insert(rec.path.clone(), rec)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.records.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in sorted-path order.
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> + '_ {
        self.records.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> + '_ {
        self.records.keys().map(|s| s.as_str())
    }

    /// Sorted, filtered iteration. A callback error terminates the
    /// iteration and is returned as-is.
    pub fn for_each<F>(&self, opts: &IterOptions, mut f: F) -> Result<()>
    where
        F: FnMut(&FileRecord) -> Result<()>,
    {
        for rec in self.records.values() {
            if opts.admits(rec) {
                f(rec)?;
            }
        }
        Ok(())
    }
}
