//! Change plan between two record snapshots.
//!
//! The plan is applyable: removals, additions, content replacements, and
//! metadata edits, plus defensive "check" entries naming the modification
//! times a regular file is allowed to have before the plan touches it. A
//! caller that finds a different mtime on disk knows local edits would be
//! lost and can abort.

use crate::db::Database;
use crate::fileinfo::{FileRecord, FileType};
use crate::filter::{self, Filter};

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub filters: Vec<Filter>,
    pub repo_rules: bool,
    /// Leave uid/gid differences out of the plan.
    pub no_ownerships: bool,
    /// Track directory modification times as metadata edits. Symlink
    /// times are never tracked.
    pub non_file_times: bool,
}

/// A path plus the mtimes the caller may observe without aborting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckEntry {
    pub path: String,
    pub mod_times: Vec<i64>,
}

/// Metadata-only edits for one path; `None` fields are already correct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaChange {
    pub path: String,
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mod_time: Option<i64>,
}

impl MetaChange {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            permissions: None,
            uid: None,
            gid: None,
            mod_time: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.permissions.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.mod_time.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffPlan {
    pub check: Vec<CheckEntry>,
    /// Informational: the file type changed (always paired with rm+add).
    pub type_change: Vec<String>,
    pub rm: Vec<FileRecord>,
    pub add: Vec<FileRecord>,
    pub change: Vec<FileRecord>,
    pub meta_change: Vec<MetaChange>,
}

impl DiffPlan {
    pub fn is_empty(&self) -> bool {
        self.type_change.is_empty()
            && self.rm.is_empty()
            && self.add.is_empty()
            && self.change.is_empty()
            && self.meta_change.is_empty()
    }
}

/// Compare `old` and `new` and emit the plan that turns `old` into `new`.
/// Paths outside the filter chain contribute nothing; iteration is in
/// sorted-path order so output is deterministic.
pub fn diff(old: &Database, new: &Database, options: &DiffOptions) -> DiffPlan {
    let mut plan = DiffPlan::default();

    let mut paths: Vec<&str> = old.paths().collect();
    let mut new_paths: Vec<&str> = new.paths().collect();
    paths.append(&mut new_paths);
    paths.sort();
    paths.dedup();

    for path in paths {
        if !options.filters.is_empty() || options.repo_rules {
            if !filter::is_included(path, &options.filters, options.repo_rules).0 {
                continue;
            }
        }
        match (old.get(path), new.get(path)) {
            (Some(o), None) => {
                if o.file_type.is_file() {
                    plan.check.push(CheckEntry {
                        path: path.to_string(),
                        mod_times: vec![o.mod_time],
                    });
                }
                plan.rm.push(o.clone());
            }
            (None, Some(n)) => {
                if n.file_type.is_file() {
                    plan.check.push(CheckEntry {
                        path: path.to_string(),
                        mod_times: vec![n.mod_time],
                    });
                }
                plan.add.push(n.clone());
            }
            (Some(o), Some(n)) => diff_pair(o, n, options, &mut plan),
            (None, None) => unreachable!("path came from one of the databases"),
        }
    }
    plan
}

fn diff_pair(o: &FileRecord, n: &FileRecord, options: &DiffOptions, plan: &mut DiffPlan) {
    if o.file_type != n.file_type {
        if o.file_type.is_file() {
            plan.check.push(CheckEntry {
                path: o.path.clone(),
                mod_times: vec![o.mod_time],
            });
        }
        plan.type_change.push(o.path.clone());
        plan.rm.push(o.clone());
        plan.add.push(n.clone());
        return;
    }

    if o.file_type.is_file() {
        if o.mod_time != n.mod_time {
            plan.check.push(CheckEntry {
                path: o.path.clone(),
                mod_times: vec![o.mod_time, n.mod_time],
            });
            plan.change.push(n.clone());
            return;
        }
        if o.special != n.special {
            plan.change.push(n.clone());
            return;
        }
    } else if o.special != n.special {
        // Same type, different link target or device coordinates.
        plan.change.push(n.clone());
        return;
    }

    let mut meta = MetaChange::new(&o.path);
    if o.permissions != n.permissions {
        meta.permissions = Some(n.permissions);
    }
    if !options.no_ownerships {
        if o.uid != n.uid {
            meta.uid = Some(n.uid);
        }
        if o.gid != n.gid {
            meta.gid = Some(n.gid);
        }
    }
    if options.non_file_times
        && o.file_type == FileType::Directory
        && o.mod_time != n.mod_time
    {
        meta.mod_time = Some(n.mod_time);
    }
    if !meta.is_empty() {
        plan.meta_change.push(meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, mtime: i64) -> FileRecord {
        let mut rec = FileRecord::new(path, FileType::File);
        rec.mod_time = mtime;
        rec.size = 1;
        rec.permissions = 0o644;
        rec.uid = 100;
        rec.gid = 100;
        rec
    }

    fn dir(path: &str, mtime: i64) -> FileRecord {
        let mut rec = FileRecord::new(path, FileType::Directory);
        rec.mod_time = mtime;
        rec.permissions = 0o755;
        rec.uid = 100;
        rec.gid = 100;
        rec
    }

    fn link(path: &str, target: &str) -> FileRecord {
        let mut rec = FileRecord::new(path, FileType::Link);
        rec.mod_time = 1;
        rec.permissions = 0o777;
        rec.uid = 100;
        rec.gid = 100;
        rec.special = target.to_string();
        rec
    }

    fn db(records: Vec<FileRecord>) -> Database {
        Database::from_records(records)
    }

    #[test]
    fn test_identical_databases_empty_plan() {
        let a = db(vec![dir(".", 1), file("a", 100), link("l", "a")]);
        let plan = diff(&a, &a.clone(), &DiffOptions::default());
        assert!(plan.is_empty());
        assert!(plan.check.is_empty());
    }

    #[test]
    fn test_file_replaced_emits_check_and_change() {
        let old = db(vec![file("p", 100)]);
        let new = db(vec![file("p", 200)]);
        let plan = diff(&old, &new, &DiffOptions::default());

        assert_eq!(
            plan.check,
            vec![CheckEntry {
                path: "p".to_string(),
                mod_times: vec![100, 200],
            }]
        );
        assert_eq!(plan.change.len(), 1);
        assert_eq!(plan.change[0].mod_time, 200);
        assert!(plan.rm.is_empty() && plan.add.is_empty() && plan.meta_change.is_empty());
    }

    #[test]
    fn test_removed_file_gets_check() {
        let old = db(vec![file("gone", 100), dir("gone-dir", 50)]);
        let new = db(vec![]);
        let plan = diff(&old, &new, &DiffOptions::default());

        // Only the regular file earns a check entry.
        assert_eq!(plan.check.len(), 1);
        assert_eq!(plan.check[0].path, "gone");
        assert_eq!(plan.check[0].mod_times, vec![100]);
        assert_eq!(plan.rm.len(), 2);
    }

    #[test]
    fn test_added_file_gets_check() {
        let old = db(vec![]);
        let new = db(vec![file("fresh", 300), dir("fresh-dir", 10)]);
        let plan = diff(&old, &new, &DiffOptions::default());

        assert_eq!(plan.check.len(), 1);
        assert_eq!(plan.check[0].path, "fresh");
        assert_eq!(plan.check[0].mod_times, vec![300]);
        assert_eq!(plan.add.len(), 2);
    }

    #[test]
    fn test_type_change_is_rm_add() {
        let old = db(vec![file("p", 100)]);
        let new = db(vec![dir("p", 100)]);
        let plan = diff(&old, &new, &DiffOptions::default());

        assert_eq!(plan.type_change, vec!["p"]);
        assert_eq!(plan.rm.len(), 1);
        assert_eq!(plan.add.len(), 1);
        assert!(plan.change.is_empty());
        // Old side was a file, so it still gets a check.
        assert_eq!(plan.check.len(), 1);
        assert_eq!(plan.check[0].mod_times, vec![100]);

        // Non-file to non-file: no check.
        let old = db(vec![dir("q", 1)]);
        let new = db(vec![link("q", "t")]);
        let plan = diff(&old, &new, &DiffOptions::default());
        assert_eq!(plan.type_change, vec!["q"]);
        assert!(plan.check.is_empty());
    }

    #[test]
    fn test_link_target_change() {
        let old = db(vec![link("l", "one")]);
        let new = db(vec![link("l", "two")]);
        let plan = diff(&old, &new, &DiffOptions::default());
        assert_eq!(plan.change.len(), 1);
        assert_eq!(plan.change[0].special, "two");
        assert!(plan.check.is_empty());
        assert!(plan.meta_change.is_empty());
    }

    #[test]
    fn test_meta_changes() {
        let mut o = file("f", 100);
        o.permissions = 0o644;
        o.uid = 1;
        o.gid = 1;
        let mut n = file("f", 100);
        n.permissions = 0o600;
        n.uid = 2;
        n.gid = 3;
        let plan = diff(&db(vec![o.clone()]), &db(vec![n.clone()]), &DiffOptions::default());

        assert_eq!(plan.meta_change.len(), 1);
        let meta = &plan.meta_change[0];
        assert_eq!(meta.permissions, Some(0o600));
        assert_eq!(meta.uid, Some(2));
        assert_eq!(meta.gid, Some(3));
        assert_eq!(meta.mod_time, None);
        assert!(plan.change.is_empty());

        // no_ownerships drops the uid/gid edits.
        let plan = diff(
            &db(vec![o]),
            &db(vec![n]),
            &DiffOptions {
                no_ownerships: true,
                ..Default::default()
            },
        );
        let meta = &plan.meta_change[0];
        assert_eq!(meta.permissions, Some(0o600));
        assert_eq!(meta.uid, None);
        assert_eq!(meta.gid, None);
    }

    #[test]
    fn test_directory_mtime_needs_non_file_times() {
        let old = db(vec![dir("d", 100)]);
        let new = db(vec![dir("d", 200)]);

        let plan = diff(&old, &new, &DiffOptions::default());
        assert!(plan.is_empty());

        let plan = diff(
            &old,
            &new,
            &DiffOptions {
                non_file_times: true,
                ..Default::default()
            },
        );
        assert_eq!(plan.meta_change.len(), 1);
        assert_eq!(plan.meta_change[0].mod_time, Some(200));
    }

    #[test]
    fn test_symlink_mtime_never_tracked() {
        let mut o = link("l", "t");
        o.mod_time = 100;
        let mut n = link("l", "t");
        n.mod_time = 999;
        let plan = diff(
            &db(vec![o]),
            &db(vec![n]),
            &DiffOptions {
                non_file_times: true,
                ..Default::default()
            },
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_excluded_paths_contribute_nothing() {
        let mut filter = Filter::new();
        filter.add_path(crate::filter::GroupKind::Exclude, "skip");
        let options = DiffOptions {
            filters: vec![filter],
            ..Default::default()
        };

        let old = db(vec![file("keep", 1), file("skip/a", 1)]);
        let new = db(vec![file("keep", 2), file("skip/a", 9)]);
        let plan = diff(&old, &new, &options);
        assert_eq!(plan.change.len(), 1);
        assert_eq!(plan.change[0].path, "keep");
        assert_eq!(plan.check.len(), 1);
    }

    #[test]
    fn test_output_is_sorted_and_single_action_per_path() {
        let old = db(vec![file("a", 1), file("b", 1), file("c", 1)]);
        let new = db(vec![file("a", 2), dir("b", 1), file("d", 1)]);
        let plan = diff(&old, &new, &DiffOptions::default());

        let rm_paths: Vec<_> = plan.rm.iter().map(|r| r.path.clone()).collect();
        assert_eq!(rm_paths, vec!["b", "c"]);
        let add_paths: Vec<_> = plan.add.iter().map(|r| r.path.clone()).collect();
        assert_eq!(add_paths, vec!["b", "d"]);
        let change_paths: Vec<_> = plan.change.iter().map(|r| r.path.clone()).collect();
        assert_eq!(change_paths, vec!["a"]);

        // A changed path never shows up in rm/add, and vice versa.
        assert!(!rm_paths.contains(&"a".to_string()));
        assert!(!add_paths.contains(&"a".to_string()));
    }
}
