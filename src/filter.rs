use crate::error::{QfsError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

/// Directory at the site root reserved for local qfs state.
pub const REPO_DIR: &str = ".qfs";
/// Filter profiles live here and replicate between sites even though the
/// rest of the reserved directory does not.
pub const REPO_FILTER_DIR: &str = ".qfs/filters";

/// Which part of the rule set decided a path's fate. `Default` means no
/// rule matched and the tri-state default applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Default,
    Junk,
    Prune,
    Include,
    Exclude,
    RepoRule,
}

/// The three user-visible rule groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Prune,
    Include,
    Exclude,
}

#[derive(Debug, Clone, Default)]
struct RuleSet {
    /// Exact full paths, consulted only against the queried path itself,
    /// never against ancestors. Populated for Include by `add_path` with
    /// the rule's ancestor directories.
    full_paths: HashSet<String>,
    /// Exact paths, consulted at every ancestor level.
    paths: HashSet<String>,
    /// Exact base names.
    bases: HashSet<String>,
    /// Base-name patterns.
    patterns: Vec<Regex>,
}

impl RuleSet {
    fn is_empty(&self) -> bool {
        self.full_paths.is_empty()
            && self.paths.is_empty()
            && self.bases.is_empty()
            && self.patterns.is_empty()
    }

    fn matches(&self, path: &str, base: &str, initial: bool) -> bool {
        if initial && self.full_paths.contains(path) {
            return true;
        }
        if self.paths.contains(path) {
            return true;
        }
        if self.bases.contains(base) {
            return true;
        }
        self.patterns.iter().any(|re| re.is_match(base))
    }
}

/// How a filter file is loaded: `PruneOnly` keeps only the prune group and
/// forces default-include, for operations that must see everything that is
/// not pruned (e.g. junk cleanup sweeps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Full,
    PruneOnly,
}

/// Imports nest; past this depth the chain is assumed circular.
const MAX_READ_DEPTH: usize = 40;

/// A compiled rule set. Built once (programmatically or from a filter
/// file), read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    prune: RuleSet,
    include: RuleSet,
    exclude: RuleSet,
    junk: Option<Regex>,
    default_include: Option<bool>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a filter file, following `:read:` imports.
    pub fn load(path: &Path, mode: LoadMode) -> Result<Filter> {
        let mut filter = Filter::new();
        filter.read_file(path, mode, 0)?;
        if mode == LoadMode::PruneOnly {
            filter.set_default_include(true);
        }
        Ok(filter)
    }

    fn group_mut(&mut self, kind: GroupKind) -> &mut RuleSet {
        match kind {
            GroupKind::Prune => &mut self.prune,
            GroupKind::Include => &mut self.include,
            GroupKind::Exclude => &mut self.exclude,
        }
    }

    /// Add an exact-path rule. Include paths implicitly admit their
    /// ancestor directories, but only as full-path matches: a rule
    /// `a/b/c` lets `a` and `a/b` through without turning `a` into a
    /// base-name match anywhere else.
    pub fn add_path(&mut self, kind: GroupKind, path: &str) {
        let path = path.trim_end_matches('/');
        if kind == GroupKind::Include {
            let mut cur = path;
            while let Some(i) = cur.rfind('/') {
                cur = &cur[..i];
                self.include.full_paths.insert(cur.to_string());
            }
        }
        self.group_mut(kind).paths.insert(path.to_string());
    }

    pub fn add_base(&mut self, kind: GroupKind, name: &str) {
        self.group_mut(kind).bases.insert(name.to_string());
    }

    pub fn add_pattern(&mut self, kind: GroupKind, pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            return Err(QfsError::Filter("empty pattern".to_string()));
        }
        let re = Regex::new(pattern)
            .map_err(|e| QfsError::Filter(format!("invalid pattern {:?}: {}", pattern, e)))?;
        self.group_mut(kind).patterns.push(re);
        Ok(())
    }

    /// Single assignment; a second junk pattern is a configuration error.
    pub fn set_junk(&mut self, pattern: &str) -> Result<()> {
        if self.junk.is_some() {
            return Err(QfsError::Filter("junk pattern set twice".to_string()));
        }
        if pattern.is_empty() {
            return Err(QfsError::Filter("empty junk pattern".to_string()));
        }
        let re = Regex::new(pattern)
            .map_err(|e| QfsError::Filter(format!("invalid junk pattern {:?}: {}", pattern, e)))?;
        self.junk = Some(re);
        Ok(())
    }

    pub fn set_default_include(&mut self, include: bool) {
        self.default_include = Some(include);
    }

    /// Tri-state resolution: an unset default includes everything unless
    /// the include group has rules.
    pub fn default_include(&self) -> bool {
        self.default_include
            .unwrap_or_else(|| self.include.is_empty())
    }

    fn read_file(&mut self, path: &Path, mode: LoadMode, depth: usize) -> Result<()> {
        if depth > MAX_READ_DEPTH {
            return Err(QfsError::Filter(format!(
                "{}: import chain too deep (circular :read:?)",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| QfsError::path_io(path.display().to_string(), e))?;
        self.parse_lines(&text, path, mode, depth)
    }

    fn parse_lines(&mut self, text: &str, origin: &Path, mode: LoadMode, depth: usize) -> Result<()> {
        let fail = |line: usize, message: String| QfsError::FilterLoad {
            file: origin.to_path_buf(),
            line,
            message,
        };

        // Group state is local to each file; an imported file starts fresh.
        let mut group: Option<GroupKind> = None;

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            if raw.starts_with('#') {
                continue;
            }
            let line = raw.trim_end();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix(":read:") {
                let target = origin.parent().unwrap_or(Path::new(".")).join(rest);
                self.read_file(&target, mode, depth + 1)?;
                continue;
            }
            if let Some(rest) = line.strip_prefix(":junk:") {
                self.set_junk(rest)
                    .map_err(|e| fail(lineno, e.to_string()))?;
                continue;
            }
            match line {
                ":prune:" => {
                    group = Some(GroupKind::Prune);
                    continue;
                }
                ":include:" => {
                    group = Some(GroupKind::Include);
                    continue;
                }
                ":exclude:" => {
                    group = Some(GroupKind::Exclude);
                    continue;
                }
                _ => {}
            }

            let kind = group.ok_or_else(|| {
                fail(lineno, format!("rule {:?} before any group directive", line))
            })?;
            if mode == LoadMode::PruneOnly && kind != GroupKind::Prune {
                continue;
            }

            if line == "." {
                match kind {
                    GroupKind::Include => self.set_default_include(true),
                    GroupKind::Exclude => self.set_default_include(false),
                    GroupKind::Prune => {
                        return Err(fail(
                            lineno,
                            "default directive not allowed in prune group".to_string(),
                        ))
                    }
                }
            } else if let Some(rest) = line.strip_prefix(":re:") {
                self.add_pattern(kind, rest)
                    .map_err(|e| fail(lineno, e.to_string()))?;
            } else if let Some(rest) = line.strip_prefix("*/") {
                if rest.is_empty() {
                    return Err(fail(lineno, "empty base-name rule".to_string()));
                }
                self.add_base(kind, rest);
            } else if let Some(rest) = line.strip_prefix("*.") {
                if rest.is_empty() {
                    return Err(fail(lineno, "empty extension rule".to_string()));
                }
                self.add_pattern(kind, &format!(r"\.{}$", regex::escape(rest)))
                    .map_err(|e| fail(lineno, e.to_string()))?;
            } else {
                self.add_path(kind, line);
            }
        }
        Ok(())
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Levels from `path` up to but excluding the root `.`.
fn walk_up(path: &str) -> impl Iterator<Item = &str> + '_ {
    let mut cur = if path == "." { None } else { Some(path) };
    std::iter::from_fn(move || {
        let out = cur?;
        cur = out.rfind('/').map(|i| &out[..i]);
        Some(out)
    })
}

/// Decide whether `path` is in scope given a chain of filters.
///
/// Priority: junk dominates everything at the leaf level, prune dominates
/// include (it means "do not even look inside"), an exclude match is a
/// hard veto across filters, and include may lift children out of excluded
/// directories. With repo rules active, the reserved `.qfs` layout is
/// decided before any user rule.
///
/// `path` must be relative; absolute input is a programmer error.
pub fn is_included(path: &str, filters: &[Filter], repo_rules: bool) -> (bool, Group) {
    debug_assert!(
        !Path::new(path).is_absolute(),
        "filter query must be relative: {path}"
    );
    if Path::new(path).is_absolute() {
        return (false, Group::Default);
    }

    let base = base_name(path);
    for f in filters {
        if let Some(junk) = &f.junk {
            if junk.is_match(base) {
                return (false, Group::Junk);
            }
        }
    }

    if repo_rules {
        if path == REPO_FILTER_DIR || path.starts_with(".qfs/filters/") {
            return (true, Group::RepoRule);
        }
        if path == REPO_DIR {
            return (true, Group::RepoRule);
        }
        if path.starts_with(".qfs/") {
            return (false, Group::RepoRule);
        }
    }

    if filters.is_empty() {
        return (true, Group::Default);
    }

    for cur in walk_up(path) {
        let initial = cur == path;
        let cur_base = base_name(cur);
        for f in filters {
            if f.prune.matches(cur, cur_base, initial) {
                return (false, Group::Prune);
            }
        }
    }

    let mut all_included = true;
    let mut any_default_false = false;
    for f in filters {
        let mut included = false;
        for cur in walk_up(path) {
            let initial = cur == path;
            let cur_base = base_name(cur);
            if f.include.matches(cur, cur_base, initial) {
                included = true;
                break;
            }
            if f.exclude.matches(cur, cur_base, initial) {
                return (false, Group::Exclude);
            }
        }
        if !included {
            all_included = false;
            if !f.default_include() {
                any_default_false = true;
            }
        }
    }

    if all_included {
        (true, Group::Include)
    } else {
        (!any_default_false, Group::Default)
    }
}
