use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// stat(2) file type bits, spelled out locally so the codec does not depend
// on the platform's mode_t width.
const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

/// Permission section of a mode word; everything a record's `permissions`
/// field is allowed to carry.
pub const PERMISSION_MASK: u32 = 0o7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    File,
    Directory,
    Link,
    CharDev,
    BlockDev,
    Pipe,
    Socket,
    Unknown,
}

impl FileType {
    pub fn as_char(self) -> char {
        match self {
            FileType::File => 'f',
            FileType::Directory => 'd',
            FileType::Link => 'l',
            FileType::CharDev => 'c',
            FileType::BlockDev => 'b',
            FileType::Pipe => 'p',
            FileType::Socket => 's',
            FileType::Unknown => 'x',
        }
    }

    pub fn from_char(c: char) -> Option<FileType> {
        match c {
            'f' => Some(FileType::File),
            'd' => Some(FileType::Directory),
            'l' => Some(FileType::Link),
            'c' => Some(FileType::CharDev),
            'b' => Some(FileType::BlockDev),
            'p' => Some(FileType::Pipe),
            's' => Some(FileType::Socket),
            'x' => Some(FileType::Unknown),
            _ => None,
        }
    }

    /// Classify from the high bits of a raw stat mode (legacy databases
    /// store the full mode word).
    pub fn from_mode(mode: u32) -> FileType {
        match mode & S_IFMT {
            S_IFREG => FileType::File,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Link,
            S_IFCHR => FileType::CharDev,
            S_IFBLK => FileType::BlockDev,
            S_IFIFO => FileType::Pipe,
            S_IFSOCK => FileType::Socket,
            _ => FileType::Unknown,
        }
    }

    pub fn is_file(self) -> bool {
        self == FileType::File
    }

    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }

    pub fn is_device(self) -> bool {
        matches!(self, FileType::CharDev | FileType::BlockDev)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One filesystem entry as tracked by qfs: the unit of database content,
/// traversal output, and diff input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Relative path from the traversal root, forward slashes; the root
    /// itself is `.`.
    pub path: String,
    pub file_type: FileType,
    /// Modification time in milliseconds since the Unix epoch.
    pub mod_time: i64,
    /// Byte count; zero for anything that is not a regular file.
    pub size: i64,
    /// POSIX permission bits, restricted to 0..=0o7777.
    pub permissions: u32,
    pub uid: u32,
    pub gid: u32,
    /// Link target for symlinks, `MAJOR,MINOR` for devices, empty otherwise.
    pub special: String,
    /// Filesystem device number; traversal-only, never persisted.
    pub dev: Option<u64>,
    /// The object store's own last-modified time; cache-validation hint
    /// only, never persisted in the portable format.
    pub object_time: Option<i64>,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, file_type: FileType) -> Self {
        Self {
            path: path.into(),
            file_type,
            mod_time: 0,
            size: 0,
            permissions: 0,
            uid: 0,
            gid: 0,
            special: String::new(),
            dev: None,
            object_time: None,
        }
    }

    /// Base name of the record's path.
    #[allow(dead_code)] // Used in tests
    pub fn base(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Millisecond timestamp for a wall-clock time; times before the epoch
/// come out negative.
#[allow(dead_code)] // Used in tests
pub fn millis_from_system_time(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

pub fn system_time_from_millis(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}
