//! Object-key encoding of file records.
//!
//! A record stored under prefix `P` becomes the key
//! `P/<path-with-@-doubled>@<type>,<mod_time_ms>,<rest>`, where `<rest>` is
//! the 4-digit octal permissions for files and directories or the escaped
//! link target for symlinks. Literal `@` anywhere in a path or target is
//! doubled.

use crate::error::{QfsError, Result};
use crate::fileinfo::{FileRecord, FileType};
use regex::Regex;
use std::sync::OnceLock;

pub fn escape(s: &str) -> String {
    s.replace('@', "@@")
}

pub fn unescape(s: &str) -> String {
    s.replace("@@", "@")
}

fn key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^((?:[^@]|@@)+)@([fdl]),(\d+),((?:[^@]|@@)+)$")
            .expect("static key pattern")
    })
}

pub fn join_key(prefix: &str, body: &str) -> String {
    if prefix.is_empty() {
        body.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), body)
    }
}

/// Listing prefix that captures every version of `path` (and, harmlessly,
/// longer escaped paths that the decoder filters back out).
pub fn path_prefix(prefix: &str, path: &str) -> String {
    join_key(prefix, &format!("{}@", escape(path)))
}

/// Encode a record as its object key. Only files, directories, and
/// symlinks exist in a repository.
pub fn encode(prefix: &str, rec: &FileRecord) -> Result<String> {
    let rest = match rec.file_type {
        FileType::File | FileType::Directory => format!("{:04o}", rec.permissions),
        FileType::Link => escape(&rec.special),
        _ => {
            return Err(QfsError::Other(format!(
                "{}: can only store files, directories, and links",
                rec.path
            )))
        }
    };
    let body = format!(
        "{}@{},{},{}",
        escape(&rec.path),
        rec.file_type.as_char(),
        rec.mod_time,
        rest
    );
    Ok(join_key(prefix, &body))
}

/// Decode an object key back into a record. `size` and `object_time` come
/// from the store's listing metadata. Returns `None` for keys that do not
/// parse; such keys are orphans to be cleaned up.
pub fn decode(prefix: &str, key: &str, size: i64, object_time: i64) -> Option<FileRecord> {
    let body = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(&format!("{}/", prefix.trim_end_matches('/')))?
    };
    let caps = key_regex().captures(body)?;

    let path = unescape(&caps[1]);
    let file_type = FileType::from_char(caps[2].chars().next()?)?;
    let mod_time: i64 = caps[3].parse().ok()?;
    let (permissions, special) = match file_type {
        FileType::File | FileType::Directory => {
            let digits = &caps[4];
            if digits.len() != 4 || !digits.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
                return None;
            }
            (u32::from_str_radix(digits, 8).ok()?, String::new())
        }
        // Links carry no mode in the key; lstat reports 0777 for them.
        FileType::Link => (0o777, unescape(&caps[4])),
        _ => return None,
    };

    Some(FileRecord {
        path,
        file_type,
        mod_time,
        size: if file_type.is_file() { size } else { 0 },
        permissions,
        uid: 0,
        gid: 0,
        special,
        dev: None,
        object_time: Some(object_time),
    })
}
