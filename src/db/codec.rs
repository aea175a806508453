//! Reading and writing of qfs database files.
//!
//! The canonical format (`QFS 1`) frames each record as
//! `<len>[/<same>]\x00<suffix>\n`, where `<same>` bytes are reused from the
//! previous record's payload and `<len>` is the byte count of the fresh
//! suffix. Payload fields are NUL-separated; mode, uid, and gid are emitted
//! empty when unchanged from the previous record. The legacy
//! `SYNC_TOOLS_DB_VERSION 3` format is accepted for reading only.

use crate::db::IterOptions;
use crate::error::{QfsError, Result};
use crate::fileinfo::{FileRecord, FileType, PERMISSION_MASK};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

const HEADER_V1: &str = "QFS 1";
const HEADER_LEGACY: &str = "SYNC_TOOLS_DB_VERSION 3";

/// Streaming writer for the canonical format. Records must arrive in
/// sorted-path order; the writer enforces it.
pub struct DbWriter<W: Write> {
    out: W,
    started: bool,
    prev_payload: Vec<u8>,
    prev_path: String,
    last_mode: u32,
    last_uid: u32,
    last_gid: u32,
}

impl<W: Write> DbWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            started: false,
            prev_payload: Vec::new(),
            prev_path: String::new(),
            last_mode: 0,
            last_uid: 0,
            last_gid: 0,
        }
    }

    pub fn write_record(&mut self, rec: &FileRecord) -> Result<()> {
        if rec.path.contains('\0')
            || rec.path.contains('\n')
            || rec.special.contains('\0')
            || rec.special.contains('\n')
        {
            return Err(QfsError::Other(format!(
                "{}: record contains unencodable bytes",
                rec.path
            )));
        }
        if rec.permissions & !PERMISSION_MASK != 0 {
            return Err(QfsError::Other(format!(
                "{}: mode {:o} outside the permission bits",
                rec.path, rec.permissions
            )));
        }
        if self.started && rec.path.as_str() <= self.prev_path.as_str() {
            return Err(QfsError::Other(format!(
                "database records out of order: {:?} after {:?}",
                rec.path, self.prev_path
            )));
        }
        if !self.started {
            writeln!(self.out, "{}", HEADER_V1)?;
        }

        let payload = self.payload(rec);
        let same = common_prefix(&self.prev_payload, &payload);
        let suffix = &payload[same..];
        if same > 0 {
            write!(self.out, "{}/{}\0", suffix.len(), same)?;
        } else {
            write!(self.out, "{}\0", suffix.len())?;
        }
        self.out.write_all(suffix)?;
        self.out.write_all(b"\n")?;

        self.prev_payload = payload;
        self.prev_path = rec.path.clone();
        self.last_mode = rec.permissions;
        self.last_uid = rec.uid;
        self.last_gid = rec.gid;
        self.started = true;
        Ok(())
    }

    /// The first record carries mode, uid, and gid explicitly; afterwards
    /// each is emitted empty iff it equals the last emitted value.
    fn payload(&self, rec: &FileRecord) -> Vec<u8> {
        let mode = if self.started && rec.permissions == self.last_mode {
            String::new()
        } else {
            format!("0{:o}", rec.permissions)
        };
        let uid = if self.started && rec.uid == self.last_uid {
            String::new()
        } else {
            rec.uid.to_string()
        };
        let gid = if self.started && rec.gid == self.last_gid {
            String::new()
        } else {
            rec.gid.to_string()
        };

        let type_s = rec.file_type.as_char().to_string();
        let mtime_s = rec.mod_time.to_string();
        let size_s = rec.size.to_string();
        let fields: [&str; 8] = [
            &rec.path, &type_s, &mtime_s, &size_s, &mode, &uid, &gid, &rec.special,
        ];
        let mut payload = Vec::with_capacity(fields.iter().map(|f| f.len() + 1).sum());
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                payload.push(0);
            }
            payload.extend_from_slice(field.as_bytes());
        }
        payload
    }

    /// Flush and hand the underlying writer back. An empty database is a
    /// bare header.
    pub fn finish(mut self) -> Result<W> {
        if !self.started {
            writeln!(self.out, "{}", HEADER_V1)?;
        }
        self.out.flush()?;
        Ok(self.out)
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbFormat {
    V1,
    Legacy,
}

enum Parsed {
    Eof,
    Dropped,
    Rec(FileRecord),
}

/// Reader for both database formats. Reusable: `for_each` rewinds to the
/// beginning before iterating.
#[derive(Debug)]
pub struct DbReader<R: BufRead + Seek> {
    input: R,
    filename: String,
    format: DbFormat,
    /// Byte offset of the next unread byte.
    offset: u64,
    /// Byte offset where the record currently being parsed started;
    /// every decode error points here.
    record_offset: u64,
    prev_payload: Vec<u8>,
    last_mode: u32,
    last_uid: u32,
    last_gid: u32,
    have_prev: bool,
}

impl DbReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| QfsError::path_io(path.display().to_string(), e))?;
        Self::new(BufReader::new(file), path.display().to_string())
    }
}

impl<R: BufRead + Seek> DbReader<R> {
    pub fn new(input: R, filename: impl Into<String>) -> Result<Self> {
        let mut reader = Self {
            input,
            filename: filename.into(),
            format: DbFormat::V1,
            offset: 0,
            record_offset: 0,
            prev_payload: Vec::new(),
            last_mode: 0,
            last_uid: 0,
            last_gid: 0,
            have_prev: false,
        };
        reader.read_header()?;
        Ok(reader)
    }

    fn err(&self, message: impl Into<String>) -> QfsError {
        QfsError::format(&self.filename, self.record_offset, message)
    }

    fn read_header(&mut self) -> Result<()> {
        self.record_offset = 0;
        let mut line = Vec::new();
        self.read_until(b'\n', &mut line)?;
        if line.last() != Some(&b'\n') {
            return Err(self.err("missing database header"));
        }
        line.pop();
        match std::str::from_utf8(&line) {
            Ok(HEADER_V1) => self.format = DbFormat::V1,
            Ok(HEADER_LEGACY) => self.format = DbFormat::Legacy,
            _ => return Err(self.err("unknown database header")),
        }
        Ok(())
    }

    /// Restart the stream; the next `next_record` yields the first record
    /// again.
    pub fn rewind(&mut self) -> Result<()> {
        self.input.seek(SeekFrom::Start(0))?;
        self.offset = 0;
        self.prev_payload.clear();
        self.have_prev = false;
        self.read_header()
    }

    pub fn next_record(&mut self) -> Result<Option<FileRecord>> {
        loop {
            self.record_offset = self.offset;
            let parsed = match self.format {
                DbFormat::V1 => self.next_v1()?,
                DbFormat::Legacy => self.next_legacy()?,
            };
            match parsed {
                Parsed::Eof => return Ok(None),
                Parsed::Dropped => continue,
                Parsed::Rec(rec) => return Ok(Some(rec)),
            }
        }
    }

    /// Rewind, then invoke the callback once per admitted record in
    /// sorted order. Callback errors stop the iteration and come back
    /// wrapped with the record's position.
    pub fn for_each<F>(&mut self, opts: &IterOptions, mut f: F) -> Result<()>
    where
        F: FnMut(&FileRecord) -> Result<()>,
    {
        self.rewind()?;
        while let Some(rec) = self.next_record()? {
            if !opts.admits(&rec) {
                continue;
            }
            f(&rec).map_err(|e| self.err(e.to_string()))?;
        }
        Ok(())
    }

    fn read_until(&mut self, delim: u8, buf: &mut Vec<u8>) -> Result<usize> {
        let n = self.input.read_until(delim, buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn read_exact_n(&mut self, n: usize, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        buf.resize(start + n, 0);
        self.input
            .read_exact(&mut buf[start..])
            .map_err(|_| self.err("unexpected end of file in record"))?;
        self.offset += n as u64;
        Ok(())
    }

    fn next_v1(&mut self) -> Result<Parsed> {
        let mut head = Vec::new();
        let n = self.read_until(b'\0', &mut head)?;
        if n == 0 {
            return Ok(Parsed::Eof);
        }
        if head.last() != Some(&b'\0') {
            return Err(self.err("unexpected end of file in record header"));
        }
        head.pop();
        let head = std::str::from_utf8(&head)
            .map_err(|_| self.err("invalid record header"))?;
        let (len, same) = match head.split_once('/') {
            Some((l, s)) => (
                l.parse::<usize>()
                    .map_err(|_| self.err("invalid record header"))?,
                s.parse::<usize>()
                    .map_err(|_| self.err("invalid record header"))?,
            ),
            None => (
                head.parse::<usize>()
                    .map_err(|_| self.err("invalid record header"))?,
                0,
            ),
        };
        if same > self.prev_payload.len() {
            return Err(self.err("shared prefix longer than previous record"));
        }

        let mut payload = self.prev_payload[..same].to_vec();
        self.read_exact_n(len, &mut payload)?;
        let mut nl = Vec::new();
        self.read_exact_n(1, &mut nl)?;
        if nl != b"\n" {
            return Err(self.err("missing record terminator"));
        }

        let rec = self.parse_v1_payload(&payload)?;
        self.prev_payload = payload;
        Ok(Parsed::Rec(rec))
    }

    fn parse_v1_payload(&mut self, payload: &[u8]) -> Result<FileRecord> {
        let fields: Vec<&[u8]> = payload.split(|b| *b == 0).collect();
        if fields.len() != 8 {
            return Err(self.err(format!(
                "wrong number of fields: expected 8, got {}",
                fields.len()
            )));
        }
        let text = |i: usize, what: &str| -> Result<&str> {
            std::str::from_utf8(fields[i]).map_err(|_| self.err(format!("{what} is not valid UTF-8")))
        };

        let path = text(0, "path")?.to_string();
        let type_field = text(1, "file type")?;
        let mut type_chars = type_field.chars();
        let file_type = match (type_chars.next().and_then(FileType::from_char), type_chars.next()) {
            (Some(ft), None) => ft,
            _ => return Err(self.err(format!("invalid file type {:?}", type_field))),
        };
        let mod_time: i64 = text(2, "modification time")?
            .parse()
            .map_err(|_| self.err("invalid modification time"))?;
        let size: i64 = text(3, "size")?
            .parse()
            .map_err(|_| self.err("invalid size"))?;

        let mode_field = text(4, "mode")?;
        let permissions = if mode_field.is_empty() {
            if !self.have_prev {
                return Err(self.err("carried-forward mode in first record"));
            }
            self.last_mode
        } else {
            let mode = u32::from_str_radix(mode_field, 8)
                .map_err(|_| self.err("invalid mode"))?;
            if mode & !PERMISSION_MASK != 0 {
                return Err(self.err("mode outside the permission bits"));
            }
            mode
        };
        let uid_field = text(5, "uid")?;
        let uid = if uid_field.is_empty() {
            if !self.have_prev {
                return Err(self.err("carried-forward uid in first record"));
            }
            self.last_uid
        } else {
            uid_field.parse().map_err(|_| self.err("invalid uid"))?
        };
        let gid_field = text(6, "gid")?;
        let gid = if gid_field.is_empty() {
            if !self.have_prev {
                return Err(self.err("carried-forward gid in first record"));
            }
            self.last_gid
        } else {
            gid_field.parse().map_err(|_| self.err("invalid gid"))?
        };
        let special = text(7, "special")?.to_string();

        self.last_mode = permissions;
        self.last_uid = uid;
        self.last_gid = gid;
        self.have_prev = true;

        Ok(FileRecord {
            path,
            file_type,
            mod_time,
            size,
            permissions,
            uid,
            gid,
            special,
            dev: None,
            object_time: None,
        })
    }

    fn next_legacy(&mut self) -> Result<Parsed> {
        let mut line = Vec::new();
        let n = self.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(Parsed::Eof);
        }
        if line.last() != Some(&b'\n') {
            return Err(self.err("missing record terminator"));
        }
        line.pop();
        if line.first() != Some(&b'\0') {
            return Err(self.err("malformed legacy record"));
        }

        let fields: Vec<&[u8]> = line[1..].split(|b| *b == 0).collect();
        if fields.len() != 9 {
            return Err(self.err(format!(
                "wrong number of fields: expected 9, got {}",
                fields.len()
            )));
        }
        if !fields[8].is_empty() {
            return Err(self.err("trailing data after legacy record"));
        }
        let text = |i: usize, what: &str| -> Result<&str> {
            std::str::from_utf8(fields[i]).map_err(|_| self.err(format!("{what} is not valid UTF-8")))
        };

        let mut path = text(0, "path")?.to_string();
        if let Some(stripped) = path.strip_prefix("./") {
            path = stripped.to_string();
        }
        let mod_time_s: i64 = text(1, "modification time")?
            .parse()
            .map_err(|_| self.err("invalid modification time"))?;
        let size: i64 = text(2, "size")?
            .parse()
            .map_err(|_| self.err("invalid size"))?;
        let mode = u32::from_str_radix(text(3, "mode")?, 8)
            .map_err(|_| self.err("invalid mode"))?;
        let uid: u32 = text(4, "uid")?
            .parse()
            .map_err(|_| self.err("invalid uid"))?;
        let gid: u32 = text(5, "gid")?
            .parse()
            .map_err(|_| self.err("invalid gid"))?;
        // Link counts are not tracked; the field is validated and dropped.
        let _: u64 = text(6, "link count")?
            .parse()
            .map_err(|_| self.err("invalid link count"))?;
        let special_raw = text(7, "special")?;

        if special_raw == "-1" {
            // Pruned-directory marker written by old clients.
            tracing::debug!(%path, "dropping legacy pruned-directory entry");
            return Ok(Parsed::Dropped);
        }

        let file_type = FileType::from_mode(mode);
        let special = match file_type {
            FileType::Link => special_raw.to_string(),
            FileType::CharDev | FileType::BlockDev => special_raw
                .strip_prefix("c,")
                .or_else(|| special_raw.strip_prefix("b,"))
                .unwrap_or(special_raw)
                .to_string(),
            // Directories carried their entry count here; meaningless now.
            _ => String::new(),
        };

        Ok(Parsed::Rec(FileRecord {
            path,
            file_type,
            mod_time: mod_time_s * 1000,
            size: if file_type.is_file() { size } else { 0 },
            permissions: mode & PERMISSION_MASK,
            uid,
            gid,
            special,
            dev: None,
            object_time: None,
        }))
    }
}
