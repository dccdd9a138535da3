//! Key-value row storage backing the hash-record index.

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Attribute a row carries for a hash record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowKey {
    Size,
    Crc,
    Md5,
    Sha1,
    /// SHA-1 of a DAT the record was seen in.
    Dat,
    Exists,
}

impl RowKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKey::Size => "size",
            RowKey::Crc => "crc",
            RowKey::Md5 => "md5",
            RowKey::Sha1 => "sha1",
            RowKey::Dat => "dat",
            RowKey::Exists => "exists",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "size" => Ok(RowKey::Size),
            "crc" => Ok(RowKey::Crc),
            "md5" => Ok(RowKey::Md5),
            "sha1" => Ok(RowKey::Sha1),
            "dat" => Ok(RowKey::Dat),
            "exists" => Ok(RowKey::Exists),
            _ => Err(Error::persistence(format!("Unknown row key: {}", s))),
        }
    }
}

/// A single (id, key, value) row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Row {
    pub id: u64,
    pub key: RowKey,
    pub value: String,
}

impl Row {
    pub fn new(id: u64, key: RowKey, value: impl Into<String>) -> Self {
        Self {
            id,
            key,
            value: value.into(),
        }
    }

    /// Serialize the row to a pipe-delimited line.
    pub fn to_line(&self) -> String {
        format!("{}|{}|{}", self.id, self.key.as_str(), self.value)
    }

    /// Parse a row from a pipe-delimited line.
    pub fn from_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.splitn(3, '|').collect();
        if parts.len() != 3 {
            return Err(Error::persistence(format!(
                "Invalid row format: expected 3 fields, got {}",
                parts.len()
            )));
        }
        let id = parts[0]
            .parse::<u64>()
            .map_err(|_| Error::persistence(format!("Invalid row id: {}", parts[0])))?;
        Ok(Self {
            id,
            key: RowKey::parse(parts[1])?,
            value: parts[2].to_string(),
        })
    }
}

/// Relational store of hash-record rows.
pub trait RowStore: Send {
    /// Every row, in insertion order.
    fn rows(&self) -> &[Row];

    fn insert(&mut self, rows: &[Row]) -> Result<()>;

    /// Delete rows matching `pred`, returning how many went.
    fn delete_where(&mut self, pred: &dyn Fn(&Row) -> bool) -> Result<usize>;

    /// Next unused record id.
    fn next_id(&self) -> u64 {
        self.rows().iter().map(|r| r.id + 1).max().unwrap_or(0)
    }

    /// Replace the value of `key` for record `id`.
    fn set(&mut self, id: u64, key: RowKey, value: &str) -> Result<()> {
        self.delete_where(&|r| r.id == id && r.key == key)?;
        self.insert(&[Row::new(id, key, value)])
    }
}

/// In-memory row store.
#[derive(Debug, Default, Clone)]
pub struct MemoryRowStore {
    rows: Vec<Row>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RowStore for MemoryRowStore {
    fn rows(&self) -> &[Row] {
        &self.rows
    }

    fn insert(&mut self, rows: &[Row]) -> Result<()> {
        self.rows.extend_from_slice(rows);
        Ok(())
    }

    fn delete_where(&mut self, pred: &dyn Fn(&Row) -> bool) -> Result<usize> {
        let before = self.rows.len();
        self.rows.retain(|r| !pred(r));
        Ok(before - self.rows.len())
    }
}

/// Row store persisted as pipe-delimited lines.
///
/// Inserts append to the file. Deletes rewrite it through a temporary file that is
/// renamed over the original.
#[derive(Debug)]
pub struct FileRowStore {
    path: PathBuf,
    rows: Vec<Row>,
}

impl FileRowStore {
    /// Open or create a row file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(|e| persistence(&path, e))?;
                }
                File::create(&path).map_err(|e| persistence(&path, e))?;
                return Ok(Self {
                    path,
                    rows: Vec::new(),
                });
            }
            Err(e) => return Err(persistence(&path, e)),
        };

        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| persistence(&path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            rows.push(Row::from_line(line)?);
        }

        Ok(Self { path, rows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rewrite(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp_file =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| persistence(&self.path, e))?;
        for row in &self.rows {
            writeln!(temp_file, "{}", row.to_line()).map_err(|e| persistence(&self.path, e))?;
        }
        temp_file.flush().map_err(|e| persistence(&self.path, e))?;
        temp_file
            .persist(&self.path)
            .map_err(|e| persistence(&self.path, e.error))?;
        Ok(())
    }
}

impl RowStore for FileRowStore {
    fn rows(&self) -> &[Row] {
        &self.rows
    }

    fn insert(&mut self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| persistence(&self.path, e))?;
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&row.to_line());
            buf.push('\n');
        }
        file.write_all(buf.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| persistence(&self.path, e))?;
        self.rows.extend_from_slice(rows);
        Ok(())
    }

    fn delete_where(&mut self, pred: &dyn Fn(&Row) -> bool) -> Result<usize> {
        let before = self.rows.len();
        self.rows.retain(|r| !pred(r));
        let removed = before - self.rows.len();
        if removed > 0 {
            self.rewrite()?;
        }
        Ok(removed)
    }
}

fn persistence(path: &Path, e: std::io::Error) -> Error {
    Error::persistence(format!("{}: {}", path.display(), e))
}
