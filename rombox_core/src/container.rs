//! Content-addressed container format.
//!
//! A container is a gzip stream whose header carries a 28-byte FEXTRA field with the
//! payload's MD5, CRC32 and size. The file is named after the payload's SHA-1, so
//! every digest is known without decompressing.
//!
//! ```text
//! 0x00  12  magic: gzip id, deflate, FLG=FEXTRA, zero mtime/xfl/os, XLEN=28
//! 0x0c  16  MD5 of the payload
//! 0x1c   4  CRC32 of the payload (big-endian)
//! 0x20   8  payload size (u64 BE)
//! 0x28  ... deflate stream and gzip trailer
//! ```

use crate::checksum::{Crc, Md5, SHA1_SIZE, Sha1};
use crate::error::{Error, Result};
use crate::hash::{CHUNK_SIZE, HashSelection, Hashes, MultiHasher, hash_file};
use crate::source::{ArchiveEntry, ArchiveReader};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// First 12 bytes of every container.
pub const MAGIC: [u8; 12] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1c, 0x00,
];

/// Size of the container header in bytes.
pub const HEADER_SIZE: usize = 40;

/// Size of the plain gzip header that the container header replaces.
const GZIP_HEADER_SIZE: usize = 10;

/// Size of the gzip trailer (CRC32 + ISIZE).
const GZIP_TRAILER_SIZE: u64 = 8;

/// File extension of containers.
pub const EXTENSION: &str = "gz";

/// The digests stored in a container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub md5: Md5,
    pub crc: Crc,
    pub size: u64,
}

impl ContainerHeader {
    /// Encode to the 40-byte on-disk header.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..12].copy_from_slice(&MAGIC);
        buf[12..28].copy_from_slice(&self.md5.bytes().unwrap_or_default());
        buf[28..32].copy_from_slice(&self.crc.bytes().unwrap_or_default());
        buf[32..40].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Decode a header. Returns `None` if the magic does not match.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        if buf[0..12] != MAGIC {
            return None;
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[32..40]);
        Some(Self {
            md5: Md5::from_slice(&buf[12..28]).ok()?,
            crc: Crc::from_slice(&buf[28..32]).ok()?,
            size: u64::from_be_bytes(size),
        })
    }
}

/// Parse the SHA-1 out of a container file name (`<40 lowercase hex>.gz`).
pub fn sha1_from_name(path: &Path) -> Option<Sha1> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".gz")?;
    let is_sha1 = stem.len() == SHA1_SIZE * 2
        && stem
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !is_sha1 {
        return None;
    }
    Sha1::from_hex(stem).ok()
}

/// File name of the container holding content with this SHA-1.
pub fn container_name(sha1: &Sha1) -> String {
    format!("{}.{}", sha1.key(), EXTENSION)
}

/// Depot location of a container: `d[0:2]/d[2:4]/d[4:6]/d[6:8]/d.gz` under `root`.
pub fn depot_path(root: &Path, sha1: &Sha1) -> PathBuf {
    let hex = sha1.key();
    root.join(&hex[0..2])
        .join(&hex[2..4])
        .join(&hex[4..6])
        .join(&hex[6..8])
        .join(container_name(sha1))
}

/// Writer adapter that drops the first `skip` bytes written through it.
struct SkipWriter<W: Write> {
    inner: W,
    skip: usize,
}

impl<W: Write> Write for SkipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.skip == 0 {
            return self.inner.write(buf);
        }
        let dropped = self.skip.min(buf.len());
        self.skip -= dropped;
        if dropped == buf.len() {
            return Ok(dropped);
        }
        let written = self.inner.write(&buf[dropped..])?;
        Ok(dropped + written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Result of encoding a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Path of the container in the output directory.
    pub path: PathBuf,
    /// Digests of the payload.
    pub hashes: Hashes,
    /// True if a container for this content was already present.
    pub existed: bool,
}

/// Encode `input` into `<out_dir>/<sha1>.gz`.
///
/// The container is written to a temporary file in `out_dir` and renamed into place.
pub fn encode(input: &Path, out_dir: &Path) -> Result<Encoded> {
    let hashes = hash_file(input, 0, HashSelection::STANDARD)?;
    let path = out_dir.join(container_name(&hashes.sha1));
    if path.exists() {
        debug!(path = %path.display(), "container already present");
        return Ok(Encoded {
            path,
            hashes,
            existed: true,
        });
    }

    fs::create_dir_all(out_dir)?;
    let header = ContainerHeader {
        md5: hashes.md5,
        crc: hashes.crc,
        size: hashes.size.unwrap_or_default(),
    };

    let mut temp_file = tempfile::NamedTempFile::new_in(out_dir)?;
    temp_file.write_all(&header.encode())?;
    {
        let sink = SkipWriter {
            inner: temp_file.as_file_mut(),
            skip: GZIP_HEADER_SIZE,
        };
        let mut encoder = GzEncoder::new(sink, Compression::best());
        let mut source = File::open(input)?;
        io::copy(&mut source, &mut encoder)?;
        encoder.finish()?.flush()?;
    }
    temp_file.persist(&path)?;

    debug!(input = %input.display(), container = %path.display(), "encoded container");
    Ok(Encoded {
        path,
        hashes,
        existed: false,
    })
}

/// Read the digests of a container without decompressing it.
///
/// Returns the empty sentinel if the file does not start with the container magic.
pub fn inspect(path: &Path) -> Result<Hashes> {
    let sha1 = sha1_from_name(path)
        .ok_or_else(|| Error::malformed_container(path, "non-SHA1 filename"))?;

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(path)),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() < HEADER_SIZE as u64 {
        return Err(Error::malformed_container(path, "possibly corrupt file"));
    }

    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf)?;
    let Some(header) = ContainerHeader::decode(&buf) else {
        debug!(path = %path.display(), "not a container");
        return Ok(Hashes::empty());
    };

    Ok(Hashes {
        size: Some(header.size),
        crc: header.crc,
        md5: header.md5,
        sha1,
        ..Hashes::default()
    })
}

/// Decompress a container into `writer`, verifying the payload against the header
/// and the file name.
pub fn extract<W: Write>(path: &Path, mut writer: W) -> Result<Hashes> {
    let expected = inspect(path)?;
    if expected.is_empty() {
        return Err(Error::malformed_container(path, "not a container"));
    }

    let mut decoder = GzDecoder::new(File::open(path)?);
    let mut hasher = MultiHasher::new(HashSelection::STANDARD);
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = match decoder.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(Error::malformed_container(
                    path,
                    format!("corrupt deflate stream: {}", e),
                ));
            }
        };
        hasher.update(&buffer[..read]);
        writer.write_all(&buffer[..read])?;
    }
    writer.flush()?;

    let actual = hasher.finalize();
    if actual != expected {
        return Err(Error::malformed_container(
            path,
            format!(
                "payload mismatch: header size={:?} crc={} md5={} sha1={}, payload size={:?} crc={} md5={} sha1={}",
                expected.size,
                expected.crc,
                expected.md5,
                expected.sha1,
                actual.size,
                actual.crc,
                actual.md5,
                actual.sha1
            ),
        ));
    }
    Ok(actual)
}

/// Move a container into its sharded location under `root`.
///
/// If an intact copy of the content is already in the depot the source is
/// discarded; a damaged copy is replaced. If the move fails the source is deleted
/// and `Error::MoveFailure` is returned.
pub fn place_in_depot(container: &Path, root: &Path) -> Result<PathBuf> {
    let sha1 = sha1_from_name(container)
        .ok_or_else(|| Error::malformed_container(container, "non-SHA1 filename"))?;
    let target = depot_path(root, &sha1);

    if target.exists() {
        match extract(&target, io::sink()) {
            Ok(_) => {
                debug!(target = %target.display(), "already in depot");
                fs::remove_file(container)?;
                return Ok(target);
            }
            Err(e) => {
                warn!(target = %target.display(), error = %e, "replacing damaged container");
            }
        }
    }

    let moved = target
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|_| move_file(container, &target));
    if let Err(e) = moved {
        warn!(
            from = %container.display(),
            to = %target.display(),
            error = %e,
            "failed to move container into depot, discarding it"
        );
        if let Err(remove_err) = fs::remove_file(container) {
            warn!(path = %container.display(), error = %remove_err, "failed to delete container");
        }
        return Err(Error::move_failure(container, target, e));
    }

    debug!(target = %target.display(), "placed container");
    Ok(target)
}

/// Rename, falling back to copy + delete across filesystems.
///
/// The copy goes through a temporary file beside `to`, so the target is either
/// absent or complete.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            let dir = match to.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
            io::copy(&mut File::open(from)?, temp_file.as_file_mut())?;
            temp_file.as_file().sync_all()?;
            temp_file.persist(to).map_err(|e| e.error)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

/// Lists the single entry of a container or plain gzip file.
#[derive(Debug, Default, Clone, Copy)]
pub struct GzipEntryReader;

impl ArchiveReader for GzipEntryReader {
    fn entries(&self, path: &Path) -> Result<Vec<ArchiveEntry>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(path)),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        if len >= HEADER_SIZE as u64 && sha1_from_name(path).is_some() {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact(&mut buf)?;
            if let Some(header) = ContainerHeader::decode(&buf) {
                return Ok(vec![ArchiveEntry {
                    name,
                    size: header.size,
                    crc: header.crc,
                }]);
            }
            file.seek(SeekFrom::Start(0))?;
        }

        if len < GZIP_HEADER_SIZE as u64 + GZIP_TRAILER_SIZE {
            return Ok(Vec::new());
        }
        let mut id = [0u8; 2];
        file.read_exact(&mut id)?;
        if id != [0x1f, 0x8b] {
            debug!(path = %path.display(), "not an archive");
            return Ok(Vec::new());
        }

        let mut trailer = [0u8; 8];
        file.seek(SeekFrom::End(-(GZIP_TRAILER_SIZE as i64)))?;
        file.read_exact(&mut trailer)?;
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&trailer[0..4]);
        let mut isize = [0u8; 4];
        isize.copy_from_slice(&trailer[4..8]);

        Ok(vec![ArchiveEntry {
            name,
            size: u32::from_le_bytes(isize) as u64,
            crc: Crc::from_bytes(u32::from_le_bytes(crc).to_be_bytes()),
        }])
    }
}
