//! File identification by CRC32, MD5, SHA-1 and the SHA-2 family.

use crate::checksum::{Crc, Md5, Sha1, Sha256, Sha384, Sha512};
use crate::error::{Error, Result};
use crate::walk::expand_inputs;
use md5::Digest;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Read buffer size. Memory use while hashing is bounded by this.
pub const CHUNK_SIZE: usize = 1024;

/// Set of hash algorithms to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashSelection(u8);

impl HashSelection {
    pub const NONE: Self = HashSelection(0);
    pub const CRC: Self = HashSelection(0x01);
    pub const MD5: Self = HashSelection(0x02);
    pub const SHA1: Self = HashSelection(0x04);
    pub const SHA256: Self = HashSelection(0x08);
    pub const SHA384: Self = HashSelection(0x10);
    pub const SHA512: Self = HashSelection(0x20);

    /// CRC, MD5 and SHA-1.
    pub const STANDARD: Self = HashSelection(0x07);
    /// SHA-256, SHA-384 and SHA-512.
    pub const DEEP: Self = HashSelection(0x38);
    pub const ALL: Self = HashSelection(0x3f);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: Self) -> Self {
        HashSelection(self.0 & !other.0)
    }
}

impl BitOr for HashSelection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        HashSelection(self.0 | rhs.0)
    }
}

impl Default for HashSelection {
    fn default() -> Self {
        HashSelection::STANDARD
    }
}

/// Size and digests of a file or dump.
///
/// Every field may be unknown. A value with no size and no known digests is the
/// empty sentinel returned when identification fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Crc::is_unknown")]
    pub crc: Crc,
    #[serde(default, skip_serializing_if = "Md5::is_unknown")]
    pub md5: Md5,
    #[serde(default, skip_serializing_if = "Sha1::is_unknown")]
    pub sha1: Sha1,
    #[serde(default, skip_serializing_if = "Sha256::is_unknown")]
    pub sha256: Sha256,
    #[serde(default, skip_serializing_if = "Sha384::is_unknown")]
    pub sha384: Sha384,
    #[serde(default, skip_serializing_if = "Sha512::is_unknown")]
    pub sha512: Sha512,
}

impl Hashes {
    /// The empty sentinel.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True for the empty sentinel: no size and no known digest.
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && !self.has_any_digest()
    }

    pub fn has_any_digest(&self) -> bool {
        self.crc.is_known()
            || self.md5.is_known()
            || self.sha1.is_known()
            || self.sha256.is_known()
            || self.sha384.is_known()
            || self.sha512.is_known()
    }

    /// Per-field equality where both sides are known. `None` entries mean at least one
    /// side was unknown for that algorithm.
    fn shared(&self, other: &Self) -> [Option<bool>; 6] {
        [
            self.crc.known_eq(&other.crc),
            self.md5.known_eq(&other.md5),
            self.sha1.known_eq(&other.sha1),
            self.sha256.known_eq(&other.sha256),
            self.sha384.known_eq(&other.sha384),
            self.sha512.known_eq(&other.sha512),
        ]
    }

    /// True if at least one algorithm is known on both sides.
    pub fn shares_any_digest(&self, other: &Self) -> bool {
        self.shared(other).iter().any(Option::is_some)
    }

    /// Equal size and every digest known on both sides is equal, with at least one
    /// shared digest.
    pub fn matches(&self, other: &Self) -> bool {
        let shared = self.shared(other);
        shared.iter().any(Option::is_some)
            && self.size == other.size
            && shared.iter().all(|eq| eq.unwrap_or(true))
    }

    /// Same set of known digests on both sides, all equal.
    pub fn matches_fully(&self, other: &Self) -> bool {
        self.matches(other)
            && self.crc.is_known() == other.crc.is_known()
            && self.md5.is_known() == other.md5.is_known()
            && self.sha1.is_known() == other.sha1.is_known()
            && self.sha256.is_known() == other.sha256.is_known()
            && self.sha384.is_known() == other.sha384.is_known()
            && self.sha512.is_known() == other.sha512.is_known()
    }

    /// Copy size and digests that are unknown here from `other`.
    pub fn fill_missing(&mut self, other: &Self) {
        if self.size.is_none() {
            self.size = other.size;
        }
        self.crc.fill_from(&other.crc);
        self.md5.fill_from(&other.md5);
        self.sha1.fill_from(&other.sha1);
        self.sha256.fill_from(&other.sha256);
        self.sha384.fill_from(&other.sha384);
        self.sha512.fill_from(&other.sha512);
    }

    /// Lexicographic comparison of the digest bytes, CRC first.
    pub fn cmp_digests(&self, other: &Self) -> Ordering {
        self.crc
            .cmp_bytes(&other.crc)
            .then_with(|| self.md5.cmp_bytes(&other.md5))
            .then_with(|| self.sha1.cmp_bytes(&other.sha1))
            .then_with(|| self.sha256.cmp_bytes(&other.sha256))
            .then_with(|| self.sha384.cmp_bytes(&other.sha384))
            .then_with(|| self.sha512.cmp_bytes(&other.sha512))
    }
}

/// Incremental multi-algorithm hasher.
pub struct MultiHasher {
    size: u64,
    crc: Option<crc32fast::Hasher>,
    md5: Option<md5::Md5>,
    sha1: Option<sha1::Sha1>,
    sha256: Option<sha2::Sha256>,
    sha384: Option<sha2::Sha384>,
    sha512: Option<sha2::Sha512>,
}

impl MultiHasher {
    pub fn new(want: HashSelection) -> Self {
        Self {
            size: 0,
            crc: want
                .contains(HashSelection::CRC)
                .then(crc32fast::Hasher::new),
            md5: want.contains(HashSelection::MD5).then(md5::Md5::new),
            sha1: want.contains(HashSelection::SHA1).then(sha1::Sha1::new),
            sha256: want.contains(HashSelection::SHA256).then(sha2::Sha256::new),
            sha384: want.contains(HashSelection::SHA384).then(sha2::Sha384::new),
            sha512: want.contains(HashSelection::SHA512).then(sha2::Sha512::new),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        if let Some(h) = self.crc.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.md5.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha1.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha256.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha384.as_mut() {
            h.update(data);
        }
        if let Some(h) = self.sha512.as_mut() {
            h.update(data);
        }
    }

    pub fn finalize(self) -> Hashes {
        // Digest output lengths are fixed by the algorithm, so from_slice cannot fail.
        Hashes {
            size: Some(self.size),
            crc: self
                .crc
                .map(|h| Crc::from_bytes(h.finalize().to_be_bytes()))
                .unwrap_or_default(),
            md5: self
                .md5
                .and_then(|h| Md5::from_slice(&h.finalize()).ok())
                .unwrap_or_default(),
            sha1: self
                .sha1
                .and_then(|h| Sha1::from_slice(&h.finalize()).ok())
                .unwrap_or_default(),
            sha256: self
                .sha256
                .and_then(|h| Sha256::from_slice(&h.finalize()).ok())
                .unwrap_or_default(),
            sha384: self
                .sha384
                .and_then(|h| Sha384::from_slice(&h.finalize()).ok())
                .unwrap_or_default(),
            sha512: self
                .sha512
                .and_then(|h| Sha512::from_slice(&h.finalize()).ok())
                .unwrap_or_default(),
        }
    }
}

/// Hash data from a reader in `CHUNK_SIZE` pieces.
pub fn hash_reader<R: Read>(mut reader: R, want: HashSelection) -> Result<Hashes> {
    let mut hasher = MultiHasher::new(want);
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

/// Hash raw bytes.
pub fn hash_bytes(data: &[u8], want: HashSelection) -> Hashes {
    let mut hasher = MultiHasher::new(want);
    hasher.update(data);
    hasher.finalize()
}

/// Hash a file starting at `offset`.
///
/// Returns `Error::NotFound` if the path does not exist.
pub fn hash_file(path: &Path, offset: u64, want: HashSelection) -> Result<Hashes> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::not_found(path)),
        Err(e) => return Err(e.into()),
    };
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    hash_reader(file, want)
}

/// Hash a file, returning the empty sentinel instead of an error.
pub fn hash_file_or_empty(path: &Path, offset: u64, want: HashSelection) -> Hashes {
    match hash_file(path, offset, want) {
        Ok(hashes) => hashes,
        Err(Error::NotFound { .. }) => {
            debug!(path = %path.display(), "file not found, returning empty hashes");
            Hashes::empty()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to hash file");
            Hashes::empty()
        }
    }
}

/// Hash many files in parallel on the given pool. Directories are walked
/// recursively. Each file gets its own handle; failures yield the empty sentinel
/// for that file only.
pub fn hash_files(
    pool: &rayon::ThreadPool,
    paths: &[PathBuf],
    want: HashSelection,
) -> Vec<(PathBuf, Hashes)> {
    let paths = expand_inputs(paths);
    pool.install(|| {
        paths
            .par_iter()
            .map(|path| (path.clone(), hash_file_or_empty(path, 0, want)))
            .collect()
    })
}
