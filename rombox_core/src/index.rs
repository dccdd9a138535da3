//! Hash-record index reconciled against the DAT corpus.
//!
//! A hash record is identified by size, CRC, MD5 and SHA-1, any of which may be a
//! wildcard, and carries the SHA-1 digests of the DATs that listed it plus a flag
//! saying whether the content is in a depot. Records are stored as rows:
//!
//! ```text
//! 12|size|4096
//! 12|crc|0d4a1185
//! 12|md5|null
//! 12|sha1|2aae6c35c94fcfb415dbe95f408b9ce91ee846ed
//! 12|dat|<dat sha1>
//! 12|exists|false
//! ```

use crate::checksum::{Checksum, Crc, Md5, Sha1};
use crate::error::{Error, Result};
use crate::hash::{HashSelection, Hashes, hash_file};
use crate::item::ItemKind;
use crate::rows::{Row, RowKey, RowStore};
use crate::source::DatSource;
use crate::walk::files_under;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Row value of a wildcard field.
const WILDCARD: &str = "null";

/// One entry of the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HashRecord {
    pub id: u64,
    pub size: Option<u64>,
    pub crc: Crc,
    pub md5: Md5,
    pub sha1: Sha1,
    /// SHA-1 digests of the DATs listing this record.
    pub dats: BTreeSet<String>,
    /// Content is stored in a depot.
    pub exists: bool,
}

impl HashRecord {
    /// Size and every digest known on both sides agree.
    pub fn matches(&self, size: Option<u64>, crc: &Crc, md5: &Md5, sha1: &Sha1) -> bool {
        let size_matches = match (self.size, size) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        size_matches && self.crc.matches(crc) && self.md5.matches(md5) && self.sha1.matches(sha1)
    }

    fn matches_hashes(&self, hashes: &Hashes) -> bool {
        self.matches(hashes.size, &hashes.crc, &hashes.md5, &hashes.sha1)
    }

    fn to_rows(&self) -> Vec<Row> {
        let mut rows = vec![
            Row::new(
                self.id,
                RowKey::Size,
                self.size
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| WILDCARD.to_string()),
            ),
            Row::new(self.id, RowKey::Crc, checksum_value(&self.crc)),
            Row::new(self.id, RowKey::Md5, checksum_value(&self.md5)),
            Row::new(self.id, RowKey::Sha1, checksum_value(&self.sha1)),
        ];
        rows.extend(
            self.dats
                .iter()
                .map(|dat| Row::new(self.id, RowKey::Dat, dat.clone())),
        );
        rows.push(Row::new(self.id, RowKey::Exists, self.exists.to_string()));
        rows
    }
}

fn checksum_value<const N: usize>(checksum: &Checksum<N>) -> String {
    checksum.to_hex().unwrap_or_else(|| WILDCARD.to_string())
}

fn parse_checksum<const N: usize>(value: &str) -> Result<Checksum<N>> {
    if value == WILDCARD {
        return Ok(Checksum::Unknown);
    }
    Checksum::from_hex(value)
        .map_err(|e| Error::persistence(format!("Invalid digest in index: {}", e)))
}

/// Counts produced by a refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    /// DAT files found under the root.
    pub dats_found: usize,
    /// DATs parsed because their digest was not yet indexed.
    pub dats_added: usize,
    /// Indexed digests no longer on disk.
    pub dats_removed: usize,
    /// DATs that could not be hashed or parsed.
    pub dats_failed: usize,
    pub records_inserted: usize,
    /// Existing records newly tagged with a DAT.
    pub records_tagged: usize,
}

/// Index summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub records: usize,
    pub dats: usize,
    pub present: usize,
}

/// Maintains hash records in a row store from the DATs a source can read.
pub struct DepotIndex<S: RowStore, D: DatSource> {
    rows: S,
    source: D,
}

impl<S: RowStore, D: DatSource> DepotIndex<S, D> {
    pub fn new(rows: S, source: D) -> Self {
        Self { rows, source }
    }

    pub fn row_store(&self) -> &S {
        &self.rows
    }

    /// Assemble records from rows, ordered by id.
    pub fn records(&self) -> Result<Vec<HashRecord>> {
        let mut records: BTreeMap<u64, HashRecord> = BTreeMap::new();
        for row in self.rows.rows() {
            let record = records.entry(row.id).or_insert_with(|| HashRecord {
                id: row.id,
                ..HashRecord::default()
            });
            match row.key {
                RowKey::Size => {
                    record.size = if row.value == WILDCARD {
                        None
                    } else {
                        Some(row.value.parse().map_err(|_| {
                            Error::persistence(format!("Invalid size in index: {}", row.value))
                        })?)
                    }
                }
                RowKey::Crc => record.crc = parse_checksum(&row.value)?,
                RowKey::Md5 => record.md5 = parse_checksum(&row.value)?,
                RowKey::Sha1 => record.sha1 = parse_checksum(&row.value)?,
                RowKey::Dat => {
                    record.dats.insert(row.value.clone());
                }
                RowKey::Exists => record.exists = row.value == "true",
            }
        }
        Ok(records.into_values().collect())
    }

    /// Digests of every DAT that has rows in the index.
    pub fn indexed_dats(&self) -> BTreeSet<String> {
        self.rows
            .rows()
            .iter()
            .filter(|r| r.key == RowKey::Dat)
            .map(|r| r.value.clone())
            .collect()
    }

    /// Reconcile the index with the DAT files under `dat_root`.
    ///
    /// New DATs are parsed and their roms matched against existing records or
    /// inserted as new ones. DATs that disappeared lose only their tag rows.
    pub fn refresh(&mut self, dat_root: &Path) -> Result<RefreshStats> {
        if !dat_root.exists() {
            return Err(Error::not_found(dat_root));
        }

        let mut stats = RefreshStats::default();
        let mut on_disk: BTreeMap<String, PathBuf> = BTreeMap::new();
        for path in files_under(dat_root)? {
            stats.dats_found += 1;
            match hash_file(&path, 0, HashSelection::SHA1) {
                Ok(hashes) => {
                    on_disk.insert(hashes.sha1.key(), path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to hash DAT");
                    stats.dats_failed += 1;
                }
            }
        }

        let indexed = self.indexed_dats();
        let mut records = self.records()?;

        for (digest, path) in &on_disk {
            if indexed.contains(digest) {
                continue;
            }
            let items = match self.source.load(path) {
                Ok(items) => items,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read DAT");
                    stats.dats_failed += 1;
                    continue;
                }
            };
            stats.dats_added += 1;
            debug!(path = %path.display(), items = items.len(), "indexing DAT");

            for item in items {
                let ItemKind::Rom(dump) = &item.kind else {
                    continue;
                };
                let hashes = &dump.hashes;
                match records.iter_mut().find(|r| r.matches_hashes(hashes)) {
                    Some(record) => {
                        if record.dats.insert(digest.clone()) {
                            self.rows
                                .insert(&[Row::new(record.id, RowKey::Dat, digest.clone())])?;
                            stats.records_tagged += 1;
                        }
                    }
                    None => {
                        let record = HashRecord {
                            id: self.rows.next_id(),
                            size: hashes.size,
                            crc: hashes.crc,
                            md5: hashes.md5,
                            sha1: hashes.sha1,
                            dats: BTreeSet::from([digest.clone()]),
                            exists: false,
                        };
                        self.rows.insert(&record.to_rows())?;
                        records.push(record);
                        stats.records_inserted += 1;
                    }
                }
            }
        }

        let stale: BTreeSet<String> = indexed
            .into_iter()
            .filter(|digest| !on_disk.contains_key(digest))
            .collect();
        if !stale.is_empty() {
            self.rows
                .delete_where(&|r| r.key == RowKey::Dat && stale.contains(&r.value))?;
            stats.dats_removed = stale.len();
        }

        info!(
            found = stats.dats_found,
            added = stats.dats_added,
            removed = stats.dats_removed,
            failed = stats.dats_failed,
            inserted = stats.records_inserted,
            tagged = stats.records_tagged,
            "refresh complete"
        );
        Ok(stats)
    }

    /// Records matching the given identity under the wildcard rule.
    pub fn lookup(
        &self,
        size: Option<u64>,
        crc: &Crc,
        md5: &Md5,
        sha1: &Sha1,
    ) -> Result<Vec<HashRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.matches(size, crc, md5, sha1))
            .collect())
    }

    /// Flag every record matching `hashes` as present in a depot.
    pub fn mark_present(&mut self, hashes: &Hashes) -> Result<usize> {
        let mut marked = 0;
        for record in self.records()? {
            if !record.exists && record.matches_hashes(hashes) {
                self.rows.set(record.id, RowKey::Exists, "true")?;
                marked += 1;
            }
        }
        Ok(marked)
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let records = self.records()?;
        Ok(IndexStats {
            records: records.len(),
            dats: self.indexed_dats().len(),
            present: records.iter().filter(|r| r.exists).count(),
        })
    }
}
