//! Collaborator seams: DAT parsing and archive listing.
//!
//! DAT grammars and archive formats live outside this crate. Callers plug in an
//! implementation of these traits; the core only consumes what they produce.

use crate::checksum::Crc;
use crate::error::{Error, Result};
use crate::item::Item;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Produces the items (and through them, the machines) described by a DAT file.
pub trait DatSource: Send + Sync {
    fn load(&self, path: &Path) -> Result<Vec<Item>>;
}

/// One file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub crc: Crc,
}

/// Lists the entries of an archive without extracting them.
///
/// An empty list means the file is not an archive this reader understands.
pub trait ArchiveReader: Send + Sync {
    fn entries(&self, path: &Path) -> Result<Vec<ArchiveEntry>>;
}

/// DAT source reading a JSON array of items in this crate's serde model.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDatSource;

impl DatSource for JsonDatSource {
    fn load(&self, path: &Path) -> Result<Vec<Item>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(path));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| Error::dat_source(path, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashSelection, hash_bytes};
    use crate::item::Machine;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_json_dat_source_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("set.json");
        let items = vec![Item::rom(
            "a.bin",
            Arc::new(Machine::named("game")),
            hash_bytes(b"a", HashSelection::STANDARD),
        )];
        fs::write(&path, serde_json::to_string(&items).unwrap()).unwrap();

        let loaded = JsonDatSource.load(&path).unwrap();
        assert_eq!(loaded, items);
    }

    #[test]
    fn test_json_dat_source_errors() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.json");
        assert!(matches!(
            JsonDatSource.load(&missing),
            Err(Error::NotFound { .. })
        ));

        let bad = temp_dir.path().join("bad.json");
        fs::write(&bad, "not json").unwrap();
        assert!(matches!(
            JsonDatSource.load(&bad),
            Err(Error::DatSource { .. })
        ));
    }
}
