//! Machines and the items they own.

use crate::hash::{HashSelection, Hashes, hash_file_or_empty};
use crate::source::ArchiveEntry;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

/// Kind of machine a set describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineType {
    #[default]
    None,
    Bios,
    Device,
    Mechanical,
}

/// A named set (game, system, bios or device) and its links to other sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rom_of: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_of: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    #[serde(default)]
    pub machine_type: MachineType,
}

impl Machine {
    /// A machine with only a name and matching description.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            ..Self::default()
        }
    }

    pub fn clone_of(&self) -> Option<&str> {
        non_empty(self.clone_of.as_deref())
    }

    pub fn rom_of(&self) -> Option<&str> {
        non_empty(self.rom_of.as_deref())
    }

    pub fn is_bios_or_device(&self) -> bool {
        matches!(self.machine_type, MachineType::Bios | MachineType::Device)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}

/// Dump status of a rom or disk.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    None,
    Good,
    BadDump,
    Nodump,
    Verified,
}

/// Payload shared by roms and disks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump {
    #[serde(default)]
    pub hashes: Hashes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_tag: Option<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl Dump {
    pub fn new(hashes: Hashes) -> Self {
        Self {
            hashes,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub default: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiosSet {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<bool>,
}

/// Kind-specific data of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemKind {
    Rom(Dump),
    Disk(Dump),
    Archive,
    Release(Release),
    Sample,
    BiosSet(BiosSet),
    Blank,
}

/// Payload-free discriminant of `ItemKind`, in bucket sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemType {
    Rom,
    Disk,
    Sample,
    Release,
    BiosSet,
    Archive,
    Blank,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Rom => "rom",
            ItemType::Disk => "disk",
            ItemType::Sample => "sample",
            ItemType::Release => "release",
            ItemType::BiosSet => "biosset",
            ItemType::Archive => "archive",
            ItemType::Blank => "blank",
        }
    }
}

/// How a collapsed duplicate matched the surviving item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Every digest known on either side was known and equal on both.
    Full,
    /// Only the digests known on both sides were compared.
    Partial,
}

/// Where a collapsed duplicate came from relative to the survivor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchScope {
    /// Same system and source.
    Internal,
    /// A different merged-in source.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duplicate {
    pub kind: MatchKind,
    pub scope: MatchScope,
}

/// Identifies which loaded DAT an item came from.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Source {
    pub system_id: u32,
    pub source_id: u32,
}

/// A single content unit belonging to a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub machine: Arc<Machine>,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<Duplicate>,
    pub kind: ItemKind,
}

impl Item {
    pub fn new(name: impl Into<String>, machine: Arc<Machine>, kind: ItemKind) -> Self {
        Self {
            name: name.into(),
            machine,
            source: Source::default(),
            duplicate: None,
            kind,
        }
    }

    pub fn rom(name: impl Into<String>, machine: Arc<Machine>, hashes: Hashes) -> Self {
        Self::new(name, machine, ItemKind::Rom(Dump::new(hashes)))
    }

    pub fn disk(name: impl Into<String>, machine: Arc<Machine>, hashes: Hashes) -> Self {
        Self::new(name, machine, ItemKind::Disk(Dump::new(hashes)))
    }

    /// The empty rom returned when a file cannot be identified.
    pub fn sentinel() -> Self {
        Self::rom("", Arc::new(Machine::default()), Hashes::empty())
    }

    pub fn is_sentinel(&self) -> bool {
        match &self.kind {
            ItemKind::Rom(dump) => self.name.is_empty() && dump.hashes.is_empty(),
            _ => false,
        }
    }

    /// Identify a file on disk as a rom named after the file.
    ///
    /// Returns the sentinel if the file is missing or unreadable.
    pub fn from_file(path: &Path, want: HashSelection) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_fingerprint(name, hash_file_or_empty(path, 0, want))
    }

    /// Wrap a fingerprint as a rom owned by a machine named after the file stem.
    /// An empty fingerprint yields the sentinel.
    pub fn from_fingerprint(name: impl Into<String>, hashes: Hashes) -> Self {
        if hashes.is_empty() {
            return Self::sentinel();
        }
        let name = name.into();
        let machine = Path::new(&name)
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::rom(name, Arc::new(Machine::named(machine)), hashes)
    }

    /// Build a rom from an archive entry's name, size and CRC.
    pub fn from_archive_entry(entry: &ArchiveEntry, machine: Arc<Machine>) -> Self {
        let hashes = Hashes {
            size: Some(entry.size),
            crc: entry.crc,
            ..Hashes::default()
        };
        Self::rom(entry.name.clone(), machine, hashes)
    }

    pub fn item_type(&self) -> ItemType {
        match self.kind {
            ItemKind::Rom(_) => ItemType::Rom,
            ItemKind::Disk(_) => ItemType::Disk,
            ItemKind::Archive => ItemType::Archive,
            ItemKind::Release(_) => ItemType::Release,
            ItemKind::Sample => ItemType::Sample,
            ItemKind::BiosSet(_) => ItemType::BiosSet,
            ItemKind::Blank => ItemType::Blank,
        }
    }

    pub fn dump(&self) -> Option<&Dump> {
        match &self.kind {
            ItemKind::Rom(dump) | ItemKind::Disk(dump) => Some(dump),
            _ => None,
        }
    }

    pub fn dump_mut(&mut self) -> Option<&mut Dump> {
        match &mut self.kind {
            ItemKind::Rom(dump) | ItemKind::Disk(dump) => Some(dump),
            _ => None,
        }
    }

    pub fn hashes(&self) -> Option<&Hashes> {
        self.dump().map(|d| &d.hashes)
    }

    pub fn size(&self) -> Option<u64> {
        self.hashes().and_then(|h| h.size)
    }

    pub fn merge_tag(&self) -> Option<&str> {
        self.dump().and_then(|d| non_empty(d.merge_tag.as_deref()))
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, ItemKind::Disk(_))
    }

    pub fn machine_name(&self) -> &str {
        &self.machine.name
    }

    /// A copy of this item owned by `machine`.
    pub fn reparented(&self, machine: &Arc<Machine>) -> Self {
        let mut item = self.clone();
        item.machine = Arc::clone(machine);
        item
    }

    /// Overwrite the rom-of link on this item's machine record.
    pub fn set_rom_of(&mut self, rom_of: Option<String>) {
        if self.machine.rom_of != rom_of {
            Arc::make_mut(&mut self.machine).rom_of = rom_of;
        }
    }

    /// Drop clone-of and rom-of from this item's machine record.
    pub fn clear_links(&mut self) {
        if self.machine.clone_of.is_some() || self.machine.rom_of.is_some() {
            let machine = Arc::make_mut(&mut self.machine);
            machine.clone_of = None;
            machine.rom_of = None;
        }
    }

    /// Duplicate test used for merging, presence checks and removal.
    pub fn matches(&self, other: &Item) -> bool {
        match (&self.kind, &other.kind) {
            (ItemKind::Rom(a), ItemKind::Rom(b)) | (ItemKind::Disk(a), ItemKind::Disk(b)) => {
                let both_nodump = a.status == ItemStatus::Nodump
                    && b.status == ItemStatus::Nodump
                    && self.name == other.name
                    && !a.hashes.has_any_digest()
                    && !b.hashes.has_any_digest();
                both_nodump || a.hashes.matches(&b.hashes)
            }
            (ItemKind::Archive, ItemKind::Archive) | (ItemKind::Sample, ItemKind::Sample) => {
                self.name == other.name
            }
            (ItemKind::Release(a), ItemKind::Release(b)) => self.name == other.name && a == b,
            (ItemKind::BiosSet(a), ItemKind::BiosSet(b)) => self.name == other.name && a == b,
            (ItemKind::Blank, ItemKind::Blank) => self.machine.name == other.machine.name,
            _ => false,
        }
    }

    /// Classify a match against `other`. Only meaningful when `matches` holds.
    pub fn duplicate_of(&self, other: &Item) -> Duplicate {
        let kind = match (self.hashes(), other.hashes()) {
            (Some(a), Some(b)) if !a.matches_fully(b) => MatchKind::Partial,
            _ => MatchKind::Full,
        };
        let scope = if self.source == other.source {
            MatchScope::Internal
        } else {
            MatchScope::External
        };
        Duplicate { kind, scope }
    }

    /// Deterministic in-bucket order: kind, case-insensitive name, size, digests,
    /// then the remaining identifying fields.
    pub fn cmp_for_bucket(&self, other: &Item) -> Ordering {
        self.item_type()
            .cmp(&other.item_type())
            .then_with(|| cmp_ignore_case(&self.name, &other.name))
            .then_with(|| self.size().cmp(&other.size()))
            .then_with(|| match (self.hashes(), other.hashes()) {
                (Some(a), Some(b)) => a.cmp_digests(b),
                _ => Ordering::Equal,
            })
            .then_with(|| self.machine.name.cmp(&other.machine.name))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.status().cmp(&other.status()))
            .then_with(|| self.merge_tag().cmp(&other.merge_tag()))
    }

    fn status(&self) -> Option<ItemStatus> {
        self.dump().map(|d| d.status)
    }
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{Crc, Md5, Sha1};
    use crate::hash::hash_bytes;
    use std::fs;
    use tempfile::TempDir;

    fn machine(name: &str) -> Arc<Machine> {
        Arc::new(Machine::named(name))
    }

    fn rom(name: &str, data: &[u8]) -> Item {
        Item::rom(name, machine("game"), hash_bytes(data, HashSelection::STANDARD))
    }

    #[test]
    fn test_rom_matches_same_content_different_name() {
        let a = rom("a.bin", b"data");
        let b = rom("b.bin", b"data");
        assert!(a.matches(&b));
        assert!(b.matches(&a));
    }

    #[test]
    fn test_rom_partial_match_on_shared_digest() {
        let full = rom("a.bin", b"data");
        let mut crc_only = full.clone();
        if let Some(dump) = crc_only.dump_mut() {
            dump.hashes.md5 = Md5::Unknown;
            dump.hashes.sha1 = Sha1::Unknown;
        }
        assert!(full.matches(&crc_only));
        assert_eq!(full.duplicate_of(&crc_only).kind, MatchKind::Partial);
        assert_eq!(full.duplicate_of(&full).kind, MatchKind::Full);
    }

    #[test]
    fn test_rom_no_shared_digest_is_not_match() {
        let a = Item::rom(
            "a.bin",
            machine("game"),
            Hashes {
                size: Some(4),
                crc: Crc::from_hex("11111111").unwrap(),
                ..Hashes::default()
            },
        );
        let b = Item::rom(
            "a.bin",
            machine("game"),
            Hashes {
                size: Some(4),
                md5: Md5::from_bytes([1u8; 16]),
                ..Hashes::default()
            },
        );
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_zero_only_matches_zero() {
        let zero = Item::rom(
            "a.bin",
            machine("game"),
            Hashes {
                size: Some(0),
                crc: Crc::Zero,
                ..Hashes::default()
            },
        );
        let value = Item::rom(
            "a.bin",
            machine("game"),
            Hashes {
                size: Some(0),
                crc: Crc::from_hex("00000001").unwrap(),
                ..Hashes::default()
            },
        );
        assert!(zero.matches(&zero.clone()));
        assert!(!zero.matches(&value));
    }

    #[test]
    fn test_nodump_matches_by_name() {
        let mut a = Item::rom("missing.bin", machine("game"), Hashes::default());
        if let Some(dump) = a.dump_mut() {
            dump.status = ItemStatus::Nodump;
        }
        let b = a.clone();
        let mut c = a.clone();
        c.name = "other.bin".to_string();

        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_kinds_never_cross_match() {
        let rom = rom("a.bin", b"data");
        let mut disk = rom.clone();
        disk.kind = ItemKind::Disk(rom.dump().cloned().unwrap());
        assert!(!rom.matches(&disk));

        let sample = Item::new("a.bin", machine("game"), ItemKind::Sample);
        assert!(!rom.matches(&sample));
    }

    #[test]
    fn test_named_kinds_match_by_name() {
        let a = Item::new("boot", machine("game"), ItemKind::Archive);
        let b = Item::new("boot", machine("other"), ItemKind::Archive);
        assert!(a.matches(&b));

        let r1 = Item::new("eu", machine("g"), ItemKind::Release(Release::default()));
        let mut r2 = r1.clone();
        if let ItemKind::Release(release) = &mut r2.kind {
            release.region = "Europe".to_string();
        }
        assert!(!r1.matches(&r2));

        let blank_a = Item::new("", machine("g"), ItemKind::Blank);
        let blank_b = Item::new("x", machine("g"), ItemKind::Blank);
        assert!(blank_a.matches(&blank_b));
    }

    #[test]
    fn test_scope_internal_external() {
        let a = rom("a.bin", b"data");
        let mut b = a.clone();
        assert_eq!(a.duplicate_of(&b).scope, MatchScope::Internal);
        b.source.source_id = 1;
        assert_eq!(a.duplicate_of(&b).scope, MatchScope::External);
    }

    #[test]
    fn test_reparented_shares_no_links_with_original() {
        let mut child_machine = Machine::named("child");
        child_machine.clone_of = Some("parent".to_string());
        let child_machine = Arc::new(child_machine);

        let item = rom("a.bin", b"data");
        let mut moved = item.reparented(&child_machine);
        assert_eq!(moved.machine_name(), "child");
        assert_eq!(item.machine_name(), "game");

        moved.clear_links();
        assert_eq!(moved.machine.clone_of, None);
        assert_eq!(child_machine.clone_of.as_deref(), Some("parent"));
    }

    #[test]
    fn test_bucket_order() {
        let disk = Item::disk("A", machine("g"), Hashes::default());
        let upper = rom("B.bin", b"x");
        let lower = rom("a.bin", b"y");
        let mut items = vec![disk.clone(), upper.clone(), lower.clone()];
        items.sort_by(Item::cmp_for_bucket);
        assert_eq!(items, vec![lower, upper, disk]);
    }

    #[test]
    fn test_bucket_order_breaks_ties_on_source_and_status() {
        let base = rom("a.bin", b"same");
        let mut other_source = base.clone();
        other_source.source = Source {
            system_id: 0,
            source_id: 2,
        };
        let mut baddump = base.clone();
        if let Some(dump) = baddump.dump_mut() {
            dump.status = ItemStatus::BadDump;
        }

        for order in [
            vec![other_source.clone(), baddump.clone(), base.clone()],
            vec![baddump.clone(), base.clone(), other_source.clone()],
        ] {
            let mut items = order;
            items.sort_by(Item::cmp_for_bucket);
            assert_eq!(items, vec![base.clone(), baddump.clone(), other_source.clone()]);
        }
    }

    #[test]
    fn test_from_file_and_sentinel() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("font.bin");
        fs::write(&path, b"glyphs").unwrap();

        let item = Item::from_file(&path, HashSelection::STANDARD);
        assert_eq!(item.name, "font.bin");
        assert_eq!(item.machine_name(), "font");
        assert_eq!(item.size(), Some(6));
        assert!(!item.is_sentinel());

        let missing = Item::from_file(&temp_dir.path().join("nope"), HashSelection::STANDARD);
        assert!(missing.is_sentinel());

        let blank = Item::new("", machine("g"), ItemKind::Blank);
        assert!(!blank.is_sentinel());
    }

    #[test]
    fn test_serde_roundtrip_json() {
        let mut item = rom("a.bin", b"data");
        if let Some(dump) = item.dump_mut() {
            dump.merge_tag = Some("a.bin".to_string());
        }
        let json = serde_json::to_string(&item).unwrap();
        let back: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    use proptest::prelude::*;

    fn arb_rom() -> impl Strategy<Value = Item> {
        (
            prop::option::of(0u64..4),
            prop::option::of(0u8..3),
            prop::option::of(0u8..3),
            prop::bool::ANY,
        )
            .prop_map(|(size, crc, md5, nodump)| {
                let mut item = Item::rom(
                    "r.bin",
                    Arc::new(Machine::named("m")),
                    Hashes {
                        size,
                        crc: crc.map(|b| Crc::from_bytes([b; 4])).unwrap_or_default(),
                        md5: md5.map(|b| Md5::from_bytes([b; 16])).unwrap_or_default(),
                        ..Hashes::default()
                    },
                );
                if nodump && let Some(dump) = item.dump_mut() {
                    dump.status = ItemStatus::Nodump;
                }
                item
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Rom equality is symmetric.
        #[test]
        fn prop_rom_matches_symmetric(a in arb_rom(), b in arb_rom()) {
            prop_assert_eq!(a.matches(&b), b.matches(&a));
        }
    }
}
