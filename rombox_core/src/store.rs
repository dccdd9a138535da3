//! Keyed multimap of items with bucketing, sorting and duplicate collapsing.

use crate::checksum::{Checksum, Crc};
use crate::item::{Duplicate, Item, ItemKind, MatchKind, MatchScope};
use dashmap::DashMap;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

/// Machine name used when an item's machine has a blank name.
pub const DEFAULT_MACHINE: &str = "Default";

/// Field a bucket map is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKey {
    Crc,
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    MachineName,
}

impl BucketKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "crc" => Some(BucketKey::Crc),
            "md5" => Some(BucketKey::Md5),
            "sha1" => Some(BucketKey::Sha1),
            "sha256" => Some(BucketKey::Sha256),
            "sha384" => Some(BucketKey::Sha384),
            "sha512" => Some(BucketKey::Sha512),
            "machine" | "game" => Some(BucketKey::MachineName),
            _ => None,
        }
    }
}

/// When equal items inside a bucket are collapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DedupeMode {
    #[default]
    None,
    /// Only when the map is keyed by machine name.
    Game,
    Full,
}

/// Options that shape the machine-name key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct KeyOptions {
    key: BucketKey,
    normalize_case: bool,
    preserve_source_prefix: bool,
}

/// Concurrent bucket map of items.
///
/// Buckets live in a sharded map so regrouping can run on the worker pool with
/// writes serialised per destination key only.
pub struct ItemStore {
    buckets: DashMap<String, Vec<Item>>,
    bucketed_by: Option<KeyOptions>,
    pool: Arc<rayon::ThreadPool>,
}

impl ItemStore {
    /// Create an empty store that runs bucketing on `pool`.
    pub fn new(pool: Arc<rayon::ThreadPool>) -> Self {
        Self {
            buckets: DashMap::new(),
            bucketed_by: None,
            pool,
        }
    }

    /// Load raw items keyed by their machine name.
    pub fn from_items(pool: Arc<rayon::ThreadPool>, items: Vec<Item>) -> Self {
        let store = Self::new(pool);
        for item in items {
            store.add(machine_key(&item.machine.name), item);
        }
        store
    }

    /// Append an item to the bucket at `key`.
    pub fn add(&self, key: impl Into<String>, item: Item) {
        self.buckets.entry(key.into()).or_default().push(item);
    }

    /// Append several items to the bucket at `key`.
    pub fn add_range(&self, key: impl Into<String>, items: impl IntoIterator<Item = Item>) {
        self.buckets.entry(key.into()).or_default().extend(items);
    }

    /// Replace the bucket at `key`.
    pub fn insert(&self, key: impl Into<String>, items: Vec<Item>) {
        self.buckets.insert(key.into(), items);
    }

    /// Remove the bucket at `key`. Absent keys are a no-op.
    pub fn remove(&self, key: &str) -> Option<Vec<Item>> {
        self.buckets.remove(key).map(|(_, items)| items)
    }

    /// Remove the first item in `key` equal to `item`.
    pub fn remove_item(&self, key: &str, item: &Item) -> bool {
        match self.buckets.get_mut(key) {
            Some(mut bucket) => match bucket.iter().position(|i| i.matches(item)) {
                Some(index) => {
                    bucket.remove(index);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Clone of the bucket at `key`.
    pub fn get(&self, key: &str) -> Option<Vec<Item>> {
        self.buckets.get(key).map(|bucket| bucket.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// All keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of items across all buckets.
    pub fn item_count(&self) -> usize {
        self.buckets.iter().map(|e| e.value().len()).sum()
    }

    /// Key the map was last bucketed by, if any.
    pub fn bucketed_by(&self) -> Option<BucketKey> {
        self.bucketed_by.map(|o| o.key)
    }

    /// Forget the current keying so the next `bucket_by` regroups.
    pub(crate) fn reset_bucketing(&mut self) {
        self.bucketed_by = None;
    }

    /// Every bucket in key order.
    pub fn buckets(&self) -> Vec<(String, Vec<Item>)> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(&key).map(|items| (key, items)))
            .collect()
    }

    /// Flatten all buckets in key order.
    pub fn into_items(self) -> Vec<Item> {
        let mut buckets: Vec<(String, Vec<Item>)> = self.buckets.into_iter().collect();
        buckets.sort_by(|a, b| a.0.cmp(&b.0));
        buckets.into_iter().flat_map(|(_, items)| items).collect()
    }

    /// Regroup under `key`, then sort every bucket and collapse duplicates per
    /// `dedupe`.
    ///
    /// Regrouping is skipped when the map is already keyed the same way, which keeps
    /// repeated calls idempotent.
    pub fn bucket_by(
        &mut self,
        key: BucketKey,
        dedupe: DedupeMode,
        normalize_case: bool,
        preserve_source_prefix: bool,
    ) {
        let options = KeyOptions {
            key,
            normalize_case,
            preserve_source_prefix,
        };

        if self.bucketed_by != Some(options) {
            debug!(?key, buckets = self.buckets.len(), "regrouping items");
            let old = std::mem::take(&mut self.buckets);
            let regrouped: DashMap<String, Vec<Item>> = DashMap::new();
            self.pool.install(|| {
                old.into_par_iter().for_each(|(_, items)| {
                    for item in items {
                        regrouped
                            .entry(bucket_key(&item, &options))
                            .or_default()
                            .push(item);
                    }
                });
            });
            self.buckets = regrouped;
            self.bucketed_by = Some(options);
        }

        let collapse = match dedupe {
            DedupeMode::None => false,
            DedupeMode::Game => key == BucketKey::MachineName,
            DedupeMode::Full => true,
        };

        let before = self.item_count();
        let buckets = &mut self.buckets;
        self.pool.install(|| {
            buckets.par_iter_mut().for_each(|mut entry| {
                let bucket = entry.value_mut();
                bucket.sort_by(Item::cmp_for_bucket);
                if collapse {
                    *bucket = collapse_duplicates(std::mem::take(bucket));
                    bucket.sort_by(Item::cmp_for_bucket);
                }
            });
        });

        info!(
            ?key,
            ?dedupe,
            buckets = self.buckets.len(),
            items = self.item_count(),
            collapsed = before - self.item_count(),
            "bucketed items"
        );
    }
}

/// Key of a machine name as used by the machine-name bucket map.
pub fn machine_key(name: &str) -> String {
    let name = if name.trim().is_empty() {
        DEFAULT_MACHINE
    } else {
        name
    };
    html_encode(&name.to_lowercase())
}

fn bucket_key(item: &Item, options: &KeyOptions) -> String {
    match options.key {
        BucketKey::Crc => match &item.kind {
            ItemKind::Rom(dump) => dump.hashes.crc.key(),
            _ => Crc::zero_hex(),
        },
        BucketKey::Md5 => hash_key(item, |h| h.md5),
        BucketKey::Sha1 => hash_key(item, |h| h.sha1),
        BucketKey::Sha256 => hash_key(item, |h| h.sha256),
        BucketKey::Sha384 => hash_key(item, |h| h.sha384),
        BucketKey::Sha512 => hash_key(item, |h| h.sha512),
        BucketKey::MachineName => {
            let mut name = if item.machine.name.trim().is_empty() {
                DEFAULT_MACHINE.to_string()
            } else {
                item.machine.name.clone()
            };
            if options.preserve_source_prefix {
                name = format!(
                    "{:010}-{:010}-{}",
                    item.source.system_id, item.source.source_id, name
                );
            }
            if options.normalize_case {
                name = name.to_lowercase();
            }
            html_encode(&name)
        }
    }
}

fn hash_key<const N: usize>(
    item: &Item,
    field: impl Fn(&crate::hash::Hashes) -> Checksum<N>,
) -> String {
    match item.hashes() {
        Some(hashes) => field(hashes).key(),
        None => Checksum::<N>::zero_hex(),
    }
}

fn html_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Collapse equal items until no two survivors match.
///
/// Absorbing a duplicate can fill in digests on the survivor, which may make it
/// equal to another survivor, so passes repeat until nothing changes.
fn collapse_duplicates(mut items: Vec<Item>) -> Vec<Item> {
    loop {
        let before = items.len();
        let mut survivors: Vec<Item> = Vec::with_capacity(before);
        for item in items {
            match survivors.iter_mut().find(|s| s.matches(&item)) {
                Some(survivor) => absorb(survivor, &item),
                None => survivors.push(item),
            }
        }
        items = survivors;
        if items.len() == before {
            return items;
        }
    }
}

fn absorb(survivor: &mut Item, duplicate: &Item) {
    let found = survivor.duplicate_of(duplicate);
    let merged = match (survivor.duplicate, duplicate.duplicate) {
        (None, None) => found,
        (a, b) => {
            let all = [Some(found), a, b];
            let all = all.iter().flatten();
            Duplicate {
                kind: if all.clone().any(|d| d.kind == MatchKind::Partial) {
                    MatchKind::Partial
                } else {
                    MatchKind::Full
                },
                scope: if all.clone().any(|d| d.scope == MatchScope::External) {
                    MatchScope::External
                } else {
                    MatchScope::Internal
                },
            }
        }
    };
    survivor.duplicate = Some(merged);
    if let (Some(dump), Some(hashes)) = (survivor.dump_mut(), duplicate.hashes()) {
        dump.hashes.fill_missing(hashes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{Md5, Sha1};
    use crate::hash::{HashSelection, Hashes, hash_bytes};
    use crate::item::Machine;

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        )
    }

    fn rom(machine: &str, name: &str, data: &[u8]) -> Item {
        Item::rom(
            name,
            Arc::new(Machine::named(machine)),
            hash_bytes(data, HashSelection::STANDARD),
        )
    }

    #[test]
    fn test_add_remove_get() {
        let store = ItemStore::new(pool());
        store.add("a", rom("a", "1.bin", b"1"));
        store.add_range("a", vec![rom("a", "2.bin", b"2")]);
        assert_eq!(store.item_count(), 2);
        assert_eq!(store.get("a").unwrap().len(), 2);

        assert!(store.remove("missing").is_none());
        assert!(store.remove_item("a", &rom("x", "other-name", b"1")));
        assert!(!store.remove_item("a", &rom("x", "other-name", b"1")));
        assert_eq!(store.get("a").unwrap().len(), 1);

        store.remove("a");
        assert!(store.is_empty());
    }

    #[test]
    fn test_machine_key_normalisation() {
        assert_eq!(machine_key("Pac&Man"), "pac&amp;man");
        assert_eq!(machine_key(""), "default");
        assert_eq!(machine_key("  "), "default");
    }

    #[test]
    fn test_bucket_by_machine_with_prefix() {
        let mut item = rom("Game", "a.bin", b"a");
        item.source.system_id = 3;
        item.source.source_id = 12;

        let mut store = ItemStore::new(pool());
        store.add("raw", item);
        store.bucket_by(BucketKey::MachineName, DedupeMode::None, false, true);
        assert_eq!(store.keys(), vec!["0000000003-0000000012-Game".to_string()]);

        let mut store = ItemStore::new(pool());
        store.add("raw", rom("", "a.bin", b"a"));
        store.bucket_by(BucketKey::MachineName, DedupeMode::None, true, false);
        assert_eq!(store.keys(), vec!["default".to_string()]);
    }

    #[test]
    fn test_bucket_by_crc_sentinels() {
        let mut store = ItemStore::new(pool());
        let mut disk = Item::disk("hd", Arc::new(Machine::named("g")), Hashes::default());
        if let Some(dump) = disk.dump_mut() {
            dump.hashes.sha1 = Sha1::from_bytes([9u8; 20]);
        }
        let no_crc = Item::rom("x.bin", Arc::new(Machine::named("g")), Hashes::default());
        store.add("g", disk);
        store.add("g", no_crc);
        store.add("g", rom("g", "a.bin", b"hello world"));

        store.bucket_by(BucketKey::Crc, DedupeMode::None, true, false);
        let keys = store.keys();
        assert!(keys.contains(&"00000000".to_string()));
        assert!(keys.contains(&"0d4a1185".to_string()));
        assert!(keys.contains(&String::new()));

        store.bucket_by(BucketKey::Sha1, DedupeMode::None, true, false);
        assert!(store.contains_key(&"09".repeat(20)));
    }

    #[test]
    fn test_full_dedupe_marks_survivor() {
        let mut a = rom("g1", "a.bin", b"same");
        a.source.source_id = 1;
        let b = rom("g2", "b.bin", b"same");
        let c = rom("g3", "c.bin", b"different");

        let mut store = ItemStore::new(pool());
        store.add_range("raw", vec![a, b, c]);
        store.bucket_by(BucketKey::Crc, DedupeMode::Full, true, false);
        assert_eq!(store.item_count(), 2);

        let crc = hash_bytes(b"same", HashSelection::CRC).crc.key();
        let bucket = store.get(&crc).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(
            bucket[0].duplicate,
            Some(Duplicate {
                kind: MatchKind::Full,
                scope: MatchScope::External
            })
        );
    }

    #[test]
    fn test_game_dedupe_only_by_machine() {
        let mut store = ItemStore::new(pool());
        store.add_range("raw", vec![rom("g1", "a.bin", b"x"), rom("g2", "b.bin", b"x")]);
        store.bucket_by(BucketKey::Crc, DedupeMode::Game, true, false);
        assert_eq!(store.item_count(), 2);

        store.bucket_by(BucketKey::MachineName, DedupeMode::Game, true, false);
        assert_eq!(store.item_count(), 2);

        store.add("g1", rom("g1", "copy.bin", b"x"));
        store.bucket_by(BucketKey::MachineName, DedupeMode::Game, true, false);
        assert_eq!(store.get("g1").unwrap().len(), 1);
    }

    #[test]
    fn test_dedupe_backfill_reaches_fixed_point() {
        let machine = Arc::new(Machine::named("g"));
        let crc = Crc::from_bytes([1, 2, 3, 4]);
        let md5 = Md5::from_bytes([5u8; 16]);
        let crc_only = Item::rom(
            "a",
            Arc::clone(&machine),
            Hashes {
                size: Some(1),
                crc,
                ..Hashes::default()
            },
        );
        let md5_only = Item::rom(
            "b",
            Arc::clone(&machine),
            Hashes {
                size: Some(1),
                md5,
                ..Hashes::default()
            },
        );
        let both = Item::rom(
            "c",
            Arc::clone(&machine),
            Hashes {
                size: Some(1),
                crc,
                md5,
                ..Hashes::default()
            },
        );

        let mut store = ItemStore::new(pool());
        store.add_range("g", vec![crc_only, md5_only, both]);
        store.bucket_by(BucketKey::MachineName, DedupeMode::Full, true, false);
        assert_eq!(store.item_count(), 1);
    }

    #[test]
    fn test_sorted_buckets() {
        let mut store = ItemStore::new(pool());
        store.add_range(
            "raw",
            vec![rom("g", "b.bin", b"2"), rom("g", "a.bin", b"1"), rom("g", "A.bin", b"1")],
        );
        store.bucket_by(BucketKey::MachineName, DedupeMode::None, true, false);
        let names: Vec<String> = store.get("g").unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["A.bin", "a.bin", "b.bin"]);
    }

    use proptest::prelude::*;

    fn arb_items() -> impl Strategy<Value = Vec<Item>> {
        prop::collection::vec(
            (0u8..4, 0u8..3, prop::option::of(0u8..3), prop::option::of(0u8..3)),
            0..24,
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (machine, size, crc, md5))| {
                    let mut item = Item::rom(
                        format!("r{}", i),
                        Arc::new(Machine::named(format!("m{}", machine))),
                        Hashes {
                            size: Some(size as u64),
                            crc: crc.map(|b| Crc::from_bytes([b + 1; 4])).unwrap_or_default(),
                            md5: md5.map(|b| Md5::from_bytes([b + 1; 16])).unwrap_or_default(),
                            ..Hashes::default()
                        },
                    );
                    item.source.source_id = (i % 2) as u32;
                    item
                })
                .collect()
        })
    }

    fn snapshot(store: &ItemStore) -> Vec<(String, Vec<Item>)> {
        store.buckets()
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Bucketing twice with the same arguments changes nothing.
        #[test]
        fn prop_bucket_by_idempotent(items in arb_items(), full in any::<bool>()) {
            let dedupe = if full { DedupeMode::Full } else { DedupeMode::None };
            let mut store = ItemStore::new(pool());
            store.add_range("raw", items);
            store.bucket_by(BucketKey::Crc, dedupe, true, false);
            let first = snapshot(&store);
            store.bucket_by(BucketKey::Crc, dedupe, true, false);
            prop_assert_eq!(first, snapshot(&store));
        }

        /// After full dedupe no bucket holds two equal items.
        #[test]
        fn prop_full_dedupe_leaves_no_equal_pair(items in arb_items()) {
            let mut store = ItemStore::new(pool());
            store.add_range("raw", items);
            store.bucket_by(BucketKey::MachineName, DedupeMode::Full, true, false);
            for (_, bucket) in store.buckets() {
                for (i, a) in bucket.iter().enumerate() {
                    for b in &bucket[i + 1..] {
                        prop_assert!(!a.matches(b));
                    }
                }
            }
        }
    }
}
