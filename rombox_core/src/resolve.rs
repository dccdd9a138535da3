//! Parent/clone/bios/device set resolution.
//!
//! Rewrites a machine-keyed item store into one of five layouts. Every pass walks a
//! snapshot of the machine keys, follows a single link per machine and completes
//! before the next pass starts. Links are never followed transitively.

use crate::item::{Item, Machine};
use crate::store::{BucketKey, DedupeMode, ItemStore, machine_key};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Target on-disk layout of sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// Each set also carries the items of the devices it references.
    DeviceNonMerged,
    /// Each set carries device, parent and bios items.
    FullyNonMerged,
    /// Clones carry their parent's items but not the bios items.
    NonMerged,
    /// Clones are folded into their parent set.
    Merged,
    /// Clones carry only what differs from their parent.
    Split,
}

impl Topology {
    pub const ALL: [Topology; 5] = [
        Topology::DeviceNonMerged,
        Topology::FullyNonMerged,
        Topology::NonMerged,
        Topology::Merged,
        Topology::Split,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::DeviceNonMerged => "device-non-merged",
            Topology::FullyNonMerged => "fully-non-merged",
            Topology::NonMerged => "non-merged",
            Topology::Merged => "merged",
            Topology::Split => "split",
        }
    }

    /// Passes run for this layout, in order.
    pub fn passes(&self) -> &'static [Pass] {
        match self {
            Topology::DeviceNonMerged => &[Pass::AddRomsFromDevices, Pass::RemoveTagsFromChild],
            Topology::FullyNonMerged => &[
                Pass::AddRomsFromDevices,
                Pass::AddRomsFromParent,
                Pass::AddRomsFromBios,
                Pass::RemoveTagsFromChild,
            ],
            Topology::NonMerged => &[
                Pass::AddRomsFromParent,
                Pass::RemoveBiosRomsFromChild,
                Pass::RemoveTagsFromChild,
            ],
            Topology::Merged => &[
                Pass::AddRomsFromChildren,
                Pass::RemoveBiosRomsFromChild,
                Pass::RemoveTagsFromChild,
            ],
            Topology::Split => &[
                Pass::RemoveRomsFromChild,
                Pass::RemoveBiosRomsFromChild,
                Pass::RemoveTagsFromChild,
            ],
        }
    }
}

/// A single rewrite over the whole machine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    AddRomsFromDevices,
    AddRomsFromParent,
    AddRomsFromBios,
    AddRomsFromChildren,
    RemoveRomsFromChild,
    RemoveBiosRomsFromChild,
    RemoveTagsFromChild,
    RemoveBiosAndDeviceSets,
}

/// What a resolution run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub topology: Topology,
    pub passes: Vec<Pass>,
    pub cancelled: bool,
}

/// Applies a topology to an item store.
#[derive(Debug, Clone)]
pub struct SetResolver {
    topology: Topology,
    dedupe: DedupeMode,
    remove_bios_and_devices: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl SetResolver {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            dedupe: DedupeMode::None,
            remove_bios_and_devices: false,
            cancel: None,
        }
    }

    /// Dedupe mode used when bucketing by machine before the passes run.
    pub fn dedupe(mut self, dedupe: DedupeMode) -> Self {
        self.dedupe = dedupe;
        self
    }

    /// Drop bios and device sets once the layout passes are done.
    pub fn remove_bios_and_devices(mut self, remove: bool) -> Self {
        self.remove_bios_and_devices = remove;
        self
    }

    /// Flag checked between passes; once set, no further pass starts.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Bucket `store` by machine name and run every pass of the topology.
    pub fn resolve(&self, store: &mut ItemStore) -> Resolution {
        info!(topology = self.topology.as_str(), "resolving sets");
        store.bucket_by(BucketKey::MachineName, self.dedupe, true, false);

        let mut passes: Vec<Pass> = self.topology.passes().to_vec();
        if self.remove_bios_and_devices {
            passes.push(Pass::RemoveBiosAndDeviceSets);
        }

        let mut resolution = Resolution {
            topology: self.topology,
            passes: Vec::with_capacity(passes.len()),
            cancelled: false,
        };
        for pass in passes {
            if self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                info!(?pass, "resolution cancelled");
                resolution.cancelled = true;
                break;
            }
            run_pass(store, pass);
            info!(?pass, machines = store.len(), items = store.item_count(), "pass complete");
            resolution.passes.push(pass);
        }

        // Items moved between sets no longer sit under their derived keys.
        store.reset_bucketing();
        resolution
    }
}

/// Run one pass against a machine-keyed store.
pub fn run_pass(store: &ItemStore, pass: Pass) {
    match pass {
        Pass::AddRomsFromDevices => add_roms_from_devices(store),
        Pass::AddRomsFromParent => add_roms_from_parent(store),
        Pass::AddRomsFromBios => add_roms_from_bios(store),
        Pass::AddRomsFromChildren => add_roms_from_children(store),
        Pass::RemoveRomsFromChild => remove_roms_from_child(store),
        Pass::RemoveBiosRomsFromChild => remove_bios_roms_from_child(store),
        Pass::RemoveTagsFromChild => remove_tags_from_child(store),
        Pass::RemoveBiosAndDeviceSets => remove_bios_and_device_sets(store),
    }
}

/// Linked machine key for `game`, read from its first item. Self-links are ignored.
fn linked_key(
    game: &str,
    items: &[Item],
    link: impl Fn(&Machine) -> Option<&str>,
) -> Option<String> {
    let name = link(&items.first()?.machine)?;
    let key = machine_key(name);
    (key != game).then_some(key)
}

/// Non-empty bucket at `key`.
fn non_empty(store: &ItemStore, key: &str) -> Option<Vec<Item>> {
    store.get(key).filter(|items| !items.is_empty())
}

/// Copy every item of `from` into `items` unless an item with the same name or an
/// equal item is already there. Copies are owned by the first item's machine.
fn copy_missing(items: &mut Vec<Item>, from: &[Item]) -> usize {
    let Some(owner) = items.first().map(|i| Arc::clone(&i.machine)) else {
        return 0;
    };
    let mut copied = 0;
    for item in from {
        let present = items
            .iter()
            .any(|i| i.name == item.name || i.matches(item));
        if !present {
            items.push(item.reparented(&owner));
            copied += 1;
        }
    }
    copied
}

/// Remove from `items` the first item equal to each item of `from`.
fn remove_matching(items: &mut Vec<Item>, from: &[Item]) -> usize {
    let mut removed = 0;
    for item in from {
        if let Some(index) = items.iter().position(|i| i.matches(item)) {
            items.remove(index);
            removed += 1;
        }
    }
    removed
}

fn add_roms_from_devices(store: &ItemStore) {
    for game in store.keys() {
        let Some(mut items) = non_empty(store, &game) else {
            continue;
        };
        let devices = items[0].machine.devices.clone();
        if devices.is_empty() {
            continue;
        }

        let mut copied = 0;
        for device in devices {
            let device_key = machine_key(&device);
            if device_key == game {
                continue;
            }
            if let Some(device_items) = non_empty(store, &device_key) {
                copied += copy_missing(&mut items, &device_items);
            }
        }
        if copied > 0 {
            debug!(game = %game, copied, "added device items");
            store.insert(game, items);
        }
    }
}

fn add_roms_from_parent(store: &ItemStore) {
    for game in store.keys() {
        let Some(mut items) = non_empty(store, &game) else {
            continue;
        };
        let Some(parent) = linked_key(&game, &items, Machine::clone_of) else {
            continue;
        };
        let Some(parent_items) = non_empty(store, &parent) else {
            continue;
        };

        let copied = copy_missing(&mut items, &parent_items);
        let rom_of = parent_items[0].machine.rom_of.clone();
        for item in items.iter_mut() {
            item.set_rom_of(rom_of.clone());
        }
        debug!(game = %game, parent = %parent, copied, "added parent items");
        store.insert(game, items);
    }
}

fn add_roms_from_bios(store: &ItemStore) {
    for game in store.keys() {
        let Some(mut items) = non_empty(store, &game) else {
            continue;
        };
        let Some(bios) = linked_key(&game, &items, Machine::rom_of) else {
            continue;
        };
        let Some(bios_items) = non_empty(store, &bios) else {
            continue;
        };

        let copied = copy_missing(&mut items, &bios_items);
        if copied > 0 {
            debug!(game = %game, bios = %bios, copied, "added bios items");
            store.insert(game, items);
        }
    }
}

fn add_roms_from_children(store: &ItemStore) {
    for game in store.keys() {
        let Some(items) = non_empty(store, &game) else {
            continue;
        };
        let Some(parent_name) = items[0].machine.clone_of().map(str::to_string) else {
            continue;
        };
        let parent = machine_key(&parent_name);
        if parent == game {
            continue;
        }
        let Some(mut parent_items) = store.get(&parent) else {
            continue;
        };

        let owner = match parent_items.first() {
            Some(first) => Arc::clone(&first.machine),
            None => Arc::new(Machine::named(parent_name)),
        };

        let mut moved = 0;
        for item in items {
            if item.is_disk() {
                let merged_in_parent = item
                    .merge_tag()
                    .is_some_and(|tag| parent_items.iter().any(|p| p.name == tag));
                if !merged_in_parent {
                    parent_items.push(item.reparented(&owner));
                    moved += 1;
                }
            } else if !parent_items.iter().any(|p| p.matches(&item)) {
                let mut child = item.reparented(&owner);
                child.name = format!("{}\\{}", item.machine.name, item.name);
                parent_items.push(child);
                moved += 1;
            }
        }

        debug!(game = %game, parent = %parent, moved, "merged child into parent");
        store.insert(parent, parent_items);
        store.remove(&game);
    }
}

fn remove_roms_from_child(store: &ItemStore) {
    for game in store.keys() {
        let Some(mut items) = non_empty(store, &game) else {
            continue;
        };
        let Some(parent) = linked_key(&game, &items, Machine::clone_of) else {
            continue;
        };
        let Some(parent_items) = non_empty(store, &parent) else {
            continue;
        };

        let removed = remove_matching(&mut items, &parent_items);
        let rom_of = parent_items[0].machine.rom_of.clone();
        for item in items.iter_mut() {
            item.set_rom_of(rom_of.clone());
        }
        debug!(game = %game, parent = %parent, removed, "removed parent items");
        store.insert(game, items);
    }
}

fn remove_bios_roms_from_child(store: &ItemStore) {
    for game in store.keys() {
        let Some(mut items) = non_empty(store, &game) else {
            continue;
        };
        let Some(bios) = linked_key(&game, &items, Machine::rom_of) else {
            continue;
        };
        let Some(bios_items) = non_empty(store, &bios) else {
            continue;
        };

        let removed = remove_matching(&mut items, &bios_items);
        if removed > 0 {
            debug!(game = %game, bios = %bios, removed, "removed bios items");
            store.insert(game, items);
        }
    }
}

fn remove_tags_from_child(store: &ItemStore) {
    for game in store.keys() {
        let Some(mut items) = store.get(&game) else {
            continue;
        };
        for item in items.iter_mut() {
            item.clear_links();
        }
        store.insert(game, items);
    }
}

fn remove_bios_and_device_sets(store: &ItemStore) {
    for game in store.keys() {
        let is_system = store
            .get(&game)
            .and_then(|items| items.first().map(|i| i.machine.is_bios_or_device()))
            .unwrap_or(false);
        if is_system {
            debug!(game = %game, "removed bios/device set");
            store.remove(&game);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashSelection, Hashes, hash_bytes};
    use crate::item::{Dump, ItemKind, MachineType};

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        )
    }

    struct Set {
        machine: Arc<Machine>,
    }

    impl Set {
        fn new(name: &str) -> Self {
            Self {
                machine: Arc::new(Machine::named(name)),
            }
        }

        fn clone_of(mut self, parent: &str) -> Self {
            Arc::make_mut(&mut self.machine).clone_of = Some(parent.to_string());
            self
        }

        fn rom_of(mut self, bios: &str) -> Self {
            Arc::make_mut(&mut self.machine).rom_of = Some(bios.to_string());
            self
        }

        fn device(mut self, device: &str) -> Self {
            Arc::make_mut(&mut self.machine)
                .devices
                .push(device.to_string());
            self
        }

        fn kind(mut self, machine_type: MachineType) -> Self {
            Arc::make_mut(&mut self.machine).machine_type = machine_type;
            self
        }

        fn rom(&self, name: &str, data: &[u8]) -> Item {
            Item::rom(
                name,
                Arc::clone(&self.machine),
                hash_bytes(data, HashSelection::STANDARD),
            )
        }
    }

    fn names(store: &ItemStore, key: &str) -> Vec<String> {
        let mut names: Vec<String> = store
            .get(key)
            .unwrap_or_default()
            .into_iter()
            .map(|i| i.name)
            .collect();
        names.sort();
        names
    }

    fn resolve(topology: Topology, items: Vec<Item>) -> ItemStore {
        let mut store = ItemStore::from_items(pool(), items);
        SetResolver::new(topology).resolve(&mut store);
        store
    }

    #[test]
    fn test_topology_passes_and_parse() {
        assert_eq!(
            Topology::Split.passes(),
            &[
                Pass::RemoveRomsFromChild,
                Pass::RemoveBiosRomsFromChild,
                Pass::RemoveTagsFromChild
            ]
        );
        for topology in Topology::ALL {
            assert_eq!(Topology::parse(topology.as_str()), Some(topology));
        }
        assert_eq!(Topology::parse("bogus"), None);
    }

    #[test]
    fn test_merged_moves_differing_child_item_into_parent() {
        let parent = Set::new("parent");
        let game = Set::new("game").clone_of("parent");
        let store = resolve(
            Topology::Merged,
            vec![
                parent.rom("bios.bin", b"parent bios"),
                parent.rom("main.bin", b"main"),
                game.rom("bios.bin", b"game bios"),
                game.rom("main.bin", b"main"),
            ],
        );

        assert!(!store.contains_key("game"));
        assert_eq!(
            names(&store, "parent"),
            vec!["bios.bin", "game\\bios.bin", "main.bin"]
        );
        for item in store.get("parent").unwrap() {
            assert_eq!(item.machine_name(), "parent");
            assert_eq!(item.machine.clone_of, None);
        }
    }

    #[test]
    fn test_merged_disk_gated_by_merge_tag() {
        let parent = Set::new("parent");
        let game = Set::new("game").clone_of("parent");
        let parent_disk = Item::disk(
            "hdd",
            Arc::clone(&parent.machine),
            Hashes {
                sha1: crate::checksum::Sha1::from_bytes([1u8; 20]),
                ..Hashes::default()
            },
        );
        let mut merged_disk = Item::new(
            "hdd",
            Arc::clone(&game.machine),
            ItemKind::Disk(Dump::new(Hashes {
                sha1: crate::checksum::Sha1::from_bytes([2u8; 20]),
                ..Hashes::default()
            })),
        );
        if let Some(dump) = merged_disk.dump_mut() {
            dump.merge_tag = Some("hdd".to_string());
        }
        let own_disk = Item::disk(
            "extra",
            Arc::clone(&game.machine),
            Hashes {
                sha1: crate::checksum::Sha1::from_bytes([3u8; 20]),
                ..Hashes::default()
            },
        );

        let store = resolve(Topology::Merged, vec![parent_disk, merged_disk, own_disk]);
        assert_eq!(names(&store, "parent"), vec!["extra", "hdd"]);
    }

    #[test]
    fn test_merged_with_missing_parent_keeps_child() {
        let game = Set::new("game").clone_of("nowhere");
        let store = resolve(Topology::Merged, vec![game.rom("a.bin", b"a")]);
        assert_eq!(names(&store, "game"), vec!["a.bin"]);
    }

    #[test]
    fn test_split_empties_identical_child() {
        let parent = Set::new("parent");
        let game = Set::new("game").clone_of("parent");
        let store = resolve(
            Topology::Split,
            vec![
                parent.rom("a.bin", b"a"),
                parent.rom("b.bin", b"b"),
                game.rom("a.bin", b"a"),
                game.rom("b.bin", b"b"),
            ],
        );

        assert_eq!(names(&store, "game"), Vec::<String>::new());
        assert_eq!(names(&store, "parent"), vec!["a.bin", "b.bin"]);
    }

    #[test]
    fn test_split_keeps_unique_child_items_and_drops_bios() {
        let bios = Set::new("neogeo").kind(MachineType::Bios);
        let parent = Set::new("parent").rom_of("neogeo");
        let game = Set::new("game").clone_of("parent").rom_of("parent");
        let store = resolve(
            Topology::Split,
            vec![
                bios.rom("sp-s2.sp1", b"bios"),
                parent.rom("sp-s2.sp1", b"bios"),
                parent.rom("p1.bin", b"p1"),
                game.rom("sp-s2.sp1", b"bios"),
                game.rom("p1.bin", b"p1"),
                game.rom("p1k.bin", b"p1 korea"),
            ],
        );

        assert_eq!(names(&store, "game"), vec!["p1k.bin"]);
        assert_eq!(names(&store, "parent"), vec!["p1.bin"]);
        assert_eq!(names(&store, "neogeo"), vec!["sp-s2.sp1"]);
    }

    #[test]
    fn test_split_strips_bios_reached_through_parent() {
        let bios = Set::new("neogeo").kind(MachineType::Bios);
        let parent = Set::new("parent").rom_of("neogeo");
        // The clone names no bios of its own.
        let game = Set::new("game").clone_of("parent");
        let store = resolve(
            Topology::Split,
            vec![
                bios.rom("sp-s2.sp1", b"bios"),
                bios.rom("000-lo.lo", b"lo table"),
                parent.rom("p1.bin", b"p1"),
                game.rom("p1.bin", b"p1"),
                game.rom("000-lo.lo", b"lo table"),
                game.rom("p1k.bin", b"p1 korea"),
            ],
        );

        assert_eq!(names(&store, "game"), vec!["p1k.bin"]);
        assert_eq!(names(&store, "parent"), vec!["p1.bin"]);
        assert_eq!(names(&store, "neogeo"), vec!["000-lo.lo", "sp-s2.sp1"]);
    }

    #[test]
    fn test_device_non_merged_copies_and_is_stable() {
        let device = Set::new("fontdev").kind(MachineType::Device);
        let game = Set::new("game").device("fontdev");
        let mut store = ItemStore::from_items(
            pool(),
            vec![device.rom("font.bin", b"font"), game.rom("main.bin", b"main")],
        );

        let resolver = SetResolver::new(Topology::DeviceNonMerged);
        resolver.resolve(&mut store);
        assert_eq!(names(&store, "game"), vec!["font.bin", "main.bin"]);
        let font = store
            .get("game")
            .unwrap()
            .into_iter()
            .find(|i| i.name == "font.bin")
            .unwrap();
        assert_eq!(font.machine_name(), "game");

        let snapshot = |store: &ItemStore| -> Vec<Vec<String>> {
            store.keys().iter().map(|k| names(store, k)).collect()
        };
        let first = snapshot(&store);
        resolver.resolve(&mut store);
        assert_eq!(snapshot(&store), first);
        assert_eq!(store.item_count(), 3);
    }

    #[test]
    fn test_non_merged_adds_parent_and_strips_bios() {
        let bios = Set::new("bios").kind(MachineType::Bios);
        let parent = Set::new("parent").rom_of("bios");
        let game = Set::new("game").clone_of("parent").rom_of("parent");
        let store = resolve(
            Topology::NonMerged,
            vec![
                bios.rom("bios.bin", b"bios"),
                parent.rom("bios.bin", b"bios"),
                parent.rom("p.bin", b"p"),
                game.rom("bios.bin", b"bios"),
                game.rom("g.bin", b"g"),
            ],
        );

        assert_eq!(names(&store, "game"), vec!["g.bin", "p.bin"]);
        assert_eq!(names(&store, "parent"), vec!["p.bin"]);
        for item in store.get("game").unwrap() {
            assert_eq!(item.machine.rom_of, None);
            assert_eq!(item.machine.clone_of, None);
        }
    }

    #[test]
    fn test_fully_non_merged_adds_bios_and_devices() {
        let bios = Set::new("bios").kind(MachineType::Bios);
        let device = Set::new("dev").kind(MachineType::Device);
        let parent = Set::new("parent").rom_of("bios");
        let game = Set::new("game").clone_of("parent").device("dev");
        let store = resolve(
            Topology::FullyNonMerged,
            vec![
                bios.rom("bios.bin", b"bios"),
                device.rom("dev.bin", b"dev"),
                parent.rom("p.bin", b"p"),
                game.rom("g.bin", b"g"),
            ],
        );

        assert_eq!(
            names(&store, "game"),
            vec!["bios.bin", "dev.bin", "g.bin", "p.bin"]
        );
    }

    #[test]
    fn test_copy_skips_same_name_items() {
        let parent = Set::new("parent");
        let game = Set::new("game").clone_of("parent");
        let store = resolve(
            Topology::NonMerged,
            vec![parent.rom("a.bin", b"parent"), game.rom("a.bin", b"child")],
        );
        let items = store.get("game").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].hashes().unwrap().crc,
            hash_bytes(b"child", HashSelection::CRC).crc
        );
    }

    #[test]
    fn test_self_reference_is_noop() {
        let game = Set::new("game").clone_of("game").rom_of("game");
        let store = resolve(Topology::Merged, vec![game.rom("a.bin", b"a")]);
        assert_eq!(names(&store, "game"), vec!["a.bin"]);
    }

    #[test]
    fn test_remove_bios_and_device_sets() {
        let bios = Set::new("bios").kind(MachineType::Bios);
        let device = Set::new("dev").kind(MachineType::Device);
        let game = Set::new("game").rom_of("bios");
        let mut store = ItemStore::from_items(
            pool(),
            vec![
                bios.rom("bios.bin", b"bios"),
                device.rom("dev.bin", b"dev"),
                game.rom("g.bin", b"g"),
            ],
        );
        let resolution = SetResolver::new(Topology::Split)
            .remove_bios_and_devices(true)
            .resolve(&mut store);

        assert_eq!(resolution.passes.last(), Some(&Pass::RemoveBiosAndDeviceSets));
        assert_eq!(store.keys(), vec!["game".to_string()]);
    }

    #[test]
    fn test_cancel_before_first_pass() {
        let game = Set::new("game").clone_of("parent");
        let parent = Set::new("parent");
        let mut store = ItemStore::from_items(
            pool(),
            vec![parent.rom("a.bin", b"a"), game.rom("a.bin", b"a")],
        );
        let flag = Arc::new(AtomicBool::new(true));
        let resolution = SetResolver::new(Topology::Merged)
            .cancel_flag(flag)
            .resolve(&mut store);

        assert!(resolution.cancelled);
        assert!(resolution.passes.is_empty());
        assert!(store.contains_key("game"));
    }
}
