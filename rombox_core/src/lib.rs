//! # Rombox Core
//!
//! A content-addressed ROM depot with DAT set resolution.
//!
//! This library identifies files by CRC32/MD5/SHA-1 (optionally SHA-256/384/512),
//! groups DAT items into buckets, rewrites parent/clone/bios/device relationships
//! into the usual set layouts, and stores payloads deduplicated in gzip-compatible
//! containers named by their SHA-1.
//!
//! ## Features
//!
//! - Three-state digests: unknown (wildcard), explicit zero, or a value
//! - Concurrent bucket map with sorting and duplicate collapsing
//! - Device non-merged, fully non-merged, non-merged, merged and split layouts
//! - Containers readable by any gzip decoder, with digests in the header
//! - Sharded depot placement and a hash-record index kept in sync with the DATs
//!
//! ## Example
//!
//! ```no_run
//! use rombox_core::{Config, Depot, ItemStore, JsonDatSource, DatSource, SetResolver, Topology};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(Path::new("rombox.toml"))?;
//! let pool = config.thread_pool()?;
//!
//! // Resolve a DAT into merged sets
//! let items = JsonDatSource.load(Path::new("dats/arcade.json"))?;
//! let mut store = ItemStore::from_items(pool.clone(), items);
//! SetResolver::new(Topology::Merged).resolve(&mut store);
//!
//! // Archive a file into the depot
//! let depot = Depot::open(&config, pool)?;
//! let archived = depot.archive(Path::new("roms/pacman.bin"))?;
//! println!("{}", archived.container.display());
//! # Ok(())
//! # }
//! ```

mod checksum;
pub mod container;
mod config;
mod depot;
mod error;
mod hash;
mod index;
mod item;
mod resolve;
mod rows;
mod source;
mod store;
mod walk;

pub use checksum::{Checksum, Crc, Md5, Sha1, Sha256, Sha384, Sha512};
pub use config::{Config, DepotConfig};
pub use container::{ContainerHeader, Encoded, GzipEntryReader};
pub use depot::{Archived, Depot};
pub use error::{Error, Result};
pub use hash::{
    HashSelection, Hashes, MultiHasher, hash_bytes, hash_file, hash_file_or_empty, hash_files,
    hash_reader,
};
pub use index::{DepotIndex, HashRecord, IndexStats, RefreshStats};
pub use item::{
    BiosSet, Dump, Duplicate, Item, ItemKind, ItemStatus, ItemType, Machine, MachineType,
    MatchKind, MatchScope, Release, Source,
};
pub use resolve::{Pass, Resolution, SetResolver, Topology};
pub use rows::{FileRowStore, MemoryRowStore, Row, RowKey, RowStore};
pub use source::{ArchiveEntry, ArchiveReader, DatSource, JsonDatSource};
pub use store::{BucketKey, DedupeMode, ItemStore, machine_key};
pub use walk::{expand_inputs, files_under};
