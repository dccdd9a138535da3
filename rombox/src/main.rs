mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use output::{
    ArchiveOutput, ArchivedFile, DbStatsOutput, ExtractOutput, HashOutput, HashedFile,
    InspectOutput, InspectedContainer, OutputWriter, RefreshOutput, ResolveOutput,
    ResolvedMachine, hashes_line,
};
use rombox_core::container;
use rombox_core::{
    ArchiveReader, Config, DatSource, DedupeMode, Depot, DepotIndex, FileRowStore,
    GzipEntryReader, HashSelection, Hashes, Item, ItemStore, JsonDatSource, Machine, SetResolver,
    Topology, hash_files,
};
use std::fmt::Write as _;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Rombox - A content-addressed ROM depot
#[derive(Parser)]
#[command(name = "rombox")]
#[command(about = "Content-addressed ROM depot with DAT set resolution", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ROMBOX_CONFIG env var or ./rombox.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print size and digests of files
    Hash {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Also compute SHA-256, SHA-384 and SHA-512
        #[arg(long)]
        deep: bool,
    },

    /// Compress files into containers and place them in the depot
    Archive {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show the digests stored in container headers
    Inspect {
        #[arg(required = true)]
        containers: Vec<PathBuf>,

        /// List archive entries as items
        #[arg(long)]
        entries: bool,
    },

    /// Decompress and verify a container
    Extract {
        container: PathBuf,

        /// Destination file
        dest: PathBuf,
    },

    /// Reconcile the hash-record index with the DAT directory
    Refresh,

    /// Show index statistics
    Dbstats,

    /// Rewrite the sets of a JSON DAT listing into a layout
    Resolve {
        dat: PathBuf,

        #[arg(long, value_enum, default_value = "split")]
        topology: TopologyArg,

        #[arg(long, value_enum, default_value = "none")]
        dedupe: DedupeArg,

        /// Drop bios and device sets from the result
        #[arg(long)]
        remove_bios_devices: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TopologyArg {
    DeviceNonMerged,
    FullyNonMerged,
    NonMerged,
    Merged,
    Split,
}

impl From<TopologyArg> for Topology {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::DeviceNonMerged => Topology::DeviceNonMerged,
            TopologyArg::FullyNonMerged => Topology::FullyNonMerged,
            TopologyArg::NonMerged => Topology::NonMerged,
            TopologyArg::Merged => Topology::Merged,
            TopologyArg::Split => Topology::Split,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DedupeArg {
    None,
    Game,
    Full,
}

impl From<DedupeArg> for DedupeMode {
    fn from(arg: DedupeArg) -> Self {
        match arg {
            DedupeArg::None => DedupeMode::None,
            DedupeArg::Game => DedupeMode::Game,
            DedupeArg::Full => DedupeMode::Full,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let output = OutputWriter::new(cli.json);
    if let Err(e) = run(cli, &output) {
        output.write_error(&e, 1);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rombox=info,rombox_core=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli, output: &OutputWriter) -> Result<()> {
    // Config file: CLI arg > ROMBOX_CONFIG env var > ./rombox.toml, defaults if absent
    let config_path = cli
        .config
        .or_else(|| std::env::var("ROMBOX_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("rombox.toml"));
    let config = if config_path.exists() {
        debug!(path = %config_path.display(), "loading config");
        Config::load(&config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else {
        debug!(path = %config_path.display(), "config not found, using defaults");
        Config::default()
    };

    match cli.command {
        Commands::Hash { paths, deep } => cmd_hash(&config, &paths, deep, output),
        Commands::Archive { paths } => cmd_archive(&config, &paths, output),
        Commands::Inspect {
            containers,
            entries,
        } => cmd_inspect(&containers, entries, output),
        Commands::Extract { container, dest } => cmd_extract(&container, &dest, output),
        Commands::Refresh => cmd_refresh(&config, output),
        Commands::Dbstats => cmd_dbstats(&config, output),
        Commands::Resolve {
            dat,
            topology,
            dedupe,
            remove_bios_devices,
        } => cmd_resolve(
            &config,
            &dat,
            topology.into(),
            dedupe.into(),
            remove_bios_devices,
            output,
        ),
    }
}

fn open_index(config: &Config) -> Result<DepotIndex<FileRowStore, JsonDatSource>> {
    let rows_path = config.rows_path();
    let rows = FileRowStore::open(&rows_path)
        .with_context(|| format!("Failed to open index {}", rows_path.display()))?;
    Ok(DepotIndex::new(rows, JsonDatSource))
}

fn cmd_hash(config: &Config, paths: &[PathBuf], deep: bool, output: &OutputWriter) -> Result<()> {
    let want = if deep {
        HashSelection::ALL
    } else {
        HashSelection::STANDARD
    };
    let pool = config
        .thread_pool()
        .with_context(|| "Failed to start workers")?;

    let files: Vec<HashedFile> = hash_files(&pool, paths, want)
        .into_iter()
        .map(|(path, hashes)| HashedFile {
            path: path.display().to_string(),
            identified: !hashes.is_empty(),
            hashes,
        })
        .collect();

    let data = HashOutput {
        success: true,
        result_code: 0,
        files,
    };
    output.write(&data, || {
        let mut text = String::new();
        for file in &data.files {
            if file.identified {
                let _ = writeln!(text, "{} {}", hashes_line(&file.hashes), file.path);
            } else {
                let _ = writeln!(text, "unreadable {}", file.path);
            }
        }
        text
    })
}

fn cmd_archive(config: &Config, paths: &[PathBuf], output: &OutputWriter) -> Result<()> {
    let pool = config
        .thread_pool()
        .with_context(|| "Failed to start workers")?;
    let depot = Depot::open(config, pool).with_context(|| "Failed to open depot")?;
    let mut index = open_index(config)?;

    let mut files = Vec::new();
    let mut records_marked = 0;
    for (path, result) in depot.archive_all(paths) {
        match result {
            Ok(archived) => {
                records_marked += index
                    .mark_present(&archived.hashes)
                    .with_context(|| "Failed to update index")?;
                files.push(ArchivedFile {
                    path: path.display().to_string(),
                    container: Some(archived.container.display().to_string()),
                    sha1: archived.hashes.sha1.to_hex(),
                    existed: archived.existed,
                    error: None,
                });
            }
            Err(e) => files.push(ArchivedFile {
                path: path.display().to_string(),
                container: None,
                sha1: None,
                existed: false,
                error: Some(e.to_string()),
            }),
        }
    }

    let failed = files.iter().filter(|f| f.error.is_some()).count();
    let data = ArchiveOutput {
        success: failed == 0,
        result_code: if failed == 0 { 0 } else { 1 },
        files,
        records_marked,
    };
    output.write(&data, || {
        let mut text = String::new();
        for file in &data.files {
            match (&file.container, &file.error) {
                (Some(container), _) => {
                    let state = if file.existed { "exists" } else { "added" };
                    let _ = writeln!(text, "{} {} -> {}", state, file.path, container);
                }
                (None, Some(error)) => {
                    let _ = writeln!(text, "failed {}: {}", file.path, error);
                }
                (None, None) => {}
            }
        }
        let _ = writeln!(text, "Marked {} index records present", data.records_marked);
        text
    })
}

fn cmd_inspect(containers: &[PathBuf], entries: bool, output: &OutputWriter) -> Result<()> {
    let inspected = inspect_containers(containers, entries);

    let failed = inspected.iter().filter(|c| c.error.is_some()).count();
    let data = InspectOutput {
        success: failed == 0,
        result_code: if failed == 0 { 0 } else { 1 },
        containers: inspected,
    };
    output.write(&data, || {
        let mut text = String::new();
        for c in &data.containers {
            if let Some(error) = &c.error {
                let _ = writeln!(text, "failed {}: {}", c.path, error);
            } else if c.container {
                let _ = writeln!(text, "{} {}", hashes_line(&c.hashes), c.path);
            } else {
                let _ = writeln!(text, "not a container {}", c.path);
            }
            for item in &c.entries {
                let size = item.size().map(|s| s.to_string()).unwrap_or_default();
                let crc = item.hashes().map(|h| h.crc.to_string()).unwrap_or_default();
                let _ = writeln!(text, "  {} size={} crc={}", item.name, size, crc);
            }
        }
        text
    })
}

/// Inspect each container on its own; a bad file is reported and the rest continue.
fn inspect_containers(containers: &[PathBuf], entries: bool) -> Vec<InspectedContainer> {
    containers
        .iter()
        .map(|path| {
            let listed = container::inspect(path).and_then(|hashes| {
                let items = if entries {
                    list_entries(path)?
                } else {
                    Vec::new()
                };
                Ok((hashes, items))
            });
            match listed {
                Ok((hashes, items)) => InspectedContainer {
                    path: path.display().to_string(),
                    container: !hashes.is_empty(),
                    hashes,
                    entries: items,
                    error: None,
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to inspect container");
                    InspectedContainer {
                        path: path.display().to_string(),
                        container: false,
                        hashes: Hashes::empty(),
                        entries: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            }
        })
        .collect()
}

fn list_entries(path: &Path) -> rombox_core::Result<Vec<Item>> {
    let machine = Arc::new(Machine::named(
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    ));
    Ok(GzipEntryReader
        .entries(path)?
        .iter()
        .map(|entry| Item::from_archive_entry(entry, Arc::clone(&machine)))
        .collect())
}

fn cmd_extract(container_path: &Path, dest: &Path, output: &OutputWriter) -> Result<()> {
    let file =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let hashes = match container::extract(container_path, BufWriter::new(file)) {
        Ok(hashes) => hashes,
        Err(e) => {
            let _ = std::fs::remove_file(dest);
            return Err(e)
                .with_context(|| format!("Failed to extract {}", container_path.display()));
        }
    };

    let data = ExtractOutput {
        success: true,
        result_code: 0,
        container: container_path.display().to_string(),
        destination: dest.display().to_string(),
        hashes,
    };
    output.write(&data, || {
        format!(
            "Extracted {} to {} ({})\n",
            data.container,
            data.destination,
            hashes_line(&data.hashes)
        )
    })
}

fn cmd_refresh(config: &Config, output: &OutputWriter) -> Result<()> {
    let mut index = open_index(config)?;
    let stats = index
        .refresh(&config.dats)
        .with_context(|| format!("Failed to refresh from {}", config.dats.display()))?;

    let data = RefreshOutput {
        success: true,
        result_code: 0,
        dats: config.dats.display().to_string(),
        stats,
    };
    output.write(&data, || {
        let s = &data.stats;
        format!(
            "DATs: {} found, {} added, {} removed, {} failed\nRecords: {} inserted, {} tagged\n",
            s.dats_found,
            s.dats_added,
            s.dats_removed,
            s.dats_failed,
            s.records_inserted,
            s.records_tagged
        )
    })
}

fn cmd_dbstats(config: &Config, output: &OutputWriter) -> Result<()> {
    let index = open_index(config)?;
    let stats = index.stats().with_context(|| "Failed to read index")?;

    let data = DbStatsOutput {
        success: true,
        result_code: 0,
        stats,
    };
    output.write(&data, || {
        format!(
            "Records: {}\nDATs: {}\nPresent: {}\n",
            data.stats.records, data.stats.dats, data.stats.present
        )
    })
}

fn cmd_resolve(
    config: &Config,
    dat: &Path,
    topology: Topology,
    dedupe: DedupeMode,
    remove_bios_devices: bool,
    output: &OutputWriter,
) -> Result<()> {
    let items = JsonDatSource
        .load(dat)
        .with_context(|| format!("Failed to read DAT {}", dat.display()))?;
    let pool = config
        .thread_pool()
        .with_context(|| "Failed to start workers")?;

    let mut store = ItemStore::from_items(pool, items);
    let resolution = SetResolver::new(topology)
        .dedupe(dedupe)
        .remove_bios_and_devices(remove_bios_devices)
        .resolve(&mut store);
    info!(
        topology = topology.as_str(),
        passes = resolution.passes.len(),
        machines = store.len(),
        "resolved DAT"
    );

    let machines: Vec<ResolvedMachine> = store
        .buckets()
        .into_iter()
        .map(|(key, items)| ResolvedMachine {
            machine: items
                .first()
                .map(|i| i.machine.name.clone())
                .unwrap_or(key),
            items,
        })
        .collect();

    let data = ResolveOutput {
        success: true,
        result_code: 0,
        topology: topology.as_str().to_string(),
        machines,
    };
    output.write(&data, || {
        let mut text = String::new();
        for machine in &data.machines {
            let _ = writeln!(text, "{}", machine.machine);
            for item in &machine.items {
                let _ = writeln!(text, "  {} {}", item.item_type().as_str(), item.name);
            }
        }
        text
    })
}
