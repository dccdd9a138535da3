//! Depot roots: placement, lookup and sidecar markers.

use crate::checksum::Sha1;
use crate::config::{Config, DepotConfig};
use crate::container::{self, depot_path};
use crate::error::{Error, Result};
use crate::hash::Hashes;
use crate::walk::expand_inputs;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size marker kept at the top of every online depot root.
pub const SIZE_MARKER: &str = ".romba_size";

/// Backup of the size marker.
pub const SIZE_MARKER_BACKUP: &str = ".romba_size.backup";

/// Outcome of archiving one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archived {
    pub source: PathBuf,
    /// Location of the container in the depot.
    pub container: PathBuf,
    pub hashes: Hashes,
    /// True if the content was already in a depot root.
    pub existed: bool,
}

/// The ordered depot table.
pub struct Depot {
    roots: Vec<DepotConfig>,
    tmpdir: PathBuf,
    pool: Arc<rayon::ThreadPool>,
    writer: Mutex<()>,
}

impl Depot {
    /// Open the depot table, creating online roots and their sidecar markers.
    pub fn open(config: &Config, pool: Arc<rayon::ThreadPool>) -> Result<Self> {
        for depot in config.online_depots() {
            fs::create_dir_all(&depot.root)?;
            for marker in [SIZE_MARKER, SIZE_MARKER_BACKUP] {
                let path = depot.root.join(marker);
                if !path.exists() {
                    OpenOptions::new().create(true).append(true).open(&path)?;
                    debug!(path = %path.display(), "created sidecar marker");
                }
            }
        }
        fs::create_dir_all(&config.tmpdir)?;

        Ok(Self {
            roots: config.depots.clone(),
            tmpdir: config.tmpdir.clone(),
            pool,
            writer: Mutex::new(()),
        })
    }

    /// All configured roots in table order.
    pub fn roots(&self) -> &[DepotConfig] {
        &self.roots
    }

    fn online_roots(&self) -> impl Iterator<Item = &Path> {
        self.roots
            .iter()
            .filter(|d| d.online)
            .map(|d| d.root.as_path())
    }

    /// Root new containers are placed under: the first online one.
    pub fn placement_root(&self) -> Result<&Path> {
        self.online_roots()
            .next()
            .ok_or_else(|| Error::invalid_config("No online depot configured"))
    }

    /// Find the container for `sha1` in any online root.
    pub fn locate(&self, sha1: &Sha1) -> Option<PathBuf> {
        if sha1.is_unknown() {
            return None;
        }
        self.online_roots()
            .map(|root| depot_path(root, sha1))
            .find(|path| path.exists())
    }

    /// Encode `path` and place the container in the depot.
    ///
    /// Content already present in any online root is not placed again.
    pub fn archive(&self, path: &Path) -> Result<Archived> {
        let root = self.placement_root()?;
        let staging = tempfile::TempDir::new_in(&self.tmpdir)?;
        let encoded = container::encode(path, staging.path())?;

        let _guard = self.writer.lock();
        if let Some(existing) = self.locate(&encoded.hashes.sha1) {
            match container::extract(&existing, io::sink()) {
                Ok(_) => {
                    debug!(source = %path.display(), container = %existing.display(), "already archived");
                    return Ok(Archived {
                        source: path.to_path_buf(),
                        container: existing,
                        hashes: encoded.hashes,
                        existed: true,
                    });
                }
                Err(e) => {
                    warn!(container = %existing.display(), error = %e, "existing container is damaged");
                }
            }
        }

        let placed = container::place_in_depot(&encoded.path, root)?;
        Ok(Archived {
            source: path.to_path_buf(),
            container: placed,
            hashes: encoded.hashes,
            existed: false,
        })
    }

    /// Archive many files on the worker pool. Directories are archived recursively.
    /// A failure affects only its own file.
    pub fn archive_all(&self, paths: &[PathBuf]) -> Vec<(PathBuf, Result<Archived>)> {
        let paths = expand_inputs(paths);
        let results: Vec<(PathBuf, Result<Archived>)> = self.pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    let result = self.archive(path);
                    if let Err(e) = &result {
                        warn!(path = %path.display(), error = %e, "failed to archive file");
                    }
                    (path.clone(), result)
                })
                .collect()
        });

        let archived = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(
            total = paths.len(),
            archived,
            failed = paths.len() - archived,
            "archive complete"
        );
        results
    }
}
