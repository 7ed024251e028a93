//! Persisted library state.
//!
//! The whole [`Library`] (tracks, play history, statistics) is stored as a
//! single JSON document. Writes go to a temporary file in the same
//! directory which is then renamed over the cache, so a crash mid-save
//! leaves the previous cache intact.

use anyhow::{Context, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::library::Library;

/// Serialize a library to cache JSON.
pub fn encode(library: &Library) -> Result<Vec<u8>> {
    serde_json::to_vec(library).context("Failed to serialize library")
}

/// Parse cache JSON into a library.
pub fn decode(bytes: &[u8]) -> Result<Library> {
    serde_json::from_slice(bytes).context("Library cache is corrupt")
}

/// Location of the on-disk cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFile {
    path: PathBuf,
}

impl CacheFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached library. `Ok(None)` if there is no cache yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn load(&self) -> Result<Option<Library>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read cache {}", self.path.display()))
            }
        };

        let library = decode(&bytes).with_context(|| format!("While loading {}", self.path.display()))?;
        log::debug!("Loaded {} tracks from {}", library.len(), self.path.display());
        Ok(Some(library))
    }

    /// Atomically replace the cache with `library`.
    pub fn save(&self, library: &Library) -> Result<()> {
        let bytes = encode(library)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut temp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        temp.write_all(&bytes).context("Failed to write library cache")?;
        temp.as_file().sync_all().context("Failed to flush library cache")?;
        temp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        log::debug!("Saved {} tracks to {}", library.len(), self.path.display());
        Ok(())
    }
}
