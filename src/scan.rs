//! # Library Scanner
//!
//! Walks the music directory, keeps audio files big enough to be real
//! tracks, and reads their durations from the file headers.
//!
//! Duration probing sits behind the [`DurationProbe`] trait so the library
//! can resolve missing durations lazily and tests can supply fixed tables.
//! [`TagProbe`] is the real implementation, backed by `lofty`.

use anyhow::{Context, Result};
use lofty::prelude::AudioFile;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::library::Track;

/// Files below this size are never treated as tracks.
pub const MIN_FILE_BYTES: u64 = 1024;

/// Extensions considered audio, compared case-insensitively.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "m4a", "wav"];

/// Reads the playing time of an audio file.
pub trait DurationProbe: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or its length is unknown.
    fn probe(&self, path: &Path) -> Result<Duration>;
}

/// Probe that parses container and tag metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct TagProbe;

impl DurationProbe for TagProbe {
    fn probe(&self, path: &Path) -> Result<Duration> {
        let tagged = lofty::read_from_path(path)
            .with_context(|| format!("Failed to read audio metadata from {}", path.display()))?;
        Ok(tagged.properties().duration())
    }
}

/// True if the extension is one of [`AUDIO_EXTENSIONS`].
#[must_use]
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// All audio files under `dir` that are at least [`MIN_FILE_BYTES`] long, sorted by path.
///
/// Unreadable entries are logged and skipped.
///
/// # Errors
///
/// Returns an error if `dir` itself is not a readable directory.
pub fn candidate_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(dir)
        .with_context(|| format!("Music directory {} is not accessible", dir.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("Music path {} is not a directory", dir.display());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry: {e}");
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_audio_file(entry.path()) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) if meta.len() >= MIN_FILE_BYTES => paths.push(entry.into_path()),
            Ok(_) => log::debug!("Skipping tiny file {}", entry.path().display()),
            Err(e) => log::warn!("Skipping {}: {e}", entry.path().display()),
        }
    }

    paths.sort();
    Ok(paths)
}

/// Probe each path and keep the ones at least `min_duration` long.
pub fn build_tracks(paths: Vec<PathBuf>, probe: &dyn DurationProbe, min_duration: Duration) -> Vec<Track> {
    paths
        .into_iter()
        .filter_map(|path| match probe.probe(&path) {
            Ok(duration) if duration >= min_duration => Some(Track::new(path, duration)),
            Ok(duration) => {
                log::debug!("Skipping {} ({}s is too short)", path.display(), duration.as_secs());
                None
            }
            Err(e) => {
                log::warn!("Skipping {}: {e:#}", path.display());
                None
            }
        })
        .collect()
}

/// Scan `dir` into tracks.
///
/// # Errors
///
/// Returns an error if `dir` cannot be read.
pub fn discover(dir: &Path, probe: &dyn DurationProbe, min_duration: Duration) -> Result<Vec<Track>> {
    let paths = candidate_paths(dir)?;
    let found = paths.len();
    let tracks = build_tracks(paths, probe, min_duration);
    log::info!("Scanned {}: {found} candidates, {} tracks kept", dir.display(), tracks.len());
    Ok(tracks)
}
