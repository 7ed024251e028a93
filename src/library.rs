//! # Track Library
//!
//! The [`Library`] owns the whole track corpus, the aggregate
//! [`LibraryStats`] and the active [`Playlist`]. It is shared between
//! threads as a [`SharedLibrary`]; every mutation happens under that one
//! mutex, and [`Library::recompute_scores`] runs start to finish inside a
//! single lock so no reader ever sees a half-scored corpus.
//!
//! ## Recompute pass
//!
//! 1. Resolve any missing track durations (fatal if one cannot be read).
//! 2. Score every track against the *previous* pass's statistics.
//! 3. Rebuild the statistics from the freshly scored tracks.
//! 4. Stable-sort the corpus by score, highest first.
//!
//! [`Library::rebuild_playlist`] then takes the top of the sorted corpus.

use crate::algorithm::{self, ScoringContext};
use crate::scan::DurationProbe;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Library shared between the scheduler and everything observing it.
pub type SharedLibrary = Arc<Mutex<Library>>;

/// Lock a shared library, turning a poisoned lock into an error.
///
/// # Errors
///
/// Returns an error if another thread panicked while holding the lock.
pub fn lock(shared: &SharedLibrary) -> anyhow::Result<MutexGuard<'_, Library>> {
    shared
        .lock()
        .map_err(|_| anyhow::anyhow!("library lock poisoned by a panicked thread"))
}

/// Fatal conditions that leave nothing to schedule.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("the track library is empty; nothing to schedule")]
    EmptyCorpus,
    #[error("could not resolve the duration of {path}: {reason}")]
    UnresolvedDuration { path: PathBuf, reason: String },
}

/// Per-track play and skip history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayInfo {
    pub score: f64,
    pub total_plays: u64,
    pub total_skips: u64,
    pub consecutive_skips: u32,
    pub last_played_at: Option<SystemTime>,
    pub last_skipped_at: Option<SystemTime>,
    pub recomputes_since_play: u8,
}

/// One playable audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub path: PathBuf,
    /// Zero until resolved.
    #[serde(default)]
    pub duration: Duration,
    #[serde(default)]
    pub play_info: PlayInfo,
}

impl Track {
    pub fn new(path: impl Into<PathBuf>, duration: Duration) -> Self {
        Self {
            path: path.into(),
            duration,
            play_info: PlayInfo::default(),
        }
    }

    /// File name shown to the user.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// Corpus-wide aggregates rebuilt on every recompute pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryStats {
    pub avg_plays: f64,
    pub avg_skips: f64,
    pub avg_score: f64,
    /// Sum of all positive track scores.
    pub total_score: f64,
    pub last_compute_at: Option<SystemTime>,
    /// Cumulative listening time; survives recomputes.
    pub total_time_played: Duration,
    pub total_plays: u64,
    pub total_skips: u64,
    /// Combined length of every track in the corpus.
    pub total_duration: Duration,
}

/// The bounded, ordered slice of the corpus currently being walked.
///
/// Entries are indices into [`Library::tracks`]; they stay valid until the
/// next recompute re-sorts the corpus, which always rebuilds the playlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    entries: Vec<usize>,
    cursor: usize,
    capacity: usize,
}

impl Playlist {
    /// Next entry, or `None` once the cursor reaches the end.
    pub fn advance(&mut self) -> Option<usize> {
        let entry = self.entries.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(entry)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    #[must_use]
    pub fn entries(&self) -> &[usize] {
        &self.entries
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The full corpus plus its statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    #[serde(default)]
    tracks: Vec<Track>,
    #[serde(default)]
    stats: LibraryStats,
    /// Set once too-short or unreadable tracks have been dropped.
    #[serde(default)]
    pruned: bool,
    #[serde(skip)]
    playlist: Playlist,
}

impl Library {
    /// Build a library from discovered tracks. Later duplicates of a path are dropped.
    pub fn new(tracks: Vec<Track>) -> Self {
        let mut library = Self::default();
        library.merge(tracks);
        library
    }

    /// Build a library from a fresh scan, which has already applied the
    /// duration filter.
    pub fn from_scan(tracks: Vec<Track>) -> Self {
        let mut library = Self::new(tracks);
        library.pruned = true;
        library
    }

    #[must_use]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    #[must_use]
    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    #[must_use]
    pub fn position(&self, path: &Path) -> Option<usize> {
        self.tracks.iter().position(|track| track.path == path)
    }

    #[must_use]
    pub fn stats(&self) -> &LibraryStats {
        &self.stats
    }

    #[must_use]
    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    #[must_use]
    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Add tracks whose paths are not yet known. Returns how many were added.
    pub fn merge(&mut self, discovered: Vec<Track>) -> usize {
        let mut known: HashSet<PathBuf> = self.tracks.iter().map(|t| t.path.clone()).collect();
        let before = self.tracks.len();

        for track in discovered {
            if known.insert(track.path.clone()) {
                self.tracks.push(track);
            }
        }

        let added = self.tracks.len() - before;
        if added > 0 {
            // New indices would not be covered by the current ordering.
            self.playlist = Playlist::default();
        }
        added
    }

    /// Re-read every duration and drop tracks that are unreadable or shorter than `min`.
    /// Returns how many were removed.
    pub fn prune(&mut self, min: Duration, probe: &dyn DurationProbe) -> usize {
        let before = self.tracks.len();

        self.tracks.retain_mut(|track| match probe.probe(&track.path) {
            Ok(duration) if duration >= min => {
                track.duration = duration;
                true
            }
            Ok(duration) => {
                log::debug!("pruning {} ({duration:?} is too short)", track.path.display());
                false
            }
            Err(e) => {
                log::debug!("pruning {}: {e:#}", track.path.display());
                false
            }
        });

        self.pruned = true;
        self.playlist = Playlist::default();
        before - self.tracks.len()
    }

    /// Score every track and re-sort the corpus, using the thread RNG and the current time.
    pub fn recompute_scores(&mut self, probe: &dyn DurationProbe) -> Result<(), LibraryError> {
        self.recompute_scores_with(
            probe,
            &ScoringContext::default(),
            &mut rand::thread_rng(),
            SystemTime::now(),
        )
    }

    /// Score every track against the previous pass's statistics, rebuild the
    /// statistics and stable-sort by score descending.
    ///
    /// Fails without touching any score when the corpus is empty or a
    /// duration cannot be resolved. The playlist is cleared; call
    /// [`Library::rebuild_playlist`] afterwards.
    pub fn recompute_scores_with<R: Rng + ?Sized>(
        &mut self,
        probe: &dyn DurationProbe,
        context: &ScoringContext,
        rng: &mut R,
        now: SystemTime,
    ) -> Result<(), LibraryError> {
        if self.tracks.is_empty() {
            return Err(LibraryError::EmptyCorpus);
        }

        self.resolve_durations(probe)?;

        let baseline = self.stats.clone();
        let track_count = self.tracks.len();

        let mut total_plays = 0u64;
        let mut total_skips = 0u64;
        let mut total_score = 0.0;
        let mut total_duration = Duration::ZERO;

        for track in &mut self.tracks {
            total_plays += track.play_info.total_plays;
            total_skips += track.play_info.total_skips;
            total_duration += track.duration;

            track.play_info = algorithm::compute_score_with_context(
                &track.play_info,
                &baseline,
                track_count,
                context,
                rng,
            );

            // Only positive scores count toward the total.
            if track.play_info.score > 0.0 {
                total_score += track.play_info.score;
            }
        }

        let count = track_count as f64;
        self.stats = LibraryStats {
            avg_plays: total_plays as f64 / count,
            avg_skips: total_skips as f64 / count,
            avg_score: total_score / count,
            total_score,
            last_compute_at: Some(now),
            total_time_played: baseline.total_time_played,
            total_plays,
            total_skips,
            total_duration,
        };

        self.tracks
            .sort_by(|a, b| b.play_info.score.total_cmp(&a.play_info.score));
        self.playlist = Playlist::default();

        log::debug!(
            "recomputed {track_count} scores (avg {:.2}, total {:.2})",
            self.stats.avg_score,
            self.stats.total_score
        );
        Ok(())
    }

    /// Fill in zero durations. All-or-nothing: on error no track is changed.
    fn resolve_durations(&mut self, probe: &dyn DurationProbe) -> Result<(), LibraryError> {
        let mut resolved = Vec::new();

        for (index, track) in self.tracks.iter().enumerate() {
            if !track.duration.is_zero() {
                continue;
            }

            let duration = probe.probe(&track.path).map_err(|e| LibraryError::UnresolvedDuration {
                path: track.path.clone(),
                reason: format!("{e:#}"),
            })?;

            if duration.is_zero() {
                return Err(LibraryError::UnresolvedDuration {
                    path: track.path.clone(),
                    reason: "duration is zero".to_string(),
                });
            }
            resolved.push((index, duration));
        }

        for (index, duration) in resolved {
            self.tracks[index].duration = duration;
        }
        Ok(())
    }

    /// Take the top `capacity` tracks of the sorted corpus and rewind the cursor.
    pub fn rebuild_playlist(&mut self, capacity: usize) {
        let capacity = capacity.min(self.tracks.len());
        self.playlist = Playlist {
            entries: (0..capacity).collect(),
            cursor: 0,
            capacity,
        };
    }

    /// Pop the next playlist entry, or `None` when a recompute is due.
    pub fn next_entry(&mut self) -> Option<usize> {
        self.playlist.advance()
    }

    /// Record a completed play. Returns false if the path is not in the corpus.
    pub fn mark_played(&mut self, path: &Path, at: SystemTime, listened: Duration) -> bool {
        let Some(index) = self.position(path) else {
            return false;
        };

        let info = &mut self.tracks[index].play_info;
        info.total_plays += 1;
        info.consecutive_skips = 0;
        info.recomputes_since_play = 0;
        info.last_played_at = Some(at);

        self.stats.total_plays += 1;
        self.stats.total_time_played += listened;
        true
    }

    /// Record a skip. Returns false if the path is not in the corpus.
    pub fn mark_skipped(&mut self, path: &Path, at: SystemTime, listened: Duration) -> bool {
        let Some(index) = self.position(path) else {
            return false;
        };

        let info = &mut self.tracks[index].play_info;
        info.total_skips += 1;
        info.consecutive_skips = info.consecutive_skips.saturating_add(1);
        info.recomputes_since_play = 0;
        info.last_skipped_at = Some(at);

        self.stats.total_skips += 1;
        self.stats.total_time_played += listened;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::time::UNIX_EPOCH;

    /// Probe backed by a fixed table.
    struct TableProbe(HashMap<PathBuf, Duration>);

    impl DurationProbe for TableProbe {
        fn probe(&self, path: &Path) -> Result<Duration> {
            self.0
                .get(path)
                .copied()
                .ok_or_else(|| anyhow!("no such file: {}", path.display()))
        }
    }

    fn no_probe() -> TableProbe {
        TableProbe(HashMap::new())
    }

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    fn sample_library(count: usize) -> Library {
        Library::new(
            (0..count)
                .map(|i| Track::new(format!("/music/track{i:02}.mp3"), minutes(3)))
                .collect(),
        )
    }

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_new_drops_duplicate_paths() {
        let library = Library::new(vec![
            Track::new("/music/a.mp3", minutes(2)),
            Track::new("/music/b.mp3", minutes(3)),
            Track::new("/music/a.mp3", minutes(4)),
        ]);

        assert_eq!(library.len(), 2);
        assert_eq!(library.tracks()[0].duration, minutes(2));
    }

    #[test]
    fn test_recompute_sorts_and_rebuild_truncates() {
        let mut library = sample_library(10);
        let mut rng = StdRng::seed_from_u64(3);

        library
            .recompute_scores_with(&no_probe(), &ScoringContext::default(), &mut rng, at(100))
            .expect("recompute should succeed");
        library.rebuild_playlist(4);

        let scores: Vec<f64> = library.tracks().iter().map(|t| t.play_info.score).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]), "not sorted: {scores:?}");

        let playlist = library.playlist();
        assert_eq!(playlist.len(), 4);
        assert_eq!(playlist.cursor(), 0);
        let listed: Vec<f64> = playlist.entries().iter().map(|&i| library.tracks()[i].play_info.score).collect();
        assert_eq!(listed, scores[..4].to_vec());
    }

    #[test]
    fn test_rebuild_capacity_clamped_to_corpus() {
        let mut library = sample_library(3);
        library.recompute_scores(&no_probe()).unwrap();
        library.rebuild_playlist(25);

        assert_eq!(library.playlist().len(), 3);
        assert_eq!(library.playlist().capacity(), 3);
    }

    #[test]
    fn test_stats_invariants_after_recompute() {
        let mut library = sample_library(6);
        let mut rng = StdRng::seed_from_u64(11);
        library.mark_skipped(Path::new("/music/track01.mp3"), at(50), Duration::from_secs(5));
        library.mark_played(Path::new("/music/track02.mp3"), at(60), minutes(3));

        library
            .recompute_scores_with(&no_probe(), &ScoringContext::default(), &mut rng, at(100))
            .unwrap();
        // A second pass so the skipped track can go negative.
        library.mark_skipped(Path::new("/music/track01.mp3"), at(150), Duration::from_secs(5));
        library
            .recompute_scores_with(&no_probe(), &ScoringContext::default(), &mut rng, at(200))
            .unwrap();

        let stats = library.stats();
        let positive: f64 = library
            .tracks()
            .iter()
            .map(|t| t.play_info.score)
            .filter(|&s| s > 0.0)
            .sum();

        assert!((stats.total_score - positive).abs() < 1e-9);
        assert!((stats.avg_score - stats.total_score / library.len() as f64).abs() < 1e-9);
        assert_eq!(stats.total_plays, 1);
        assert_eq!(stats.total_skips, 2);
        assert_eq!(stats.total_duration, minutes(18));
        assert_eq!(stats.last_compute_at, Some(at(200)));
    }

    #[test]
    fn test_empty_corpus_is_fatal() {
        let mut library = Library::default();
        let err = library.recompute_scores(&no_probe()).unwrap_err();
        assert!(matches!(err, LibraryError::EmptyCorpus));
    }

    #[test]
    fn test_unresolvable_duration_is_fatal_and_leaves_scores_alone() {
        let mut library = Library::new(vec![
            Track::new("/music/known.mp3", Duration::ZERO),
            Track::new("/music/ghost.mp3", Duration::ZERO),
        ]);
        let probe = TableProbe(HashMap::from([(PathBuf::from("/music/known.mp3"), minutes(2))]));

        let err = library.recompute_scores(&probe).unwrap_err();
        match err {
            LibraryError::UnresolvedDuration { path, .. } => assert_eq!(path, PathBuf::from("/music/ghost.mp3")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(library.tracks().iter().all(|t| t.play_info.score == 0.0));
        assert!(library.tracks().iter().all(|t| t.duration.is_zero()));
    }

    #[test]
    fn test_missing_duration_resolved_lazily() {
        let mut library = Library::new(vec![Track::new("/music/lazy.mp3", Duration::ZERO)]);
        let probe = TableProbe(HashMap::from([(PathBuf::from("/music/lazy.mp3"), minutes(4))]));

        library.recompute_scores(&probe).unwrap();
        assert_eq!(library.tracks()[0].duration, minutes(4));
    }

    #[test]
    fn test_cursor_never_passes_end() {
        let mut library = sample_library(3);
        library.recompute_scores(&no_probe()).unwrap();
        library.rebuild_playlist(2);

        assert!(library.next_entry().is_some());
        assert!(library.next_entry().is_some());
        assert!(library.playlist().is_exhausted());
        assert_eq!(library.next_entry(), None);
        assert_eq!(library.next_entry(), None);
        assert_eq!(library.playlist().cursor(), 2);
    }

    #[test]
    fn test_mark_played_and_skipped() {
        let mut library = sample_library(2);
        let path = Path::new("/music/track00.mp3");

        assert!(library.mark_skipped(path, at(10), Duration::from_secs(7)));
        assert!(library.mark_skipped(path, at(20), Duration::from_secs(3)));
        let info = &library.tracks()[0].play_info;
        assert_eq!(info.total_skips, 2);
        assert_eq!(info.consecutive_skips, 2);
        assert_eq!(info.total_plays, 0);
        assert_eq!(info.last_skipped_at, Some(at(20)));

        assert!(library.mark_played(path, at(30), minutes(3)));
        let info = &library.tracks()[0].play_info;
        assert_eq!(info.total_plays, 1);
        assert_eq!(info.consecutive_skips, 0);
        assert_eq!(info.recomputes_since_play, 0);
        assert_eq!(info.last_played_at, Some(at(30)));

        assert_eq!(library.stats().total_time_played, Duration::from_secs(190));
        assert!(!library.mark_played(Path::new("/nowhere.mp3"), at(40), Duration::ZERO));
    }

    #[test]
    fn test_prune_drops_short_and_unreadable() {
        let mut library = Library::new(vec![
            Track::new("/music/long.mp3", minutes(3)),
            Track::new("/music/short.mp3", minutes(3)),
            Track::new("/music/gone.mp3", minutes(3)),
        ]);
        let probe = TableProbe(HashMap::from([
            (PathBuf::from("/music/long.mp3"), minutes(3)),
            (PathBuf::from("/music/short.mp3"), Duration::from_secs(20)),
        ]));

        let removed = library.prune(Duration::from_secs(90), &probe);
        assert_eq!(removed, 2);
        assert_eq!(library.len(), 1);
        assert!(library.is_pruned());
    }

    #[test]
    fn test_merge_keeps_existing_history() {
        let mut library = sample_library(2);
        library.mark_played(Path::new("/music/track00.mp3"), at(5), minutes(3));

        let added = library.merge(vec![
            Track::new("/music/track00.mp3", minutes(3)),
            Track::new("/music/new.mp3", minutes(5)),
        ]);

        assert_eq!(added, 1);
        assert_eq!(library.len(), 3);
        assert_eq!(library.tracks()[0].play_info.total_plays, 1);
    }

    #[test]
    fn test_playlist_not_serialized() {
        let mut library = sample_library(3);
        library.recompute_scores(&no_probe()).unwrap();
        library.rebuild_playlist(3);

        let json = serde_json::to_string(&library).unwrap();
        let restored: Library = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.tracks(), library.tracks());
        assert!(restored.playlist().is_empty());
        assert_eq!(restored.stats(), library.stats());
    }
}
