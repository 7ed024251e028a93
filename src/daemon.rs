//! # Process Runtimes
//!
//! Builds the object graph for one `rotation` process and runs it.
//!
//! ## Leader
//!
//! ```text
//!  stdin ──► input thread ─┐
//!  SIGINT ─► signal thread ─┼──► Scheduler ──► Player (child process)
//!  socket ─► follower reader┘        │
//!                                    ├──► status line (stdout)
//!                                    └──► relay thread ──► follower socket
//! ```
//!
//! The scheduler runs on the main thread. Once it returns, the library is
//! written back to the cache one last time and the socket file is removed.
//!
//! ## Follower
//!
//! Renders the leader's snapshots and forwards typed commands and
//! termination signals across the socket. `d` leaves without stopping the
//! leader.
//!
//! ## Library loading
//!
//! The cached library is used when present. A missing, empty or corrupt
//! cache triggers a full scan of `music_dir`; a corrupt cache never stops
//! playback.

use anyhow::{Context, Result};
use std::io::{self, BufReader};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::cache::CacheFile;
use crate::config::{Config, RuntimeConfig};
use crate::coordinator::{self, FollowerExit, FollowerLink, LeaderEndpoint, Role, ViewerEvent};
use crate::display::{self, DisplayCommand, StatusLine};
use crate::library::{self, Library, LibraryError};
use crate::player::ProcessPlayer;
use crate::protocol::{ControlSignal, StateSnapshot};
use crate::scan::{self, DurationProbe, TagProbe};
use crate::scheduler::{NowPlaying, Scheduler};
use crate::signals::TerminationSignals;

/// Counts from a [`rescan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescanReport {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

/// Pick a role for `socket` and run it to completion.
///
/// # Errors
///
/// Returns an error on any fatal condition: the socket cannot be used,
/// there are no tracks, scoring fails, or the leader is unreachable.
pub fn run(config: &Config, runtime: &RuntimeConfig, signals: TerminationSignals) -> Result<()> {
    let socket = runtime.socket_for(config);

    match coordinator::determine_role(&socket)? {
        Role::Leader(endpoint) => run_leader(endpoint, config, runtime, signals),
        Role::Follower(link) => run_follower(link, signals),
    }
}

/// Play music and serve followers until asked to exit.
pub fn run_leader(
    endpoint: LeaderEndpoint,
    config: &Config,
    runtime: &RuntimeConfig,
    signals: TerminationSignals,
) -> Result<()> {
    let probe: Arc<dyn DurationProbe> = Arc::new(TagProbe);
    let cache = CacheFile::new(&runtime.cache_path);

    let library = load_library(config, &cache, probe.as_ref())?;
    println!("Loaded {} tracks", library.len());
    let shared = Arc::new(Mutex::new(library));

    let player = ProcessPlayer::new(&config.player_command)?;
    let now_playing = NowPlaying::new();
    let mut scheduler = Scheduler::new(
        Arc::clone(&shared),
        Box::new(player),
        probe,
        config.playlist_capacity(),
    )
    .with_cache(cache.clone())
    .with_tick(config.tick())
    .with_now_playing(now_playing.clone());

    let leader = endpoint.serve(scheduler.signal_sender(), now_playing)?;
    scheduler.add_observer(leader.observer());

    let status = Arc::new(Mutex::new(StatusLine::stdout()));
    let line = Arc::clone(&status);
    scheduler.add_observer(Box::new(move |snapshot: &StateSnapshot| {
        if let Ok(mut line) = line.lock() {
            let _ = line.render(snapshot);
        }
    }));

    let exit = scheduler.signal_sender();
    signals.spawn_translator(move |_| {
        exit.send(ControlSignal::Exit);
    })?;

    let input = scheduler.signal_sender();
    display::spawn_input(BufReader::new(io::stdin()), move |command| match command {
        DisplayCommand::Signal(signal) => input.send(signal),
        DisplayCommand::Detach => {
            log::warn!("This process is the leader; use 'q' to stop playback");
            true
        }
    })?;

    let outcome = scheduler.begin_session();
    finish_status(&status);
    drop(leader);

    // Flush whatever is known, even after a fatal error.
    match library::lock(&shared) {
        Ok(library) => {
            if let Err(e) = cache.save(&library) {
                log::error!("Failed to save library on shutdown: {e:#}");
            }
        }
        Err(e) => log::error!("{e:#}"),
    }

    outcome
}

/// Mirror the leader's status and forward commands until exit, detach or leader loss.
pub fn run_follower(link: FollowerLink, signals: TerminationSignals) -> Result<()> {
    println!("Attached to the running player. {}", display::USAGE);

    let (tx, rx) = mpsc::channel();

    let on_signal = tx.clone();
    signals.spawn_translator(move |_| {
        let _ = on_signal.send(ViewerEvent::Signal(ControlSignal::Exit));
    })?;

    let input = tx.clone();
    display::spawn_input(BufReader::new(io::stdin()), move |command| {
        let event = match command {
            DisplayCommand::Signal(signal) => ViewerEvent::Signal(signal),
            DisplayCommand::Detach => ViewerEvent::Detach,
        };
        input.send(event).is_ok()
    })?;

    let status = Arc::new(Mutex::new(StatusLine::stdout()));
    let line = Arc::clone(&status);
    let exit = link.run(tx, rx, move |snapshot| {
        if let Ok(mut line) = line.lock() {
            let _ = line.render(snapshot);
        }
    })?;
    finish_status(&status);

    match exit {
        FollowerExit::Exited => log::info!("Asked the leader to stop"),
        FollowerExit::Detached => log::info!("Detached; playback continues"),
        FollowerExit::LeaderClosed => println!("The player has stopped."),
    }
    Ok(())
}

fn finish_status(status: &Mutex<StatusLine<io::Stdout>>) {
    if let Ok(mut line) = status.lock() {
        let _ = line.finish();
    }
}

/// Load the library from `cache`, falling back to a scan of the music directory.
///
/// A cached corpus that has never been pruned is pruned once against the
/// minimum duration. A freshly scanned library is saved straight away.
///
/// # Errors
///
/// Returns an error if a scan is needed and fails, or if no tracks are found.
pub fn load_library(config: &Config, cache: &CacheFile, probe: &dyn DurationProbe) -> Result<Library> {
    match cache.load() {
        Ok(Some(mut library)) if !library.is_empty() => {
            if !library.is_pruned() {
                let removed = library.prune(config.min_track_duration(), probe);
                log::info!("Pruned {removed} short or unreadable tracks from the cache");
                save_or_warn(cache, &library);
            }
            if !library.is_empty() {
                return Ok(library);
            }
            log::info!("Every cached track was pruned; scanning");
        }
        Ok(_) => log::info!("No usable cache at {}; scanning", cache.path().display()),
        Err(e) => log::warn!("{e:#}; rescanning {}", config.music_dir.display()),
    }

    let tracks = scan::discover(&config.music_dir, probe, config.min_track_duration())?;
    let library = ensure_not_empty(Library::from_scan(tracks), config)?;
    save_or_warn(cache, &library);
    Ok(library)
}

/// Merge newly found files into the cached library, drop vanished or short
/// ones, and save. History of tracks already known is kept.
///
/// # Errors
///
/// Returns an error if the music directory cannot be scanned or the cache
/// cannot be written.
pub fn rescan(config: &Config, cache: &CacheFile, probe: &dyn DurationProbe) -> Result<RescanReport> {
    let mut library = match cache.load() {
        Ok(Some(library)) => library,
        Ok(None) => Library::default(),
        Err(e) => {
            log::warn!("{e:#}; starting from an empty library");
            Library::default()
        }
    };

    let discovered = scan::discover(&config.music_dir, probe, config.min_track_duration())?;
    let added = library.merge(discovered);
    let removed = library.prune(config.min_track_duration(), probe);

    cache.save(&library)?;
    Ok(RescanReport {
        added,
        removed,
        total: library.len(),
    })
}

/// Print the cached library, highest score first.
///
/// # Errors
///
/// Returns an error if the cache is unreadable.
pub fn list(cache: &CacheFile, limit: Option<usize>) -> Result<()> {
    let Some(library) = cache.load()? else {
        println!("No library cache at {}. Run `rotation rescan` first.", cache.path().display());
        return Ok(());
    };

    let mut tracks: Vec<_> = library.tracks().iter().collect();
    tracks.sort_by(|a, b| b.play_info.score.total_cmp(&a.play_info.score));

    println!("{:>8}  {:>5}  {:>5}  {:>6}  track", "score", "plays", "skips", "length");
    for track in tracks.iter().take(limit.unwrap_or(usize::MAX)) {
        println!(
            "{:>8.1}  {:>5}  {:>5}  {:>6}  {}",
            track.play_info.score,
            track.play_info.total_plays,
            track.play_info.total_skips,
            display::fmt_duration(track.duration),
            track.path.display()
        );
    }

    let stats = library.stats();
    println!();
    println!(
        "{} tracks, {} total, {} listened ({} plays, {} skips, average score {:.1})",
        library.len(),
        display::fmt_duration(stats.total_duration),
        display::fmt_duration(stats.total_time_played),
        stats.total_plays,
        stats.total_skips,
        stats.avg_score
    );
    Ok(())
}

fn ensure_not_empty(library: Library, config: &Config) -> Result<Library> {
    if library.is_empty() {
        return Err(LibraryError::EmptyCorpus)
            .with_context(|| format!("No playable tracks found in {}", config.music_dir.display()));
    }
    Ok(library)
}

fn save_or_warn(cache: &CacheFile, library: &Library) {
    if let Err(e) = cache.save(library) {
        log::warn!("Failed to save library cache: {e:#}");
    }
}
