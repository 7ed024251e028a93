//! # Playback Scheduler
//!
//! Walks the playlist one track at a time and turns control signals into
//! player calls and history updates.
//!
//! ## Track cycle
//!
//! ```text
//! Idle -> Playing -> { Completed | Skipped | Paused <-> Playing } -> Idle
//! ```
//!
//! Everything the scheduler reacts to arrives on one channel as a
//! [`SchedulerEvent`]: control signals (from the display, the follower
//! socket and OS signals), periodic ticks, and player completions. The
//! session thread blocks on that channel, so it wakes on whichever comes
//! first.
//!
//! ## Races
//!
//! A skip that arrives after the player has already reported the end of
//! the current track loses: the track counts as played. Completions carry
//! a generation number so a late report from a stopped track is never
//! mistaken for the end of the next one.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::cache::CacheFile;
use crate::library::{self, SharedLibrary, Track};
use crate::player::{Completion, PlaybackOutcome, Player};
use crate::protocol::{ControlSignal, StateSnapshot};
use crate::scan::DurationProbe;

/// Everything the session loop waits on.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Control(ControlSignal),
    Tick,
    PlayerExited { generation: u64, outcome: PlaybackOutcome },
}

/// Cloneable handle for pushing control signals into a running session.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: Sender<SchedulerEvent>,
}

impl SignalSender {
    pub fn new(tx: Sender<SchedulerEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the scheduler is gone.
    pub fn send(&self, signal: ControlSignal) -> bool {
        self.tx.send(SchedulerEvent::Control(signal)).is_ok()
    }
}

/// Latest snapshot, written by the scheduler and read by anyone.
///
/// Snapshots are replaced whole, never edited in place, so a reader always
/// sees a complete one.
#[derive(Debug, Clone, Default)]
pub struct NowPlaying {
    slot: Arc<RwLock<Option<Arc<StateSnapshot>>>>,
}

impl NowPlaying {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, snapshot: StateSnapshot) {
        let mut slot = self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(snapshot));
    }

    pub fn clear(&self) {
        let mut slot = self.slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<StateSnapshot>> {
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Elapsed-time accounting that leaves out paused intervals.
///
/// On resume the start instant is moved forward by the length of the
/// pause, so `elapsed = now - started_at` at all times while playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayClock {
    started_at: Instant,
    paused_at: Option<Instant>,
}

impl PlayClock {
    pub fn start(now: Instant) -> Self {
        Self {
            started_at: now,
            paused_at: None,
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.started_at += now.saturating_duration_since(paused_at);
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.paused_at
            .unwrap_or(now)
            .saturating_duration_since(self.started_at)
    }
}

/// Background thread feeding [`SchedulerEvent::Tick`] into the session.
struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    fn spawn(tx: Sender<SchedulerEvent>, period: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("rotation-ticker".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    if tx.send(SchedulerEvent::Tick).is_err() {
                        break;
                    }
                }
            })
            .context("Failed to spawn ticker thread")?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Called with every published snapshot.
pub type SnapshotObserver = Box<dyn FnMut(&StateSnapshot) + Send>;

/// How one track's cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TrackEnd {
    Finished,
    Skipped,
    Failed(String),
    Exit,
}

/// Drives playback for the leader process.
pub struct Scheduler {
    library: SharedLibrary,
    player: Box<dyn Player>,
    probe: Arc<dyn DurationProbe>,
    cache: Option<CacheFile>,
    capacity: usize,
    tick: Duration,
    now_playing: NowPlaying,
    observers: Vec<SnapshotObserver>,
    events_tx: Sender<SchedulerEvent>,
    events_rx: Receiver<SchedulerEvent>,
    backlog: VecDeque<SchedulerEvent>,
    generation: u64,
    recomputes: u64,
    failures: usize,
}

impl Scheduler {
    pub fn new(
        library: SharedLibrary,
        player: Box<dyn Player>,
        probe: Arc<dyn DurationProbe>,
        capacity: usize,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            library,
            player,
            probe,
            cache: None,
            capacity,
            tick: Duration::from_millis(250),
            now_playing: NowPlaying::new(),
            observers: Vec::new(),
            events_tx,
            events_rx,
            backlog: VecDeque::new(),
            generation: 0,
            recomputes: 0,
            failures: 0,
        }
    }

    /// Save the library here after every track.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheFile) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Publish into an existing slot instead of a private one.
    #[must_use]
    pub fn with_now_playing(mut self, now_playing: NowPlaying) -> Self {
        self.now_playing = now_playing;
        self
    }

    pub fn add_observer(&mut self, observer: SnapshotObserver) {
        self.observers.push(observer);
    }

    #[must_use]
    pub fn signal_sender(&self) -> SignalSender {
        SignalSender {
            tx: self.events_tx.clone(),
        }
    }

    #[must_use]
    pub fn now_playing(&self) -> NowPlaying {
        self.now_playing.clone()
    }

    /// Recompute passes run so far.
    #[must_use]
    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }

    /// Play tracks until an `Exit` signal arrives.
    ///
    /// # Errors
    ///
    /// Fails if scoring fails (empty corpus, unresolvable duration) or if
    /// every track in the corpus fails to play in a row.
    pub fn begin_session(&mut self) -> Result<()> {
        let _ticker = Ticker::spawn(self.events_tx.clone(), self.tick)?;
        log::info!("Session started");

        loop {
            if self.exit_requested() {
                break;
            }

            let track = self.next_track()?;
            let end = self.play_one(&track)?;

            match end {
                TrackEnd::Exit => {
                    self.persist();
                    break;
                }
                TrackEnd::Finished | TrackEnd::Skipped => {
                    self.failures = 0;
                    self.persist();
                }
                TrackEnd::Failed(reason) => {
                    log::warn!("Could not play {}: {reason}", track.path.display());
                    self.failures += 1;

                    let corpus = library::lock(&self.library)?.len();
                    if self.failures >= corpus {
                        anyhow::bail!("No playable tracks: the last {} attempts all failed", self.failures);
                    }
                }
            }
        }

        self.now_playing.clear();
        log::info!("Session ended");
        Ok(())
    }

    fn next_event(&mut self) -> Result<SchedulerEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }
        self.events_rx.recv().context("Scheduler event channel closed")
    }

    fn drain_pending(&mut self) {
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => self.backlog.push_back(event),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Between tracks only `Exit` means anything; other signals were aimed
    /// at a track that has already ended.
    fn exit_requested(&mut self) -> bool {
        self.drain_pending();

        let mut exit = false;
        for event in self.backlog.drain(..) {
            match event {
                SchedulerEvent::Control(ControlSignal::Exit) => exit = true,
                SchedulerEvent::Control(signal) => log::debug!("Dropping {signal:?} received between tracks"),
                SchedulerEvent::Tick | SchedulerEvent::PlayerExited { .. } => {}
            }
        }
        exit
    }

    /// Completion already reported for `generation` but not yet handled.
    fn pending_completion(&mut self, generation: u64) -> Option<PlaybackOutcome> {
        self.drain_pending();

        let position = self.backlog.iter().position(
            |event| matches!(event, SchedulerEvent::PlayerExited { generation: g, .. } if *g == generation),
        )?;
        match self.backlog.remove(position) {
            Some(SchedulerEvent::PlayerExited { outcome, .. }) => Some(outcome),
            _ => None,
        }
    }

    /// Pop the next playlist entry, recomputing first if the playlist is used up.
    fn next_track(&mut self) -> Result<Track> {
        let mut library = library::lock(&self.library)?;

        if library.playlist().is_exhausted() {
            library.recompute_scores(self.probe.as_ref())?;
            library.rebuild_playlist(self.capacity);
            self.recomputes += 1;
            log::info!(
                "Recomputed scores (pass {}); playlist has {} tracks",
                self.recomputes,
                library.playlist().len()
            );
        }

        let index = library
            .next_entry()
            .ok_or_else(|| anyhow::anyhow!("Playlist is empty after rebuild"))?;
        library
            .track(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Playlist entry {index} is out of range"))
    }

    fn play_one(&mut self, track: &Track) -> Result<TrackEnd> {
        self.generation += 1;
        let generation = self.generation;

        let tx = self.events_tx.clone();
        let on_complete: Completion = Box::new(move |outcome| {
            let _ = tx.send(SchedulerEvent::PlayerExited { generation, outcome });
        });

        if let Err(e) = self.player.start(&track.path, on_complete) {
            return Ok(TrackEnd::Failed(format!("{e:#}")));
        }

        let mut clock = PlayClock::start(Instant::now());
        log::info!("Now playing {}", track.display_name());
        self.publish(track, Duration::ZERO);

        loop {
            match self.next_event()? {
                SchedulerEvent::Tick => self.publish(track, clock.elapsed(Instant::now())),
                SchedulerEvent::Control(ControlSignal::Pause) => {
                    if !clock.is_paused() {
                        if let Err(e) = self.player.pause() {
                            log::warn!("Pause failed: {e:#}");
                            continue;
                        }
                        clock.pause(Instant::now());
                        log::debug!("Paused");
                    }
                }
                SchedulerEvent::Control(ControlSignal::Resume) => {
                    if clock.is_paused() {
                        if let Err(e) = self.player.resume() {
                            log::warn!("Resume failed: {e:#}");
                            continue;
                        }
                        clock.resume(Instant::now());
                        log::debug!("Resumed");
                    }
                }
                SchedulerEvent::Control(ControlSignal::Skip) => {
                    if let Some(outcome) = self.pending_completion(generation) {
                        log::debug!("Skip arrived after the track ended; counting it as played");
                        return Ok(self.finish(track, outcome, &clock));
                    }

                    self.stop_player();
                    let listened = clock.elapsed(Instant::now());
                    library::lock(&self.library)?.mark_skipped(&track.path, SystemTime::now(), listened);
                    log::info!("Skipped {}", track.display_name());
                    return Ok(TrackEnd::Skipped);
                }
                SchedulerEvent::Control(ControlSignal::Exit) => {
                    self.stop_player();
                    let listened = clock.elapsed(Instant::now());
                    library::lock(&self.library)?.mark_played(&track.path, SystemTime::now(), listened);
                    return Ok(TrackEnd::Exit);
                }
                SchedulerEvent::PlayerExited { generation: g, outcome } if g == generation => {
                    return Ok(self.finish(track, outcome, &clock));
                }
                SchedulerEvent::PlayerExited { generation: g, .. } => {
                    log::trace!("Ignoring completion from stale track {g}");
                }
            }
        }
    }

    fn finish(&self, track: &Track, outcome: PlaybackOutcome, clock: &PlayClock) -> TrackEnd {
        match outcome {
            PlaybackOutcome::Finished => {
                let listened = clock.elapsed(Instant::now());
                match library::lock(&self.library) {
                    Ok(mut library) => {
                        library.mark_played(&track.path, SystemTime::now(), listened);
                    }
                    Err(e) => log::error!("Could not record play: {e:#}"),
                }
                log::debug!("Finished {}", track.display_name());
                TrackEnd::Finished
            }
            PlaybackOutcome::Failed(reason) => TrackEnd::Failed(reason),
        }
    }

    fn stop_player(&mut self) {
        if let Err(e) = self.player.stop() {
            log::warn!("Failed to stop player: {e:#}");
        }
    }

    fn publish(&mut self, track: &Track, elapsed: Duration) {
        let snapshot = StateSnapshot {
            track_name: track.display_name(),
            elapsed,
            total_length: track.duration,
            score: track.play_info.score,
        };

        for observer in &mut self.observers {
            observer(&snapshot);
        }
        self.now_playing.replace(snapshot);
    }

    fn persist(&self) {
        let Some(cache) = &self.cache else {
            return;
        };

        let result = library::lock(&self.library).and_then(|library| cache.save(&library));
        if let Err(e) = result {
            log::warn!("Failed to save library cache: {e:#}");
        }
    }
}
