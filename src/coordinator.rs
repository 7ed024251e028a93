//! # Instance Coordination
//!
//! One process per socket path owns playback (the leader). Every other
//! process started against the same path becomes a follower: it renders
//! the leader's snapshots and forwards the user's control signals.
//!
//! ## Role selection
//!
//! [`determine_role`] tries to connect first. If nothing answers it binds
//! the path. A bind that fails with "address in use" gets one more
//! connect attempt; only if that also fails is the file treated as stale,
//! removed and bound again. The operating system's bind uniqueness is the
//! only arbiter of who leads.
//!
//! ## Leader threads
//!
//! - **accept**: takes connections and spawns a reader per follower
//! - **reader**: forwards `Control` frames into the scheduler
//! - **relay**: owns the current follower and writes snapshots to it
//!
//! Only one follower is serviced at a time; the most recently accepted
//! one wins and the previous connection is closed. The leader never
//! blocks on a slow or missing follower: writes have a timeout, and a
//! snapshot that cannot be written promptly is dropped.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol::{self, ControlSignal, FrameReader, Message, StateSnapshot};
use crate::scheduler::{NowPlaying, SignalSender, SnapshotObserver};

/// Longest a snapshot write may block before the snapshot is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause before the follower's single retry of a failed send.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Which part this process plays.
#[derive(Debug)]
pub enum Role {
    Leader(LeaderEndpoint),
    Follower(FollowerLink),
}

impl Role {
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }
}

/// Connect to an existing leader at `path`, or become the leader.
///
/// # Errors
///
/// Returns an error if the socket can be neither reached nor bound, for
/// example when its directory is not writable.
pub fn determine_role(path: &Path) -> Result<Role> {
    if let Ok(stream) = UnixStream::connect(path) {
        log::info!("Found a running leader at {}", path.display());
        return Ok(Role::Follower(FollowerLink::new(stream)));
    }

    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            if let Ok(stream) = UnixStream::connect(path) {
                return Ok(Role::Follower(FollowerLink::new(stream)));
            }

            log::warn!("Removing stale socket {}", path.display());
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
            UnixListener::bind(path)
                .with_context(|| format!("Failed to bind {}", path.display()))?
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to bind {}", path.display())),
    };

    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;

    log::info!("Leading on {}", path.display());
    Ok(Role::Leader(LeaderEndpoint {
        listener,
        path: path.to_path_buf(),
    }))
}

/// A bound socket waiting for followers.
#[derive(Debug)]
pub struct LeaderEndpoint {
    listener: UnixListener,
    path: PathBuf,
}

enum RelayEvent {
    Snapshot(StateSnapshot),
    Connected { id: u64, stream: UnixStream },
    Disconnected { id: u64 },
}

struct Peer {
    id: u64,
    stream: UnixStream,
}

impl LeaderEndpoint {
    /// Start serving followers.
    ///
    /// Control frames go to `signals`; a follower that connects is sent
    /// the snapshot currently in `now_playing` straight away.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker threads cannot be spawned.
    pub fn serve(self, signals: SignalSender, now_playing: NowPlaying) -> Result<LeaderHandle> {
        let (relay_tx, relay_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        thread::Builder::new()
            .name("rotation-relay".into())
            .spawn(move || relay_loop(relay_rx, now_playing))
            .context("Failed to spawn relay thread")?;

        let accept_tx = relay_tx.clone();
        let accept_stop = Arc::clone(&stop);
        let listener = self.listener;
        let accept = thread::Builder::new()
            .name("rotation-accept".into())
            .spawn(move || accept_loop(listener, accept_tx, signals, accept_stop))
            .context("Failed to spawn accept thread")?;

        Ok(LeaderHandle {
            relay_tx,
            path: self.path,
            stop,
            accept: Some(accept),
        })
    }
}

fn accept_loop(listener: UnixListener, relay_tx: Sender<RelayEvent>, signals: SignalSender, stop: Arc<AtomicBool>) {
    let mut next_id = 0u64;

    for conn in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Failed to accept follower: {e}");
                continue;
            }
        };

        next_id += 1;
        let id = next_id;

        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                log::warn!("Failed to clone follower stream: {e}");
                continue;
            }
        };

        log::info!("Follower {id} connected");
        if relay_tx.send(RelayEvent::Connected { id, stream }).is_err() {
            break;
        }

        let signals = signals.clone();
        let relay_tx = relay_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("rotation-follower-{id}"))
            .spawn(move || {
                read_controls(id, reader, &signals);
                let _ = relay_tx.send(RelayEvent::Disconnected { id });
            });
        if let Err(e) = spawned {
            log::warn!("Failed to spawn reader for follower {id}: {e}");
        }
    }

    log::debug!("Accept loop finished");
}

fn read_controls(id: u64, stream: UnixStream, signals: &SignalSender) {
    let mut reader = FrameReader::new(stream);

    loop {
        match reader.read_message() {
            Ok(Some(Message::Control { signal })) => {
                log::debug!("Follower {id} sent {signal:?}");
                if !signals.send(signal) {
                    break;
                }
            }
            Ok(Some(Message::Snapshot(_))) => {
                log::warn!("Follower {id} sent a snapshot; ignoring");
            }
            Ok(None) => break,
            Err(e) if protocol::is_transient(&e) => continue,
            Err(e) => {
                log::debug!("Follower {id} read failed: {e}");
                break;
            }
        }
    }

    log::info!("Follower {id} disconnected");
}

/// Snapshots queued while a write was blocked are coalesced: only the
/// newest one is written, so a stalled follower never builds a backlog.
fn relay_loop(events: Receiver<RelayEvent>, now_playing: NowPlaying) {
    let mut peer: Option<Peer> = None;

    while let Ok(first) = events.recv() {
        let mut latest = None;

        for event in std::iter::once(first).chain(events.try_iter()) {
            match event {
                RelayEvent::Snapshot(snapshot) => {
                    if latest.replace(snapshot).is_some() {
                        log::trace!("Coalesced a queued snapshot");
                    }
                }
                RelayEvent::Connected { id, stream } => {
                    if let Some(old) = peer.take() {
                        log::info!("Follower {id} replaces follower {}", old.id);
                        let _ = old.stream.shutdown(Shutdown::Both);
                    }
                    // Anything queued so far predates the current snapshot it is sent.
                    latest = None;
                    peer = attach(id, stream, &now_playing);
                }
                RelayEvent::Disconnected { id } => {
                    if peer.as_ref().is_some_and(|current| current.id == id) {
                        peer = None;
                    }
                }
            }
        }

        let (Some(snapshot), Some(current)) = (latest, peer.as_mut()) else {
            continue;
        };
        if !send_snapshot(current, &snapshot) {
            peer = None;
        }
    }

    log::debug!("Relay loop finished");
}

/// Prepare a freshly accepted follower and send it the current snapshot.
fn attach(id: u64, stream: UnixStream, now_playing: &NowPlaying) -> Option<Peer> {
    if let Err(e) = stream.set_write_timeout(Some(WRITE_TIMEOUT)) {
        log::warn!("Failed to set write timeout for follower {id}: {e}");
    }

    let mut fresh = Peer { id, stream };
    let delivered = match now_playing.current() {
        Some(snapshot) => send_snapshot(&mut fresh, &snapshot),
        None => true,
    };
    delivered.then_some(fresh)
}

/// Returns false if the peer should be dropped.
fn send_snapshot(peer: &mut Peer, snapshot: &StateSnapshot) -> bool {
    match protocol::write_message(&mut peer.stream, &Message::Snapshot(snapshot.clone())) {
        Ok(()) => true,
        Err(e) if protocol::is_transient(&e) => {
            log::debug!("Follower {} is slow; dropping a snapshot", peer.id);
            true
        }
        Err(e) => {
            log::info!("Dropping follower {}: {e}", peer.id);
            let _ = peer.stream.shutdown(Shutdown::Both);
            false
        }
    }
}

/// A serving leader. Dropping it stops accepting and removes the socket file.
pub struct LeaderHandle {
    relay_tx: Sender<RelayEvent>,
    path: PathBuf,
    stop: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl LeaderHandle {
    /// Scheduler observer that forwards every snapshot to the follower.
    #[must_use]
    pub fn observer(&self) -> SnapshotObserver {
        let tx = self.relay_tx.clone();
        Box::new(move |snapshot: &StateSnapshot| {
            let _ = tx.send(RelayEvent::Snapshot(snapshot.clone()));
        })
    }
}

impl Drop for LeaderHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it notices the flag.
        let _ = UnixStream::connect(&self.path);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }

        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                log::warn!("Failed to remove socket {}: {e}", self.path.display());
            }
        }
    }
}

/// Input to a running follower.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Forward to the leader.
    Signal(ControlSignal),
    /// Leave without touching the leader.
    Detach,
    LeaderClosed,
}

/// Why [`FollowerLink::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerExit {
    /// `Exit` was sent to the leader.
    Exited,
    Detached,
    LeaderClosed,
}

/// A connection to the leader.
#[derive(Debug)]
pub struct FollowerLink {
    stream: UnixStream,
}

impl FollowerLink {
    fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Render snapshots and forward signals until exit, detach or leader loss.
    ///
    /// `tx` must be the sending half of `rx`; the socket reader uses it to
    /// report the leader going away.
    ///
    /// # Errors
    ///
    /// Returns an error if a signal cannot be delivered after one retry.
    pub fn run<F>(self, tx: Sender<ViewerEvent>, rx: Receiver<ViewerEvent>, mut render: F) -> Result<FollowerExit>
    where
        F: FnMut(&StateSnapshot) + Send + 'static,
    {
        let mut writer = self.stream;
        writer
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .context("Failed to set socket write timeout")?;

        let reader = writer.try_clone().context("Failed to clone leader stream")?;
        thread::Builder::new()
            .name("rotation-viewer".into())
            .spawn(move || {
                let mut frames = FrameReader::new(reader);
                loop {
                    match frames.read_message() {
                        Ok(Some(Message::Snapshot(snapshot))) => render(&snapshot),
                        Ok(Some(Message::Control { .. })) => log::warn!("Leader sent a control frame; ignoring"),
                        Ok(None) => break,
                        Err(e) if protocol::is_transient(&e) => continue,
                        Err(e) => {
                            log::debug!("Leader read failed: {e}");
                            break;
                        }
                    }
                }
                let _ = tx.send(ViewerEvent::LeaderClosed);
            })
            .context("Failed to spawn viewer thread")?;

        for event in rx {
            match event {
                ViewerEvent::Signal(signal) => {
                    send_signal(&mut writer, signal)?;
                    if signal == ControlSignal::Exit {
                        let _ = writer.shutdown(Shutdown::Both);
                        return Ok(FollowerExit::Exited);
                    }
                }
                ViewerEvent::Detach => {
                    let _ = writer.shutdown(Shutdown::Both);
                    return Ok(FollowerExit::Detached);
                }
                ViewerEvent::LeaderClosed => return Ok(FollowerExit::LeaderClosed),
            }
        }

        Ok(FollowerExit::LeaderClosed)
    }
}

/// Send one control frame, retrying once after a short pause on a transient error.
fn send_signal(writer: &mut UnixStream, signal: ControlSignal) -> Result<()> {
    let message = Message::Control { signal };

    match protocol::write_message(writer, &message) {
        Ok(()) => Ok(()),
        Err(e) if protocol::is_transient(&e) => {
            log::debug!("Transient send failure ({e}); retrying");
            // The viewer thread keeps draining the leader meanwhile.
            thread::sleep(RETRY_BACKOFF);
            protocol::write_message(writer, &message)
                .with_context(|| format!("Failed to send {signal:?} to the leader"))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to send {signal:?} to the leader")),
    }
}
