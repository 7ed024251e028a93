//! # Audio Playback
//!
//! The scheduler drives audio through the [`Player`] trait: start a track
//! with a completion callback, then pause, resume or stop it.
//!
//! [`ProcessPlayer`] is the production backend. It runs an external decoder
//! (by default `ffplay`) as a child process per track, suspends it with
//! `SIGSTOP`/`SIGCONT`, and reports the outcome from a waiter thread once
//! the child exits. Each child runs in its own process group, so a
//! terminal Ctrl-C reaches only the leader, which then stops the child.
//!
//! At most one track plays at a time: starting a track stops the previous
//! one, and every method takes `&mut self`, so a single owner serialises
//! all playback.

use anyhow::{Context, Result};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long `stop` waits after `SIGTERM` before escalating to `SIGKILL`.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// How a track's playback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to the end, or stopped on request.
    Finished,
    /// The backend could not play the file.
    Failed(String),
}

/// Invoked exactly once when a started track ends.
pub type Completion = Box<dyn FnOnce(PlaybackOutcome) + Send + 'static>;

/// Audio backend.
pub trait Player: Send {
    /// Begin playing `path`, stopping anything already playing.
    ///
    /// `on_complete` runs on a background thread when the track ends,
    /// including when it is stopped. It is not run if `start` fails.
    fn start(&mut self, path: &Path, on_complete: Completion) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Stop the current track. A no-op if nothing is playing.
    fn stop(&mut self) -> Result<()>;
}

struct RunningTrack {
    pid: libc::pid_t,
    paused: bool,
    stopping: Arc<AtomicBool>,
    exited: Receiver<()>,
}

/// Plays each track in a child process.
pub struct ProcessPlayer {
    program: String,
    args: Vec<String>,
    current: Option<RunningTrack>,
}

impl ProcessPlayer {
    /// `command` is the program followed by its leading arguments; the track path is appended.
    ///
    /// # Errors
    ///
    /// Returns an error if `command` is empty.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("player_command must name a program"))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            current: None,
        })
    }

    /// True while a child is running or suspended.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Drop the current track if its child has already been reaped, so its
    /// pid is never signalled again.
    fn forget_exited(&mut self) {
        let exited = self
            .current
            .as_ref()
            .is_some_and(|track| !matches!(track.exited.try_recv(), Err(mpsc::TryRecvError::Empty)));
        if exited {
            self.current = None;
        }
    }

    fn signal(pid: libc::pid_t, signal: libc::c_int) -> Result<()> {
        // SAFETY: kill has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone; the waiter will report it.
            return Ok(());
        }
        Err(err).with_context(|| format!("Failed to send signal {signal} to player process {pid}"))
    }

    fn spawn_waiter(mut child: Child, stopping: Arc<AtomicBool>, on_complete: Completion) -> Receiver<()> {
        let (exited_tx, exited_rx) = mpsc::channel();

        thread::spawn(move || {
            let outcome = match child.wait() {
                Ok(_) if stopping.load(Ordering::SeqCst) => PlaybackOutcome::Finished,
                Ok(status) if status.success() => PlaybackOutcome::Finished,
                Ok(status) => PlaybackOutcome::Failed(format!("player exited with {status}")),
                Err(e) => PlaybackOutcome::Failed(format!("failed to wait for player: {e}")),
            };
            let _ = exited_tx.send(());
            on_complete(outcome);
        });

        exited_rx
    }
}

impl Player for ProcessPlayer {
    fn start(&mut self, path: &Path, on_complete: Completion) -> Result<()> {
        self.stop()?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to launch {} for {}", self.program, path.display()))?;

        let pid = libc::pid_t::try_from(child.id()).context("Player pid out of range")?;
        log::debug!("Started {} (pid {pid}) for {}", self.program, path.display());

        let stopping = Arc::new(AtomicBool::new(false));
        let exited = Self::spawn_waiter(child, Arc::clone(&stopping), on_complete);

        self.current = Some(RunningTrack {
            pid,
            paused: false,
            stopping,
            exited,
        });
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.forget_exited();
        if let Some(track) = self.current.as_mut() {
            if !track.paused {
                Self::signal(track.pid, libc::SIGSTOP)?;
                track.paused = true;
            }
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.forget_exited();
        if let Some(track) = self.current.as_mut() {
            if track.paused {
                Self::signal(track.pid, libc::SIGCONT)?;
                track.paused = false;
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(track) = self.current.take() else {
            return Ok(());
        };

        // Already exited on its own.
        if !matches!(track.exited.try_recv(), Err(mpsc::TryRecvError::Empty)) {
            return Ok(());
        }

        track.stopping.store(true, Ordering::SeqCst);
        if track.paused {
            Self::signal(track.pid, libc::SIGCONT)?;
        }
        Self::signal(track.pid, libc::SIGTERM)?;

        match track.exited.recv_timeout(STOP_GRACE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Player process {} ignored SIGTERM; killing it", track.pid);
                Self::signal(track.pid, libc::SIGKILL)
            }
        }
    }
}

impl Drop for ProcessPlayer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop player on shutdown: {e:#}");
        }
    }
}
