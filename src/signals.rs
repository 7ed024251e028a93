//! Termination signal handling.
//!
//! `SIGINT`, `SIGTERM` and `SIGQUIT` are blocked process-wide and collected
//! synchronously with `sigwait` on a dedicated thread, which turns the
//! first one into a graceful shutdown request. A second signal while that
//! shutdown is in progress exits immediately.
//!
//! [`TerminationSignals::block`] must run before any other thread is
//! spawned so every thread inherits the mask.

use anyhow::{Context, Result};
use std::thread::{self, JoinHandle};

/// Signals treated as a request to stop.
pub const TERMINATION_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGQUIT];

/// Exit status used when a second signal forces an immediate exit.
const FORCED_EXIT_STATUS: i32 = 130;

/// The blocked termination signal set.
#[derive(Clone, Copy)]
pub struct TerminationSignals {
    set: libc::sigset_t,
}

impl TerminationSignals {
    /// Block the termination signals for the calling thread and any thread it spawns later.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal mask cannot be changed.
    pub fn block() -> Result<Self> {
        // SAFETY: sigset_t is plain data; sigemptyset initialises it before use.
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        // SAFETY: `set` is a valid, initialised sigset_t for all calls below.
        unsafe {
            libc::sigemptyset(&mut set);
            for signal in TERMINATION_SIGNALS {
                libc::sigaddset(&mut set, signal);
            }
        }

        // SAFETY: `set` is initialised; a null old-set pointer is allowed.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc)).context("Failed to block termination signals");
        }

        Ok(Self { set })
    }

    /// Wait for the next termination signal and return its number.
    ///
    /// # Errors
    ///
    /// Returns an error if `sigwait` fails.
    pub fn wait(&self) -> Result<libc::c_int> {
        let mut signal: libc::c_int = 0;
        // SAFETY: both pointers refer to valid locals.
        let rc = unsafe { libc::sigwait(&self.set, &mut signal) };
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc)).context("sigwait failed");
        }
        Ok(signal)
    }

    /// Wait for signals on a dedicated thread. The first one calls
    /// `on_signal`; a second one exits the process at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn_translator<F>(self, on_signal: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce(libc::c_int) + Send + 'static,
    {
        thread::Builder::new()
            .name("rotation-signals".into())
            .spawn(move || {
                let mut on_signal = Some(on_signal);
                loop {
                    let signal = match self.wait() {
                        Ok(signal) => signal,
                        Err(e) => {
                            log::error!("{e:#}");
                            return;
                        }
                    };

                    match on_signal.take() {
                        Some(handler) => {
                            log::info!("Received signal {signal}; shutting down");
                            handler(signal);
                        }
                        None => {
                            log::warn!("Received signal {signal} again; exiting immediately");
                            std::process::exit(FORCED_EXIT_STATUS);
                        }
                    }
                }
            })
            .context("Failed to spawn signal thread")
    }
}
