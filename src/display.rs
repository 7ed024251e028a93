//! Terminal front end: one-line status rendering and line-based key input.
//!
//! Commands are typed one per line and confirmed with Enter:
//!
//! | input            | effect                               |
//! |------------------|--------------------------------------|
//! | `p`, `pause`     | pause                                |
//! | `r`, `resume`    | resume                               |
//! | `s`, `n`, `skip` | skip to the next track               |
//! | `q`, `quit`      | stop playback and exit               |
//! | `d`, `detach`    | leave a follower; the leader plays on |

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::protocol::{ControlSignal, StateSnapshot};

/// A parsed input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayCommand {
    Signal(ControlSignal),
    Detach,
}

/// Hint shown for unrecognised input.
pub const USAGE: &str = "Try 'p' (pause), 'r' (resume), 's' (skip), 'q' (quit) or 'd' (detach)";

/// Parse one input line. Blank lines and unknown words yield `None`.
#[must_use]
pub fn parse_line(line: &str) -> Option<DisplayCommand> {
    let command = match line.trim().to_ascii_lowercase().as_str() {
        "p" | "pause" => DisplayCommand::Signal(ControlSignal::Pause),
        "r" | "resume" | "play" => DisplayCommand::Signal(ControlSignal::Resume),
        "s" | "n" | "skip" | "next" => DisplayCommand::Signal(ControlSignal::Skip),
        "q" | "quit" | "exit" | "stop" => DisplayCommand::Signal(ControlSignal::Exit),
        "d" | "detach" => DisplayCommand::Detach,
        _ => return None,
    };
    Some(command)
}

/// Read commands from `input` on a background thread, handing each to `sink`.
///
/// The thread ends at end of input, on a read error, or when `sink`
/// returns false.
///
/// # Errors
///
/// Returns an error if the thread cannot be spawned.
pub fn spawn_input<R, F>(input: R, mut sink: F) -> Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
    F: FnMut(DisplayCommand) -> bool + Send + 'static,
{
    thread::Builder::new()
        .name("rotation-input".into())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("Stopped reading input: {e}");
                        return;
                    }
                };

                if line.trim().is_empty() {
                    continue;
                }

                match parse_line(&line) {
                    Some(command) => {
                        if !sink(command) {
                            return;
                        }
                    }
                    None => log::warn!("Unrecognized command '{}'. {USAGE}", line.trim()),
                }
            }
            log::debug!("Input closed");
        })
        .context("Failed to spawn input thread")
}

/// `mm:ss`, with minutes allowed past 59.
#[must_use]
pub fn fmt_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Status text for one snapshot.
#[must_use]
pub fn status_text(snapshot: &StateSnapshot) -> String {
    format!(
        "♫ {}  {} / {}  (score {:.1})",
        snapshot.track_name,
        fmt_duration(snapshot.elapsed),
        fmt_duration(snapshot.total_length),
        snapshot.score
    )
}

/// Redraws a single terminal line in place.
pub struct StatusLine<W: Write> {
    out: W,
}

impl StatusLine<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> StatusLine<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn render(&mut self, snapshot: &StateSnapshot) -> io::Result<()> {
        write!(self.out, "\r\x1b[2K{}", status_text(snapshot))?;
        self.out.flush()
    }

    /// Move past the status line so later output starts clean.
    pub fn finish(&mut self) -> io::Result<()> {
        writeln!(self.out)?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
