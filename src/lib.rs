//! Single-user music player that ranks its library by play and skip history.
//!
//! Core modules:
//! - [`algorithm`] - per-track scoring
//! - [`library`] - track corpus, statistics and the active playlist
//! - [`scheduler`] - plays the playlist and reacts to control signals
//! - [`coordinator`] - one leader per socket, followers relay commands
//! - [`protocol`] - framed messages between leader and follower
//!
//! ### Supporting Modules
//!
//! - [`scan`] - music directory walk and duration probing
//! - [`cache`] - persisted library
//! - [`config`] - settings file and data directories
//! - [`player`] - audio playback through an external decoder
//! - [`display`] - status line and typed commands
//! - [`signals`] - SIGINT/SIGTERM/SIGQUIT handling
//! - [`daemon`] - leader and follower process wiring
//! - [`cli`], [`completion`] - command line
//!
//! ## Quick Start Example
//!
//! ```
//! use rotation::library::{Library, Track};
//! use rotation::scan::DurationProbe;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! struct Known;
//! impl DurationProbe for Known {
//!     fn probe(&self, _: &Path) -> anyhow::Result<Duration> {
//!         Ok(Duration::from_secs(200))
//!     }
//! }
//!
//! let mut library = Library::new(vec![
//!     Track::new("/music/a.mp3", Duration::from_secs(200)),
//!     Track::new("/music/b.mp3", Duration::from_secs(180)),
//!     Track::new("/music/c.mp3", Duration::from_secs(240)),
//! ]);
//!
//! library.recompute_scores(&Known)?;
//! library.rebuild_playlist(2);
//!
//! let first = library.next_entry().expect("playlist has entries");
//! let path = library.tracks()[first].path.clone();
//! assert!(library.mark_skipped(&path, std::time::SystemTime::now(), Duration::from_secs(4)));
//! assert_eq!(library.tracks()[first].play_info.total_skips, 1);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Scoring
//!
//! Each recompute pass scores every track against the statistics of the
//! previous pass:
//!
//! - never-scored tracks are scattered randomly across the range
//! - tracks skipped since the last pass lose points, more for repeat skips
//! - tracks left unplayed gain points each pass until they are played
//! - tracks just played decay halfway toward the library average
//!
//! The playlist is then the top of the sorted library, capped at
//! `max_playlist_size`.

pub mod algorithm;
pub mod cache;
pub mod cli;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod display;
pub mod library;
pub mod player;
pub mod protocol;
pub mod scan;
pub mod scheduler;
pub mod signals;
