//! # Command-Line Interface Module
//!
//! Clap derive definitions for the `rotation` binary.
//!
//! ## Commands
//!
//! - `run` (default): play, or attach to the player that is already running
//! - `list`: show the cached library by score
//! - `rescan`: pick up new files in the music directory
//! - `completion`: print a shell completion script
//!
//! ## Examples
//!
//! ```bash
//! rotation                      # start playing, or attach to the running player
//! rotation list --limit 20
//! rotation --config ~/alt.json rescan
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

/// Main application arguments.
///
/// Running without a subcommand is the same as `rotation run`.
#[derive(Parser, Debug)]
#[command(name = "rotation")]
#[command(about = "Rotation: a music player that learns what you skip")]
#[command(version)]
pub struct Args {
    /// Config file (default: <config dir>/rotation/config.json)
    #[arg(long, global = true, env = "ROTATION_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Library cache file (default: <data dir>/rotation/library.json)
    #[arg(long, global = true, env = "ROTATION_CACHE", value_hint = clap::ValueHint::FilePath)]
    pub cache: Option<PathBuf>,

    /// Coordination socket, overriding `socket_path` from the config
    #[arg(long, global = true, env = "ROTATION_SOCKET", value_hint = clap::ValueHint::FilePath)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Args {
    /// The subcommand to run, defaulting to [`Command::Run`].
    #[must_use]
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Play music, or attach to the player that is already running
    ///
    /// The first process started against a socket plays; later ones show
    /// what is playing and pass on commands typed at their prompt
    /// (p pause, r resume, s skip, q quit, d detach).
    Run,

    /// List the cached library, highest score first
    List {
        /// Show at most this many tracks
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Scan the music directory for new and removed files
    ///
    /// Play history of tracks already in the library is kept.
    Rescan,

    /// Generate shell completions
    ///
    /// Usage: rotation completion bash > ~/.local/share/bash-completion/completions/rotation
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}
