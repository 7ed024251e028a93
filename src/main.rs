//! # Rotation - a music player that learns from skips
//!
//! Plays the tracks in a music directory, highest score first, and rescores
//! the whole library every time the playlist runs out. Skipped tracks sink,
//! neglected ones rise.
//!
//! Starting `rotation` a second time does not start a second player: the
//! new process attaches to the running one, shows what is playing and
//! passes commands through.
//!
//! ## Usage
//!
//! ```bash
//! rotation            # play, or attach to the running player
//! rotation list       # library by score
//! rotation rescan     # pick up new files
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};

use rotation::cache::CacheFile;
use rotation::cli::{Args, Command};
use rotation::config::{Config, RuntimeConfig};
use rotation::scan::TagProbe;
use rotation::signals::TerminationSignals;
use rotation::{completion, daemon};

/// Main entry point.
///
/// Logging goes to stderr through `env_logger` and is controlled by `RUST_LOG`:
/// - `RUST_LOG=debug rotation` - everything
/// - `RUST_LOG=rotation::coordinator=trace rotation` - one module
fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let command = args.subcommand();

    if let Command::Completion { shell } = command {
        completion::print_completions(shell);
        return Ok(());
    }

    let runtime = RuntimeConfig::resolve(args.config, args.cache, args.socket)?;
    let config = Config::load_or_create(&runtime.config_path)?;
    debug!("Using config {:?}", runtime.config_path);

    match command {
        Command::Run => {
            // Still single-threaded here, so every thread inherits the mask.
            // Other commands keep the default dispositions and die on Ctrl-C.
            let signals = TerminationSignals::block()?;
            daemon::run(&config, &runtime, signals)?;
        }
        Command::List { limit } => daemon::list(&CacheFile::new(&runtime.cache_path), limit)?,
        Command::Rescan => {
            info!("Rescanning {}", config.music_dir.display());
            let report = daemon::rescan(&config, &CacheFile::new(&runtime.cache_path), &TagProbe)
                .with_context(|| format!("Rescan of {} failed", config.music_dir.display()))?;
            println!(
                "{} added, {} removed, {} tracks in the library",
                report.added, report.removed, report.total
            );
        }
        Command::Completion { .. } => {}
    }

    Ok(())
}
