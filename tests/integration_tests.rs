//! # Integration Tests for Rotation
//!
//! End-to-end checks through the public API: library loading from a music
//! directory, a full scheduler session driven by control signals, and the
//! leader/follower socket.

use anyhow::{bail, Result};
use std::fs;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use rotation::cache::CacheFile;
use rotation::config::Config;
use rotation::coordinator::{self, Role};
use rotation::library::{self, Library, Track};
use rotation::player::{Completion, PlaybackOutcome, Player};
use rotation::protocol::{self, ControlSignal, FrameReader, Message, StateSnapshot};
use rotation::scan::DurationProbe;
use rotation::scheduler::{NowPlaying, Scheduler, SchedulerEvent, SignalSender};

/// Durations looked up by file name; missing files fail like unreadable ones.
struct NameProbe(Vec<(&'static str, u64)>);

impl DurationProbe for NameProbe {
    fn probe(&self, path: &Path) -> Result<Duration> {
        if !path.exists() {
            bail!("{} does not exist", path.display());
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        match self.0.iter().find(|(n, _)| *n == name) {
            Some((_, secs)) => Ok(Duration::from_secs(*secs)),
            None => bail!("no duration for {name}"),
        }
    }
}

fn write_audio(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(&[0u8; 4096]).unwrap();
    path
}

/// A music directory with two long tracks and one ten second jingle.
fn music_fixture() -> (TempDir, Config, NameProbe) {
    let temp = TempDir::new().unwrap();
    let music = temp.path().join("music");
    fs::create_dir(&music).unwrap();
    write_audio(&music, "a.mp3");
    write_audio(&music, "b.flac");
    write_audio(&music, "jingle.ogg");
    fs::write(music.join("cover.jpg"), [0u8; 4096]).unwrap();

    let config = Config {
        music_dir: music,
        ..Config::default()
    };
    let probe = NameProbe(vec![("a.mp3", 120), ("b.flac", 180), ("jingle.ogg", 10)]);
    (temp, config, probe)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};
    use std::time::Instant;

    #[test]
    fn test_list_dies_on_sigterm_while_blocked_on_output() -> Result<()> {
        let temp = TempDir::new()?;
        let cache = CacheFile::new(temp.path().join("library.json"));
        let tracks = (0..5_000)
            .map(|i| Track::new(format!("/music/artist{}/track{i}.flac", i % 40), Duration::from_secs(200)))
            .collect();
        cache.save(&Library::new(tracks))?;

        // Nobody reads stdout, so the table fills the pipe and `list` blocks.
        let mut child = Command::new(env!("CARGO_BIN_EXE_rotation"))
            .arg("--config")
            .arg(temp.path().join("config.json"))
            .arg("--cache")
            .arg(cache.path())
            .arg("list")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        thread::sleep(Duration::from_millis(500));

        let pid = libc::pid_t::try_from(child.id())?;
        // SAFETY: plain libc call on our own child.
        assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() > deadline {
                child.kill()?;
                panic!("`rotation list` ignored SIGTERM");
            }
            thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        Ok(())
    }
}

#[cfg(test)]
mod library_tests {
    use super::*;
    use rotation::daemon;

    #[test]
    fn test_first_run_scans_and_drops_short_tracks() -> Result<()> {
        let (temp, config, probe) = music_fixture();
        let cache = CacheFile::new(temp.path().join("library.json"));

        let library = daemon::load_library(&config, &cache, &probe)?;
        let mut names: Vec<String> = library.tracks().iter().map(Track::display_name).collect();
        names.sort();
        assert_eq!(names, vec!["a.mp3", "b.flac"]);
        assert!(library.is_pruned());
        assert!(cache.path().exists(), "scan result is cached");
        Ok(())
    }

    #[test]
    fn test_second_run_uses_cache_and_keeps_history() -> Result<()> {
        let (temp, config, probe) = music_fixture();
        let cache = CacheFile::new(temp.path().join("library.json"));

        let mut library = daemon::load_library(&config, &cache, &probe)?;
        let path = config.music_dir.join("a.mp3");
        assert!(library.mark_skipped(&path, std::time::SystemTime::now(), Duration::from_secs(3)));
        cache.save(&library)?;

        let reloaded = daemon::load_library(&config, &cache, &probe)?;
        let track = &reloaded.tracks()[reloaded.position(&path).unwrap()];
        assert_eq!(track.play_info.total_skips, 1);
        assert_eq!(reloaded.stats().total_skips, 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_cache_falls_back_to_scan() -> Result<()> {
        let (temp, config, probe) = music_fixture();
        let cache_path = temp.path().join("library.json");
        fs::write(&cache_path, b"{ not json")?;

        let library = daemon::load_library(&config, &CacheFile::new(&cache_path), &probe)?;
        assert_eq!(library.len(), 2);
        Ok(())
    }

    #[test]
    fn test_empty_music_dir_is_fatal() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            music_dir: temp.path().to_path_buf(),
            ..Config::default()
        };
        let cache = CacheFile::new(temp.path().join("library.json"));
        assert!(daemon::load_library(&config, &cache, &NameProbe(Vec::new())).is_err());
    }

    #[test]
    fn test_rescan_reports_new_and_removed_files() -> Result<()> {
        let (temp, config, mut probe) = music_fixture();
        let cache = CacheFile::new(temp.path().join("library.json"));
        daemon::load_library(&config, &cache, &probe)?;

        fs::remove_file(config.music_dir.join("b.flac"))?;
        write_audio(&config.music_dir, "c.opus");
        probe.0.push(("c.opus", 240));

        let report = daemon::rescan(&config, &cache, &probe)?;
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.total, 2);
        Ok(())
    }

    #[test]
    fn test_config_created_then_malformed_rejected() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("nested").join("config.json");

        let created = Config::load_or_create(&path)?;
        assert!(path.exists());
        assert_eq!(Config::load_or_create(&path)?, created);

        fs::write(&path, "max_playlist_size = 3")?;
        let err = Config::load_or_create(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Malformed config"));
        Ok(())
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;

    /// Holds every track until stopped and reports each start.
    struct ReportingPlayer {
        started: Sender<PathBuf>,
        pending: Option<Completion>,
    }

    impl Player for ReportingPlayer {
        fn start(&mut self, path: &Path, on_complete: Completion) -> Result<()> {
            self.stop()?;
            self.pending = Some(on_complete);
            let _ = self.started.send(path.to_path_buf());
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            Ok(())
        }

        fn resume(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            if let Some(on_complete) = self.pending.take() {
                on_complete(PlaybackOutcome::Finished);
            }
            Ok(())
        }
    }

    struct Fixed;

    impl DurationProbe for Fixed {
        fn probe(&self, _: &Path) -> Result<Duration> {
            Ok(Duration::from_secs(180))
        }
    }

    #[test]
    fn test_skip_then_exit_updates_history() -> Result<()> {
        let tracks = (0..4)
            .map(|i| Track::new(format!("/music/{i}.mp3"), Duration::from_secs(180)))
            .collect();
        let shared = Arc::new(Mutex::new(Library::new(tracks)));

        let (started_tx, started_rx) = mpsc::channel();
        let player = ReportingPlayer {
            started: started_tx,
            pending: None,
        };
        let mut scheduler = Scheduler::new(Arc::clone(&shared), Box::new(player), Arc::new(Fixed), 10)
            .with_tick(Duration::from_millis(10));

        let snapshots = Arc::new(Mutex::new(Vec::<StateSnapshot>::new()));
        let seen = Arc::clone(&snapshots);
        scheduler.add_observer(Box::new(move |snapshot: &StateSnapshot| {
            seen.lock().unwrap().push(snapshot.clone());
        }));

        let signals = scheduler.signal_sender();
        let driver = thread::spawn(move || {
            let skipped = started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(signals.send(ControlSignal::Skip));
            let exited = started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(signals.send(ControlSignal::Exit));
            (skipped, exited)
        });

        scheduler.begin_session()?;
        let (skipped, exited) = driver.join().unwrap();
        assert_ne!(skipped, exited);

        let library = library::lock(&shared)?;
        let skipped_track = &library.tracks()[library.position(&skipped).unwrap()];
        assert_eq!(skipped_track.play_info.total_skips, 1);
        assert_eq!(skipped_track.play_info.total_plays, 0);

        let exited_track = &library.tracks()[library.position(&exited).unwrap()];
        assert_eq!(exited_track.play_info.total_skips, 0);
        assert_eq!(library.stats().total_skips, 1);

        let snapshots = snapshots.lock().unwrap();
        assert!(snapshots.iter().any(|s| s.track_name.ends_with(".mp3")));
        assert!(snapshots.iter().all(|s| s.total_length == Duration::from_secs(180)));
        Ok(())
    }
}

#[cfg(test)]
mod coordination_tests {
    use super::*;

    fn snapshot(name: &str) -> StateSnapshot {
        StateSnapshot {
            track_name: name.to_string(),
            elapsed: Duration::from_secs(1),
            total_length: Duration::from_secs(200),
            score: 4.5,
        }
    }

    #[test]
    fn test_only_one_leader_per_socket() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("rotation.sock");

        let first = coordinator::determine_role(&path)?;
        assert!(first.is_leader());
        let Role::Leader(endpoint) = first else { unreachable!() };

        let (tx, _rx) = mpsc::channel();
        let handle = endpoint.serve(SignalSender::new(tx), NowPlaying::new())?;

        for _ in 0..3 {
            assert!(!coordinator::determine_role(&path)?.is_leader());
        }

        drop(handle);
        assert!(coordinator::determine_role(&path)?.is_leader(), "leadership is free again");
        Ok(())
    }

    #[test]
    fn test_follower_sees_snapshots_and_controls_reach_scheduler() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("rotation.sock");
        let Role::Leader(endpoint) = coordinator::determine_role(&path)? else {
            panic!("expected to lead");
        };

        let (tx, rx) = mpsc::channel();
        let now_playing = NowPlaying::new();
        let handle = endpoint.serve(SignalSender::new(tx), now_playing.clone())?;
        let mut observer = handle.observer();

        let stream = UnixStream::connect(&path)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut writer = stream.try_clone()?;
        let mut reader = FrameReader::new(stream);

        // Give the relay a moment to register the follower before publishing.
        thread::sleep(Duration::from_millis(100));
        now_playing.replace(snapshot("song.mp3"));
        observer(&snapshot("song.mp3"));

        match reader.read_message()? {
            Some(Message::Snapshot(received)) => assert_eq!(received.track_name, "song.mp3"),
            other => panic!("expected snapshot, got {other:?}"),
        }

        protocol::write_message(&mut writer, &Message::Control { signal: ControlSignal::Pause })?;
        let event = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(event, SchedulerEvent::Control(ControlSignal::Pause));
        Ok(())
    }
}
