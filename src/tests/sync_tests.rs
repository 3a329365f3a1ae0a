use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::clock::ClockMode;
use crate::config::EngineConfig;
use crate::decoder::SineDecoder;
use crate::events::EngineEvent;
use crate::file_source::FileSource;
use crate::mixer::Mixer;
use crate::sink::BufferSink;
use crate::source::{AudioSource, MasterClockSource};
use crate::sync_group::SyncGroup;
use crate::tests::support;

fn member(duration: f64, config: &EngineConfig) -> Arc<FileSource> {
    let decoder = SineDecoder::new(220.0, duration, config.sample_rate, config.channels)
        .with_amplitude(0.3);
    FileSource::new("member", Box::new(decoder), config).unwrap()
}

fn wait_for_frames(mixer: &Mixer, frames: u64, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while mixer.total_mixed_frames() < frames && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
}

/// A ghost with members of 5, 7 and 10 seconds: group transport starts all
/// of them, a tempo change half a second in reaches every member through
/// the fan-out, and the group keeps mixing without resync churn.
#[test]
fn test_group_tempo_change_reaches_all_members() {
    support::init_logging();
    let config = EngineConfig::default();

    let group = SyncGroup::new(&config);
    let a = member(5.0, &config);
    let b = member(7.0, &config);
    let c = member(10.0, &config);
    group.add(&a);
    group.add(&b);
    group.add(&c);
    assert!((group.duration() - 10.0).abs() < 1e-9);

    let mut mixer = Mixer::new(
        config.clone(),
        Box::new(BufferSink::new(config.frames_per_buffer)),
    )
    .unwrap();
    mixer.set_rendering_mode(ClockMode::Offline);
    let events = mixer.events();

    for source in group.members() {
        mixer.add_source(source).unwrap();
    }
    group.play().unwrap();
    mixer.start().unwrap();

    wait_for_frames(&mixer, 24_000, Duration::from_secs(10));
    group.set_tempo(1.5);

    // The fan-out is synchronous: every member carries the new tempo the
    // moment the setter returns, well within one mixer cycle.
    assert_eq!(a.tempo(), 1.5);
    assert_eq!(b.tempo(), 1.5);
    assert_eq!(c.tempo(), 1.5);

    let at_change = mixer.total_mixed_frames();
    wait_for_frames(&mixer, at_change + 8_192, Duration::from_secs(10));
    mixer.stop().unwrap();

    // The tempo change must not have knocked members out of sync: no
    // drift-resync dropouts, thanks to the grace period and the shared
    // timeline accounting.
    let resyncs = events
        .try_iter()
        .filter(|e| {
            matches!(
                e,
                EngineEvent::TrackDropout { reason, .. } if reason.contains("resync")
            )
        })
        .count();
    assert_eq!(resyncs, 0);
}

/// Attach/detach round trip: a detached member no longer follows the
/// ghost and renders as an independent source again.
#[test]
fn test_detach_restores_independence() {
    support::init_logging();
    let config = EngineConfig::default();

    let group = SyncGroup::new(&config);
    let source = member(5.0, &config);
    group.add(&source);
    assert!(MasterClockSource::is_attached_to_clock(source.as_ref()));

    group.remove(source.id());
    assert!(!MasterClockSource::is_attached_to_clock(source.as_ref()));

    group.set_tempo(2.0);
    group.pause();
    assert_eq!(source.tempo(), 1.0);
    assert_ne!(source.state(), crate::source::SourceState::Paused);
}

/// Group transport cascades: pausing the ghost pauses every member,
/// stopping rewinds them.
#[test]
fn test_group_transport_cascade() {
    support::init_logging();
    let config = EngineConfig::default();

    let group = SyncGroup::new(&config);
    let a = member(5.0, &config);
    let b = member(7.0, &config);
    group.add(&a);
    group.add(&b);

    group.play().unwrap();
    assert_eq!(a.state(), crate::source::SourceState::Playing);
    assert_eq!(b.state(), crate::source::SourceState::Playing);

    group.pause();
    assert_eq!(a.state(), crate::source::SourceState::Paused);
    assert_eq!(b.state(), crate::source::SourceState::Paused);

    group.stop();
    assert_eq!(a.state(), crate::source::SourceState::Stopped);
    assert_eq!(b.state(), crate::source::SourceState::Stopped);
    assert_eq!(a.position(), 0.0);

    a.dispose();
    b.dispose();
}

/// A ghost-following source that falls outside tolerance snaps back to
/// the ghost's timeline on its next read.
#[test]
fn test_ghost_follower_resyncs_on_drift() {
    support::init_logging();
    let config = EngineConfig::default();

    let ghost = Arc::new(crate::ghost_source::GhostSource::new(
        config.sample_rate,
        config.channels,
    ));
    ghost.resize_frames(48_000 * 10);

    let source = member(10.0, &config);
    source.observe_ghost(&ghost);
    // Not attached to the master clock: the legacy ghost-drift path.
    source.play().unwrap();
    ghost.play().unwrap();

    // Walk the ghost ahead by two seconds; the source is still at ~0.
    let mut scratch = vec![0.0f32; config.samples_per_buffer()];
    for _ in 0..(2 * config.sample_rate as usize / config.frames_per_buffer) {
        ghost.read_samples(&mut scratch, config.frames_per_buffer);
    }
    let ghost_secs = ghost.current_frame() as f64 / config.sample_rate as f64;
    assert!(ghost_secs > 1.9);

    // The next member read detects the drift and seeks toward the ghost.
    source.read_samples(&mut scratch, config.frames_per_buffer);
    let deadline = Instant::now() + Duration::from_secs(2);
    while (source.position() - ghost_secs).abs() > 0.1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(
        (source.position() - ghost_secs).abs() < 0.1,
        "source at {:.3}s, ghost at {:.3}s",
        source.position(),
        ghost_secs
    );
    source.dispose();
}
