use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::decoder::SineDecoder;
use crate::events::EngineEvent;
use crate::file_source::FileSource;
use crate::mixer::Mixer;
use crate::source::AudioSource;
use crate::tests::support::{self, PacedSink, SlowDecoder};

/// A starved decoder in a realtime mix: underruns surface as events, the
/// mixed stream keeps its full frame count (zero-filled gaps), and a
/// healthy source stays audible throughout.
#[test]
fn test_starved_decoder_emits_underruns_without_derailing_mix() {
    support::init_logging();
    let config = EngineConfig::default();

    let sink = PacedSink::new(&config);
    let captured = sink.captured();

    let mut mixer = Mixer::new(config.clone(), Box::new(sink)).unwrap();
    let events = mixer.events();

    // Stalls ~3x longer than a buffer lasts: cannot keep up.
    let starved = {
        let inner = SineDecoder::new(440.0, 10.0, config.sample_rate, config.channels)
            .with_amplitude(0.2);
        let decoder = SlowDecoder::new(inner, Duration::from_millis(30));
        FileSource::new("starved", Box::new(decoder), &config).unwrap()
    };
    let healthy = {
        let decoder = SineDecoder::new(330.0, 10.0, config.sample_rate, config.channels)
            .with_amplitude(0.5);
        FileSource::new("healthy", Box::new(decoder), &config).unwrap()
    };

    starved.play().unwrap();
    healthy.play().unwrap();
    mixer.add_source(Arc::clone(&starved) as Arc<dyn AudioSource>).unwrap();
    mixer.add_source(Arc::clone(&healthy) as Arc<dyn AudioSource>).unwrap();
    mixer.start().unwrap();

    // Roughly half a second of realtime mixing.
    let deadline = Instant::now() + Duration::from_secs(5);
    while mixer.total_mixed_frames() < 24_000 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    mixer.stop().unwrap();

    let total_frames = mixer.total_mixed_frames();
    assert!(total_frames >= 24_000);

    // Every mixed frame reached the sink despite the starvation.
    let captured = captured.lock().unwrap();
    assert_eq!(
        captured.len() as u64,
        total_frames * config.channels as u64
    );

    // The starved source produced underrun events.
    let underruns = events
        .try_iter()
        .filter(|e| {
            matches!(
                e,
                EngineEvent::BufferUnderrun { source_id, .. } if *source_id == starved.id()
            )
        })
        .count();
    assert!(underruns > 0, "expected underrun events from the starved source");
    assert!(starved.underrun_count() > 0);

    // The healthy source kept the mix audible: its 0.5 amplitude shows in
    // the back half of the capture.
    let tail = &captured[captured.len() / 2..];
    let peak = tail.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
    assert!(peak > 0.4, "healthy source inaudible, peak {}", peak);

    starved.dispose();
    healthy.dispose();
}
