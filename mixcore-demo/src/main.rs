/*!
    Wires a synthetic tone generator through `mixcore::Engine` into the
    platform's default output device.

    Usage:
      cargo run --release -p mixcore-demo -- [frequency_hz]
*/

use std::f32::consts::TAU;
use std::thread;
use std::time::Duration;

use mixcore::cache::CacheMode;
use mixcore::resampler::PassthroughResampler;
use mixcore::sink::CpalSink;
use mixcore::{Engine, EngineConfig, FormatDescriptor, Sample, Stream};

const PLAY_SECONDS: u64 = 3;

fn main() {
    let frequency: f32 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(440.0);

    let config = EngineConfig::default();
    let sink = Box::new(CpalSink::new(config.tick_frames * 4));
    let engine = Engine::open(config, sink).expect("failed to open audio engine");

    let out_format = engine.config().output_format;
    let stream = tone_stream(frequency, out_format, config.default_cache_capacity);
    let id = engine
        .add_stream(stream.clone())
        .expect("stream table full");
    stream.play();

    eprintln!("playing a {frequency} Hz tone for {PLAY_SECONDS}s");
    thread::sleep(Duration::from_secs(PLAY_SECONDS));

    engine.remove_stream(id);
    engine.close();
}

/// Build a pull-path stream whose raw callback synthesizes a sine wave
/// at `frequency`, already at the engine's output format (so the
/// resampler is a no-op pass-through).
fn tone_stream(
    frequency: f32,
    out_format: FormatDescriptor,
    cache_capacity: usize,
) -> std::sync::Arc<Stream> {
    let sample_rate = out_format.sample_rate as f32;
    let channels = out_format.channels as usize;
    let mut phase: f32 = 0.0;

    let callback = Box::new(move |dst: &mut [Sample], format: &mut FormatDescriptor| {
        let frames = dst.len() / channels.max(1);
        for frame in 0..frames {
            let value = (phase * TAU).sin() * 0.2;
            for ch in 0..channels {
                dst[frame * channels + ch] = value;
            }
            phase += frequency / sample_rate;
            if phase >= 1.0 {
                phase -= 1.0;
            }
        }
        *format = out_format;
        frames as i64
    });

    Stream::open_pull(
        callback,
        Box::new(PassthroughResampler::new()),
        out_format,
        cache_capacity,
        CacheMode::Thread,
    )
    .expect("failed to open tone stream")
}
