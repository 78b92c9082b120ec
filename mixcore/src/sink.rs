/*!
    The external collaborator that receives the mixer's output blocks:
    a single blocking writer, driven by the mixer's tick loop.
*/

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::format::FormatDescriptor;
use crate::sample::Sample;

/// Destination for mixed output frames.
///
/// `write` is expected to block until the sink has accepted the block
/// (or failed) — the mixer's tick loop is a single blocking consumer.
pub trait Sink: Send {
    /// Prepare the sink for `format`. Called once before the first write
    /// and again whenever the format changes.
    fn prepare(&mut self, format: FormatDescriptor) -> Result<(), String>;

    /// Block until `frames` frames of `data` have been accepted.
    fn write(&mut self, data: &[Sample], frames: usize) -> Result<(), String>;

    /// Block until any internally buffered frames have been consumed.
    fn drain(&mut self);

    /// Attempt to recover after a prior `write` failure. Returns `true`
    /// if the sink believes it can accept writes again.
    fn recover(&mut self) -> bool;

    fn close(&mut self);
}

struct RingInner {
    samples: VecDeque<Sample>,
    channels: usize,
    closed: bool,
}

/// In-process [`Sink`] that stages frames in a bounded ring buffer for a
/// test or demo consumer to drain, grounded in the same bounded
/// mutex+condvar queue idiom as the engine's own input gate.
pub struct RingSink {
    inner: Mutex<RingInner>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity_frames: usize,
}

impl RingSink {
    pub fn new(capacity_frames: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                samples: VecDeque::new(),
                channels: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity_frames,
        }
    }

    /// Block until `frames` frames are available, then copy them into
    /// `dst` and return the count actually copied (0 once closed and
    /// drained).
    pub fn take(&self, dst: &mut [Sample], frames: usize) -> usize {
        let mut inner = self.inner.lock();
        let channels = inner.channels.max(1);
        while inner.samples.len() < frames * channels && !inner.closed {
            self.not_empty.wait(&mut inner);
        }
        let avail_frames = inner.samples.len() / channels;
        let take_frames = avail_frames.min(frames);
        let n_samples = take_frames * channels;
        for slot in dst.iter_mut().take(n_samples) {
            *slot = inner.samples.pop_front().unwrap();
        }
        self.not_full.notify_one();
        take_frames
    }

    fn prepare_shared(&self, format: FormatDescriptor) -> Result<(), String> {
        self.inner.lock().channels = format.channels as usize;
        Ok(())
    }

    fn write_shared(&self, data: &[Sample], frames: usize) -> Result<(), String> {
        let mut inner = self.inner.lock();
        let channels = inner.channels.max(1);
        let n_samples = frames * channels;
        while inner.samples.len() + n_samples > self.capacity_frames * channels && !inner.closed {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return Err("sink closed".into());
        }
        inner.samples.extend(data[..n_samples].iter().copied());
        self.not_empty.notify_one();
        Ok(())
    }

    fn drain_shared(&self) {
        let mut inner = self.inner.lock();
        while !inner.samples.is_empty() && !inner.closed {
            self.not_full.wait(&mut inner);
        }
    }

    fn recover_shared(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.closed = false;
        true
    }

    fn close_shared(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

impl Sink for RingSink {
    fn prepare(&mut self, format: FormatDescriptor) -> Result<(), String> {
        self.prepare_shared(format)
    }

    fn write(&mut self, data: &[Sample], frames: usize) -> Result<(), String> {
        self.write_shared(data, frames)
    }

    fn drain(&mut self) {
        self.drain_shared()
    }

    fn recover(&mut self) -> bool {
        self.recover_shared()
    }

    fn close(&mut self) {
        self.close_shared()
    }
}

#[cfg(feature = "cpal-sink")]
mod cpal_sink {
    use super::*;
    use std::sync::Arc;

    use cpal::{
        BufferSize, SampleRate, Stream as CpalStream, StreamConfig,
        traits::{DeviceTrait, HostTrait, StreamTrait},
    };

    pub const DEFAULT_BUFFER_SIZE: u32 = 1024;

    /// Stock [`Sink`] backed by the platform default output device.
    ///
    /// The cpal output callback drains a [`RingSink`] that `write` feeds
    /// into, bridging the engine's blocking-write model onto cpal's
    /// pull-based callback.
    pub struct CpalSink {
        ring: Arc<RingSink>,
        stream: Option<CpalStream>,
        buffer_size: u32,
    }

    impl CpalSink {
        pub fn new(capacity_frames: usize) -> Self {
            Self::with_buffer_size(capacity_frames, DEFAULT_BUFFER_SIZE)
        }

        pub fn with_buffer_size(capacity_frames: usize, buffer_size: u32) -> Self {
            Self {
                ring: Arc::new(RingSink::new(capacity_frames)),
                stream: None,
                buffer_size,
            }
        }
    }

    impl Sink for CpalSink {
        fn prepare(&mut self, format: FormatDescriptor) -> Result<(), String> {
            self.ring.prepare_shared(format)?;

            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| "no audio output device found".to_string())?;

            let config = StreamConfig {
                channels: format.channels,
                sample_rate: SampleRate(format.sample_rate),
                buffer_size: BufferSize::Fixed(self.buffer_size),
            };

            let ring = Arc::clone(&self.ring);
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [Sample], _: &cpal::OutputCallbackInfo| {
                        let frames = data.len() / format.channels.max(1) as usize;
                        ring.take(data, frames);
                    },
                    |err| {
                        eprintln!("audio stream error: {err}");
                    },
                    None,
                )
                .map_err(|e| e.to_string())?;

            stream.play().map_err(|e| e.to_string())?;
            self.stream = Some(stream);
            Ok(())
        }

        fn write(&mut self, data: &[Sample], frames: usize) -> Result<(), String> {
            self.ring.write_shared(data, frames)
        }

        fn drain(&mut self) {
            self.ring.drain_shared();
        }

        fn recover(&mut self) -> bool {
            self.ring.recover_shared()
        }

        fn close(&mut self) {
            self.ring.close_shared();
            self.stream.take();
        }
    }
}

#[cfg(feature = "cpal-sink")]
pub use cpal_sink::CpalSink;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_take_round_trips() {
        let mut sink = RingSink::new(100);
        sink.prepare(FormatDescriptor::new(44_100, 2)).unwrap();
        sink.write(&[1.0, 2.0, 3.0, 4.0], 2).unwrap();

        let mut dst = vec![0.0f32; 4];
        let frames = sink.take(&mut dst, 2);
        assert_eq!(frames, 2);
        assert_eq!(dst, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn close_unblocks_write() {
        let mut sink = RingSink::new(1);
        sink.prepare(FormatDescriptor::new(44_100, 1)).unwrap();
        sink.write(&[1.0], 1).unwrap();
        sink.close();
        assert!(sink.write(&[2.0], 1).is_err());
    }
}
