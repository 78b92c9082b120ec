/*!
    Stream lifecycle: binds one input source to the mixer.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::cache::{Cache, CacheMode, InputCallback};
use crate::error::{StreamError, StreamResult};
use crate::format::FormatDescriptor;
use crate::resampler::Resampler;
use crate::sample::{SILENCE, Sample, VOLUME_MAX};

/// `STATUS` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayState {
    Playing,
    Paused,
    Ended,
}

/// `CACHE_STATUS` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheReadiness {
    Ready,
    Buffering,
}

/// Keys accepted by [`Stream::get_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusKey {
    Status,
    Played,
    CacheStatus,
    CacheFilling,
    CacheDelay,
}

/// Values returned by [`Stream::get_status`], one variant per [`StatusKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusValue {
    PlayState(PlayState),
    Millis(u64),
    CacheReadiness(CacheReadiness),
    Percent(u8),
    Frames(usize),
}

/// Notifications a stream raises as the mixer observes its cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Buffering,
    Ready,
    End,
}

pub type EventCallback = Box<dyn FnMut(StreamEvent) + Send>;

fn frames_to_ms(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames.saturating_mul(1000) / sample_rate as u64
}

struct StreamInner {
    playing: bool,
    ended: bool,
    aborted: bool,
    buffering: bool,
    played: u64,
    event_cb: Option<EventCallback>,
}

impl StreamInner {
    fn new() -> Self {
        Self {
            playing: false,
            ended: false,
            aborted: false,
            buffering: false,
            played: 0,
            event_cb: None,
        }
    }
}

/// One producer pipeline bound to the mixer: `callback → resampler →
/// cache` (pull path) or `write → resampler → cache` (push path).
pub struct Stream {
    out_format: FormatDescriptor,
    cache: Arc<Cache>,
    resampler: Arc<Mutex<Box<dyn Resampler>>>,
    volume: AtomicU32,
    inner: Mutex<StreamInner>,
}

impl Stream {
    /// Pull path: `raw_callback` is driven by the cache's own production
    /// mode (thread or on-demand), converted to `out_format` through
    /// `resampler` before entering the cache. `Stream::flush`/`abort`
    /// reach the same resampler instance through the shared handle, so
    /// they take the cache's input-lock first to avoid racing the
    /// driving callback.
    pub fn open_pull(
        mut raw_callback: Box<dyn FnMut(&mut [Sample], &mut FormatDescriptor) -> i64 + Send>,
        resampler: Box<dyn Resampler>,
        out_format: FormatDescriptor,
        cache_capacity: usize,
        mode: CacheMode,
    ) -> StreamResult<Arc<Self>> {
        let channels = out_format.channels.max(1) as usize;
        let resampler = Arc::new(Mutex::new(resampler));
        let driving_resampler = Arc::clone(&resampler);

        let driving: InputCallback = Box::new(move |dst, format| {
            let mut raw_format = FormatDescriptor::UNKNOWN;
            let mut scratch = vec![SILENCE; dst.len()];
            let produced = raw_callback(&mut scratch, &mut raw_format);
            if produced < 0 {
                return produced;
            }
            let mut resampler = driving_resampler.lock();
            resampler.write(&scratch, produced as usize, raw_format);
            let (frames, out_fmt) = resampler.read(dst, dst.len() / channels);
            *format = out_fmt;
            frames as i64
        });

        let cache = Cache::open(cache_capacity, out_format.channels, mode, Some(driving))?;

        Ok(Arc::new(Self {
            out_format,
            cache,
            resampler,
            volume: AtomicU32::new(VOLUME_MAX),
            inner: Mutex::new(StreamInner::new()),
        }))
    }

    /// Push path: external code calls [`Stream::write`]; frames pass
    /// through `resampler` before landing in the cache.
    pub fn open_push(
        resampler: Box<dyn Resampler>,
        out_format: FormatDescriptor,
        cache_capacity: usize,
    ) -> StreamResult<Arc<Self>> {
        let cache = Cache::open(cache_capacity, out_format.channels, CacheMode::OnDemand, None)?;
        Ok(Arc::new(Self {
            out_format,
            cache,
            resampler: Arc::new(Mutex::new(resampler)),
            volume: AtomicU32::new(VOLUME_MAX),
            inner: Mutex::new(StreamInner::new()),
        }))
    }

    /// Push samples from an external producer (push-path only).
    pub fn write(&self, src: &[Sample], frames: usize, format: FormatDescriptor) {
        if self.inner.lock().aborted {
            return;
        }
        let channels = self.out_format.channels.max(1) as usize;
        let mut resampler = self.resampler.lock();
        resampler.write(src, frames, format);
        let mut scratch = vec![SILENCE; 4096 * channels];
        loop {
            let (n, out_fmt) = resampler.read(&mut scratch, 4096);
            if n == 0 {
                break;
            }
            self.cache.write(&scratch, n, out_fmt);
        }
    }

    /// Resume playback. Always unlocks the cache's input-lock, whether
    /// or not a prior `flush` actually acquired it.
    pub fn play(&self) {
        self.inner.lock().playing = true;
        self.cache.unlock();
    }

    /// Suspend playback without releasing the input-lock held by a
    /// preceding `flush`.
    pub fn pause(&self) {
        self.inner.lock().playing = false;
    }

    /// Clear the cache and resampler and reset `played` to zero. Only
    /// releases the input-lock it takes if the stream was playing.
    pub fn flush(&self) {
        self.cache.lock();
        self.cache.flush();
        self.resampler.lock().flush();

        let mut inner = self.inner.lock();
        inner.played = 0;
        inner.buffering = false;
        let was_playing = inner.playing;
        drop(inner);

        if was_playing {
            self.cache.unlock();
        }
    }

    pub fn set_volume(&self, volume: u32) {
        self.volume.store(volume.min(VOLUME_MAX), Ordering::Relaxed);
    }

    pub fn get_volume(&self) -> u32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn set_cache_size(&self, capacity: usize) -> StreamResult<()> {
        self.cache.set_time(capacity).map_err(StreamError::from)
    }

    pub fn set_event_callback(&self, cb: EventCallback) {
        self.inner.lock().event_cb = Some(cb);
    }

    pub fn get_status(&self, key: StatusKey) -> StatusValue {
        let inner = self.inner.lock();
        match key {
            StatusKey::Status => StatusValue::PlayState(if inner.ended {
                PlayState::Ended
            } else if inner.playing {
                PlayState::Playing
            } else {
                PlayState::Paused
            }),
            StatusKey::Played => {
                StatusValue::Millis(frames_to_ms(inner.played, self.out_format.sample_rate))
            }
            StatusKey::CacheStatus => StatusValue::CacheReadiness(if self.cache.is_ready() {
                CacheReadiness::Ready
            } else {
                CacheReadiness::Buffering
            }),
            StatusKey::CacheFilling => StatusValue::Percent(self.cache.filling()),
            StatusKey::CacheDelay => StatusValue::Frames(self.cache.delay()),
        }
    }

    /// Stop the stream permanently and report total played time,
    /// including samples still buffered in the cache and resampler.
    pub fn abort(&self) -> u64 {
        self.cache.lock();
        let mut inner = self.inner.lock();
        inner.playing = false;
        inner.aborted = true;
        let played = inner.played;
        drop(inner);

        let pending = self.cache.delay() as u64 + self.resampler.lock().delay() as u64;
        frames_to_ms(played + pending, self.out_format.sample_rate)
    }

    /// Reseed `played` from a millisecond value (e.g. after a seek).
    pub fn restore(&self, played_ms: u64) {
        let frames = played_ms.saturating_mul(self.out_format.sample_rate as u64) / 1000;
        self.inner.lock().played = frames;
    }

    /// Release the cache's producer thread and resampler resources.
    /// Called by the engine once the stream is reaped from its table.
    pub fn close(&self) {
        self.cache.close();
        self.resampler.lock().close();
    }

    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock();
        inner.playing && !inner.ended && !inner.aborted
    }

    pub fn volume_fraction(&self) -> u32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Record the outcome of one mixer-driven cache read, updating
    /// `played` and the buffering edge, and firing the stream's event
    /// callback exactly once per edge.
    pub fn observe_read(&self, frames_read: usize) -> Option<StreamEvent> {
        let delay = self.cache.delay();
        let mut inner = self.inner.lock();
        let event = if frames_read == 0 {
            if delay > 0 && !inner.buffering {
                inner.buffering = true;
                Some(StreamEvent::Buffering)
            } else {
                None
            }
        } else {
            inner.played += frames_read as u64;
            if inner.buffering {
                inner.buffering = false;
                Some(StreamEvent::Ready)
            } else {
                None
            }
        };
        if let Some(ev) = event {
            if let Some(cb) = inner.event_cb.as_mut() {
                cb(ev);
            }
        }
        event
    }

    /// Mark the stream ended after a terminal producer failure.
    pub fn mark_ended(&self) {
        let mut inner = self.inner.lock();
        inner.ended = true;
        inner.playing = false;
        if let Some(cb) = inner.event_cb.as_mut() {
            cb(StreamEvent::End);
        }
    }

    pub fn is_ended(&self) -> bool {
        self.inner.lock().ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resampler::PassthroughResampler;

    fn push_stream(capacity: usize) -> Arc<Stream> {
        Stream::open_push(
            Box::new(PassthroughResampler::new()),
            FormatDescriptor::new(1000, 1),
            capacity,
        )
        .unwrap()
    }

    #[test]
    fn played_is_monotonic_and_resets_on_flush() {
        let stream = push_stream(1000);
        stream.play();
        assert_eq!(
            stream.get_status(StatusKey::Played),
            StatusValue::Millis(0)
        );

        stream.observe_read(500);
        stream.observe_read(500);
        assert_eq!(
            stream.get_status(StatusKey::Played),
            StatusValue::Millis(1000)
        );

        stream.flush();
        assert_eq!(
            stream.get_status(StatusKey::Played),
            StatusValue::Millis(0)
        );
    }

    #[test]
    fn paused_then_flushed_stream_stays_locked_until_play() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counted_calls = Arc::clone(&calls);
        let raw_cb = Box::new(move |dst: &mut [Sample], format: &mut FormatDescriptor| {
            counted_calls.fetch_add(1, Ordering::Relaxed);
            for s in dst.iter_mut() {
                *s = 1.0;
            }
            *format = FormatDescriptor::new(1000, 1);
            dst.len() as i64
        });

        let stream = Stream::open_pull(
            raw_cb,
            Box::new(PassthroughResampler::new()),
            FormatDescriptor::new(1000, 1),
            100,
            CacheMode::OnDemand,
        )
        .unwrap();

        stream.play();
        stream.pause();
        stream.flush();

        let mut dst = vec![0.0f32; 10];
        let _ = stream.cache().read(&mut dst, 10);
        assert_eq!(calls.load(Ordering::Relaxed), 0, "gate held across pause+flush");

        stream.play();
        let _ = stream.cache().read(&mut dst, 10);
        assert!(calls.load(Ordering::Relaxed) > 0, "play unlocks the gate");
    }

    #[test]
    fn abort_reports_played_plus_pending() {
        let stream = push_stream(10_000);
        stream.play();

        // out_format sample rate is 1000 Hz, so 1 frame == 1 ms.
        let samples = vec![0.0f32; 1000];
        stream.write(&samples, 1000, FormatDescriptor::new(1000, 1));

        let mut dst = vec![0.0f32; 1000];
        let (frames, _) = stream.cache().read(&mut dst, 1000).unwrap();
        stream.observe_read(frames);

        let pending = vec![0.0f32; 200];
        stream.write(&pending, 200, FormatDescriptor::new(1000, 1));

        let total_ms = stream.abort();
        assert_eq!(total_ms, 1200);
    }

    #[test]
    fn mark_ended_updates_status() {
        let stream = push_stream(100);
        stream.play();
        stream.mark_ended();
        assert_eq!(
            stream.get_status(StatusKey::Status),
            StatusValue::PlayState(PlayState::Ended)
        );
    }

    #[test]
    fn buffering_hysteresis_fires_on_each_edge() {
        let stream = push_stream(10);
        stream.play();

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&events);
        stream.set_event_callback(Box::new(move |ev| recorder.lock().push(ev)));

        // Partial fill: cache isn't ready, read returns 0 frames while
        // frames are pending -> BUFFERING.
        let samples = vec![0.0f32; 5];
        stream.write(&samples, 5, FormatDescriptor::new(1000, 1));
        let mut dst = vec![0.0f32; 10];
        let (frames, _) = stream.cache().read(&mut dst, 10).unwrap();
        assert_eq!(frames, 0);
        stream.observe_read(frames);
        assert_eq!(*events.lock(), vec![StreamEvent::Buffering]);

        // Top up to capacity: cache becomes ready and the read drains it
        // in full -> READY.
        stream.write(&samples, 5, FormatDescriptor::new(1000, 1));
        let (frames, _) = stream.cache().read(&mut dst, 10).unwrap();
        assert_eq!(frames, 10);
        stream.observe_read(frames);
        assert_eq!(
            *events.lock(),
            vec![StreamEvent::Buffering, StreamEvent::Ready]
        );

        // Drained to empty, then partially filled again -> BUFFERING once
        // more.
        stream.write(&samples, 5, FormatDescriptor::new(1000, 1));
        let (frames, _) = stream.cache().read(&mut dst, 10).unwrap();
        assert_eq!(frames, 0);
        stream.observe_read(frames);
        assert_eq!(
            *events.lock(),
            vec![
                StreamEvent::Buffering,
                StreamEvent::Ready,
                StreamEvent::Buffering,
            ]
        );
    }
}
