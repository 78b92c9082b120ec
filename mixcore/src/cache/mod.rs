/*!
    Bounded producer/consumer frame buffer with in-band format markers.
*/

mod gate;
mod markers;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};

use crate::error::{CacheError, CacheResult};
use crate::format::FormatDescriptor;
use crate::sample::{SILENCE, Sample};

use gate::InputGate;
use markers::MarkerList;

/// Pre-filled scratch size for the thread-mode producer loop, in frames.
const SCRATCH_CAPACITY_FRAMES: usize = 4096;

/// Production mode selected at `Cache::open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// A dedicated thread repeatedly drives the input callback.
    Thread,
    /// `read` tops the buffer up from the callback itself.
    OnDemand,
}

/// `fn(dst, out_format) -> frames_produced(>=0) | error(<0)`.
pub type InputCallback = Box<dyn FnMut(&mut [Sample], &mut FormatDescriptor) -> i64 + Send>;

struct CacheInner {
    capacity: usize,
    fill: usize,
    ready: bool,
    markers: MarkerList,
    prod: HeapProd<Sample>,
    cons: HeapCons<Sample>,
    terminal_failure: bool,
}

impl CacheInner {
    fn new(capacity_frames: usize, channels: u16) -> Self {
        let rb = HeapRb::<Sample>::new(capacity_frames * channels as usize);
        let (prod, cons) = rb.split();
        Self {
            capacity: capacity_frames,
            fill: 0,
            ready: false,
            markers: MarkerList::new(),
            prod,
            cons,
            terminal_failure: false,
        }
    }

    /// Accept up to `frames` frames from `src`, clamped to remaining
    /// capacity. Returns the number of frames actually accepted.
    fn deposit_frames(
        &mut self,
        src: &[Sample],
        frames: usize,
        channels: usize,
        format: FormatDescriptor,
    ) -> usize {
        let vacant_frames = self.capacity - self.fill;
        let accepted = frames.min(vacant_frames);
        if accepted == 0 {
            return 0;
        }
        let n_samples = accepted * channels;
        let pushed = self.prod.push_slice(&src[..n_samples]);
        debug_assert_eq!(pushed, n_samples);
        self.fill += accepted;
        self.markers.deposit(accepted, format);
        if self.fill == self.capacity {
            self.ready = true;
        }
        accepted
    }

    /// Drain at most `max_frames` frames of a single format into `dst`.
    fn drain(
        &mut self,
        dst: &mut [Sample],
        max_frames: usize,
        channels: usize,
    ) -> (usize, FormatDescriptor) {
        if !self.ready {
            return (0, FormatDescriptor::UNKNOWN);
        }
        let avail = self.fill.min(max_frames);
        if avail == 0 {
            return (0, FormatDescriptor::UNKNOWN);
        }
        let (clamp, format) = self
            .markers
            .head_run()
            .expect("fill > 0 implies a marker is present");
        let to_read = avail.min(clamp);
        let n_samples = to_read * channels;
        let popped = self.cons.pop_slice(&mut dst[..n_samples]);
        debug_assert_eq!(popped, n_samples);
        self.fill -= to_read;
        self.markers.take(to_read);
        if self.fill == 0 {
            self.ready = false;
        }
        (to_read, format)
    }

    fn discard_all(&mut self) {
        let samples = self.cons.occupied_len();
        self.cons.skip(samples);
        self.fill = 0;
        self.ready = false;
        self.markers.clear();
    }
}

/// A bounded FIFO of output-format frames fed by a pull-based producer
/// and drained by a pull-based consumer.
pub struct Cache {
    state: Mutex<CacheInner>,
    gate: InputGate,
    callback: Option<Mutex<InputCallback>>,
    mode: CacheMode,
    channels: u16,
    stop: AtomicBool,
    flush_pending: AtomicBool,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Open a cache with capacity `capacity` frames at `channels`
    /// channels. In [`CacheMode::Thread`] mode a producer thread is
    /// spawned immediately and joined by [`Cache::close`].
    pub fn open(
        capacity: usize,
        channels: u16,
        mode: CacheMode,
        callback: Option<InputCallback>,
    ) -> CacheResult<Arc<Self>> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        if mode == CacheMode::Thread && callback.is_none() {
            return Err(CacheError::MissingCallback);
        }

        let cache = Arc::new(Self {
            state: Mutex::new(CacheInner::new(capacity, channels)),
            gate: InputGate::new(),
            callback: callback.map(Mutex::new),
            mode,
            channels,
            stop: AtomicBool::new(false),
            flush_pending: AtomicBool::new(false),
            thread_handle: Mutex::new(None),
        });

        if mode == CacheMode::Thread {
            let worker = Arc::clone(&cache);
            let handle = thread::spawn(move || worker.producer_loop());
            *cache.thread_handle.lock() = Some(handle);
        }

        Ok(cache)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Fill level as a percentage, 100 once ready.
    pub fn filling(&self) -> u8 {
        let inner = self.state.lock();
        if inner.ready {
            100
        } else {
            ((inner.fill * 100) / inner.capacity.max(1)) as u8
        }
    }

    /// Pending frames, used by `Stream::get_status(CACHE_DELAY)`.
    pub fn delay(&self) -> usize {
        self.state.lock().fill
    }

    /// Pull up to `max_frames` frames of a single input format.
    ///
    /// Returns `Ok((0, _))` when not ready (consumer must poll). Returns
    /// `Err` only once the producer has reported a terminal failure and
    /// the cache has been fully drained.
    pub fn read(&self, dst: &mut [Sample], max_frames: usize) -> CacheResult<(usize, FormatDescriptor)> {
        if self.mode == CacheMode::OnDemand {
            self.top_up_on_demand();
        }
        let mut inner = self.state.lock();
        let (frames, format) = inner.drain(dst, max_frames, self.channels as usize);
        if frames == 0 && inner.fill == 0 && inner.terminal_failure {
            return Err(CacheError::ProducerFailed);
        }
        Ok((frames, format))
    }

    /// Push frames from an external producer (push-path streams feed
    /// this from their resampler's write callback).
    pub fn write(&self, src: &[Sample], frames: usize, format: FormatDescriptor) -> usize {
        let mut inner = self.state.lock();
        inner.deposit_frames(src, frames, self.channels as usize, format)
    }

    /// Drop all buffered frames and markers. Does not touch the input
    /// gate: callers that need a guaranteed-quiet window call
    /// [`Cache::lock`] before, and [`Cache::unlock`] after, as needed.
    pub fn flush(&self) {
        let mut inner = self.state.lock();
        inner.discard_all();
        if self.mode == CacheMode::Thread {
            self.flush_pending.store(true, Ordering::Release);
        }
    }

    /// Acquire the input-lock, gating further callback invocation.
    pub fn lock(&self) {
        self.gate.acquire();
    }

    /// Release the input-lock. Idempotent.
    pub fn unlock(&self) {
        self.gate.release();
    }

    /// Resize the backing buffer. Fails if `new_capacity` is smaller than
    /// the current fill level.
    pub fn set_time(&self, new_capacity: usize) -> CacheResult<()> {
        if new_capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        let mut inner = self.state.lock();
        if new_capacity < inner.fill {
            return Err(CacheError::ShrinkBelowFill {
                requested: new_capacity,
                fill: inner.fill,
            });
        }

        let mut resized = CacheInner::new(new_capacity, self.channels);
        let n_samples = inner.fill * self.channels as usize;
        let mut carry = vec![SILENCE; n_samples];
        let popped = inner.cons.pop_slice(&mut carry);
        debug_assert_eq!(popped, n_samples);
        let pushed = resized.prod.push_slice(&carry);
        debug_assert_eq!(pushed, n_samples);

        resized.fill = inner.fill;
        resized.ready = resized.fill == resized.capacity && resized.fill > 0;
        resized.markers = std::mem::take(&mut inner.markers);

        *inner = resized;
        Ok(())
    }

    /// Stop the producer thread (if any) and join it.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn top_up_on_demand(&self) {
        let Some(callback) = &self.callback else {
            return;
        };

        // Deliberately asymmetric: the gate is released unconditionally
        // below even when this call didn't acquire it.
        let acquired = self.gate.try_acquire();
        if acquired {
            let vacant = {
                let inner = self.state.lock();
                inner.capacity - inner.fill
            };
            if vacant > 0 {
                let mut scratch = vec![SILENCE; vacant * self.channels as usize];
                let mut format = FormatDescriptor::UNKNOWN;
                let produced = {
                    let mut cb = callback.lock();
                    (*cb)(&mut scratch, &mut format)
                };
                let mut inner = self.state.lock();
                if produced < 0 {
                    inner.terminal_failure = true;
                } else {
                    let produced = (produced as usize).min(vacant);
                    inner.deposit_frames(&scratch, produced, self.channels as usize, format);
                }
            }
        }
        self.gate.release();
    }

    fn producer_loop(self: Arc<Self>) {
        let channels = self.channels as usize;
        let mut scratch: Vec<Sample> = Vec::new();
        let mut scratch_marks: VecDeque<(usize, FormatDescriptor)> = VecDeque::new();

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if self.flush_pending.swap(false, Ordering::AcqRel) {
                scratch.clear();
                scratch_marks.clear();
            }

            let scratch_frames = scratch.len() / channels;
            if scratch_frames >= SCRATCH_CAPACITY_FRAMES {
                thread::sleep(Duration::from_millis(1));
            } else if self.gate.try_acquire() {
                let want = SCRATCH_CAPACITY_FRAMES - scratch_frames;
                let mut tmp = vec![SILENCE; want * channels];
                let mut format = FormatDescriptor::UNKNOWN;
                let produced = {
                    let mut cb = self
                        .callback
                        .as_ref()
                        .expect("thread mode always has a callback")
                        .lock();
                    (*cb)(&mut tmp, &mut format)
                };
                self.gate.release();

                if produced < 0 {
                    self.state.lock().terminal_failure = true;
                    break;
                }
                let produced = (produced as usize).min(want);
                scratch.extend_from_slice(&tmp[..produced * channels]);
                scratch_marks.push_back((produced, format));
            } else {
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            if scratch.is_empty() {
                continue;
            }

            let mut inner = self.state.lock();
            let mut consumed_frames = 0usize;
            while let Some(&(run_len, format)) = scratch_marks.front() {
                let start = consumed_frames * channels;
                let end = (consumed_frames + run_len) * channels;
                let accepted = inner.deposit_frames(&scratch[start..end], run_len, channels, format);
                consumed_frames += accepted;
                if accepted == run_len {
                    scratch_marks.pop_front();
                } else {
                    if accepted > 0 {
                        scratch_marks.front_mut().unwrap().0 -= accepted;
                    }
                    break;
                }
            }
            drop(inner);
            scratch.drain(0..consumed_frames * channels);
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn ones_callback(total: usize) -> InputCallback {
        let produced = AtomicUsize::new(0);
        Box::new(move |dst, format| {
            let remaining = total - produced.load(Ordering::Relaxed);
            let batch = remaining.min(dst.len() / 2).min(100);
            for sample in dst.iter_mut().take(batch * 2) {
                *sample = 1.0;
            }
            *format = FormatDescriptor::new(44_100, 2);
            produced.fetch_add(batch, Ordering::Relaxed);
            batch as i64
        })
    }

    #[test]
    fn threaded_fill_then_drain() {
        let cache = Cache::open(1000, 2, CacheMode::Thread, Some(ones_callback(1000))).unwrap();

        let start = Instant::now();
        let mut polls = 0;
        while !cache.is_ready() {
            polls += 1;
            assert!(polls <= 11, "took more than 11 polls to become ready");
            assert!(start.elapsed() < Duration::from_secs(5), "timed out");
            thread::sleep(Duration::from_millis(5));
        }

        let mut dst = vec![0.0f32; 1000 * 2];
        let (frames, _format) = cache.read(&mut dst, 1000).unwrap();
        assert_eq!(frames, 1000);
        assert!(dst.iter().all(|&s| s == 1.0));
        assert!(!cache.is_ready());

        cache.close();
    }

    #[test]
    fn format_boundary_splits_reads() {
        let cache = Cache::open(1000, 2, CacheMode::OnDemand, None).unwrap();
        let chunk_a = vec![1.0f32; 500 * 2];
        let chunk_b = vec![2.0f32; 500 * 2];

        assert_eq!(cache.write(&chunk_a, 500, FormatDescriptor::new(44_100, 2)), 500);
        assert_eq!(cache.write(&chunk_b, 500, FormatDescriptor::new(48_000, 2)), 500);

        let mut dst = vec![0.0f32; 1000 * 2];
        let (frames, format) = cache.read(&mut dst, 1000).unwrap();
        assert_eq!(frames, 500);
        assert_eq!(format, FormatDescriptor::new(44_100, 2));
        assert!(dst[..1000].iter().all(|&s| s == 1.0));

        let (frames, format) = cache.read(&mut dst, 1000).unwrap();
        assert_eq!(frames, 500);
        assert_eq!(format, FormatDescriptor::new(48_000, 2));
        assert!(dst[..1000].iter().all(|&s| s == 2.0));
    }

    #[test]
    fn flush_clears_fill_and_markers() {
        let cache = Cache::open(1000, 2, CacheMode::OnDemand, None).unwrap();
        let chunk = vec![1.0f32; 800 * 2];
        cache.write(&chunk, 800, FormatDescriptor::new(44_100, 2));
        assert_eq!(cache.delay(), 800);

        cache.lock();
        cache.flush();
        cache.unlock();

        assert_eq!(cache.delay(), 0);
        assert!(!cache.is_ready());

        let mut dst = vec![0.0f32; 10 * 2];
        assert_eq!(cache.read(&mut dst, 10).unwrap().0, 0);
    }

    #[test]
    fn producer_failure_on_empty_cache_surfaces_as_error() {
        let cache = Cache::open(100, 1, CacheMode::OnDemand, Some(Box::new(|_dst, _fmt| -1)))
            .unwrap();
        let mut dst = vec![0.0f32; 10];
        assert!(cache.read(&mut dst, 10).is_err());
    }

    #[test]
    fn set_time_preserves_buffered_frames() {
        let cache = Cache::open(100, 2, CacheMode::OnDemand, None).unwrap();
        let chunk = vec![3.0f32; 50 * 2];
        cache.write(&chunk, 50, FormatDescriptor::new(44_100, 2));

        cache.set_time(200).unwrap();
        assert_eq!(cache.delay(), 50);

        let mut dst = vec![0.0f32; 50 * 2];
        let (frames, _) = cache.read(&mut dst, 50).unwrap();
        assert_eq!(frames, 50);
        assert!(dst.iter().all(|&s| s == 3.0));
    }

    #[test]
    fn set_time_rejects_shrink_below_fill() {
        let cache = Cache::open(100, 2, CacheMode::OnDemand, None).unwrap();
        let chunk = vec![1.0f32; 80 * 2];
        cache.write(&chunk, 80, FormatDescriptor::new(44_100, 2));
        assert!(cache.set_time(40).is_err());
    }

    #[test]
    fn filling_tracks_partial_fill_and_saturates_at_ready() {
        let cache = Cache::open(100, 1, CacheMode::OnDemand, None).unwrap();
        assert_eq!(cache.filling(), 0);

        let chunk = vec![1.0f32; 40];
        cache.write(&chunk, 40, FormatDescriptor::new(44_100, 1));
        assert_eq!(cache.filling(), 40);
        assert!(!cache.is_ready());

        cache.write(&chunk, 40, FormatDescriptor::new(44_100, 1));
        assert_eq!(cache.filling(), 80);
        assert!(!cache.is_ready());

        let rest = vec![1.0f32; 20];
        cache.write(&rest, 20, FormatDescriptor::new(44_100, 1));
        assert!(cache.is_ready());
        assert_eq!(cache.filling(), 100);
    }
}
