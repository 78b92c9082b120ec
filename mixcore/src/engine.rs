/*!
    Engine: owns the stream table, the mixer thread, and the sink.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::format::FormatDescriptor;
use crate::mixer::{DEFAULT_MAX_SILENCE, Mixer};
use crate::sample::VOLUME_MAX;
use crate::sink::Sink;
use crate::stream::Stream;

/// Upper bound on simultaneously active stream slots.
pub const MAX_STREAMS: usize = 256;

/// Output format and sizing knobs for an [`Engine`], with sensible
/// defaults for sample rate, channel count, and tick/cache sizing.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub output_format: FormatDescriptor,
    pub default_cache_capacity: usize,
    pub tick_frames: usize,
    pub max_silence: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_format: FormatDescriptor::new(48_000, 2),
            default_cache_capacity: 48_000,
            tick_frames: 1024,
            max_silence: DEFAULT_MAX_SILENCE,
        }
    }
}

pub type StreamId = usize;

struct StreamSlot {
    stream: Arc<Stream>,
}

/// Contiguous stream table indexed by [`StreamId`]: slots are reused by
/// index rather than the table shrinking, so a `StreamId` stays valid
/// until that slot is explicitly removed.
pub struct StreamTable {
    slots: Mutex<Vec<Option<StreamSlot>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Insert `stream` into a free slot, reusing a tombstoned one where
    /// possible. Returns `None` once [`MAX_STREAMS`] slots are occupied.
    pub fn insert(&self, stream: Arc<Stream>) -> Option<StreamId> {
        let mut slots = self.slots.lock();
        if let Some(id) = slots.iter().position(|s| s.is_none()) {
            slots[id] = Some(StreamSlot { stream });
            return Some(id);
        }
        if slots.len() >= MAX_STREAMS {
            return None;
        }
        slots.push(Some(StreamSlot { stream }));
        Some(slots.len() - 1)
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.slots.lock().get(id).and_then(|s| s.as_ref().map(|s| Arc::clone(&s.stream)))
    }

    /// Remove a stream's slot and return its handle so the caller can
    /// `close()` it outside the table lock.
    pub fn remove(&self, id: StreamId) -> Option<Arc<Stream>> {
        let mut slots = self.slots.lock();
        slots.get_mut(id).and_then(|s| s.take()).map(|s| s.stream)
    }

    /// Snapshot the currently occupied slots. Cloning out the `Arc`s
    /// keeps the table lock held only for the duration of the
    /// enumeration itself, not for the reads that follow.
    pub fn iter_active(&self) -> Vec<Arc<Stream>> {
        self.slots
            .lock()
            .iter()
            .filter_map(|slot| slot.as_ref().map(|s| Arc::clone(&s.stream)))
            .collect()
    }

    /// Tombstone-reap streams the mixer has already marked ended.
    pub fn reap_ended(&self) -> Vec<Arc<Stream>> {
        let mut slots = self.slots.lock();
        let mut reaped = Vec::new();
        for slot in slots.iter_mut() {
            let ended = slot.as_ref().is_some_and(|s| s.stream.is_ended());
            if ended {
                if let Some(s) = slot.take() {
                    reaped.push(s.stream);
                }
            }
        }
        reaped
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

struct EngineInner {
    mixer_handle: Option<JoinHandle<()>>,
}

/// Top-level handle: owns the stream table, master volume, and the
/// mixer thread driving `sink`.
pub struct Engine {
    config: EngineConfig,
    table: Arc<StreamTable>,
    master_volume: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    inner: Mutex<EngineInner>,
}

impl Engine {
    /// Open the engine and start its mixer thread against `sink`.
    ///
    /// `sink` is prepared synchronously here, before the mixer thread is
    /// spawned, so a device that isn't available surfaces as
    /// [`EngineError::SinkUnavailable`] to the caller instead of silently
    /// failing every tick on the mixer thread.
    pub fn open(config: EngineConfig, mut sink: Box<dyn Sink>) -> EngineResult<Arc<Self>> {
        sink.prepare(config.output_format)
            .map_err(EngineError::SinkUnavailable)?;

        let table = Arc::new(StreamTable::new());
        let stop = Arc::new(AtomicBool::new(false));
        let master_volume = Arc::new(AtomicU32::new(VOLUME_MAX));

        let mixer_table = Arc::clone(&table);
        let mixer_stop = Arc::clone(&stop);
        let mixer_volume = Arc::clone(&master_volume);
        let out_format = config.output_format;
        let tick_frames = config.tick_frames;
        let max_silence = config.max_silence;

        let mixer_handle = thread::spawn(move || {
            let mut mixer = Mixer::with_sink_prepared(out_format, tick_frames, max_silence);
            loop {
                if mixer_stop.load(Ordering::Acquire) {
                    break;
                }
                let volume = mixer_volume.load(Ordering::Relaxed);
                if mixer.tick(&mixer_table, volume, sink.as_mut()).is_err() {
                    break;
                }
            }
            sink.close();
        });

        Ok(Arc::new(Self {
            config,
            table,
            master_volume,
            stop,
            inner: Mutex::new(EngineInner {
                mixer_handle: Some(mixer_handle),
            }),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add a stream to the mixer. Fails with
    /// [`EngineError::StreamTableFull`] once [`MAX_STREAMS`] streams are
    /// already active.
    pub fn add_stream(&self, stream: Arc<Stream>) -> EngineResult<StreamId> {
        self.table
            .insert(stream)
            .ok_or(EngineError::StreamTableFull { max: MAX_STREAMS })
    }

    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.table.get(id)
    }

    pub fn remove_stream(&self, id: StreamId) {
        if let Some(stream) = self.table.remove(id) {
            stream.close();
        }
    }

    /// Sweep streams the mixer ended on its own and release their
    /// resources.
    pub fn reap_ended(&self) {
        for stream in self.table.reap_ended() {
            stream.close();
        }
    }

    pub fn set_master_volume(&self, volume: u32) {
        self.master_volume.store(volume.min(VOLUME_MAX), Ordering::Relaxed);
    }

    pub fn master_volume(&self) -> u32 {
        self.master_volume.load(Ordering::Relaxed)
    }

    /// Stop the mixer thread and release every remaining stream.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.inner.lock().mixer_handle.take() {
            let _ = handle.join();
        }
        for id in 0..self.table.slots.lock().len() {
            self.remove_stream(id);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheMode;
    use crate::resampler::PassthroughResampler;
    use crate::sample::Sample;
    use crate::sink::RingSink;

    #[test]
    fn add_remove_reuses_slot() {
        let table = StreamTable::new();
        let cb = Box::new(|dst: &mut [Sample], format: &mut FormatDescriptor| {
            for s in dst.iter_mut() {
                *s = 0.0;
            }
            *format = FormatDescriptor::new(1000, 1);
            dst.len() as i64
        });
        let stream = Stream::open_pull(
            cb,
            Box::new(PassthroughResampler::new()),
            FormatDescriptor::new(1000, 1),
            100,
            CacheMode::OnDemand,
        )
        .unwrap();

        let id = table.insert(stream).unwrap();
        assert!(table.get(id).is_some());
        let removed = table.remove(id);
        assert!(removed.is_some());
        assert!(table.get(id).is_none());
    }

    #[test]
    fn engine_open_close_round_trip() {
        let config = EngineConfig {
            tick_frames: 64,
            ..EngineConfig::default()
        };
        let sink = Box::new(RingSink::new(4096));
        let engine = Engine::open(config, sink).unwrap();
        engine.set_master_volume(80);
        assert_eq!(engine.master_volume(), 80);
        engine.close();
    }
}
