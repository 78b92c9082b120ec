/*!
    Single-consumer mixer loop: enumerate active streams, pull, scale,
    sum, and drive the sink.
*/

use std::time::{Duration, Instant};

use crate::engine::StreamTable;
use crate::format::FormatDescriptor;
use crate::sample::{Accumulator, SILENCE, Sample, VOLUME_MAX, scale};
use crate::sink::Sink;

/// Default idle window before a running sink drains back to stopped.
pub const DEFAULT_MAX_SILENCE: Duration = Duration::from_secs(5);

/// Minimum-latency sleep while the sink is stopped and there is no
/// input.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinkState {
    Stopped,
    Running,
}

/// Drives one mixer tick loop at a time; owns no thread itself, so the
/// engine can run it on whichever thread it spawns, independent of the
/// stream table's own storage.
pub struct Mixer {
    out_format: FormatDescriptor,
    tick_frames: usize,
    max_silence: Duration,
    sink_state: SinkState,
    idle_since: Option<Instant>,
}

impl Mixer {
    pub fn new(out_format: FormatDescriptor, tick_frames: usize, max_silence: Duration) -> Self {
        Self {
            out_format,
            tick_frames,
            max_silence,
            sink_state: SinkState::Stopped,
            idle_since: None,
        }
    }

    /// Build a mixer whose sink the caller has already prepared, so the
    /// first tick drives it directly instead of calling `prepare()` again.
    pub(crate) fn with_sink_prepared(
        out_format: FormatDescriptor,
        tick_frames: usize,
        max_silence: Duration,
    ) -> Self {
        Self {
            sink_state: SinkState::Running,
            ..Self::new(out_format, tick_frames, max_silence)
        }
    }

    /// Run one tick against every stream in `table`, writing to `sink`.
    /// Returns `Err` once the sink has failed both a write and a
    /// recovery attempt.
    pub fn tick(
        &mut self,
        table: &StreamTable,
        master_volume: u32,
        sink: &mut dyn Sink,
    ) -> Result<(), String> {
        let channels = self.out_format.channels.max(1) as usize;
        let mut output = vec![SILENCE; self.tick_frames * channels];
        let mut scratch = vec![SILENCE; self.tick_frames * channels];
        let mut accumulators: Vec<Accumulator> = Vec::new();
        let mut contribution = 0usize;
        let mut any_contributor = false;

        for stream in table.iter_active() {
            if !stream.is_active() {
                continue;
            }

            let (frames, _format) = match stream.cache().read(&mut scratch, self.tick_frames) {
                Ok(result) => result,
                Err(_) => {
                    stream.mark_ended();
                    continue;
                }
            };

            // Updates `played` and fires the stream's own BUFFERING/READY
            // callback edge; the mixer doesn't need the event itself.
            stream.observe_read(frames);

            if frames == 0 {
                continue;
            }

            let volume = stream.volume_fraction();
            if accumulators.len() < frames * channels {
                accumulators.resize(frames * channels, Accumulator::default());
            }
            for i in 0..frames * channels {
                let scaled = scale(scratch[i], volume, VOLUME_MAX);
                accumulators[i].add(scaled);
            }

            any_contributor = true;
            contribution = contribution.max(frames);
        }

        for (i, acc) in accumulators.iter().enumerate().take(contribution * channels) {
            output[i] = scale(acc.finish(), master_volume, VOLUME_MAX);
        }

        // Tear down any stream's cache/resampler the moment it's found
        // ended, rather than leaving that to a caller who may never poll
        // for it (a CacheMode::Thread producer thread otherwise runs
        // forever past end-of-stream).
        for stream in table.reap_ended() {
            stream.close();
        }

        self.drive_sink(sink, &output, contribution, any_contributor)
    }

    fn drive_sink(
        &mut self,
        sink: &mut dyn Sink,
        output: &[Sample],
        contribution_frames: usize,
        any_contributor: bool,
    ) -> Result<(), String> {
        match (self.sink_state, any_contributor) {
            (SinkState::Stopped, false) => {
                std::thread::sleep(IDLE_POLL_INTERVAL);
                Ok(())
            }
            (SinkState::Stopped, true) => {
                sink.prepare(self.out_format)?;
                self.write_with_recovery(sink, output, contribution_frames)?;
                self.sink_state = SinkState::Running;
                self.idle_since = None;
                Ok(())
            }
            (SinkState::Running, false) => {
                let idle_since = *self.idle_since.get_or_insert_with(Instant::now);
                if idle_since.elapsed() > self.max_silence {
                    sink.drain();
                    self.sink_state = SinkState::Stopped;
                    self.idle_since = None;
                    Ok(())
                } else {
                    let channels = self.out_format.channels.max(1) as usize;
                    let silence = vec![SILENCE; self.tick_frames * channels];
                    self.write_with_recovery(sink, &silence, self.tick_frames)
                }
            }
            (SinkState::Running, true) => {
                self.idle_since = None;
                self.write_with_recovery(sink, output, contribution_frames)
            }
        }
    }

    fn write_with_recovery(
        &mut self,
        sink: &mut dyn Sink,
        output: &[Sample],
        frames: usize,
    ) -> Result<(), String> {
        if sink.write(output, frames).is_ok() {
            return Ok(());
        }
        if sink.recover() && sink.write(output, frames).is_ok() {
            return Ok(());
        }
        Err("sink write failed after one recovery attempt".to_string())
    }
}
