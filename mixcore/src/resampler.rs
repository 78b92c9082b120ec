/*!
    The external collaborator that sits between a stream's raw input and
    its [`crate::cache::Cache`].

    `mixcore` does not implement resampling itself — streams are
    constructed against any [`Resampler`] implementation. [`PassthroughResampler`]
    is the stock implementation for sources that are already at the
    engine's output format.
*/

use crate::format::FormatDescriptor;
use crate::sample::Sample;

/// Converts frames from a stream's native input format to the engine's
/// output format.
///
/// Mirrors the cache's own pull/push shape so a resampler can sit
/// directly between an input callback and a [`crate::cache::Cache`]
/// without the stream needing to know which side is driving.
pub trait Resampler: Send {
    /// Pull up to `max_frames` converted frames into `dst`, reporting the
    /// output format of the batch actually written.
    fn read(&mut self, dst: &mut [Sample], max_frames: usize) -> (usize, FormatDescriptor);

    /// Push `frames` frames of `src_format` input for conversion.
    /// Returns the number of input frames consumed.
    fn write(&mut self, src: &[Sample], frames: usize, src_format: FormatDescriptor) -> usize;

    /// Discard any buffered input/output and internal filter state.
    fn flush(&mut self);

    /// Frames currently buffered inside the resampler, not yet readable.
    fn delay(&self) -> usize;

    /// Release any resources tied to the current conversion.
    fn close(&mut self) {}
}

/// Stock [`Resampler`] for sources already at the target format: frames
/// pass through unchanged and the reported format is whatever the
/// caller wrote.
#[derive(Default)]
pub struct PassthroughResampler {
    buffer: Vec<Sample>,
    format: FormatDescriptor,
}

impl PassthroughResampler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Resampler for PassthroughResampler {
    fn read(&mut self, dst: &mut [Sample], max_frames: usize) -> (usize, FormatDescriptor) {
        if self.format.channels == 0 {
            return (0, FormatDescriptor::UNKNOWN);
        }
        let channels = self.format.channels as usize;
        let avail_frames = self.buffer.len() / channels;
        let frames = avail_frames.min(max_frames);
        let n_samples = frames * channels;
        dst[..n_samples].copy_from_slice(&self.buffer[..n_samples]);
        self.buffer.drain(..n_samples);
        (frames, self.format)
    }

    fn write(&mut self, src: &[Sample], frames: usize, src_format: FormatDescriptor) -> usize {
        if !src_format.is_unknown() {
            self.format = src_format;
        }
        let channels = self.format.channels.max(1) as usize;
        self.buffer.extend_from_slice(&src[..frames * channels]);
        frames
    }

    fn flush(&mut self) {
        self.buffer.clear();
    }

    fn delay(&self) -> usize {
        let channels = self.format.channels.max(1) as usize;
        self.buffer.len() / channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_round_trips_frames() {
        let mut r = PassthroughResampler::new();
        let format = FormatDescriptor::new(44_100, 2);
        let input = vec![1.0f32, 2.0, 3.0, 4.0];
        assert_eq!(r.write(&input, 2, format), 2);
        assert_eq!(r.delay(), 2);

        let mut out = vec![0.0f32; 4];
        let (frames, out_format) = r.read(&mut out, 2);
        assert_eq!(frames, 2);
        assert_eq!(out_format, format);
        assert_eq!(out, input);
        assert_eq!(r.delay(), 0);
    }

    #[test]
    fn flush_drops_buffered_frames() {
        let mut r = PassthroughResampler::new();
        r.write(&[1.0, 2.0], 1, FormatDescriptor::new(44_100, 2));
        r.flush();
        assert_eq!(r.delay(), 0);
    }
}
