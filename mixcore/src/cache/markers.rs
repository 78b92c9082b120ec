use std::collections::VecDeque;

use crate::format::{FormatDescriptor, FormatMarker};

/// Ordered sequence of format markers for one cache.
///
/// Invariant: the sum of `run_length` across all markers equals the
/// cache's current fill level. Enforced by construction: every call that
/// adds frames to the cache goes through [`MarkerList::deposit`], and
/// every call that removes frames goes through [`MarkerList::take`].
#[derive(Default)]
pub(crate) struct MarkerList {
    markers: VecDeque<FormatMarker>,
}

impl MarkerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Record `n` newly-produced frames reported as format `format`.
    ///
    /// A new marker is appended when the list is empty, or when `format`
    /// is non-sentinel and differs from the tail marker's format;
    /// otherwise `n` is folded into the tail marker's run-length.
    pub fn deposit(&mut self, n: usize, format: FormatDescriptor) {
        if n == 0 {
            return;
        }
        let needs_new_marker = match self.markers.back() {
            None => true,
            Some(tail) => !format.is_unknown() && tail.format != format,
        };
        if needs_new_marker {
            self.markers.push_back(FormatMarker {
                format,
                run_length: 0,
            });
        }
        self.markers.back_mut().unwrap().run_length += n;
    }

    /// How many frames may be taken from the head marker in one read
    /// without crossing into a second format, and the head's format.
    ///
    /// Returns `None` if there are no markers.
    pub fn head_run(&self) -> Option<(usize, FormatDescriptor)> {
        let head = self.markers.front()?;
        let clamp = if self.markers.len() > 1 {
            Some(head.run_length)
        } else {
            None
        };
        Some((clamp.unwrap_or(usize::MAX), head.format))
    }

    /// Consume `n` frames from the head marker, retiring it if its
    /// run-length reaches zero.
    pub fn take(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let retire = {
            let head = self
                .markers
                .front_mut()
                .expect("take() called with no markers");
            head.run_length = head.run_length.saturating_sub(n);
            head.run_length == 0
        };
        if retire {
            self.markers.pop_front();
        }
    }

    #[cfg(test)]
    pub fn total_run_length(&self) -> usize {
        self.markers.iter().map(|m| m.run_length).sum()
    }
}
