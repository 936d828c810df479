//! Fixed-capacity circular audio buffer (§4.A).
//!
//! Frame-indexed, not byte-indexed: one slot holds one frame (one sample per
//! channel). The producer (the audio capture callback) is the sole writer of
//! `pos` and `last_frame_time`; readers take a snapshot under the same lock
//! and are responsible for clamping the ranges they request. `write` never
//! allocates — it copies straight into the preallocated backing `Vec` so it
//! stays safe to call from a real-time audio callback.

use parking_lot::Mutex;

struct Inner {
    /// Interleaved frames: `channels` samples per frame, `capacity_frames` frames.
    data: Vec<f32>,
    /// Next slot to be written; `pos` itself has not yet been written this wrap.
    pos: usize,
    /// Absolute UTC instant (seconds since epoch) of the most recently written frame.
    last_frame_time: f64,
    /// Becomes true once `capacity_frames` frames have been written at least once.
    wrapped: bool,
}

/// A lock-protected ring of `capacity_frames` multi-channel audio frames.
pub struct RingBuffer {
    capacity_frames: usize,
    channels: usize,
    inner: Mutex<Inner>,
}

impl RingBuffer {
    /// Creates a ring buffer holding `capacity_frames` frames of `channels` samples each.
    #[must_use]
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        assert!(capacity_frames > 0, "ring buffer capacity must be positive");
        assert!(channels > 0, "channel count must be positive");
        Self {
            capacity_frames,
            channels,
            inner: Mutex::new(Inner {
                data: vec![0.0; capacity_frames * channels],
                pos: 0,
                last_frame_time: 0.0,
                wrapped: false,
            }),
        }
    }

    /// Frame capacity `L`.
    #[must_use]
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Channel count `C`.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Appends `block` (interleaved frames, `block.len()` a multiple of `channels`).
    ///
    /// `last_frame_time` is the absolute capture time of the block's *last* frame.
    /// Holds the lock only for the duration of the copy.
    pub fn write(&self, block: &[f32], last_frame_time: f64) {
        assert!(
            block.len() % self.channels == 0,
            "block length must be a multiple of the channel count"
        );
        let frame_count = block.len() / self.channels;
        if frame_count == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let cap = self.capacity_frames;
        let ch = self.channels;

        if frame_count >= cap {
            // The block alone covers (or exceeds) the whole ring; only the
            // trailing `cap` frames survive. Copy them starting at slot 0.
            let tail = &block[(frame_count - cap) * ch..];
            inner.data.copy_from_slice(tail);
            inner.pos = 0;
            inner.wrapped = true;
        } else {
            let start = inner.pos;
            let first_len = (cap - start).min(frame_count);
            inner.data[start * ch..(start + first_len) * ch]
                .copy_from_slice(&block[..first_len * ch]);
            let remaining = frame_count - first_len;
            if remaining > 0 {
                inner.data[..remaining * ch].copy_from_slice(&block[first_len * ch..]);
                inner.wrapped = true;
            }
            let new_pos = (start + frame_count) % cap;
            if new_pos == 0 && frame_count > 0 {
                inner.wrapped = true;
            }
            inner.pos = new_pos;
        }

        inner.last_frame_time = last_frame_time;
    }

    /// Number of frames written so far that are valid to read, i.e. `min(total_written, L-1)`.
    fn valid_len(inner: &Inner, cap: usize) -> usize {
        if inner.wrapped {
            cap.saturating_sub(1)
        } else {
            inner.pos
        }
    }

    /// Returns the last `n` frames ending at `pos` (interleaved). `n = None` means
    /// the maximum available, up to `L-1`. Values larger than `L-1` are clamped.
    #[must_use]
    pub fn read(&self, n: Option<usize>) -> Vec<f32> {
        let inner = self.inner.lock();
        let cap = self.capacity_frames;
        let available = Self::valid_len(&inner, cap);
        let want = n.unwrap_or(cap.saturating_sub(1)).min(cap.saturating_sub(1));
        let want = want.min(available);
        Self::copy_range(&inner, cap, self.channels, -(want as i64), 0)
    }

    /// Returns frames in `[pos+start_offset, pos+end_offset)` mod `L`, both
    /// offsets non-positive and pre-clamped by the caller to `[-(L-1), 0]`.
    /// `start == end` returns an empty slice.
    #[must_use]
    pub fn slice(&self, start_offset_frames: i64, end_offset_frames: i64) -> Vec<f32> {
        let inner = self.inner.lock();
        let cap = self.capacity_frames;
        let lower = -((cap.saturating_sub(1)) as i64);
        let start = start_offset_frames.clamp(lower, 0);
        let end = end_offset_frames.clamp(lower, 0);
        if start >= end {
            return Vec::new();
        }
        Self::copy_range(&inner, cap, self.channels, start, end)
    }

    /// Copies frames in `[pos+start, pos+end)` mod `cap`, concatenating across
    /// the wrap point if the range straddles the array end.
    fn copy_range(inner: &Inner, cap: usize, ch: usize, start: i64, end: i64) -> Vec<f32> {
        let len = (end - start) as usize;
        if len == 0 {
            return Vec::new();
        }
        let begin = (inner.pos as i64 + start).rem_euclid(cap as i64) as usize;

        let mut out = Vec::with_capacity(len * ch);
        let first_len = (cap - begin).min(len);
        out.extend_from_slice(&inner.data[begin * ch..(begin + first_len) * ch]);
        let remaining = len - first_len;
        if remaining > 0 {
            out.extend_from_slice(&inner.data[..remaining * ch]);
        }
        out
    }

    /// Returns `(pos, last_frame_time)` atomically.
    #[must_use]
    pub fn timestamp_snapshot(&self) -> (usize, f64) {
        let inner = self.inner.lock();
        (inner.pos, inner.last_frame_time)
    }
}
