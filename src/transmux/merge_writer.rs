//! Merge-writing buffer: coalesces many small container writes into one send
//! segment, up to a latency budget or the next video keyframe.
//!
//! Muxers serialise frames into slots returned by `allocate`, flush the
//! in-progress segment before writing a keyframe, and poll
//! `peek_completed_segment` after each frame. Completed segments from the
//! most recent keyframe onward stay queued so a newly attached subscriber can
//! be primed without waiting for the next keyframe. Every offset comes from
//! buffer-internal state; there is no external running counter to drift.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Backstop on retained segments for keyframe-less (audio-only) output.
const MAX_RETAINED_SEGMENTS: usize = 512;

struct MwSegment {
    data: Bytes,
    key: bool,
}

pub struct MergeWritingBuffer {
    exist_video: bool,
    latency_ms: i64,
    current: BytesMut,
    start_dts: i64,
    end_dts: i64,
    key_segment: bool,
    has_data: bool,
    segments: VecDeque<MwSegment>,
}

impl MergeWritingBuffer {
    #[must_use]
    pub fn new(exist_video: bool, latency_ms: u64) -> Self {
        Self {
            exist_video,
            latency_ms: latency_ms as i64,
            current: BytesMut::with_capacity(16 * 1024),
            start_dts: 0,
            end_dts: 0,
            key_segment: false,
            has_data: false,
            segments: VecDeque::new(),
        }
    }

    /// Reserve `n` contiguous writable bytes for a frame with the given dts.
    /// `key` marks a video keyframe starting a new group.
    pub fn allocate(&mut self, n: usize, dts: i64, key: bool) -> &mut [u8] {
        if !self.has_data {
            self.start_dts = dts;
            self.key_segment = key && self.exist_video;
            self.has_data = true;
        }
        self.end_dts = dts;
        let start = self.current.len();
        self.current.resize(start + n, 0);
        &mut self.current[start..]
    }

    /// Emit the in-progress segment once it spans at least the latency
    /// budget. A zero budget emits per frame.
    pub fn peek_completed_segment(&mut self) -> Option<Bytes> {
        if !self.has_data {
            return None;
        }
        if self.latency_ms > 0 && self.end_dts - self.start_dts < self.latency_ms {
            return None;
        }
        self.cut()
    }

    /// Emit whatever is in progress, regardless of duration.
    pub fn flush_segment(&mut self) -> Option<Bytes> {
        if !self.has_data {
            return None;
        }
        self.cut()
    }

    /// Visit the retained segments from the most recent keyframe onward, in
    /// order. Nothing is visited before the first keyframe segment exists.
    pub fn read_segments_from_key_frame(&self, mut f: impl FnMut(Bytes)) {
        let Some(start) = self.segments.iter().rposition(|s| s.key) else {
            return;
        };
        for segment in self.segments.iter().skip(start) {
            f(segment.data.clone());
        }
    }

    #[must_use]
    pub fn retained_segment_count(&self) -> usize {
        self.segments.len()
    }

    fn cut(&mut self) -> Option<Bytes> {
        self.has_data = false;
        if self.current.is_empty() {
            self.key_segment = false;
            return None;
        }
        let data = self.current.split().freeze();
        if self.exist_video {
            if self.key_segment {
                // A new group starts here; the previous one is unreachable
                // for replay and can go.
                self.segments.clear();
            }
            if self.segments.len() >= MAX_RETAINED_SEGMENTS {
                self.segments.pop_front();
            }
            self.segments.push_back(MwSegment {
                data: data.clone(),
                key: self.key_segment,
            });
        }
        self.key_segment = false;
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(buffer: &mut MergeWritingBuffer, byte: u8, n: usize, dts: i64, key: bool) {
        let slot = buffer.allocate(n, dts, key);
        slot.fill(byte);
    }

    #[test]
    fn completes_at_latency_threshold() {
        let mut buffer = MergeWritingBuffer::new(true, 350);
        write(&mut buffer, 1, 10, 0, true);
        assert!(buffer.peek_completed_segment().is_none());
        write(&mut buffer, 2, 10, 200, false);
        assert!(buffer.peek_completed_segment().is_none());
        write(&mut buffer, 3, 10, 350, false);
        let segment = buffer.peek_completed_segment().expect("segment due");
        assert_eq!(segment.len(), 30);
        assert_eq!(&segment[..10], &[1u8; 10]);
    }

    #[test]
    fn zero_latency_emits_per_frame() {
        let mut buffer = MergeWritingBuffer::new(true, 0);
        write(&mut buffer, 7, 4, 0, true);
        assert_eq!(buffer.peek_completed_segment().unwrap().len(), 4);
        write(&mut buffer, 8, 4, 33, false);
        assert_eq!(buffer.peek_completed_segment().unwrap().len(), 4);
    }

    #[test]
    fn keyframe_replay_covers_current_group_only() {
        let mut buffer = MergeWritingBuffer::new(true, 0);
        write(&mut buffer, 1, 8, 0, true);
        buffer.peek_completed_segment();
        write(&mut buffer, 2, 8, 33, false);
        buffer.peek_completed_segment();
        // Next group: the first one becomes unreachable.
        write(&mut buffer, 3, 8, 66, true);
        buffer.peek_completed_segment();
        write(&mut buffer, 4, 8, 99, false);
        buffer.peek_completed_segment();

        let mut replay = Vec::new();
        buffer.read_segments_from_key_frame(|s| replay.push(s[0]));
        assert_eq!(replay, vec![3, 4]);
        assert_eq!(buffer.retained_segment_count(), 2);
    }

    #[test]
    fn flush_emits_short_segment() {
        let mut buffer = MergeWritingBuffer::new(true, 350);
        write(&mut buffer, 9, 16, 0, true);
        let segment = buffer.flush_segment().expect("flushed");
        assert_eq!(segment.len(), 16);
        assert!(buffer.flush_segment().is_none());
    }

    #[test]
    fn audio_only_retains_nothing_for_replay() {
        let mut buffer = MergeWritingBuffer::new(false, 0);
        write(&mut buffer, 5, 8, 0, false);
        buffer.peek_completed_segment();
        let mut replay = Vec::new();
        buffer.read_segments_from_key_frame(|s| replay.push(s));
        assert!(replay.is_empty());
        assert_eq!(buffer.retained_segment_count(), 0);
    }
}
