//! Media-playlist writer: a FIFO of segments rendered to `#EXTM3U` text.
//! No BOM, `\n` line ends, version 3 only.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Segment {
    pub duration: f32,
    pub url: String,
    pub sequence: u64,
    pub path: PathBuf,
}

pub struct M3u8Writer {
    playlist: VecDeque<Segment>,
    capacity: usize,
}

impl M3u8Writer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            playlist: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Append a finished segment, dropping the head when the FIFO is full.
    /// Returns the evicted segment so the caller can delete its file.
    pub fn add_segment(
        &mut self,
        duration: f32,
        url: String,
        sequence: u64,
        path: PathBuf,
    ) -> Option<Segment> {
        let evicted = if self.playlist.len() == self.capacity {
            self.playlist.pop_front()
        } else {
            None
        };
        self.playlist.push_back(Segment {
            duration,
            url,
            sequence,
            path,
        });
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.playlist.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.playlist.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.playlist.len() == self.capacity
    }

    #[must_use]
    pub fn head(&self) -> Option<&Segment> {
        self.playlist.front()
    }

    /// Largest segment duration rounded up; players size their buffers on it.
    #[must_use]
    pub fn target_duration(&self) -> u32 {
        self.playlist
            .iter()
            .map(|s| s.duration.ceil() as u32)
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn to_text(&self) -> String {
        if self.playlist.is_empty() {
            return String::new();
        }
        let mut text = String::with_capacity(256);
        text.push_str("#EXTM3U\n");
        text.push_str("#EXT-X-VERSION:3\n");
        let _ = writeln!(text, "#EXT-X-TARGETDURATION:{}", self.target_duration());
        let first_sequence = self.playlist.front().map_or(0, |s| s.sequence);
        let _ = writeln!(text, "#EXT-X-MEDIA-SEQUENCE:{first_sequence}");
        for segment in &self.playlist {
            let _ = writeln!(text, "#EXTINF:{:.3},", segment.duration);
            text.push_str(&segment.url);
            text.push('\n');
        }
        text
    }
}
