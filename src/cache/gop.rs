//! GOP cache: the packets between the two most recent video keyframes.
//!
//! The buffer is either empty or starts at a video keyframe. `add_packet`
//! reports whether it took ownership of the packet: packets arriving before
//! the first keyframe (and overflow drops) are refused so the caller frees
//! their just-committed pool tail, while cached packets are released later
//! through the discard callback in strict FIFO order -- the only order the
//! packet pool's head-eviction ledger can follow.

use crate::media::{AvPacket, MediaType};
use std::collections::VecDeque;

/// Upper bound on cached packets, a backstop against keyframe-less encoders.
const MAX_CACHED_PACKETS: usize = 4096;

pub type DiscardFn = Box<dyn FnMut(&AvPacket) + Send>;

pub struct GopBuffer {
    packets: VecDeque<AvPacket>,
    keyframes: usize,
    discard: Option<DiscardFn>,
}

impl GopBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            packets: VecDeque::with_capacity(256),
            keyframes: 0,
            discard: None,
        }
    }

    /// Invoked for every evicted packet, oldest first. The source wires this
    /// to `PacketPool::free_head`.
    pub fn set_discard_handler(&mut self, f: DiscardFn) {
        self.discard = Some(f);
    }

    /// Cache a packet. Returns `false` when the packet was not taken (no
    /// keyframe anchor yet, or the backstop is full); refused packets never
    /// reach the discard callback.
    pub fn add_packet(&mut self, packet: AvPacket) -> bool {
        let video_key = packet.key && packet.media_type == MediaType::Video;

        if video_key && self.keyframes >= 1 {
            self.evict_all();
        }

        if !video_key && self.keyframes == 0 {
            // Nothing decodable to anchor on yet.
            return false;
        }

        if self.packets.len() >= MAX_CACHED_PACKETS {
            tracing::warn!(
                cached = self.packets.len(),
                "gop cache overflow, refusing incoming packet"
            );
            return false;
        }

        if video_key {
            self.keyframes += 1;
        }
        self.packets.push_back(packet);
        true
    }

    pub fn peek_all(&self, mut f: impl FnMut(&AvPacket)) {
        for packet in &self.packets {
            f(packet);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[must_use]
    pub const fn keyframe_count(&self) -> usize {
        self.keyframes
    }

    /// Evict every cached packet through the discard callback.
    pub fn clear(&mut self) {
        self.evict_all();
    }

    pub fn close(&mut self) {
        self.discard = None;
        self.packets.clear();
        self.keyframes = 0;
    }

    fn evict_all(&mut self) {
        while let Some(packet) = self.packets.pop_front() {
            if packet.key && packet.media_type == MediaType::Video {
                self.keyframes -= 1;
            }
            if let Some(f) = self.discard.as_mut() {
                f(&packet);
            }
        }
    }
}

impl Default for GopBuffer {
    fn default() -> Self {
        Self::new()
    }
}
