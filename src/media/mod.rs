//! Elementary-stream data model shared by the demux seam, the GOP cache and
//! every transmuxer.
//!
//! `AvPacket` payloads are `Bytes` so a packet cached in the GOP buffer and a
//! packet in flight to a transmuxer share one allocation -- cloning only bumps
//! the refcount.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Millisecond timebase used by the FLV/RTMP side of the house.
pub const TIMEBASE_MILLIS: u32 = 1000;
/// 90 kHz timebase used by MPEG-TS and RTP.
pub const TIMEBASE_90KHZ: u32 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MediaType {
    Audio,
    Video,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CodecId {
    H264,
    H265,
    Aac,
    G711a,
    G711u,
}

impl CodecId {
    #[must_use]
    pub const fn media_type(self) -> MediaType {
        match self {
            Self::H264 | Self::H265 => MediaType::Video,
            Self::Aac | Self::G711a | Self::G711u => MediaType::Audio,
        }
    }

    /// Stable numeric tag, folded into `TransStreamId` derivation.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::H264 => 1,
            Self::H265 => 2,
            Self::Aac => 10,
            Self::G711a => 11,
            Self::G711u => 12,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Aac => "aac",
            Self::G711a => "g711a",
            Self::G711u => "g711u",
        };
        write!(f, "{name}")
    }
}

/// One announced elementary track. Immutable once the demuxer reports it;
/// shared as `Arc<AvStream>` between the source, its transmuxers and tests.
#[derive(Debug, Clone)]
pub struct AvStream {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: CodecId,
    /// Codec initialisation bytes (avcC / hvcC / AudioSpecificConfig).
    pub extra_data: Bytes,
    pub sample_rate: Option<u32>,
    /// Timebase of dts/pts values produced for this track.
    pub timebase: u32,
}

impl AvStream {
    #[must_use]
    pub fn new(index: usize, codec: CodecId, extra_data: Bytes, timebase: u32) -> Self {
        Self {
            index,
            media_type: codec.media_type(),
            codec,
            extra_data,
            sample_rate: None,
            timebase,
        }
    }

    #[must_use]
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    /// NALU length-field size recorded in avcC/hvcC, 4 when absent.
    #[must_use]
    pub fn nal_length_size(&self) -> usize {
        match self.codec {
            CodecId::H264 if self.extra_data.len() > 4 => {
                ((self.extra_data[4] & 0x03) + 1) as usize
            }
            CodecId::H265 if self.extra_data.len() > 21 => {
                ((self.extra_data[21] & 0x03) + 1) as usize
            }
            _ => 4,
        }
    }
}

/// One demuxed frame. The payload is a slice of a `PacketPool` allocation
/// that reserved header room in front, so container prefixes can be written
/// without another copy.
#[derive(Debug, Clone)]
pub struct AvPacket {
    pub index: usize,
    pub media_type: MediaType,
    pub key: bool,
    pub dts: i64,
    pub pts: i64,
    pub timebase: u32,
    pub data: Bytes,
}

impl AvPacket {
    #[must_use]
    pub fn convert_dts(&self, timebase: u32) -> i64 {
        rescale(self.dts, self.timebase, timebase)
    }

    #[must_use]
    pub fn convert_pts(&self, timebase: u32) -> i64 {
        rescale(self.pts, self.timebase, timebase)
    }

    /// Video payload with AVCC length prefixes rewritten as Annex-B start
    /// codes, for TS and WebRTC output. `nal_length_size` comes from the
    /// track's extradata.
    #[must_use]
    pub fn annexb_data(&self, nal_length_size: usize) -> Bytes {
        avcc_to_annexb(&self.data, nal_length_size)
    }
}

/// Rescale a timestamp between integer timebases without overflowing i64
/// for any realistic stream duration.
#[must_use]
pub fn rescale(ts: i64, from: u32, to: u32) -> i64 {
    if from == to || from == 0 {
        return ts;
    }
    ts * i64::from(to) / i64::from(from)
}

/// Rewrite length-prefixed NALUs into start-code form. Truncated length
/// fields end the conversion at the last complete unit.
#[must_use]
pub fn avcc_to_annexb(data: &[u8], nal_length_size: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    let mut cursor = 0usize;
    while cursor + nal_length_size <= data.len() {
        let mut len = 0usize;
        for &b in &data[cursor..cursor + nal_length_size] {
            len = (len << 8) | b as usize;
        }
        cursor += nal_length_size;
        if len == 0 || cursor + len > data.len() {
            break;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&data[cursor..cursor + len]);
        cursor += len;
    }
    out.freeze()
}

/// Parameter sets (SPS/PPS/VPS) from an avcC/hvcC record, rewritten with
/// Annex-B start codes. Extradata that already carries start codes passes
/// through untouched.
#[must_use]
pub fn decoder_config_to_annexb(codec: CodecId, extra: &[u8]) -> Bytes {
    if extra.starts_with(&[0, 0, 0, 1]) || extra.starts_with(&[0, 0, 1]) {
        return Bytes::copy_from_slice(extra);
    }
    let mut out = BytesMut::with_capacity(extra.len() + 16);
    let mut push_units = |data: &[u8], mut cursor: usize, count: usize| -> usize {
        for _ in 0..count {
            if cursor + 2 > data.len() {
                return cursor;
            }
            let len = usize::from(u16::from_be_bytes([data[cursor], data[cursor + 1]]));
            cursor += 2;
            if cursor + len > data.len() {
                return cursor;
            }
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&data[cursor..cursor + len]);
            cursor += len;
        }
        cursor
    };

    match codec {
        CodecId::H264 if extra.len() > 6 => {
            let sps_count = usize::from(extra[5] & 0x1F);
            let cursor = push_units(extra, 6, sps_count);
            if cursor < extra.len() {
                let pps_count = usize::from(extra[cursor]);
                push_units(extra, cursor + 1, pps_count);
            }
        }
        CodecId::H265 if extra.len() > 22 => {
            let num_arrays = usize::from(extra[22]);
            let mut cursor = 23;
            for _ in 0..num_arrays {
                if cursor + 3 > extra.len() {
                    break;
                }
                let count = usize::from(u16::from_be_bytes([extra[cursor + 1], extra[cursor + 2]]));
                cursor = push_units(extra, cursor + 3, count);
            }
        }
        _ => return Bytes::copy_from_slice(extra),
    }
    out.freeze()
}

/// Convenience shared-track list alias used across the source and muxers.
pub type TrackList = Vec<Arc<AvStream>>;
