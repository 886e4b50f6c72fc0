//! RTMP egress transmuxer: FLV tag bodies wrapped in RTMP chunks, coalesced
//! through the merge-writing buffer.
//!
//! Each message is one type-0 chunk header followed by the FLV data prefix
//! and the payload, with a 1-byte type-3 separator every `chunk_size` bytes.
//! Timestamps at or past 0xFFFFFF spill into the 4-byte extended field on the
//! type-0 header and every continuation.

use crate::config::AppConfig;
use crate::flv;
use crate::media::{AvPacket, AvStream, MediaType, TIMEBASE_MILLIS};
use crate::transmux::{
    BaseTransStream, FactoryContext, MergeWritingBuffer, MuxOutput, TransMuxError, TransStream,
};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

pub const CHUNK_STREAM_AUDIO: u8 = 4;
pub const CHUNK_STREAM_VIDEO: u8 = 6;
pub const MSG_TYPE_AUDIO: u8 = 8;
pub const MSG_TYPE_VIDEO: u8 = 9;
const MSG_STREAM_ID: u32 = 1;

pub const DEFAULT_CHUNK_SIZE: usize = 4096;
const EXTENDED_TS_THRESHOLD: i64 = 0xFF_FFFF;

/// Outgoing chunk-stream descriptor for one message class.
#[derive(Clone, Copy)]
struct ChunkHeader {
    csid: u8,
    msg_type: u8,
}

impl ChunkHeader {
    const fn audio() -> Self {
        Self {
            csid: CHUNK_STREAM_AUDIO,
            msg_type: MSG_TYPE_AUDIO,
        }
    }

    const fn video() -> Self {
        Self {
            csid: CHUNK_STREAM_VIDEO,
            msg_type: MSG_TYPE_VIDEO,
        }
    }

    /// Serialise a type-0 header; returns bytes written (12, or 16 with the
    /// extended timestamp).
    fn write_type0(self, buf: &mut [u8], timestamp: i64, length: usize) -> usize {
        let extended = timestamp >= EXTENDED_TS_THRESHOLD;
        let ts_field = if extended {
            EXTENDED_TS_THRESHOLD as u32
        } else {
            timestamp as u32
        };
        buf[0] = self.csid & 0x3F;
        buf[1] = ((ts_field >> 16) & 0xFF) as u8;
        buf[2] = ((ts_field >> 8) & 0xFF) as u8;
        buf[3] = (ts_field & 0xFF) as u8;
        buf[4] = ((length >> 16) & 0xFF) as u8;
        buf[5] = ((length >> 8) & 0xFF) as u8;
        buf[6] = (length & 0xFF) as u8;
        buf[7] = self.msg_type;
        buf[8..12].copy_from_slice(&MSG_STREAM_ID.to_le_bytes());
        if extended {
            buf[12..16].copy_from_slice(&(timestamp as u32).to_be_bytes());
            16
        } else {
            12
        }
    }

    /// 1-byte type-3 separator plus the extended timestamp when in effect.
    fn write_type3(self, buf: &mut [u8], timestamp: i64) -> usize {
        buf[0] = (0x3 << 6) | (self.csid & 0x3F);
        if timestamp >= EXTENDED_TS_THRESHOLD {
            buf[1..5].copy_from_slice(&(timestamp as u32).to_be_bytes());
            5
        } else {
            1
        }
    }
}

/// Total serialised size of one message: type-0 header, FLV data prefix,
/// payload and continuation separators.
fn message_size(payload_size: usize, chunk_size: usize, timestamp: i64) -> usize {
    let num_continuations = payload_size.saturating_sub(1) / chunk_size;
    let mut size = 12 + payload_size + num_continuations;
    if timestamp >= EXTENDED_TS_THRESHOLD {
        size += (1 + num_continuations) * 4;
    }
    size
}

/// Split `data` across chunks after an already-written prefix of
/// `prefix_len` bytes; returns bytes written into `buf`.
fn write_chunked_payload(
    header: ChunkHeader,
    buf: &mut [u8],
    data: &[u8],
    chunk_size: usize,
    prefix_len: usize,
    timestamp: i64,
) -> usize {
    let mut n = 0usize;
    let mut remaining = data;
    let mut budget = chunk_size - prefix_len;
    while !remaining.is_empty() {
        let take = remaining.len().min(budget);
        buf[n..n + take].copy_from_slice(&remaining[..take]);
        n += take;
        remaining = &remaining[take..];
        if !remaining.is_empty() {
            n += header.write_type3(&mut buf[n..], timestamp);
            budget = chunk_size;
        }
    }
    n
}

pub fn factory(ctx: &FactoryContext) -> Result<Box<dyn TransStream>, TransMuxError> {
    Ok(Box::new(RtmpTransStream::new(
        DEFAULT_CHUNK_SIZE,
        ctx.config,
    )))
}

pub struct RtmpTransStream {
    base: BaseTransStream,
    chunk_size: usize,
    mw_latency: u64,
    header: Bytes,
    buffer: Option<MergeWritingBuffer>,
}

impl RtmpTransStream {
    #[must_use]
    pub fn new(chunk_size: usize, config: &AppConfig) -> Self {
        Self {
            base: BaseTransStream::default(),
            chunk_size,
            mw_latency: config.mw_latency,
            header: Bytes::new(),
            buffer: None,
        }
    }

    fn buffer_mut(&mut self) -> Result<&mut MergeWritingBuffer, TransMuxError> {
        self.buffer.as_mut().ok_or(TransMuxError::NotCompleted)
    }

    /// Sequence-header message for one track: type-0 chunk + FLV prefix with
    /// the sequence flag set + extradata.
    fn append_sequence_message(header: &mut BytesMut, track: &AvStream, chunk: ChunkHeader) {
        let prefix_len = match track.media_type {
            MediaType::Audio => flv::audio_data_header_size(track.codec),
            MediaType::Video => flv::video_data_header_size(track.codec),
        };
        let payload_size = prefix_len + track.extra_data.len();
        let start = header.len();
        header.resize(start + 12 + payload_size, 0);
        let buf = &mut header[start..];
        let mut n = chunk.write_type0(buf, 0, payload_size);
        n += match track.media_type {
            MediaType::Audio => flv::write_audio_data_header(&mut buf[n..], track.codec, true),
            MediaType::Video => {
                flv::write_video_data_header(&mut buf[n..], track.codec, true, true, 0)
            }
        };
        buf[n..n + track.extra_data.len()].copy_from_slice(&track.extra_data);
    }
}

impl TransStream for RtmpTransStream {
    fn add_track(&mut self, track: Arc<AvStream>) -> Result<(), TransMuxError> {
        self.base.add_track(track)
    }

    fn write_header(&mut self) -> Result<(), TransMuxError> {
        if self.base.completed {
            return Err(TransMuxError::AlreadyCompleted);
        }
        if self.base.tracks.is_empty() {
            return Err(TransMuxError::NoTracks);
        }

        let mut header = BytesMut::with_capacity(1024);
        for track in &self.base.tracks {
            if track.extra_data.is_empty() {
                continue;
            }
            let chunk = match track.media_type {
                MediaType::Audio => ChunkHeader::audio(),
                MediaType::Video => ChunkHeader::video(),
            };
            Self::append_sequence_message(&mut header, track, chunk);
        }

        self.header = header.freeze();
        self.buffer = Some(MergeWritingBuffer::new(
            self.base.exist_video,
            self.mw_latency,
        ));
        self.base.completed = true;
        Ok(())
    }

    fn input(&mut self, packet: &AvPacket) -> Result<MuxOutput, TransMuxError> {
        if !self.base.completed {
            return Err(TransMuxError::NotCompleted);
        }
        let track_codec = self.base.track(packet.index)?.codec;

        let dts = packet.convert_dts(TIMEBASE_MILLIS);
        let pts = packet.convert_pts(TIMEBASE_MILLIS);
        let ct = (pts - dts).max(0) as u32;
        let video = packet.media_type == MediaType::Video;
        let video_key = video && packet.key;

        let mut output = MuxOutput {
            timestamp: dts,
            video_key,
            ..MuxOutput::default()
        };

        if video_key {
            if let Some(segment) = self.buffer_mut()?.flush_segment() {
                output.segments.push(segment);
            }
        }

        let (chunk, prefix_len) = if video {
            (
                ChunkHeader::video(),
                flv::video_data_header_size(track_codec),
            )
        } else {
            (
                ChunkHeader::audio(),
                flv::audio_data_header_size(track_codec),
            )
        };
        let payload_size = prefix_len + packet.data.len();
        let total = message_size(payload_size, self.chunk_size, dts);

        let chunk_size = self.chunk_size;
        let buffer = self.buffer_mut()?;
        let slot = buffer.allocate(total, dts, video_key);
        let mut n = chunk.write_type0(slot, dts, payload_size);
        n += if video {
            flv::write_video_data_header(&mut slot[n..], track_codec, packet.key, false, ct)
        } else {
            flv::write_audio_data_header(&mut slot[n..], track_codec, false)
        };
        n += write_chunked_payload(
            chunk,
            &mut slot[n..],
            &packet.data,
            chunk_size,
            prefix_len,
            dts,
        );
        debug_assert_eq!(n, total);

        if let Some(segment) = buffer.peek_completed_segment() {
            output.segments.push(segment);
        }
        Ok(output)
    }

    fn read_extra_data(&mut self, _timestamp: i64) -> Result<Vec<Bytes>, TransMuxError> {
        if self.header.is_empty() {
            return Err(TransMuxError::NotCompleted);
        }
        Ok(vec![self.header.clone()])
    }

    fn read_key_frame_buffer(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError> {
        let mut segments = Vec::new();
        if let Some(buffer) = self.buffer.as_ref() {
            buffer.read_segments_from_key_frame(|segment| segments.push(segment));
        }
        Ok((segments, 0))
    }

    fn close(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError> {
        let mut segments = Vec::new();
        if let Some(buffer) = self.buffer.as_mut() {
            if let Some(segment) = buffer.flush_segment() {
                segments.push(segment);
            }
        }
        Ok((segments, 0))
    }

    fn exist_video(&self) -> bool {
        self.base.exist_video
    }

    fn out_stream_buffer_capacity(&self) -> usize {
        512
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::CodecId;

    fn h264_track() -> Arc<AvStream> {
        Arc::new(AvStream::new(
            0,
            CodecId::H264,
            Bytes::from_static(&[0x01, 0x64, 0x00, 0x28, 0xFF, 0xE1]),
            TIMEBASE_MILLIS,
        ))
    }

    fn aac_track() -> Arc<AvStream> {
        Arc::new(AvStream::new(
            1,
            CodecId::Aac,
            Bytes::from_static(&[0x12, 0x10]),
            TIMEBASE_MILLIS,
        ))
    }

    fn video_packet(dts: i64, key: bool, len: usize) -> AvPacket {
        AvPacket {
            index: 0,
            media_type: MediaType::Video,
            key,
            dts,
            pts: dts + 10,
            timebase: TIMEBASE_MILLIS,
            data: Bytes::from(vec![0x42u8; len]),
        }
    }

    fn completed_stream() -> RtmpTransStream {
        let config = AppConfig {
            mw_latency: 0,
            ..AppConfig::default()
        };
        let mut ts = RtmpTransStream::new(128, &config);
        ts.add_track(h264_track()).unwrap();
        ts.add_track(aac_track()).unwrap();
        ts.write_header().unwrap();
        ts
    }

    #[test]
    fn message_size_accounts_for_continuations() {
        // payload 300, chunk 128 -> 2 separators.
        assert_eq!(message_size(300, 128, 0), 12 + 300 + 2);
        // Extended timestamps add 4 bytes per chunk.
        assert_eq!(message_size(300, 128, 0x0100_0000), 12 + 300 + 2 + 3 * 4);
        assert_eq!(message_size(128, 128, 0), 12 + 128);
    }

    #[test]
    fn type0_header_layout() {
        let mut buf = [0u8; 16];
        let n = ChunkHeader::video().write_type0(&mut buf, 0x123456, 100);
        assert_eq!(n, 12);
        assert_eq!(buf[0], CHUNK_STREAM_VIDEO);
        assert_eq!(&buf[1..4], &[0x12, 0x34, 0x56]);
        assert_eq!(&buf[4..7], &[0x00, 0x00, 100]);
        assert_eq!(buf[7], MSG_TYPE_VIDEO);
        assert_eq!(&buf[8..12], &1u32.to_le_bytes());
    }

    #[test]
    fn extended_timestamp_spills() {
        let mut buf = [0u8; 16];
        let ts = 0x0100_0000i64;
        let n = ChunkHeader::audio().write_type0(&mut buf, ts, 10);
        assert_eq!(n, 16);
        assert_eq!(&buf[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&buf[12..16], &(ts as u32).to_be_bytes());
    }

    #[test]
    fn sequence_header_served_as_extra_data() {
        let mut ts = completed_stream();
        let extra = ts.read_extra_data(0).unwrap();
        assert_eq!(extra.len(), 1);
        // Video sequence message first (track order), csid in the basic header.
        assert_eq!(extra[0][0], CHUNK_STREAM_VIDEO);
        assert_eq!(extra[0][7], MSG_TYPE_VIDEO);
        // FLV prefix: keyframe+AVC, AVCPacketType=0 (sequence header).
        assert_eq!(extra[0][12], 0x17);
        assert_eq!(extra[0][13], 0x00);
    }

    #[test]
    fn large_frame_is_split_with_type3_separators() {
        let mut ts = completed_stream();
        let output = ts.input(&video_packet(0, true, 300)).unwrap();
        let segment = output.segments.last().unwrap();
        assert_eq!(segment.len(), message_size(305, 128, 0));
        // First separator sits after the first full chunk.
        let sep = segment[12 + 128];
        assert_eq!(sep, (0x3 << 6) | CHUNK_STREAM_VIDEO);
    }

    #[test]
    fn dts_carried_in_output() {
        let mut ts = completed_stream();
        let output = ts.input(&video_packet(40, true, 16)).unwrap();
        assert_eq!(output.timestamp, 40);
        assert!(output.video_key);
    }
}
