//! FLV tag serialisation and the FLV transmuxer (HTTP-FLV subscribers and
//! the record sink both consume it).

use crate::config::AppConfig;
use crate::media::{AvPacket, AvStream, CodecId, MediaType, TIMEBASE_MILLIS};
use crate::transmux::{
    BaseTransStream, FactoryContext, MergeWritingBuffer, MuxOutput, TransMuxError, TransStream,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

pub const TAG_HEADER_SIZE: usize = 11;
pub const PREV_TAG_SIZE: usize = 4;

pub const TAG_TYPE_AUDIO: u8 = 8;
pub const TAG_TYPE_VIDEO: u8 = 9;

/// FLV file header plus PreviousTagSize0.
#[must_use]
pub fn file_header(has_audio: bool, has_video: bool) -> Bytes {
    let mut flags = 0u8;
    if has_audio {
        flags |= 0x04;
    }
    if has_video {
        flags |= 0x01;
    }
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(b"FLV");
    buf.put_u8(1);
    buf.put_u8(flags);
    buf.put_u32(9);
    buf.put_u32(0);
    buf.freeze()
}

/// Size of the codec prefix inside an audio tag body.
#[must_use]
pub const fn audio_data_header_size(codec: CodecId) -> usize {
    match codec {
        CodecId::Aac => 2,
        _ => 1,
    }
}

/// Size of the codec prefix inside a video tag body.
#[must_use]
pub const fn video_data_header_size(_codec: CodecId) -> usize {
    5
}

/// Write the audio tag body prefix; returns bytes written.
pub fn write_audio_data_header(buf: &mut [u8], codec: CodecId, sequence_header: bool) -> usize {
    match codec {
        // AAC 44kHz 16-bit stereo + AACPacketType.
        CodecId::Aac => {
            buf[0] = 0xAF;
            buf[1] = u8::from(!sequence_header);
            2
        }
        CodecId::G711a => {
            buf[0] = 0x72;
            1
        }
        CodecId::G711u => {
            buf[0] = 0x82;
            1
        }
        CodecId::H264 | CodecId::H265 => unreachable!("video codec in audio tag"),
    }
}

/// Write the video tag body prefix (frame/codec byte, AVCPacketType,
/// 24-bit composition time); returns bytes written.
pub fn write_video_data_header(
    buf: &mut [u8],
    codec: CodecId,
    key: bool,
    sequence_header: bool,
    composition_time: u32,
) -> usize {
    let frame_type = if key || sequence_header { 1u8 } else { 2u8 };
    let codec_id = match codec {
        CodecId::H264 => 7u8,
        CodecId::H265 => 12u8,
        _ => unreachable!("audio codec in video tag"),
    };
    buf[0] = (frame_type << 4) | codec_id;
    buf[1] = u8::from(!sequence_header);
    buf[2] = ((composition_time >> 16) & 0xFF) as u8;
    buf[3] = ((composition_time >> 8) & 0xFF) as u8;
    buf[4] = (composition_time & 0xFF) as u8;
    5
}

/// Write an 11-byte tag header (type, body size, split timestamp, stream 0).
pub fn write_tag_header(buf: &mut [u8], tag_type: u8, data_size: u32, timestamp: u32) -> usize {
    buf[0] = tag_type;
    buf[1] = ((data_size >> 16) & 0xFF) as u8;
    buf[2] = ((data_size >> 8) & 0xFF) as u8;
    buf[3] = (data_size & 0xFF) as u8;
    buf[4] = ((timestamp >> 16) & 0xFF) as u8;
    buf[5] = ((timestamp >> 8) & 0xFF) as u8;
    buf[6] = (timestamp & 0xFF) as u8;
    buf[7] = ((timestamp >> 24) & 0xFF) as u8;
    buf[8] = 0;
    buf[9] = 0;
    buf[10] = 0;
    TAG_HEADER_SIZE
}

pub fn factory(ctx: &FactoryContext) -> Result<Box<dyn TransStream>, TransMuxError> {
    Ok(Box::new(FlvTransStream::new(ctx.config)))
}

/// FLV over a live byte stream: file header + sequence-header tags served as
/// extradata, then merge-written media tags with PreviousTagSize framing.
pub struct FlvTransStream {
    base: BaseTransStream,
    header: Bytes,
    mw_latency: u64,
    buffer: Option<MergeWritingBuffer>,
}

impl FlvTransStream {
    #[must_use]
    pub fn new(config: &AppConfig) -> Self {
        Self {
            base: BaseTransStream::default(),
            header: Bytes::new(),
            mw_latency: config.mw_latency,
            buffer: None,
        }
    }

    fn append_sequence_tag(header: &mut BytesMut, track: &AvStream) {
        let (tag_type, prefix_len) = match track.media_type {
            MediaType::Audio => (TAG_TYPE_AUDIO, audio_data_header_size(track.codec)),
            MediaType::Video => (TAG_TYPE_VIDEO, video_data_header_size(track.codec)),
        };
        let body_size = prefix_len + track.extra_data.len();
        let start = header.len();
        header.resize(start + TAG_HEADER_SIZE + body_size, 0);
        let buf = &mut header[start..];
        let mut n = write_tag_header(buf, tag_type, body_size as u32, 0);
        n += match track.media_type {
            MediaType::Audio => write_audio_data_header(&mut buf[n..], track.codec, true),
            MediaType::Video => write_video_data_header(&mut buf[n..], track.codec, true, true, 0),
        };
        buf[n..n + track.extra_data.len()].copy_from_slice(&track.extra_data);
        header.put_u32((TAG_HEADER_SIZE + body_size) as u32);
    }

    fn buffer_mut(&mut self) -> Result<&mut MergeWritingBuffer, TransMuxError> {
        self.buffer.as_mut().ok_or(TransMuxError::NotCompleted)
    }
}

impl TransStream for FlvTransStream {
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

        let has_audio = self.base.audio_track().is_some();
        let has_video = self.base.video_track().is_some();

        let mut header = BytesMut::with_capacity(1024);
        header.put_slice(&file_header(has_audio, has_video));
        for track in &self.base.tracks {
            if !track.extra_data.is_empty() {
                Self::append_sequence_tag(&mut header, track);
            }
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

        // Keyframes open a fresh segment so replay starts decodable.
        if video_key {
            if let Some(segment) = self.buffer_mut()?.flush_segment() {
                output.segments.push(segment);
            }
        }

        let prefix_len = if video {
            video_data_header_size(track_codec)
        } else {
            audio_data_header_size(track_codec)
        };
        let body_size = prefix_len + packet.data.len();
        let total = TAG_HEADER_SIZE + body_size + PREV_TAG_SIZE;

        let buffer = self.buffer_mut()?;
        let slot = buffer.allocate(total, dts, video_key);
        let tag_type = if video { TAG_TYPE_VIDEO } else { TAG_TYPE_AUDIO };
        let mut n = write_tag_header(slot, tag_type, body_size as u32, dts as u32);
        n += if video {
            write_video_data_header(&mut slot[n..], track_codec, packet.key, false, ct)
        } else {
            write_audio_data_header(&mut slot[n..], track_codec, false)
        };
        slot[n..n + packet.data.len()].copy_from_slice(&packet.data);
        n += packet.data.len();
        slot[n..n + 4].copy_from_slice(&((TAG_HEADER_SIZE + body_size) as u32).to_be_bytes());

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
    use crate::media::TIMEBASE_MILLIS;

    fn h264_track() -> Arc<AvStream> {
        Arc::new(AvStream::new(
            0,
            CodecId::H264,
            Bytes::from_static(&[0x01, 0x64, 0x00, 0x28, 0xFF, 0xE1]),
            TIMEBASE_MILLIS,
        ))
    }

    fn aac_track() -> Arc<AvStream> {
        Arc::new(
            AvStream::new(
                1,
                CodecId::Aac,
                Bytes::from_static(&[0x12, 0x10]),
                TIMEBASE_MILLIS,
            )
            .with_sample_rate(44_100),
        )
    }

    fn video_packet(dts: i64, key: bool) -> AvPacket {
        AvPacket {
            index: 0,
            media_type: MediaType::Video,
            key,
            dts,
            pts: dts,
            timebase: TIMEBASE_MILLIS,
            data: Bytes::from_static(&[0, 0, 0, 2, 0x65, 0xAA]),
        }
    }

    fn completed_stream() -> FlvTransStream {
        let config = AppConfig {
            mw_latency: 0,
            ..AppConfig::default()
        };
        let mut ts = FlvTransStream::new(&config);
        ts.add_track(h264_track()).unwrap();
        ts.add_track(aac_track()).unwrap();
        ts.write_header().unwrap();
        ts
    }

    #[test]
    fn file_header_flags() {
        let both = file_header(true, true);
        assert_eq!(&both[..3], b"FLV");
        assert_eq!(both[4], 0x05);
        let audio_only = file_header(true, false);
        assert_eq!(audio_only[4], 0x04);
    }

    #[test]
    fn extra_data_starts_with_file_header() {
        let mut ts = completed_stream();
        let extra = ts.read_extra_data(0).unwrap();
        assert_eq!(extra.len(), 1);
        assert_eq!(&extra[0][..3], b"FLV");
        // File header + prev-tag-size + two sequence tags.
        assert!(extra[0].len() > 13 + 2 * (TAG_HEADER_SIZE + PREV_TAG_SIZE));
    }

    #[test]
    fn input_before_header_is_rejected() {
        let config = AppConfig::default();
        let mut ts = FlvTransStream::new(&config);
        ts.add_track(h264_track()).unwrap();
        assert!(matches!(
            ts.input(&video_packet(0, true)),
            Err(TransMuxError::NotCompleted)
        ));
    }

    #[test]
    fn video_tag_layout() {
        let mut ts = completed_stream();
        let output = ts.input(&video_packet(0, true)).unwrap();
        assert!(output.video_key);
        let segment = output.segments.last().unwrap();

        assert_eq!(segment[0], TAG_TYPE_VIDEO);
        let body_size = 5 + 6;
        assert_eq!(segment[3], body_size as u8);
        // Keyframe + AVC.
        assert_eq!(segment[TAG_HEADER_SIZE], 0x17);
        // AVCPacketType = NALU.
        assert_eq!(segment[TAG_HEADER_SIZE + 1], 0x01);
        // Trailing PreviousTagSize covers header + body.
        let total = segment.len();
        let prev = u32::from_be_bytes(segment[total - 4..].try_into().unwrap());
        assert_eq!(prev as usize, TAG_HEADER_SIZE + body_size);
    }

    #[test]
    fn keyframe_replay_available_after_input() {
        let mut ts = completed_stream();
        ts.input(&video_packet(0, true)).unwrap();
        ts.input(&video_packet(33, false)).unwrap();
        let (segments, _) = ts.read_key_frame_buffer().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0][TAG_HEADER_SIZE], 0x17);
    }
}
