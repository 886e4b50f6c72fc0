//! Minimal MPEG-TS muxer for the HLS segmenter: PAT/PMT at segment start,
//! PES packetisation with 90 kHz timestamps, PCR on video, ADTS framing for
//! AAC. Output accumulates in an internal buffer the segmenter drains in
//! batches.

pub mod errors;

pub use errors::MpegTsError;

use crate::media::CodecId;
use bytes::{BufMut, Bytes, BytesMut};

pub const TS_PACKET_SIZE: usize = 188;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const FIRST_ES_PID: u16 = 0x0100;
const MAX_STREAMS: usize = 8;

pub const STREAM_TYPE_H264: u8 = 0x1B;
pub const STREAM_TYPE_H265: u8 = 0x24;
pub const STREAM_TYPE_AAC: u8 = 0x0F;

/// MPEG-2 CRC32 (poly 0x04C11DB7, init all-ones, no reflection).
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

struct TsStream {
    pid: u16,
    codec: CodecId,
    stream_type: u8,
    extra: Bytes,
    continuity: u8,
}

pub struct TsMuxer {
    streams: Vec<TsStream>,
    buffer: BytesMut,
    pat_continuity: u8,
    pmt_continuity: u8,
    start_dts: Option<i64>,
    last_dts: i64,
}

impl TsMuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            buffer: BytesMut::with_capacity(64 * 1024),
            pat_continuity: 0,
            pmt_continuity: 0,
            start_dts: None,
            last_dts: 0,
        }
    }

    /// Register an elementary stream; returns its PID.
    pub fn add_stream(&mut self, codec: CodecId, extra: Bytes) -> Result<u16, MpegTsError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(MpegTsError::TooManyStreams);
        }
        let stream_type = match codec {
            CodecId::H264 => STREAM_TYPE_H264,
            CodecId::H265 => STREAM_TYPE_H265,
            CodecId::Aac => STREAM_TYPE_AAC,
            other => return Err(MpegTsError::UnsupportedCodec(other)),
        };
        let pid = FIRST_ES_PID + self.streams.len() as u16;
        self.streams.push(TsStream {
            pid,
            codec,
            stream_type,
            extra,
            continuity: 0,
        });
        Ok(pid)
    }

    /// Emit PAT and PMT; called at the start of every segment.
    pub fn write_header(&mut self) {
        let pat = self.pat_section();
        let pmt = self.pmt_section();
        let cc = self.pat_continuity;
        self.pat_continuity = (cc + 1) & 0x0F;
        self.write_psi_packet(PAT_PID, cc, &pat);
        let cc = self.pmt_continuity;
        self.pmt_continuity = (cc + 1) & 0x0F;
        self.write_psi_packet(PMT_PID, cc, &pmt);
    }

    /// Packetise one access unit. Video payloads are Annex-B; AAC payloads
    /// are raw frames and get an ADTS header derived from the stream's
    /// AudioSpecificConfig.
    pub fn write(
        &mut self,
        pid: u16,
        pts: i64,
        dts: i64,
        key: bool,
        payload: &[u8],
    ) -> Result<(), MpegTsError> {
        let index = self
            .streams
            .iter()
            .position(|s| s.pid == pid)
            .ok_or(MpegTsError::UnknownPid(pid))?;

        let codec = self.streams[index].codec;
        let framed: Vec<u8> = if codec == CodecId::Aac {
            let extra = self.streams[index].extra.clone();
            let mut framed = Vec::with_capacity(payload.len() + 7);
            framed.extend_from_slice(&adts_header(&extra, payload.len())?);
            framed.extend_from_slice(payload);
            framed
        } else {
            payload.to_vec()
        };

        let video = codec.media_type() == crate::media::MediaType::Video;
        let stream_id: u8 = if video { 0xE0 } else { 0xC0 };
        let mut pes = pes_header(stream_id, pts, dts, framed.len());
        pes.extend_from_slice(&framed);

        let pcr = if video && key { Some(dts) } else { None };
        self.write_pes_packets(index, pcr, &pes);

        if self.start_dts.is_none() {
            self.start_dts = Some(dts);
        }
        self.last_dts = dts;
        Ok(())
    }

    /// Elapsed segment duration in 90 kHz ticks.
    #[must_use]
    pub fn duration(&self) -> i64 {
        match self.start_dts {
            Some(start) => self.last_dts - start,
            None => 0,
        }
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drain everything muxed so far.
    pub fn take_data(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    /// Start a new segment: duration restarts, continuity counters carry on
    /// so the transport stream stays continuous across segments.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.start_dts = None;
        self.last_dts = 0;
    }

    fn pat_section(&self) -> Vec<u8> {
        let mut section = Vec::with_capacity(16);
        section.push(0x00);
        // section_syntax_indicator + length: 5 header + 4 program + 4 crc.
        section.put_u16(0xB000 | 13);
        section.put_u16(0x0001);
        section.push(0xC1);
        section.push(0x00);
        section.push(0x00);
        section.put_u16(0x0001);
        section.put_u16(0xE000 | PMT_PID);
        let crc = crc32(&section);
        section.put_u32(crc);
        section
    }

    fn pmt_section(&self) -> Vec<u8> {
        let pcr_pid = self
            .streams
            .iter()
            .find(|s| s.codec.media_type() == crate::media::MediaType::Video)
            .or(self.streams.first())
            .map_or(0x1FFF, |s| s.pid);

        let mut section = Vec::with_capacity(32);
        section.push(0x02);
        let length = 9 + self.streams.len() * 5 + 4;
        section.put_u16(0xB000 | length as u16);
        section.put_u16(0x0001);
        section.push(0xC1);
        section.push(0x00);
        section.push(0x00);
        section.put_u16(0xE000 | pcr_pid);
        section.put_u16(0xF000);
        for stream in &self.streams {
            section.push(stream.stream_type);
            section.put_u16(0xE000 | stream.pid);
            section.put_u16(0xF000);
        }
        let crc = crc32(&section);
        section.put_u32(crc);
        section
    }

    fn write_psi_packet(&mut self, pid: u16, continuity: u8, section: &[u8]) {
        let mut packet = [0xFFu8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
        packet[2] = (pid & 0xFF) as u8;
        packet[3] = 0x10 | (continuity & 0x0F);
        packet[4] = 0x00;
        packet[5..5 + section.len()].copy_from_slice(section);
        self.buffer.extend_from_slice(&packet);
    }

    fn write_pes_packets(&mut self, stream_index: usize, pcr: Option<i64>, pes: &[u8]) {
        let mut first = true;
        let mut offset = 0usize;
        while offset < pes.len() {
            let remaining = pes.len() - offset;
            let pid = self.streams[stream_index].pid;
            let cc = self.streams[stream_index].continuity;
            self.streams[stream_index].continuity = (cc + 1) & 0x0F;

            let mut packet = [0xFFu8; TS_PACKET_SIZE];
            packet[0] = 0x47;
            packet[1] = ((pid >> 8) as u8 & 0x1F) | if first { 0x40 } else { 0x00 };
            packet[2] = (pid & 0xFF) as u8;

            // Adaptation field body, excluding its length byte.
            let mut af_body: Vec<u8> = Vec::new();
            let mut has_af = false;
            if first {
                if let Some(pcr_base) = pcr {
                    has_af = true;
                    // random_access_indicator + PCR flag.
                    af_body.push(0x50);
                    let base = pcr_base as u64 & 0x1_FFFF_FFFF;
                    af_body.push((base >> 25) as u8);
                    af_body.push((base >> 17) as u8);
                    af_body.push((base >> 9) as u8);
                    af_body.push((base >> 1) as u8);
                    af_body.push((((base & 1) as u8) << 7) | 0x7E);
                    af_body.push(0x00);
                }
            }

            let mut capacity = TS_PACKET_SIZE - 4 - if has_af { af_body.len() + 1 } else { 0 };
            if remaining < capacity {
                if !has_af {
                    has_af = true;
                    capacity -= 1;
                }
                if af_body.is_empty() && capacity > remaining {
                    af_body.push(0x00);
                    capacity -= 1;
                }
                while capacity > remaining {
                    af_body.push(0xFF);
                    capacity -= 1;
                }
            }

            let mut pos = 4;
            packet[3] = if has_af { 0x30 } else { 0x10 } | (cc & 0x0F);
            if has_af {
                packet[pos] = af_body.len() as u8;
                pos += 1;
                packet[pos..pos + af_body.len()].copy_from_slice(&af_body);
                pos += af_body.len();
            }

            let take = remaining.min(capacity);
            packet[pos..pos + take].copy_from_slice(&pes[offset..offset + take]);
            offset += take;
            first = false;
            self.buffer.extend_from_slice(&packet);
        }
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// 33-bit PTS/DTS field with marker bits.
fn push_timestamp(out: &mut Vec<u8>, prefix: u8, ts: i64) {
    let v = ts as u64 & 0x1_FFFF_FFFF;
    out.push((prefix << 4) | ((((v >> 30) & 0x07) as u8) << 1) | 0x01);
    out.push(((v >> 22) & 0xFF) as u8);
    out.push(((((v >> 15) & 0x7F) as u8) << 1) | 0x01);
    out.push(((v >> 7) & 0xFF) as u8);
    out.push((((v & 0x7F) as u8) << 1) | 0x01);
}

fn pes_header(stream_id: u8, pts: i64, dts: i64, payload_len: usize) -> Vec<u8> {
    let has_dts = dts != pts;
    let header_data_len: usize = if has_dts { 10 } else { 5 };
    let mut header = Vec::with_capacity(9 + header_data_len);
    header.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);

    let pes_len = 3 + header_data_len + payload_len;
    // Video PES length may be zero (unbounded) when it overflows 16 bits.
    let len_field = if pes_len > 0xFFFF { 0 } else { pes_len as u16 };
    header.put_u16(len_field);

    header.push(0x80);
    header.push(if has_dts { 0xC0 } else { 0x80 });
    header.push(header_data_len as u8);
    push_timestamp(&mut header, if has_dts { 0x3 } else { 0x2 }, pts);
    if has_dts {
        push_timestamp(&mut header, 0x1, dts);
    }
    header
}

/// 7-byte ADTS header from an AudioSpecificConfig.
fn adts_header(asc: &[u8], frame_len: usize) -> Result<[u8; 7], MpegTsError> {
    if asc.len() < 2 {
        return Err(MpegTsError::BadAudioConfig);
    }
    let object_type = (asc[0] >> 3) & 0x1F;
    let freq_index = ((asc[0] & 0x07) << 1) | (asc[1] >> 7);
    let channels = (asc[1] >> 3) & 0x0F;
    let full_len = frame_len + 7;

    let mut header = [0u8; 7];
    header[0] = 0xFF;
    header[1] = 0xF1;
    header[2] = ((object_type.saturating_sub(1) & 0x03) << 6)
        | ((freq_index & 0x0F) << 2)
        | ((channels >> 2) & 0x01);
    header[3] = ((channels & 0x03) << 6) | (((full_len >> 11) & 0x03) as u8);
    header[4] = ((full_len >> 3) & 0xFF) as u8;
    header[5] = (((full_len & 0x07) as u8) << 5) | 0x1F;
    header[6] = 0xFC;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TIMEBASE_90KHZ;

    fn muxer_with_av() -> (TsMuxer, u16, u16) {
        let mut muxer = TsMuxer::new();
        let video = muxer.add_stream(CodecId::H264, Bytes::new()).unwrap();
        let audio = muxer
            .add_stream(CodecId::Aac, Bytes::from_static(&[0x12, 0x10]))
            .unwrap();
        (muxer, video, audio)
    }

    #[test]
    fn header_emits_pat_and_pmt_packets() {
        let (mut muxer, _, _) = muxer_with_av();
        muxer.write_header();
        let data = muxer.take_data();
        assert_eq!(data.len(), 2 * TS_PACKET_SIZE);
        // Both packets carry sync byte + PUSI.
        assert_eq!(data[0], 0x47);
        assert_eq!(data[0 + 1] & 0x40, 0x40);
        assert_eq!(data[TS_PACKET_SIZE], 0x47);
        // PAT on PID 0, PMT on its advertised PID.
        assert_eq!(u16::from(data[1] & 0x1F) << 8 | u16::from(data[2]), 0);
        assert_eq!(
            u16::from(data[TS_PACKET_SIZE + 1] & 0x1F) << 8 | u16::from(data[TS_PACKET_SIZE + 2]),
            PMT_PID
        );
    }

    #[test]
    fn every_packet_is_188_bytes_and_synced() {
        let (mut muxer, video, audio) = muxer_with_av();
        muxer.write_header();
        muxer
            .write(video, 3000, 3000, true, &[0u8; 1000])
            .unwrap();
        muxer.write(audio, 4000, 4000, false, &[1u8; 100]).unwrap();
        let data = muxer.take_data();
        assert_eq!(data.len() % TS_PACKET_SIZE, 0);
        for chunk in data.chunks(TS_PACKET_SIZE) {
            assert_eq!(chunk[0], 0x47);
        }
    }

    #[test]
    fn duration_tracks_dts_span() {
        let (mut muxer, video, _) = muxer_with_av();
        muxer.write(video, 0, 0, true, &[0u8; 10]).unwrap();
        muxer
            .write(video, 2 * TIMEBASE_90KHZ as i64, 2 * TIMEBASE_90KHZ as i64, false, &[0u8; 10])
            .unwrap();
        assert_eq!(muxer.duration(), 2 * TIMEBASE_90KHZ as i64);
        muxer.reset();
        assert_eq!(muxer.duration(), 0);
    }

    #[test]
    fn unknown_pid_is_rejected() {
        let (mut muxer, _, _) = muxer_with_av();
        assert!(matches!(
            muxer.write(0x1FFE, 0, 0, false, &[0u8; 4]),
            Err(MpegTsError::UnknownPid(_))
        ));
    }

    #[test]
    fn adts_header_layout() {
        // AAC-LC 44.1kHz stereo.
        let header = adts_header(&[0x12, 0x10], 100).unwrap();
        assert_eq!(header[0], 0xFF);
        assert_eq!(header[1], 0xF1);
        // Profile LC (1) and freq index 4.
        assert_eq!(header[2] >> 6, 0x01);
        assert_eq!((header[2] >> 2) & 0x0F, 4);
        let len = (usize::from(header[3] & 0x03) << 11)
            | (usize::from(header[4]) << 3)
            | usize::from(header[5] >> 5);
        assert_eq!(len, 107);
    }

    #[test]
    fn pes_header_timestamp_roundtrip() {
        let header = pes_header(0xE0, 90_000, 87_000, 64);
        // Flags announce pts+dts, header data length 10.
        assert_eq!(header[7], 0xC0);
        assert_eq!(header[8], 10);
        let pts_bytes = &header[9..14];
        let pts = (i64::from(pts_bytes[0] >> 1 & 0x07) << 30)
            | (i64::from(pts_bytes[1]) << 22)
            | (i64::from(pts_bytes[2] >> 1) << 15)
            | (i64::from(pts_bytes[3]) << 7)
            | i64::from(pts_bytes[4] >> 1);
        assert_eq!(pts, 90_000);
    }

    #[test]
    fn mpeg_crc32_known_vector() {
        // CRC of an empty slice is the init value.
        assert_eq!(crc32(&[]), 0xFFFF_FFFF);
        // Stability check on a PAT-shaped prefix.
        let section = [0x00u8, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00];
        let a = crc32(&section);
        let b = crc32(&section);
        assert_eq!(a, b);
    }
}
