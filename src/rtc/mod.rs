//! WebRTC egress: no merge-writing, one negotiated peer per sink.
//!
//! The transmuxer emits Annex-B samples and re-emits the parameter sets
//! before every keyframe so a freshly negotiated peer can start decoding at
//! any group boundary. SDP/ICE negotiation happens outside the engine; a
//! sink only carries the negotiated peer behind the `SampleSender` seam.

use crate::media::{decoder_config_to_annexb, AvPacket, AvStream, MediaType, TIMEBASE_MILLIS};
use crate::sink::{BaseSink, Sink, SinkError, SinkId};
use crate::transmux::{
    BaseTransStream, FactoryContext, MuxOutput, TransMuxError, TransStream, TransStreamId,
    TransStreamProtocol,
};
use bytes::Bytes;
use std::sync::Arc;

/// Negotiated peer-connection surface the engine writes samples into.
pub trait SampleSender: Send + Sync {
    /// Whether the peer's ICE state still allows sending.
    fn is_connected(&self) -> bool;

    fn send_sample(&self, data: Bytes) -> Result<(), SinkError>;
}

pub fn factory(_ctx: &FactoryContext) -> Result<Box<dyn TransStream>, TransMuxError> {
    Ok(Box::new(RtcTransStream::new()))
}

pub struct RtcTransStream {
    base: BaseTransStream,
}

impl RtcTransStream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: BaseTransStream::default(),
        }
    }
}

impl Default for RtcTransStream {
    fn default() -> Self {
        Self::new()
    }
}

impl TransStream for RtcTransStream {
    fn add_track(&mut self, track: Arc<AvStream>) -> Result<(), TransMuxError> {
        if track.media_type == MediaType::Video && track.codec != crate::media::CodecId::H264 {
            return Err(TransMuxError::MuxUnsupported {
                protocol: TransStreamProtocol::Rtc,
                codec: track.codec,
            });
        }
        self.base.add_track(track)
    }

    fn write_header(&mut self) -> Result<(), TransMuxError> {
        if self.base.tracks.is_empty() {
            return Err(TransMuxError::NoTracks);
        }
        self.base.completed = true;
        Ok(())
    }

    fn input(&mut self, packet: &AvPacket) -> Result<MuxOutput, TransMuxError> {
        if !self.base.completed {
            return Err(TransMuxError::NotCompleted);
        }
        // Audio is not carried on the single H.264 track.
        if packet.media_type != MediaType::Video {
            return Ok(MuxOutput::default());
        }

        let track = self.base.track(packet.index)?;
        let mut segments = Vec::with_capacity(2);
        if packet.key {
            segments.push(decoder_config_to_annexb(track.codec, &track.extra_data));
        }
        segments.push(packet.annexb_data(track.nal_length_size()));

        Ok(MuxOutput {
            segments,
            timestamp: packet.convert_dts(TIMEBASE_MILLIS),
            video_key: packet.key,
        })
    }

    fn read_extra_data(&mut self, _timestamp: i64) -> Result<Vec<Bytes>, TransMuxError> {
        // Parameter sets travel inline before every keyframe instead.
        Ok(Vec::new())
    }

    fn read_key_frame_buffer(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError> {
        Ok((Vec::new(), 0))
    }

    fn close(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError> {
        Ok((Vec::new(), 0))
    }

    fn exist_video(&self) -> bool {
        self.base.exist_video
    }
}

/// Sink wrapping one negotiated peer connection.
pub struct RtcSink {
    base: BaseSink,
    peer: Arc<dyn SampleSender>,
}

impl RtcSink {
    #[must_use]
    pub fn new(source_id: impl Into<String>, peer: Arc<dyn SampleSender>) -> Arc<Self> {
        Arc::new(Self {
            base: BaseSink::new(source_id, TransStreamProtocol::Rtc),
            peer,
        })
    }
}

impl Sink for RtcSink {
    fn id(&self) -> SinkId {
        self.base.id()
    }

    fn source_id(&self) -> &str {
        self.base.source_id()
    }

    fn protocol(&self) -> TransStreamProtocol {
        self.base.protocol()
    }

    fn trans_stream_id(&self) -> Option<TransStreamId> {
        self.base.trans_stream_id()
    }

    fn set_trans_stream_id(&self, id: Option<TransStreamId>) {
        self.base.set_trans_stream_id(id);
    }

    fn state(&self) -> crate::sink::SessionState {
        self.base.state()
    }

    fn update_state_if_open(&self, state: crate::sink::SessionState) -> bool {
        self.base.update_state_if_open(state)
    }

    fn write(&self, _index: i32, segments: &[Bytes], _timestamp: i64) -> Result<(), SinkError> {
        if !self.peer.is_connected() {
            return Err(SinkError::Disconnected);
        }
        for segment in segments {
            self.peer.send_sample(segment.clone())?;
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.peer.is_connected()
    }

    fn sent_packet_count(&self) -> u64 {
        self.base.sent_packet_count()
    }

    fn increase_sent_packet_count(&self) {
        self.base.increase_sent_packet_count();
    }

    fn reset_sent_packet_count(&self) {
        self.base.reset_sent_packet_count();
    }

    fn close(&self) {
        self.base.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::CodecId;
    use parking_lot::Mutex;

    struct MockPeer {
        connected: std::sync::atomic::AtomicBool,
        samples: Mutex<Vec<Bytes>>,
    }

    impl MockPeer {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: std::sync::atomic::AtomicBool::new(connected),
                samples: Mutex::new(Vec::new()),
            })
        }
    }

    impl SampleSender for MockPeer {
        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::Relaxed)
        }

        fn send_sample(&self, data: Bytes) -> Result<(), SinkError> {
            self.samples.lock().push(data);
            Ok(())
        }
    }

    fn h264_track() -> Arc<AvStream> {
        let extra = Bytes::from_static(&[
            0x01, 0x64, 0x00, 0x28, 0xFF, 0xE1, 0x00, 0x03, 0x67, 0x64, 0x28, 0x01, 0x00, 0x02,
            0x68, 0xEE,
        ]);
        Arc::new(AvStream::new(0, CodecId::H264, extra, TIMEBASE_MILLIS))
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

    #[test]
    fn keyframes_carry_parameter_sets_first() {
        let mut ts = RtcTransStream::new();
        ts.add_track(h264_track()).unwrap();
        ts.write_header().unwrap();

        let out = ts.input(&video_packet(0, true)).unwrap();
        assert_eq!(out.segments.len(), 2);
        assert!(out.segments[0].starts_with(&[0, 0, 0, 1, 0x67]));
        assert!(out.segments[1].starts_with(&[0, 0, 0, 1, 0x65]));

        let out = ts.input(&video_packet(33, false)).unwrap();
        assert_eq!(out.segments.len(), 1);
    }

    #[test]
    fn h265_is_not_muxable() {
        let mut ts = RtcTransStream::new();
        let track = Arc::new(AvStream::new(
            0,
            CodecId::H265,
            Bytes::new(),
            TIMEBASE_MILLIS,
        ));
        assert!(matches!(
            ts.add_track(track),
            Err(TransMuxError::MuxUnsupported { .. })
        ));
    }

    #[test]
    fn disconnected_peer_fails_writes() {
        let peer = MockPeer::new(false);
        let sink = RtcSink::new("live/cam", peer.clone());
        assert!(!sink.is_ready());
        assert!(matches!(
            sink.write(0, &[Bytes::from_static(b"x")], 0),
            Err(SinkError::Disconnected)
        ));

        peer.connected
            .store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(sink.write(0, &[Bytes::from_static(b"x")], 0).is_ok());
        assert_eq!(peer.samples.lock().len(), 1);
    }
}
