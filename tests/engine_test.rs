//! End-to-end engine scenarios: publish through the demux seam, fan out
//! through real transmuxers, observe sink-side bytes.

use bytes::{Bytes, BytesMut};
use rill::config::{AppConfig, HlsConfig, HookConfig};
use rill::gb28181::{SingleFilter, SsrcFilter, TcpServer, UdpServer};
use rill::hook::HookBus;
use rill::media::{AvStream, CodecId, MediaType, TIMEBASE_MILLIS};
use rill::registry::StreamRegistry;
use rill::sink::{ChannelSink, SessionState, Sink};
use rill::source::demux::{
    encode_frame, encode_stream, encode_streams_done, DemuxEvent, DemuxedFrame, Demuxer,
};
use rill::source::{ElementaryDemuxer, PublishSource, SourceError};
use rill::transmux::{TransStreamProtocol, TransStreamRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

struct Engine {
    config: Arc<AppConfig>,
    registry: Arc<StreamRegistry>,
    muxers: Arc<TransStreamRegistry>,
    hooks: Arc<HookBus>,
}

impl Engine {
    fn new(mut config: AppConfig) -> Self {
        // Deterministic delivery in tests: no merge-write coalescing.
        config.mw_latency = 0;
        config.receive_timeout = 0;
        Self {
            config: Arc::new(config),
            registry: Arc::new(StreamRegistry::new()),
            muxers: Arc::new(TransStreamRegistry::with_defaults()),
            hooks: HookBus::new(HookConfig::default()),
        }
    }

    fn start_source(&self, id: &str) -> rill::source::SourceHandle {
        PublishSource::start(
            id,
            Box::new(ElementaryDemuxer::new()),
            self.config.clone(),
            self.registry.clone(),
            self.muxers.clone(),
            self.hooks.clone(),
        )
        .expect("source registered")
    }
}

fn video_stream() -> AvStream {
    let extra = Bytes::from_static(&[
        0x01, 0x64, 0x00, 0x28, 0xFF, 0xE1, 0x00, 0x03, 0x67, 0x64, 0x28, 0x01, 0x00, 0x02, 0x68,
        0xEE,
    ]);
    AvStream::new(0, CodecId::H264, extra, TIMEBASE_MILLIS)
}

fn audio_stream() -> AvStream {
    AvStream::new(1, CodecId::Aac, Bytes::from_static(&[0x12, 0x10]), TIMEBASE_MILLIS)
}

fn video_frame(dts: i64, key: bool) -> DemuxedFrame {
    DemuxedFrame {
        index: 0,
        media_type: MediaType::Video,
        key,
        dts,
        pts: dts,
        timebase: TIMEBASE_MILLIS,
        payload: Bytes::from_static(&[0, 0, 0, 3, 0x65, 0xAA, 0xBB]),
    }
}

fn audio_frame(dts: i64) -> DemuxedFrame {
    DemuxedFrame {
        index: 1,
        media_type: MediaType::Audio,
        key: false,
        dts,
        pts: dts,
        timebase: TIMEBASE_MILLIS,
        payload: Bytes::from_static(&[0x21, 0x10, 0x04]),
    }
}

fn announce_av() -> Bytes {
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&encode_stream(&video_stream()));
    wire.extend_from_slice(&encode_stream(&audio_stream()));
    wire.extend_from_slice(&encode_streams_done());
    wire.freeze()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// Drain everything currently deliverable from a sink channel.
async fn collect(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Bytes> {
    let mut items = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(150), rx.recv()).await {
            Ok(Some(item)) => items.push(item),
            _ => break,
        }
    }
    items
}

/// (csid, message type, chunk timestamp) of an RTMP type-0 message.
fn rtmp_message_meta(message: &Bytes) -> (u8, u8, u32) {
    let csid = message[0] & 0x3F;
    let timestamp =
        (u32::from(message[1]) << 16) | (u32::from(message[2]) << 8) | u32::from(message[3]);
    (csid, message[7], timestamp)
}

#[tokio::test]
async fn rtmp_sink_gets_header_then_keyframe_in_dts_order() {
    let engine = Engine::new(AppConfig::default());
    let source = engine.start_source("live/cam");
    source.input(announce_av()).unwrap();
    settle().await;

    let (sink, mut rx) = ChannelSink::new("live/cam", TransStreamProtocol::Rtmp);
    let sink_dyn: Arc<dyn Sink> = sink.clone();
    source.add_sink(sink_dyn).await.unwrap();
    settle().await;

    // Three groups of ten video frames with interleaved audio.
    for gop in 0..3i64 {
        for frame in 0..10i64 {
            let dts = gop * 330 + frame * 33;
            source
                .input(encode_frame(&video_frame(dts, frame == 0)))
                .unwrap();
            source.input(encode_frame(&audio_frame(dts))).unwrap();
            // Pace the pipe so the bounded channel never backpressures.
            if frame % 4 == 3 {
                tokio::task::yield_now().await;
            }
        }
    }
    settle().await;

    // Receiving publish bytes advances the handle's activity timestamp.
    assert!(source.last_packet_time() >= source.create_time());

    let items = collect(&mut rx).await;
    assert!(!items.is_empty());

    // Sequence header first: video chunk carrying an AVC sequence header.
    let header = &items[0];
    assert_eq!(header[0] & 0x3F, 6);
    assert_eq!(header[7], 9);
    assert_eq!(header[12], 0x17);
    assert_eq!(header[13], 0x00);

    // First media message is a keyframe.
    let first_media = &items[1];
    let (csid, msg_type, _) = rtmp_message_meta(first_media);
    assert_eq!((csid, msg_type), (6, 9));
    assert_eq!(first_media[12], 0x17);
    assert_eq!(first_media[13], 0x01);

    // Every frame arrived, and video DTS never decreases.
    let video: Vec<u32> = items[1..]
        .iter()
        .filter(|m| rtmp_message_meta(m).0 == 6)
        .map(|m| rtmp_message_meta(m).2)
        .collect();
    let audio_count = items[1..]
        .iter()
        .filter(|m| rtmp_message_meta(m).0 == 4)
        .count();
    assert_eq!(video.len(), 30);
    assert_eq!(audio_count, 30);
    assert!(video.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn sink_waiting_before_publisher_attaches_on_completion() {
    let engine = Engine::new(AppConfig::default());

    let (sink, mut rx) = ChannelSink::new("live/late", TransStreamProtocol::Rtmp);
    let sink_dyn: Arc<dyn Sink> = sink.clone();
    engine
        .registry
        .add_sink_to_waiting_queue("live/late", sink_dyn);

    // Publisher arrives afterwards.
    let source = engine.start_source("live/late");
    source.input(announce_av()).unwrap();
    settle().await;
    assert_eq!(engine.registry.waiting_count("live/late"), 0);

    source.input(encode_frame(&video_frame(0, true))).unwrap();
    settle().await;

    let items = collect(&mut rx).await;
    assert!(items.len() >= 2, "expected header + keyframe, got {}", items.len());
    assert_eq!(items[0][13], 0x00);
    assert_eq!(sink.state(), SessionState::Transferring);
}

#[tokio::test]
async fn gop_cache_replays_from_last_keyframe_on_attach() {
    let engine = Engine::new(AppConfig::default());
    let source = engine.start_source("live/replay");
    source.input(announce_av()).unwrap();
    settle().await;

    // Two groups published with nobody listening.
    source.input(encode_frame(&video_frame(0, true))).unwrap();
    source.input(encode_frame(&video_frame(33, false))).unwrap();
    source.input(encode_frame(&video_frame(66, false))).unwrap();
    source.input(encode_frame(&video_frame(100, true))).unwrap();
    source.input(encode_frame(&video_frame(133, false))).unwrap();
    settle().await;

    let (sink, mut rx) = ChannelSink::new("live/replay", TransStreamProtocol::Rtmp);
    let sink_dyn: Arc<dyn Sink> = sink;
    source.add_sink(sink_dyn).await.unwrap();
    settle().await;

    // Replay delivers the cached group without any new input.
    let items = collect(&mut rx).await;
    assert!(items.len() >= 3);
    assert_eq!(items[0][13], 0x00, "sequence header first");
    let (_, _, first_dts) = rtmp_message_meta(&items[1]);
    assert_eq!(first_dts, 100, "replay starts at the cached keyframe");
    let (_, _, second_dts) = rtmp_message_meta(&items[2]);
    assert_eq!(second_dts, 133);
}

#[tokio::test]
async fn identical_sinks_share_one_trans_stream() {
    let engine = Engine::new(AppConfig::default());
    let source = engine.start_source("live/dedup");
    source.input(announce_av()).unwrap();
    settle().await;

    let base = engine.muxers.created_count();
    let (a, _rxa) = ChannelSink::new("live/dedup", TransStreamProtocol::Rtmp);
    let (b, _rxb) = ChannelSink::new("live/dedup", TransStreamProtocol::Rtmp);
    source.add_sink(a).await.unwrap();
    source.add_sink(b).await.unwrap();
    settle().await;
    assert_eq!(engine.muxers.created_count(), base + 1);

    // A different container gets its own muxer.
    let (c, _rxc) = ChannelSink::new("live/dedup", TransStreamProtocol::Flv);
    source.add_sink(c).await.unwrap();
    settle().await;
    assert_eq!(engine.muxers.created_count(), base + 2);
}

#[tokio::test]
async fn full_stream_pipe_reports_backpressure() {
    let mut config = AppConfig::default();
    config.receive_queue_size = 4;
    let config = Arc::new(config);
    let registry = Arc::new(StreamRegistry::new());
    let muxers = Arc::new(TransStreamRegistry::with_defaults());
    let hooks = HookBus::new(HookConfig::default());

    // Not spawned: nothing drains the pipe.
    let (_source, handle) = PublishSource::new(
        "live/full",
        Box::new(ElementaryDemuxer::new()),
        config,
        registry,
        muxers,
        hooks,
    );

    handle.input(Bytes::from_static(b"a")).unwrap();
    handle.input(Bytes::from_static(b"b")).unwrap();
    assert!(matches!(
        handle.input(Bytes::from_static(b"c")),
        Err(SourceError::Backpressure)
    ));
}

#[tokio::test]
async fn close_returns_live_sinks_to_waiting_queue() {
    let engine = Engine::new(AppConfig::default());
    let source = engine.start_source("live/closing");
    source.input(announce_av()).unwrap();
    settle().await;

    let (sink, _rx) = ChannelSink::new("live/closing", TransStreamProtocol::Rtmp);
    let sink_dyn: Arc<dyn Sink> = sink.clone();
    source.add_sink(sink_dyn).await.unwrap();
    settle().await;

    source.close().await;
    // Closing twice is a non-fatal drop.
    source.close().await;
    settle().await;

    assert!(engine.registry.find_source("live/closing").is_none());
    assert_eq!(sink.state(), SessionState::Wait);
    let waiting = engine.registry.pop_waiting_sinks("live/closing");
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id(), sink.id());
}

#[tokio::test]
async fn second_publisher_with_same_id_is_rejected() {
    let engine = Engine::new(AppConfig::default());
    let _first = engine.start_source("live/one");
    let second = PublishSource::start(
        "live/one",
        Box::new(ElementaryDemuxer::new()),
        engine.config.clone(),
        engine.registry.clone(),
        engine.muxers.clone(),
        engine.hooks.clone(),
    );
    assert!(second.is_err());
}

#[tokio::test]
async fn receive_timeout_tears_the_source_down() {
    let mut config = AppConfig::default();
    config.receive_timeout = 1;
    config.mw_latency = 0;
    let config = Arc::new(config);
    let registry = Arc::new(StreamRegistry::new());
    let muxers = Arc::new(TransStreamRegistry::with_defaults());
    let hooks = HookBus::new(HookConfig::default());

    PublishSource::start(
        "live/silent",
        Box::new(ElementaryDemuxer::new()),
        config,
        registry.clone(),
        muxers,
        hooks,
    )
    .unwrap();

    assert!(registry.find_source("live/silent").is_some());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(registry.find_source("live/silent").is_none());
}

#[tokio::test]
async fn probe_timeout_completes_audio_only_publish() {
    let mut config = AppConfig::default();
    config.probe_timeout = 150;
    let engine = Engine::new(config);
    let source = engine.start_source("live/audio");

    let (sink, mut rx) = ChannelSink::new("live/audio", TransStreamProtocol::Rtmp);
    let sink_dyn: Arc<dyn Sink> = sink;
    source.add_sink(sink_dyn).await.unwrap();

    // Announce audio only and never signal done: the probe window closes
    // the header.
    source.input(encode_stream(&audio_stream())).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    source.input(encode_frame(&audio_frame(0))).unwrap();
    source.input(encode_frame(&audio_frame(23))).unwrap();
    settle().await;

    let items = collect(&mut rx).await;
    assert_eq!(items.len(), 2, "audio flows without keyframe gating");
    assert_eq!(items[0][0] & 0x3F, 4);
}

#[tokio::test]
async fn hls_playlist_rotates_and_stays_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.hls = HlsConfig {
        enable: true,
        dir: dir.path().to_string_lossy().into_owned(),
        duration: 1,
        playlist_length: 3,
    };
    let engine = Engine::new(config);
    let source = engine.start_source("live/hls");
    source.input(announce_av()).unwrap();
    settle().await;

    // Keyframe every 1.5s, frames every 500ms: one cut per group.
    for gop in 0..8i64 {
        let start = gop * 1500;
        source
            .input(encode_frame(&video_frame(start, true)))
            .unwrap();
        source
            .input(encode_frame(&video_frame(start + 500, false)))
            .unwrap();
        source
            .input(encode_frame(&video_frame(start + 1000, false)))
            .unwrap();
        tokio::task::yield_now().await;
    }
    settle().await;

    let m3u8 = std::fs::read_to_string(dir.path().join("live_hls.m3u8")).unwrap();
    assert!(m3u8.starts_with("#EXTM3U\n"));
    assert_eq!(m3u8.matches("#EXTINF").count(), 3);

    // The playlist tail names the most recent sealed segment, and at most
    // one segment file beyond the listed ones exists on disk.
    let listed: Vec<&str> = m3u8
        .lines()
        .filter(|l| l.ends_with(".ts"))
        .collect();
    let last_listed = listed.last().unwrap();
    let on_disk = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".ts"))
        .count();
    assert!(on_disk <= listed.len() + 1, "{on_disk} ts files on disk");
    assert!(m3u8.trim_end().ends_with(last_listed));

    source.close().await;
    settle().await;
}

/// Strips the RTP header the receive servers forward, then parses the
/// elementary framing -- standing in for the PS demux that lives outside
/// the engine.
struct RtpElementaryDemuxer {
    inner: ElementaryDemuxer,
}

impl RtpElementaryDemuxer {
    fn new() -> Self {
        Self {
            inner: ElementaryDemuxer::new(),
        }
    }
}

impl Demuxer for RtpElementaryDemuxer {
    fn input(
        &mut self,
        data: &[u8],
    ) -> Result<Vec<DemuxEvent>, rill::source::demux::DemuxError> {
        if data.len() <= rill::gb28181::RTP_HEADER_SIZE {
            return Ok(Vec::new());
        }
        self.inner.input(&data[rill::gb28181::RTP_HEADER_SIZE..])
    }
}

fn rtp_packet(ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 12 + payload.len()];
    packet[0] = 0x80;
    packet[1] = 96;
    packet[8..12].copy_from_slice(&ssrc.to_be_bytes());
    packet[12..].copy_from_slice(payload);
    packet
}

async fn send_framed(stream: &mut tokio::net::TcpStream, packet: &[u8]) {
    let mut framed = Vec::with_capacity(2 + packet.len());
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    stream.write_all(&framed).await.unwrap();
}

#[tokio::test]
async fn gb28181_tcp_single_port_routes_two_ssrcs() {
    let engine = Engine::new(AppConfig::default());
    let filter = SsrcFilter::new(128);

    for (name, ssrc) in [("gb/a", 0xAAAAu32), ("gb/b", 0xBBBBu32)] {
        let handle = PublishSource::start(
            name,
            Box::new(RtpElementaryDemuxer::new()),
            engine.config.clone(),
            engine.registry.clone(),
            engine.muxers.clone(),
            engine.hooks.clone(),
        )
        .unwrap();
        assert!(filter.register_source(ssrc, handle));
    }
    assert_eq!(engine.registry.source_count(), 2);

    let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), filter.clone(), false)
        .await
        .unwrap();
    let addr = server.local_addr();
    server.spawn();

    let mut conn_a = tokio::net::TcpStream::connect(addr).await.unwrap();
    let mut conn_b = tokio::net::TcpStream::connect(addr).await.unwrap();

    // Each connection announces and publishes under its own SSRC.
    for (conn, ssrc) in [(&mut conn_a, 0xAAAAu32), (&mut conn_b, 0xBBBBu32)] {
        send_framed(conn, &rtp_packet(ssrc, &announce_av())).await;
        send_framed(
            conn,
            &rtp_packet(ssrc, &encode_frame(&video_frame(0, true))),
        )
        .await;
    }
    settle().await;

    // Both publications completed and accept subscribers.
    for name in ["gb/a", "gb/b"] {
        let handle = engine.registry.find_source(name).expect("source alive");
        let (sink, mut rx) = ChannelSink::new(name, TransStreamProtocol::Rtmp);
        let sink_dyn: Arc<dyn Sink> = sink;
        handle.add_sink(sink_dyn).await.unwrap();
        settle().await;
        let items = collect(&mut rx).await;
        assert!(!items.is_empty(), "{name} delivered nothing");
    }

    drop(conn_a);
    drop(conn_b);
}

#[tokio::test]
async fn malformed_udp_rtp_closes_only_the_bound_source() {
    let engine = Engine::new(AppConfig::default());

    let mut handles = Vec::new();
    for name in ["gb/u1", "gb/u2"] {
        handles.push(
            PublishSource::start(
                name,
                Box::new(RtpElementaryDemuxer::new()),
                engine.config.clone(),
                engine.registry.clone(),
                engine.muxers.clone(),
                engine.hooks.clone(),
            )
            .unwrap(),
        );
    }

    // Multi-port mode: each port bound to its own source.
    let mut addrs = Vec::new();
    for handle in &handles {
        let server = UdpServer::bind_with_source(
            "127.0.0.1:0".parse().unwrap(),
            SingleFilter::new(handle.clone()),
            Some(handle.clone()),
        )
        .await
        .unwrap();
        addrs.push(server.local_addr());
        server.spawn();
    }

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // Healthy traffic to the first port, garbage to the second.
    socket
        .send_to(&rtp_packet(0x1111, &announce_av()), addrs[0])
        .await
        .unwrap();
    socket.send_to(&[0x00, 0x01, 0x02], addrs[1]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(engine.registry.find_source("gb/u1").is_some());
    assert!(engine.registry.find_source("gb/u2").is_none());
}
