//! The per-publication actor: one `PublishSource` owns every mutable
//! structure of a publication and runs a single loop over two bounded
//! channels, the stream pipe (raw bytes from the parser) and the command
//! channel (sink attach/detach, lookups, close). Watchdogs are deadline
//! branches of the same `select!`, so the loop stays the only mutation site.

pub mod demux;
pub mod errors;

pub use demux::{DemuxEvent, DemuxedFrame, Demuxer, ElementaryDemuxer};
pub use errors::SourceError;

use crate::cache::GopBuffer;
use crate::collections::PacketPool;
use crate::config::AppConfig;
use crate::hook::HookBus;
use crate::media::{AvPacket, AvStream, MediaType, TrackList};
use crate::registry::{RegistryError, StreamRegistry};
use crate::sink::{SessionState, Sink, SinkId};
use crate::transmux::{
    generate_trans_stream_id, is_support_mux, FactoryContext, MuxOutput, TransStream,
    TransStreamId, TransStreamProtocol, TransStreamRegistry,
};
use bytes::Bytes;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Upper bound on elementary tracks per publication.
pub const MAX_TRACKS: usize = 8;

/// Room reserved in front of each pooled payload so a container prefix can
/// be written in place.
const PACKET_HEADER_ROOM: usize = 32;

const COMMAND_CHANNEL_CAPACITY: usize = 128;

type PoolSet = [Option<PacketPool>; MAX_TRACKS];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    HandshakeDone,
    Probing,
    Completed,
    Closed,
}

pub enum SourceCommand {
    AddSink(Arc<dyn Sink>),
    RemoveSink(SinkId),
    FindSink(SinkId, oneshot::Sender<Option<Arc<dyn Sink>>>),
    Close,
}

/// Cloneable external face of a source. Everything funnels into the loop's
/// channels; `input` is non-blocking and reports backpressure instead of
/// waiting.
#[derive(Clone)]
pub struct SourceHandle {
    id: Arc<str>,
    stream_tx: mpsc::Sender<Bytes>,
    command_tx: mpsc::Sender<SourceCommand>,
    create_time: DateTime<Local>,
    /// Millis timestamp of the most recent publish bytes, shared with the
    /// loop so watchers read it without a rendezvous.
    last_packet_millis: Arc<AtomicI64>,
}

impl SourceHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn create_time(&self) -> DateTime<Local> {
        self.create_time
    }

    /// When the source last received publish data (the create time until the
    /// first bytes arrive).
    #[must_use]
    pub fn last_packet_time(&self) -> DateTime<Local> {
        let millis = self.last_packet_millis.load(Ordering::Relaxed);
        Local
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Local::now)
    }

    /// Push raw publish bytes toward the demuxer. A full pipe is an error
    /// the parser answers by dropping the connection.
    pub fn input(&self, data: Bytes) -> Result<(), SourceError> {
        match self.stream_tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SourceError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SourceError::Closed),
        }
    }

    /// Hand a subscriber to the source. Sinks arriving before the source
    /// completes are parked in the waiting queue by the loop.
    pub async fn add_sink(&self, sink: Arc<dyn Sink>) -> Result<(), SourceError> {
        self.command_tx
            .send(SourceCommand::AddSink(sink))
            .await
            .map_err(|_| SourceError::Closed)
    }

    pub async fn remove_sink(&self, id: SinkId) -> Result<(), SourceError> {
        self.command_tx
            .send(SourceCommand::RemoveSink(id))
            .await
            .map_err(|_| SourceError::Closed)
    }

    /// Synchronous rendezvous through the loop.
    pub async fn find_sink(&self, id: SinkId) -> Option<Arc<dyn Sink>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SourceCommand::FindSink(id, reply_tx))
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    /// Request teardown. Sends onto a closed source are non-fatal drops.
    pub async fn close(&self) {
        let _ = self.command_tx.send(SourceCommand::Close).await;
    }
}

pub struct PublishSource {
    id: String,
    config: Arc<AppConfig>,
    registry: Arc<StreamRegistry>,
    muxers: Arc<TransStreamRegistry>,
    hooks: Arc<HookBus>,

    demuxer: Option<Box<dyn Demuxer>>,
    state: SourceState,
    closed: bool,
    completed: bool,
    exist_video: bool,

    origin_streams: TrackList,
    pools: Arc<Mutex<PoolSet>>,
    gop_buffer: Option<GopBuffer>,

    trans_streams: HashMap<TransStreamId, Box<dyn TransStream>>,
    sinks: HashMap<SinkId, Arc<dyn Sink>>,
    trans_stream_sinks: HashMap<TransStreamId, HashMap<SinkId, Arc<dyn Sink>>>,

    record_sink: Option<Arc<dyn Sink>>,
    record_path: Option<PathBuf>,
    sink_count: usize,

    stream_rx: mpsc::Receiver<Bytes>,
    command_rx: mpsc::Receiver<SourceCommand>,

    probe_deadline: Option<Instant>,
    last_packet_time: Instant,
    last_packet_millis: Arc<AtomicI64>,
    last_stream_end_time: Instant,
}

enum WriteOutcome {
    Ok,
    ZeroWindow,
    Fatal,
}

impl PublishSource {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        demuxer: Box<dyn Demuxer>,
        config: Arc<AppConfig>,
        registry: Arc<StreamRegistry>,
        muxers: Arc<TransStreamRegistry>,
        hooks: Arc<HookBus>,
    ) -> (Self, SourceHandle) {
        let id = id.into();
        // Two slots below the queue size keep a pending write and an
        // in-flight block from overwriting each other.
        let pipe_capacity = config.receive_queue_size.saturating_sub(2).max(1);
        let (stream_tx, stream_rx) = mpsc::channel(pipe_capacity);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let last_packet_millis = Arc::new(AtomicI64::new(Local::now().timestamp_millis()));
        let handle = SourceHandle {
            id: Arc::from(id.as_str()),
            stream_tx,
            command_tx,
            create_time: Local::now(),
            last_packet_millis: last_packet_millis.clone(),
        };

        let now = Instant::now();
        let source = Self {
            id,
            config,
            registry,
            muxers,
            hooks,
            demuxer: Some(demuxer),
            state: SourceState::HandshakeDone,
            closed: false,
            completed: false,
            exist_video: false,
            origin_streams: Vec::new(),
            pools: Arc::new(Mutex::new(Default::default())),
            gop_buffer: None,
            trans_streams: HashMap::new(),
            sinks: HashMap::new(),
            trans_stream_sinks: HashMap::new(),
            record_sink: None,
            record_path: None,
            sink_count: 0,
            stream_rx,
            command_rx,
            probe_deadline: None,
            last_packet_time: now,
            last_packet_millis,
            last_stream_end_time: now,
        };
        (source, handle)
    }

    /// Create, register and spawn a source in one step. Fails when another
    /// publisher already owns the id.
    pub fn start(
        id: impl Into<String>,
        demuxer: Box<dyn Demuxer>,
        config: Arc<AppConfig>,
        registry: Arc<StreamRegistry>,
        muxers: Arc<TransStreamRegistry>,
        hooks: Arc<HookBus>,
    ) -> Result<SourceHandle, RegistryError> {
        let (source, handle) = Self::new(id, demuxer, config, registry.clone(), muxers, hooks);
        registry.register_source(handle.clone())?;
        tokio::spawn(source.run());
        Ok(handle)
    }

    pub async fn run(mut self) {
        tracing::info!(source = %self.id, "publish source started");
        let far_future = Instant::now() + Duration::from_secs(86_400 * 365);

        while !self.closed {
            let probe_at = self.probe_deadline;
            let receive_at = (self.config.receive_timeout > 0).then(|| {
                self.last_packet_time + Duration::from_secs(self.config.receive_timeout)
            });
            let idle_at = (self.config.idle_timeout > 0
                && self.completed
                && self.sink_count == 0)
                .then(|| {
                    self.last_stream_end_time + Duration::from_secs(self.config.idle_timeout)
                });

            tokio::select! {
                data = self.stream_rx.recv() => match data {
                    Some(data) => self.on_input(data),
                    None => self.do_close(),
                },
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.do_close(),
                },
                _ = tokio::time::sleep_until(probe_at.unwrap_or(far_future)),
                    if probe_at.is_some() =>
                {
                    tracing::info!(source = %self.id, "probe window elapsed");
                    self.write_header();
                }
                _ = tokio::time::sleep_until(receive_at.unwrap_or(far_future)),
                    if receive_at.is_some() =>
                {
                    tracing::warn!(source = %self.id, "receive timeout");
                    self.hooks.receive_timeout(&self.id);
                    self.do_close();
                }
                _ = tokio::time::sleep_until(idle_at.unwrap_or(far_future)),
                    if idle_at.is_some() =>
                {
                    tracing::info!(source = %self.id, "idle timeout with no subscribers");
                    self.hooks.idle_timeout(&self.id);
                    self.do_close();
                }
            }
        }

        // Drain commands that raced the teardown so reply channels resolve.
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                SourceCommand::FindSink(_, reply) => {
                    let _ = reply.send(None);
                }
                SourceCommand::AddSink(sink) => {
                    self.registry.add_sink_to_waiting_queue(&self.id, sink);
                }
                _ => {}
            }
        }
        tracing::info!(source = %self.id, "publish source stopped");
    }

    fn handle_command(&mut self, command: SourceCommand) {
        match command {
            SourceCommand::AddSink(sink) => {
                if !self.completed {
                    self.registry.add_sink_to_waiting_queue(&self.id, sink);
                } else if !self.do_add_sink(sink.clone()) {
                    sink.close();
                }
            }
            SourceCommand::RemoveSink(id) => {
                self.do_remove_sink(id);
            }
            SourceCommand::FindSink(id, reply) => {
                let _ = reply.send(self.sinks.get(&id).cloned());
            }
            SourceCommand::Close => self.do_close(),
        }
    }

    fn on_input(&mut self, data: Bytes) {
        self.last_packet_time = Instant::now();
        self.last_packet_millis
            .store(Local::now().timestamp_millis(), Ordering::Relaxed);
        let Some(demuxer) = self.demuxer.as_mut() else {
            return;
        };
        match demuxer.input(&data) {
            Ok(events) => {
                for event in events {
                    self.on_demux_event(event);
                    if self.closed {
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::error!(source = %self.id, "parse error, closing: {err}");
                self.do_close();
            }
        }
    }

    fn on_demux_event(&mut self, event: DemuxEvent) {
        match event {
            DemuxEvent::Stream(stream) => self.on_demux_stream(stream),
            DemuxEvent::StreamsDone => self.write_header(),
            DemuxEvent::Frame(frame) => {
                if let Some(packet) = self.intern_packet(frame) {
                    self.on_demux_packet(packet);
                }
            }
            DemuxEvent::Done => {}
        }
    }

    fn on_demux_stream(&mut self, stream: AvStream) {
        if self.completed {
            tracing::warn!(source = %self.id, "track announced after header, ignored");
            return;
        }
        if stream.index >= MAX_TRACKS {
            tracing::error!(source = %self.id, index = stream.index, "too many tracks, closing");
            self.do_close();
            return;
        }

        if stream.media_type == MediaType::Video {
            self.exist_video = true;
        }
        self.origin_streams.push(Arc::new(stream));

        if self.origin_streams.len() == 1 {
            self.state = SourceState::Probing;
            self.probe_deadline =
                Some(Instant::now() + Duration::from_millis(self.config.probe_timeout));
        }

        if self.config.gop_cache && self.exist_video && self.gop_buffer.is_none() {
            let mut buffer = GopBuffer::new();
            let pools = self.pools.clone();
            buffer.set_discard_handler(Box::new(move |packet: &AvPacket| {
                if let Some(pool) = pools.lock()[packet.index].as_mut() {
                    pool.free_head();
                }
            }));
            self.gop_buffer = Some(buffer);
        }

        // Early probe cut: with audio and video both announced there is
        // nothing left to wait for.
        let has_audio = self
            .origin_streams
            .iter()
            .any(|s| s.media_type == MediaType::Audio);
        if has_audio && self.exist_video {
            self.write_header();
        }
    }

    /// Copy a demuxed payload into the owning track's pool and build the
    /// cached packet around the committed bytes.
    fn intern_packet(&mut self, frame: DemuxedFrame) -> Option<AvPacket> {
        if frame.index >= MAX_TRACKS {
            tracing::warn!(source = %self.id, index = frame.index, "frame for invalid track");
            return None;
        }
        let Some(track) = self
            .origin_streams
            .iter()
            .find(|s| s.index == frame.index)
            .cloned()
        else {
            tracing::warn!(source = %self.id, index = frame.index, "frame before announcement");
            return None;
        };

        // GOP-cached packets are evicted by the cache's discard callback, so
        // the pool must not reorder records underneath it.
        let external_eviction = self.config.gop_cache && self.exist_video;
        let mut pools = self.pools.lock();
        let pool = find_or_create_pool(
            &mut pools,
            &self.config,
            frame.index,
            track.media_type,
            external_eviction,
        );
        pool.mark();
        let slot = pool.allocate(PACKET_HEADER_ROOM + frame.payload.len());
        slot[PACKET_HEADER_ROOM..].copy_from_slice(&frame.payload);
        let committed = pool.fetch();

        Some(AvPacket {
            index: frame.index,
            media_type: track.media_type,
            key: frame.key,
            dts: frame.dts,
            pts: frame.pts,
            timebase: frame.timebase,
            data: committed.slice(PACKET_HEADER_ROOM..),
        })
    }

    fn on_demux_packet(&mut self, packet: AvPacket) {
        let cache = self.config.gop_cache && self.exist_video;
        let mut cached = false;
        if cache {
            if let Some(mut gop) = self.gop_buffer.take() {
                cached = gop.add_packet(packet.clone());
                self.gop_buffer = Some(gop);
            }
        }

        let ids: Vec<TransStreamId> = self.trans_streams.keys().copied().collect();
        for id in ids {
            self.dispatch_packet(id, &packet);
        }

        // A packet the cache refused (or never saw) is still the newest pool
        // record; release it here so the ledger stays FIFO.
        if !cached {
            if let Some(pool) = self.pools.lock()[packet.index].as_mut() {
                pool.free_tail();
            }
        }
    }

    fn dispatch_packet(&mut self, id: TransStreamId, packet: &AvPacket) {
        let Some(stream) = self.trans_streams.get_mut(&id) else {
            return;
        };
        match stream.input(packet) {
            Ok(output) if !output.segments.is_empty() => {
                self.dispatch_buffer(id, packet.index as i32, &output);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(source = %self.id, trans_stream = %id, "mux input: {err}");
            }
        }
    }

    fn dispatch_buffer(&mut self, id: TransStreamId, index: i32, output: &MuxOutput) {
        let exist_video = self
            .trans_streams
            .get(&id)
            .is_some_and(|t| t.exist_video());
        let subscribers: Vec<Arc<dyn Sink>> = self
            .trans_stream_sinks
            .get(&id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return;
        }

        let mut failed: Vec<SinkId> = Vec::new();
        for sink in subscribers {
            // A video-bearing stream starts every subscriber on a keyframe,
            // preceded by the container's sequence header.
            if exist_video && sink.sent_packet_count() == 0 {
                if !output.video_key {
                    continue;
                }
                let extra = self
                    .trans_streams
                    .get_mut(&id)
                    .and_then(|t| t.read_extra_data(output.timestamp).ok())
                    .unwrap_or_default();
                if !extra.is_empty() {
                    match write_to_sink(&sink, index, &extra, output.timestamp) {
                        WriteOutcome::Fatal => {
                            failed.push(sink.id());
                            continue;
                        }
                        WriteOutcome::ZeroWindow => continue,
                        WriteOutcome::Ok => {}
                    }
                }
            }

            if let WriteOutcome::Fatal = write_to_sink(&sink, index, &output.segments, output.timestamp) {
                failed.push(sink.id());
            }
        }

        for sink_id in failed {
            tracing::info!(source = %self.id, sink = %sink_id, "sink connection lost");
            if let Some(sink) = self.sinks.get(&sink_id).cloned() {
                self.do_remove_sink(sink_id);
                sink.close();
            }
        }
    }

    fn dispatch_gop_buffer(&mut self, id: TransStreamId) {
        if let Some(gop) = self.gop_buffer.take() {
            gop.peek_all(|packet| self.dispatch_packet(id, packet));
            self.gop_buffer = Some(gop);
        }
    }

    fn create_trans_stream(
        &mut self,
        protocol: TransStreamProtocol,
        streams: &[Arc<AvStream>],
    ) -> Result<Box<dyn TransStream>, crate::transmux::TransMuxError> {
        tracing::debug!(source = %self.id, %protocol, "creating trans stream");
        let ctx = FactoryContext {
            source_id: &self.id,
            config: &self.config,
        };
        let mut stream = self.muxers.create(protocol, &ctx)?;
        for track in streams {
            stream.add_track(track.clone())?;
        }
        stream.write_header()?;
        Ok(stream)
    }

    /// Attach a subscriber: pick effective codecs, find or create the
    /// transmuxer, prime with sequence header + cached keyframe group.
    fn do_add_sink(&mut self, sink: Arc<dyn Sink>) -> bool {
        let audio_stream = self
            .origin_streams
            .iter()
            .find(|s| s.media_type == MediaType::Audio)
            .cloned();
        let video_stream = self
            .origin_streams
            .iter()
            .find(|s| s.media_type == MediaType::Video)
            .cloned();

        let disable_audio = audio_stream.is_none();
        let disable_video = video_stream.is_none() || !sink.enable_video();
        if disable_audio && disable_video {
            return false;
        }

        // Transcoding is a no-op: a request the container cannot carry
        // degrades to the origin codecs.
        let mut audio_codec = sink.desired_audio_codec();
        let mut video_codec = sink.desired_video_codec();
        if (audio_codec.is_some() || video_codec.is_some())
            && !is_support_mux(sink.protocol(), audio_codec, video_codec)
        {
            audio_codec = None;
            video_codec = None;
        }
        if let (Some(desired), Some(origin)) = (audio_codec, audio_stream.as_ref()) {
            if desired != origin.codec {
                tracing::warn!(source = %self.id, sink = %sink.id(),
                    "audio transcode {desired} unavailable, serving {}", origin.codec);
            }
        }
        if let (Some(desired), Some(origin)) = (video_codec, video_stream.as_ref()) {
            if desired != origin.codec {
                tracing::warn!(source = %self.id, sink = %sink.id(),
                    "video transcode {desired} unavailable, serving {}", origin.codec);
            }
        }

        let streams: Vec<Arc<AvStream>> = self
            .origin_streams
            .iter()
            .filter(|s| !(disable_video && s.media_type == MediaType::Video))
            .cloned()
            .collect();

        let id = generate_trans_stream_id(sink.protocol(), &streams);
        let created = !self.trans_streams.contains_key(&id);
        if created {
            match self.create_trans_stream(sink.protocol(), &streams) {
                Ok(stream) => {
                    self.trans_streams.insert(id, stream);
                    self.trans_stream_sinks.insert(id, HashMap::new());
                }
                Err(err) => {
                    tracing::error!(source = %self.id, "trans stream create: {err}");
                    return false;
                }
            }
        }

        sink.set_trans_stream_id(Some(id));

        if !sink.update_state_if_open(SessionState::Transferring) {
            tracing::warn!(source = %self.id, sink = %sink.id(), "attaching a closed sink");
        }

        if let Err(err) = sink.start_streaming() {
            tracing::error!(source = %self.id, sink = %sink.id(), "start streaming: {err}");
            return false;
        }

        // Not ready to receive media yet (peer negotiation in flight); the
        // session re-adds the sink once it is.
        if !sink.is_ready() {
            return true;
        }

        let capacity = self
            .trans_streams
            .get(&id)
            .map_or(0, |t| t.out_stream_buffer_capacity());
        if sink.is_tcp_streaming() && capacity > 2 {
            sink.enable_async_write(capacity - 2);
        }

        if sink.protocol() == TransStreamProtocol::Hls {
            self.registry.register_hls_sink(sink.clone());
        }

        let handled = self
            .trans_streams
            .get_mut(&id)
            .and_then(|t| t.on_sink_attached(&sink).ok())
            .unwrap_or(false);

        if !handled {
            // Prime from the merge-writing buffer; the sequence header only
            // goes first when a keyframe group is actually available.
            let (buffered, timestamp) = self
                .trans_streams
                .get_mut(&id)
                .and_then(|t| t.read_key_frame_buffer().ok())
                .unwrap_or_default();
            if !buffered.is_empty() {
                let extra = self
                    .trans_streams
                    .get_mut(&id)
                    .and_then(|t| t.read_extra_data(timestamp).ok())
                    .unwrap_or_default();
                if !extra.is_empty() {
                    write_to_sink(&sink, 0, &extra, timestamp);
                }
                write_to_sink(&sink, 0, &buffered, timestamp);
            }
        }

        let is_record = self
            .record_sink
            .as_ref()
            .is_some_and(|r| r.id() == sink.id());
        if !is_record {
            self.sink_count += 1;
            tracing::info!(source = %self.id, sinks = self.sink_count, "sink attached");
            self.hooks
                .play(&self.id, &sink.id().to_string(), &sink.protocol().to_string());
        }

        self.sinks.insert(sink.id(), sink.clone());
        if let Some(subscribers) = self.trans_stream_sinks.get_mut(&id) {
            subscribers.insert(sink.id(), sink.clone());
        }

        // A fresh transmuxer replays the cached group so this sink starts
        // mid-GOP without waiting for the next keyframe.
        if created && self.config.gop_cache && self.exist_video {
            self.dispatch_gop_buffer(id);
        }

        true
    }

    fn do_remove_sink(&mut self, id: SinkId) -> bool {
        let Some(sink) = self.sinks.remove(&id) else {
            return false;
        };
        if let Some(trans_stream_id) = sink.trans_stream_id() {
            if let Some(subscribers) = self.trans_stream_sinks.get_mut(&trans_stream_id) {
                subscribers.remove(&id);
            }
        }

        let is_record = self
            .record_sink
            .as_ref()
            .is_some_and(|r| r.id() == sink.id());
        if !is_record {
            self.sink_count = self.sink_count.saturating_sub(1);
        }
        self.last_stream_end_time = Instant::now();
        tracing::info!(source = %self.id, sinks = self.sink_count, "sink detached");

        if sink.protocol() == TransStreamProtocol::Hls {
            self.registry.remove_hls_sink(id);
        }

        sink.stop_streaming();
        if !is_record {
            self.hooks
                .play_done(&self.id, &id.to_string(), &sink.protocol().to_string());
        }
        true
    }

    /// Probe ends here: default out-streams come up and every parked sink
    /// gets attached. Idempotent.
    fn write_header(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.state = SourceState::Completed;
        self.probe_deadline = None;
        tracing::debug!(source = %self.id, state = ?self.state,
            tracks = self.origin_streams.len(), "probe complete");

        if self.origin_streams.is_empty() {
            tracing::error!(source = %self.id, "no track announced, closing");
            self.do_close();
            return;
        }

        if self.config.record.enable {
            match crate::record::create_record_sink(&self.id, &self.config.record) {
                Ok((sink, path)) => {
                    self.record_sink = Some(sink);
                    self.record_path = Some(path);
                }
                Err(err) => {
                    tracing::error!(source = %self.id, "record sink create: {err}");
                }
            }
        }

        // HLS comes up with the source; waiting for the first player would
        // stack its latency on top of segment latency.
        if self.config.hls.enable {
            let streams = self.origin_streams.clone();
            let id = generate_trans_stream_id(TransStreamProtocol::Hls, &streams);
            match self.create_trans_stream(TransStreamProtocol::Hls, &streams) {
                Ok(stream) => {
                    self.trans_streams.insert(id, stream);
                    self.trans_stream_sinks.insert(id, HashMap::new());
                    if self.config.gop_cache && self.exist_video {
                        self.dispatch_gop_buffer(id);
                    }
                }
                Err(err) => {
                    tracing::error!(source = %self.id, "hls trans stream: {err}");
                }
            }
        }

        let mut pending = self.registry.pop_waiting_sinks(&self.id);
        if let Some(record) = self.record_sink.clone() {
            pending.push(record);
        }
        for sink in pending {
            if !self.do_add_sink(sink.clone()) {
                sink.close();
            }
        }
    }

    /// Teardown. Idempotent; the loop exits after the first call.
    fn do_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = SourceState::Closed;
        tracing::info!(source = %self.id, "closing publish source");

        if let Some(mut demuxer) = self.demuxer.take() {
            demuxer.close();
        }

        for pool in self.pools.lock().iter_mut().flatten() {
            pool.reset();
        }

        if let Some(mut gop) = self.gop_buffer.take() {
            gop.clear();
            gop.close();
        }

        self.probe_deadline = None;

        if let Some(record) = self.record_sink.as_ref() {
            record.close();
        }

        if let Err(err) = self.registry.unregister_source(&self.id) {
            tracing::debug!(source = %self.id, "source deregistration: {err}");
        }

        // Flush transmuxers and push the final segments out.
        let ids: Vec<TransStreamId> = self.trans_streams.keys().copied().collect();
        for id in ids {
            let Some(stream) = self.trans_streams.get_mut(&id) else {
                continue;
            };
            match stream.close() {
                Ok((segments, timestamp)) if !segments.is_empty() => {
                    let output = MuxOutput {
                        segments,
                        timestamp,
                        video_key: true,
                    };
                    self.dispatch_buffer(id, -1, &output);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(source = %self.id, trans_stream = %id, "mux close: {err}");
                }
            }
        }

        // Live sinks go back to the waiting queue for a future publisher.
        let sinks: Vec<Arc<dyn Sink>> = self.sinks.drain().map(|(_, s)| s).collect();
        for sink in sinks {
            sink.set_trans_stream_id(None);
            let is_record = self
                .record_sink
                .as_ref()
                .is_some_and(|r| r.id() == sink.id());
            if is_record {
                continue;
            }
            if sink.update_state_if_open(SessionState::Wait) {
                self.registry.add_sink_to_waiting_queue(&self.id, sink.clone());
                sink.stop_streaming();
            } else {
                tracing::warn!(source = %self.id, sink = %sink.id(), "sink already closed, not re-queued");
            }
        }

        self.trans_streams.clear();
        self.trans_stream_sinks.clear();

        self.hooks.publish_done(&self.id);
        if let Some(path) = self.record_path.as_ref() {
            self.hooks.record(&self.id, &path.display().to_string());
        }
    }
}

fn find_or_create_pool<'a>(
    pools: &'a mut PoolSet,
    config: &AppConfig,
    index: usize,
    media_type: MediaType,
    external_eviction: bool,
) -> &'a mut PacketPool {
    if pools[index].is_none() {
        let capacity = match media_type {
            MediaType::Audio => 48_000 * 12,
            MediaType::Video if config.gop_cache => config.gop_buffer_size,
            MediaType::Video => 1024 * 1024,
        };
        let pool = if external_eviction {
            PacketPool::with_external_eviction(capacity)
        } else {
            PacketPool::new(capacity)
        };
        pools[index] = Some(pool);
    }
    pools[index].as_mut().expect("pool just created")
}

fn write_to_sink(
    sink: &Arc<dyn Sink>,
    index: i32,
    segments: &[Bytes],
    timestamp: i64,
) -> WriteOutcome {
    match sink.write(index, segments, timestamp) {
        Ok(()) => {
            sink.increase_sent_packet_count();
            WriteOutcome::Ok
        }
        Err(crate::sink::SinkError::ZeroWindow) => {
            // Kernel buffer equivalent is full: back off until the next
            // keyframe re-primes this sink.
            tracing::debug!(sink = %sink.id(), "send window full, pausing until keyframe");
            sink.reset_sent_packet_count();
            WriteOutcome::ZeroWindow
        }
        Err(err) => {
            tracing::debug!(sink = %sink.id(), "sink write failed: {err}");
            WriteOutcome::Fatal
        }
    }
}
