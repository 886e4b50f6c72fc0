//! HLS transmuxer: TS segment cutting, playlist rotation, parked playlist
//! sinks.
//!
//! A new segment is cut when the source has no video or the next packet is a
//! video keyframe, and the current segment has reached the configured
//! duration. On each cut the head segment file is deleted once the playlist
//! FIFO is full and the `.m3u8` on disk is rewritten in place. Subscribers
//! that arrive before the first cut are parked and receive the playlist text
//! with that cut.

pub mod m3u8;

pub use m3u8::M3u8Writer;

use crate::config::HlsConfig;
use crate::media::{
    decoder_config_to_annexb, AvPacket, AvStream, MediaType, TIMEBASE_90KHZ,
};
use crate::mpegts::TsMuxer;
use crate::sink::{Sink, SinkId};
use crate::transmux::{
    BaseTransStream, FactoryContext, MuxOutput, TransMuxError, TransStream,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

/// Staged TS bytes are flushed to the segment file in batches of this size.
const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

pub fn factory(ctx: &FactoryContext) -> Result<Box<dyn TransStream>, TransMuxError> {
    Ok(Box::new(HlsTransStream::new(
        ctx.source_id,
        ctx.config.hls.clone(),
    )))
}

struct SegmentContext {
    sequence: u64,
    file: fs::File,
    path: PathBuf,
    url: String,
}

pub struct HlsTransStream {
    base: BaseTransStream,
    source_id: String,
    config: HlsConfig,
    muxer: TsMuxer,
    pids: HashMap<usize, u16>,
    playlist: M3u8Writer,
    m3u8_path: PathBuf,
    context: Option<SegmentContext>,
    next_sequence: u64,
    m3u8_sinks: HashMap<SinkId, Arc<dyn Sink>>,
}

impl HlsTransStream {
    #[must_use]
    pub fn new(source_id: &str, config: HlsConfig) -> Self {
        let m3u8_path = config.m3u8_path(source_id);
        let playlist = M3u8Writer::new(config.playlist_length);
        Self {
            base: BaseTransStream::default(),
            source_id: source_id.to_string(),
            config,
            muxer: TsMuxer::new(),
            pids: HashMap::new(),
            playlist,
            m3u8_path,
            context: None,
            next_sequence: 0,
            m3u8_sinks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn playlist_text(&self) -> String {
        self.playlist.to_text()
    }

    fn drain_muxer(&mut self, force: bool) -> Result<(), TransMuxError> {
        if self.muxer.buffered_len() == 0 {
            return Ok(());
        }
        if !force && self.muxer.buffered_len() < WRITE_BUFFER_SIZE {
            return Ok(());
        }
        let data = self.muxer.take_data();
        if let Some(context) = self.context.as_mut() {
            context.file.write_all(&data)?;
        }
        Ok(())
    }

    /// Seal the current segment: final writes, playlist rotation, m3u8
    /// rewrite, parked-sink delivery.
    fn flush_segment(&mut self) -> Result<(), TransMuxError> {
        self.drain_muxer(true)?;
        let Some(context) = self.context.take() else {
            return Ok(());
        };
        context.file.sync_data().ok();
        drop(context.file);

        let duration = self.muxer.duration() as f32 / TIMEBASE_90KHZ as f32;
        if let Some(evicted) =
            self.playlist
                .add_segment(duration, context.url, context.sequence, context.path)
        {
            if let Err(err) = fs::remove_file(&evicted.path) {
                tracing::warn!(path = %evicted.path.display(), "evicted segment removal: {err}");
            }
        }

        let text = self.playlist.to_text();
        fs::write(&self.m3u8_path, &text)?;

        if !self.m3u8_sinks.is_empty() {
            let payload = Bytes::from(text);
            for sink in self.m3u8_sinks.values() {
                if let Err(err) = sink.write(-1, &[payload.clone()], 0) {
                    tracing::warn!(sink = %sink.id(), "parked playlist delivery: {err}");
                }
            }
            self.m3u8_sinks.clear();
        }
        Ok(())
    }

    /// Seal the previous segment (if any) and open the next TS file.
    fn create_segment(&mut self) -> Result<(), TransMuxError> {
        if self.context.is_some() {
            self.flush_segment()?;
            self.next_sequence += 1;
        }

        let sequence = self.next_sequence;
        let path = self.config.ts_path(&self.source_id, sequence);
        let url = self.config.ts_name(&self.source_id, sequence);
        let file = fs::File::create(&path)?;
        self.context = Some(SegmentContext {
            sequence,
            file,
            path,
            url,
        });

        self.muxer.reset();
        self.muxer.write_header();
        Ok(())
    }

    fn segment_elapsed(&self) -> f32 {
        self.muxer.duration() as f32 / TIMEBASE_90KHZ as f32
    }
}

impl TransStream for HlsTransStream {
    fn add_track(&mut self, track: Arc<AvStream>) -> Result<(), TransMuxError> {
        let extra = match track.media_type {
            MediaType::Video => decoder_config_to_annexb(track.codec, &track.extra_data),
            MediaType::Audio => track.extra_data.clone(),
        };
        let pid = self.muxer.add_stream(track.codec, extra)?;
        self.pids.insert(track.index, pid);
        self.base.add_track(track)
    }

    fn write_header(&mut self) -> Result<(), TransMuxError> {
        if self.base.completed {
            return Err(TransMuxError::AlreadyCompleted);
        }
        if self.base.tracks.is_empty() {
            return Err(TransMuxError::NoTracks);
        }
        fs::create_dir_all(&self.config.dir)?;
        self.base.completed = true;
        self.create_segment()
    }

    fn input(&mut self, packet: &AvPacket) -> Result<MuxOutput, TransMuxError> {
        if !self.base.completed {
            return Err(TransMuxError::NotCompleted);
        }
        let pid = *self
            .pids
            .get(&packet.index)
            .ok_or(TransMuxError::TrackNotAvailable(packet.index))?;

        let video = packet.media_type == MediaType::Video;
        let video_key = video && packet.key;

        let boundary = !self.base.exist_video || video_key;
        if boundary && self.segment_elapsed() >= self.config.duration as f32 {
            self.create_segment()?;
        }

        let pts = packet.convert_pts(TIMEBASE_90KHZ);
        let dts = packet.convert_dts(TIMEBASE_90KHZ);
        if video {
            let track = self.base.track(packet.index)?.clone();
            let mut payload = Vec::new();
            if video_key {
                payload
                    .extend_from_slice(&decoder_config_to_annexb(track.codec, &track.extra_data));
            }
            payload.extend_from_slice(&packet.annexb_data(track.nal_length_size()));
            self.muxer.write(pid, pts, dts, packet.key, &payload)?;
        } else {
            self.muxer.write(pid, pts, dts, packet.key, &packet.data)?;
        }
        self.drain_muxer(false)?;

        Ok(MuxOutput {
            segments: Vec::new(),
            timestamp: packet.convert_dts(crate::media::TIMEBASE_MILLIS),
            video_key,
        })
    }

    fn read_extra_data(&mut self, _timestamp: i64) -> Result<Vec<Bytes>, TransMuxError> {
        Ok(Vec::new())
    }

    fn read_key_frame_buffer(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError> {
        Ok((Vec::new(), 0))
    }

    fn close(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError> {
        self.flush_segment()?;
        Ok((Vec::new(), 0))
    }

    fn exist_video(&self) -> bool {
        self.base.exist_video
    }

    /// Playlist subscribers either get the current playlist immediately or
    /// wait parked until the next cut; the generic priming path never runs.
    fn on_sink_attached(&mut self, sink: &Arc<dyn Sink>) -> Result<bool, TransMuxError> {
        if self.playlist.is_empty() {
            self.m3u8_sinks.insert(sink.id(), sink.clone());
        } else {
            let payload = Bytes::from(self.playlist.to_text());
            if let Err(err) = sink.write(-1, &[payload], 0) {
                tracing::warn!(sink = %sink.id(), "playlist delivery: {err}");
            }
        }
        Ok(true)
    }
}
