//! Container-format transmuxers ("TransStreams") and their registry.
//!
//! One TransStream exists per distinct (protocol, track-set) under a source;
//! its identity is a deterministic hash so a second subscriber asking for the
//! same format reuses the first one's muxer.

pub mod errors;
pub mod merge_writer;

pub use errors::TransMuxError;
pub use merge_writer::MergeWritingBuffer;

use crate::config::AppConfig;
use crate::media::{AvPacket, AvStream, MediaType, TrackList};
use crate::sink::Sink;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransStreamProtocol {
    Rtmp,
    Flv,
    Hls,
    Rtsp,
    Rtc,
    GbForward,
}

impl TransStreamProtocol {
    /// Stable numeric tag folded into `TransStreamId` derivation.
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            Self::Rtmp => 1,
            Self::Flv => 2,
            Self::Hls => 3,
            Self::Rtsp => 4,
            Self::Rtc => 5,
            Self::GbForward => 6,
        }
    }
}

impl fmt::Display for TransStreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Rtmp => "rtmp",
            Self::Flv => "flv",
            Self::Hls => "hls",
            Self::Rtsp => "rtsp",
            Self::Rtc => "rtc",
            Self::GbForward => "gb-forward",
        };
        write!(f, "{name}")
    }
}

/// Identity of a transmuxer under one source. Deterministic: two concurrent
/// subscribers with identical requests derive the identical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransStreamId(u64);

impl fmt::Display for TransStreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// FNV-1a over the protocol tag and the sorted (track index, codec) pairs.
#[must_use]
pub fn generate_trans_stream_id(
    protocol: TransStreamProtocol,
    streams: &[Arc<AvStream>],
) -> TransStreamId {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut pairs: Vec<(usize, u32)> = streams
        .iter()
        .map(|s| (s.index, s.codec.tag()))
        .collect();
    pairs.sort_unstable();

    let mut hash = FNV_OFFSET;
    let mut fold = |value: u32| {
        for byte in value.to_be_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    fold(protocol.tag());
    for (index, codec) in pairs {
        fold(index as u32);
        fold(codec);
    }
    TransStreamId(hash)
}

/// Bytes produced by one `input` call, ready for fan-out.
#[derive(Debug, Default)]
pub struct MuxOutput {
    pub segments: Vec<Bytes>,
    pub timestamp: i64,
    pub video_key: bool,
}

/// A container-format transmuxer. Driven exclusively from the owning
/// source's loop; packets may only be fed after `write_header`.
pub trait TransStream: Send {
    fn add_track(&mut self, track: Arc<AvStream>) -> Result<(), TransMuxError>;

    /// Build container-level initialisation bytes and flip to completed.
    fn write_header(&mut self) -> Result<(), TransMuxError>;

    fn input(&mut self, packet: &AvPacket) -> Result<MuxOutput, TransMuxError>;

    /// Container init / sequence-header bytes for a newly attached sink.
    fn read_extra_data(&mut self, timestamp: i64) -> Result<Vec<Bytes>, TransMuxError>;

    /// Whatever the merge-writing buffer holds from the last keyframe on.
    fn read_key_frame_buffer(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError>;

    /// Final segments on teardown.
    fn close(&mut self) -> Result<(Vec<Bytes>, i64), TransMuxError>;

    fn exist_video(&self) -> bool;

    /// Hint for sizing a TCP sink's async-write queue. Zero disables it.
    fn out_stream_buffer_capacity(&self) -> usize {
        0
    }

    /// Protocol-specific sink attachment. Returning `true` tells the source
    /// the muxer took ownership of priming (the HLS variant serves or parks
    /// the playlist here) and the generic keyframe-buffer path is skipped.
    fn on_sink_attached(&mut self, sink: &Arc<dyn Sink>) -> Result<bool, TransMuxError> {
        let _ = sink;
        Ok(false)
    }
}

/// Track bookkeeping shared by the concrete muxers.
#[derive(Default)]
pub struct BaseTransStream {
    pub tracks: TrackList,
    pub completed: bool,
    pub exist_video: bool,
}

impl BaseTransStream {
    pub fn add_track(&mut self, track: Arc<AvStream>) -> Result<(), TransMuxError> {
        if self.completed {
            return Err(TransMuxError::AlreadyCompleted);
        }
        if track.media_type == MediaType::Video {
            self.exist_video = true;
        }
        self.tracks.push(track);
        Ok(())
    }

    pub fn audio_track(&self) -> Option<&Arc<AvStream>> {
        self.tracks
            .iter()
            .find(|t| t.media_type == MediaType::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<AvStream>> {
        self.tracks
            .iter()
            .find(|t| t.media_type == MediaType::Video)
    }

    pub fn track(&self, index: usize) -> Result<&Arc<AvStream>, TransMuxError> {
        self.tracks
            .iter()
            .find(|t| t.index == index)
            .ok_or(TransMuxError::TrackNotAvailable(index))
    }
}

/// Everything a factory needs to build a muxer for one source.
pub struct FactoryContext<'a> {
    pub source_id: &'a str,
    pub config: &'a AppConfig,
}

pub type TransStreamFactory =
    Arc<dyn Fn(&FactoryContext) -> Result<Box<dyn TransStream>, TransMuxError> + Send + Sync>;

/// Protocol-tag → constructor mapping, plus a creation counter so tests can
/// observe deduplication.
pub struct TransStreamRegistry {
    factories: Mutex<HashMap<TransStreamProtocol, TransStreamFactory>>,
    created: AtomicU64,
}

impl TransStreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
        }
    }

    /// Registry with every built-in transmuxer factory installed.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .register(TransStreamProtocol::Rtmp, Arc::new(crate::rtmp::factory))
            .expect("fresh registry");
        registry
            .register(TransStreamProtocol::Flv, Arc::new(crate::flv::factory))
            .expect("fresh registry");
        registry
            .register(TransStreamProtocol::Hls, Arc::new(crate::hls::factory))
            .expect("fresh registry");
        registry
            .register(TransStreamProtocol::Rtc, Arc::new(crate::rtc::factory))
            .expect("fresh registry");
        registry
    }

    pub fn register(
        &self,
        protocol: TransStreamProtocol,
        factory: TransStreamFactory,
    ) -> Result<(), TransMuxError> {
        let mut factories = self.factories.lock();
        if factories.contains_key(&protocol) {
            return Err(TransMuxError::FactoryExists(protocol));
        }
        factories.insert(protocol, factory);
        Ok(())
    }

    pub fn create(
        &self,
        protocol: TransStreamProtocol,
        ctx: &FactoryContext,
    ) -> Result<Box<dyn TransStream>, TransMuxError> {
        let factory = self
            .factories
            .lock()
            .get(&protocol)
            .cloned()
            .ok_or(TransMuxError::UnknownProtocol(protocol))?;
        let stream = factory(ctx)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    #[must_use]
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

impl Default for TransStreamRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Whether `protocol` can carry the requested codec pair. The transcoding
/// scaffolding is a no-op, so an unsupported request degrades to the origin
/// codecs in the attach path.
#[must_use]
pub fn is_support_mux(
    protocol: TransStreamProtocol,
    audio: Option<crate::media::CodecId>,
    video: Option<crate::media::CodecId>,
) -> bool {
    use crate::media::CodecId;
    match protocol {
        TransStreamProtocol::Rtc => !matches!(video, Some(CodecId::H265)),
        TransStreamProtocol::Hls => !matches!(audio, Some(CodecId::G711a) | Some(CodecId::G711u)),
        _ => true,
    }
}
