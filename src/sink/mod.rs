//! Subscriber endpoints.
//!
//! A `Sink` is the engine-facing half of one player/recorder connection. Its
//! `state` is the only cross-thread-readable mutable field and sits behind
//! the sink's own mutex; everything else is either immutable identity or an
//! atomic counter. Sends go through a bounded channel with `try_send`, so a
//! slow consumer surfaces as a zero-window error instead of blocking the
//! source loop.

use crate::media::CodecId;
use crate::transmux::{TransStreamId, TransStreamProtocol};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Process-unique sink identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(uuid::Uuid);

impl SinkId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for SinkId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    HandshakeDone,
    Wait,
    Transferring,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Send window exhausted; the source stops writing until the next
    /// keyframe re-primes the sink.
    #[error("send buffer full")]
    ZeroWindow,

    #[error("connection closed")]
    Disconnected,

    #[error("io: {0}")]
    Io(String),
}

pub trait Sink: Send + Sync {
    fn id(&self) -> SinkId;
    fn source_id(&self) -> &str;
    fn protocol(&self) -> TransStreamProtocol;

    fn trans_stream_id(&self) -> Option<TransStreamId>;
    fn set_trans_stream_id(&self, id: Option<TransStreamId>);

    fn desired_audio_codec(&self) -> Option<CodecId> {
        None
    }
    fn desired_video_codec(&self) -> Option<CodecId> {
        None
    }
    fn enable_video(&self) -> bool {
        true
    }

    fn state(&self) -> SessionState;

    /// Flip the state under the sink's mutex unless it is already `Closed`.
    /// Returns whether the transition happened.
    fn update_state_if_open(&self, state: SessionState) -> bool;

    /// Send ready-made segments. `index` is the originating track, or -1 for
    /// control/priming data spanning tracks.
    fn write(&self, index: i32, segments: &[Bytes], timestamp: i64) -> Result<(), SinkError>;

    fn start_streaming(&self) -> Result<(), SinkError> {
        Ok(())
    }
    fn stop_streaming(&self) {}

    /// Whether the sink can accept media yet (WebRTC sinks say no until the
    /// peer negotiation settles).
    fn is_ready(&self) -> bool {
        true
    }

    fn is_tcp_streaming(&self) -> bool {
        false
    }

    /// Called when the chosen transmuxer advertises a send-queue capacity.
    fn enable_async_write(&self, capacity: usize) {
        let _ = capacity;
    }

    fn sent_packet_count(&self) -> u64;
    fn increase_sent_packet_count(&self);
    /// Zero-window recovery: delivery restarts at the next keyframe plus
    /// sequence header, as if the sink had just attached.
    fn reset_sent_packet_count(&self);

    fn close(&self);
}

/// Identity + state shared by every concrete sink.
pub struct BaseSink {
    id: SinkId,
    source_id: String,
    protocol: TransStreamProtocol,
    state: Mutex<SessionState>,
    trans_stream_id: Mutex<Option<TransStreamId>>,
    sent_packets: AtomicU64,
    desired_audio: Option<CodecId>,
    desired_video: Option<CodecId>,
    video_enabled: bool,
    tcp_streaming: bool,
}

impl BaseSink {
    #[must_use]
    pub fn new(source_id: impl Into<String>, protocol: TransStreamProtocol) -> Self {
        Self {
            id: SinkId::new(),
            source_id: source_id.into(),
            protocol,
            state: Mutex::new(SessionState::Created),
            trans_stream_id: Mutex::new(None),
            sent_packets: AtomicU64::new(0),
            desired_audio: None,
            desired_video: None,
            video_enabled: true,
            tcp_streaming: false,
        }
    }

    #[must_use]
    pub fn with_desired_codecs(
        mut self,
        audio: Option<CodecId>,
        video: Option<CodecId>,
    ) -> Self {
        self.desired_audio = audio;
        self.desired_video = video;
        self
    }

    #[must_use]
    pub fn with_video_enabled(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_tcp_streaming(mut self, tcp: bool) -> Self {
        self.tcp_streaming = tcp;
        self
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn protocol(&self) -> TransStreamProtocol {
        self.protocol
    }

    pub fn trans_stream_id(&self) -> Option<TransStreamId> {
        *self.trans_stream_id.lock()
    }

    pub fn set_trans_stream_id(&self, id: Option<TransStreamId>) {
        *self.trans_stream_id.lock() = id;
    }

    pub fn desired_audio_codec(&self) -> Option<CodecId> {
        self.desired_audio
    }

    pub fn desired_video_codec(&self) -> Option<CodecId> {
        self.desired_video
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn update_state_if_open(&self, state: SessionState) -> bool {
        let mut guard = self.state.lock();
        if *guard == SessionState::Closed {
            return false;
        }
        *guard = state;
        true
    }

    pub fn mark_closed(&self) {
        *self.state.lock() = SessionState::Closed;
    }

    pub fn is_tcp_streaming(&self) -> bool {
        self.tcp_streaming
    }

    pub fn sent_packet_count(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }

    pub fn increase_sent_packet_count(&self) {
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_sent_packet_count(&self) {
        self.sent_packets.store(0, Ordering::Relaxed);
    }
}

/// Sink backed by a bounded byte channel, the shape every TCP-ish consumer
/// (player session, recorder, tests) plugs into. The receiving half belongs
/// to whoever drains the connection.
pub struct ChannelSink {
    base: BaseSink,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ChannelSink {
    /// Default outbound queue depth when the transmuxer does not advertise
    /// an async-write capacity.
    pub const DEFAULT_QUEUE: usize = 512;

    #[must_use]
    pub fn new(
        source_id: impl Into<String>,
        protocol: TransStreamProtocol,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<Bytes>) {
        Self::with_base(BaseSink::new(source_id, protocol).with_tcp_streaming(true))
    }

    #[must_use]
    pub fn with_base(base: BaseSink) -> (std::sync::Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(Self::DEFAULT_QUEUE);
        (
            std::sync::Arc::new(Self {
                base,
                sender: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl Sink for ChannelSink {
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

    fn desired_audio_codec(&self) -> Option<CodecId> {
        self.base.desired_audio_codec()
    }

    fn desired_video_codec(&self) -> Option<CodecId> {
        self.base.desired_video_codec()
    }

    fn enable_video(&self) -> bool {
        self.base.video_enabled()
    }

    fn state(&self) -> SessionState {
        self.base.state()
    }

    fn update_state_if_open(&self, state: SessionState) -> bool {
        self.base.update_state_if_open(state)
    }

    fn write(&self, _index: i32, segments: &[Bytes], _timestamp: i64) -> Result<(), SinkError> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(SinkError::Disconnected);
        };
        for segment in segments {
            match sender.try_send(segment.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => return Err(SinkError::ZeroWindow),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(SinkError::Disconnected)
                }
            }
        }
        Ok(())
    }

    fn is_tcp_streaming(&self) -> bool {
        self.base.is_tcp_streaming()
    }

    fn enable_async_write(&self, capacity: usize) {
        // The outbound channel already decouples the writer from the loop.
        tracing::debug!(sink = %self.id(), capacity, "async write mode requested");
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
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transition_blocked_after_close() {
        let (sink, _rx) = ChannelSink::new("live/a", TransStreamProtocol::Rtmp);
        assert!(sink.update_state_if_open(SessionState::Transferring));
        sink.close();
        assert!(!sink.update_state_if_open(SessionState::Wait));
        assert_eq!(sink.state(), SessionState::Closed);
    }

    #[test]
    fn write_full_reports_zero_window() {
        let (sink, _rx) = ChannelSink::new("live/a", TransStreamProtocol::Rtmp);
        let seg = vec![Bytes::from_static(b"x")];
        for _ in 0..ChannelSink::DEFAULT_QUEUE {
            sink.write(0, &seg, 0).expect("queue has room");
        }
        assert!(matches!(
            sink.write(0, &seg, 0),
            Err(SinkError::ZeroWindow)
        ));
    }

    #[test]
    fn write_after_receiver_drop_is_disconnected() {
        let (sink, rx) = ChannelSink::new("live/a", TransStreamProtocol::Flv);
        drop(rx);
        assert!(matches!(
            sink.write(0, &[Bytes::from_static(b"x")], 0),
            Err(SinkError::Disconnected)
        ));
    }

    #[test]
    fn sink_ids_are_unique() {
        let (a, _ra) = ChannelSink::new("s", TransStreamProtocol::Rtmp);
        let (b, _rb) = ChannelSink::new("s", TransStreamProtocol::Rtmp);
        assert_ne!(a.id(), b.id());
    }
}
