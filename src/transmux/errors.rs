use crate::media::CodecId;
use crate::transmux::TransStreamProtocol;

#[derive(Debug, thiserror::Error)]
pub enum TransMuxError {
    #[error("transmuxer already completed")]
    AlreadyCompleted,

    #[error("transmuxer not completed")]
    NotCompleted,

    #[error("no track available")]
    NoTracks,

    #[error("track {0} not available")]
    TrackNotAvailable(usize),

    #[error("{protocol} cannot mux {codec}")]
    MuxUnsupported {
        protocol: TransStreamProtocol,
        codec: CodecId,
    },

    #[error("factory for {0} already registered")]
    FactoryExists(TransStreamProtocol),

    #[error("no factory for {0}")]
    UnknownProtocol(TransStreamProtocol),

    #[error("segment io: {0}")]
    Io(#[from] std::io::Error),

    #[error("ts mux: {0}")]
    Ts(#[from] crate::mpegts::MpegTsError),
}
