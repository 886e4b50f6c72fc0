#[derive(Debug, thiserror::Error)]
pub enum MpegTsError {
    #[error("unknown pid {0:#06x}")]
    UnknownPid(u16),

    #[error("too many streams")]
    TooManyStreams,

    #[error("codec {0} not carried in ts")]
    UnsupportedCodec(crate::media::CodecId),

    #[error("audio specific config too short")]
    BadAudioConfig,
}
