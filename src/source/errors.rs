use crate::source::demux::DemuxError;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The stream pipe is full; the parser should drop the connection.
    #[error("stream pipe full")]
    Backpressure,

    #[error("source closed")]
    Closed,

    #[error("parse: {0}")]
    Parse(#[from] DemuxError),
}
