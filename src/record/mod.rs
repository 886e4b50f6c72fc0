//! Record-to-file: a sink consuming the FLV transmuxer and appending its
//! segments to disk. The write side runs on its own task so file IO never
//! touches the source loop.

use crate::config::{sanitize_source_id, RecordConfig};
use crate::sink::{BaseSink, ChannelSink, Sink};
use crate::transmux::TransStreamProtocol;
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Build the file-backed record sink for one publication. The returned path
/// goes out with the `on_record` hook when the source closes.
pub fn create_record_sink(
    source_id: &str,
    config: &RecordConfig,
) -> std::io::Result<(Arc<dyn Sink>, PathBuf)> {
    if !config.format.eq_ignore_ascii_case("flv") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported record format: {}", config.format),
        ));
    }

    std::fs::create_dir_all(&config.dir)?;
    let file_name = format!(
        "{}_{}.flv",
        sanitize_source_id(source_id),
        Local::now().format("%Y%m%d%H%M%S")
    );
    let path = PathBuf::from(&config.dir).join(file_name);
    let file = std::fs::File::create(&path)?;

    let base = BaseSink::new(source_id, TransStreamProtocol::Flv);
    let (sink, mut rx) = ChannelSink::with_base(base);

    let mut file = tokio::fs::File::from_std(file);
    let task_path = path.clone();
    tokio::spawn(async move {
        while let Some(segment) = rx.recv().await {
            if let Err(err) = file.write_all(&segment).await {
                tracing::error!(path = %task_path.display(), "record write: {err}");
                break;
            }
        }
        if let Err(err) = file.flush().await {
            tracing::warn!(path = %task_path.display(), "record flush: {err}");
        }
        tracing::info!(path = %task_path.display(), "recording finished");
    });

    Ok((sink, path))
}
