//! Process-wide registries: active sources, sinks waiting for sources that
//! do not exist yet, and the HLS playlist-sink manager.
//!
//! Each map sits behind its own mutex and is only touched before or after
//! per-source work, never from inside a source loop holding other state.

use crate::sink::{Sink, SinkId};
use crate::source::SourceHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("source {0} already exists")]
    SourceExists(String),

    #[error("source {0} not found")]
    SourceNotFound(String),
}

#[derive(Default)]
pub struct StreamRegistry {
    sources: Mutex<HashMap<String, SourceHandle>>,
    waiting: Mutex<HashMap<String, Vec<Arc<dyn Sink>>>>,
    hls_sinks: Mutex<HashMap<SinkId, Arc<dyn Sink>>>,
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher. Exactly one publisher may own a source id.
    pub fn register_source(&self, handle: SourceHandle) -> Result<(), RegistryError> {
        let mut sources = self.sources.lock();
        if sources.contains_key(handle.id()) {
            return Err(RegistryError::SourceExists(handle.id().to_string()));
        }
        sources.insert(handle.id().to_string(), handle);
        Ok(())
    }

    pub fn unregister_source(&self, id: &str) -> Result<SourceHandle, RegistryError> {
        self.sources
            .lock()
            .remove(id)
            .ok_or_else(|| RegistryError::SourceNotFound(id.to_string()))
    }

    #[must_use]
    pub fn find_source(&self, id: &str) -> Option<SourceHandle> {
        self.sources.lock().get(id).cloned()
    }

    #[must_use]
    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    /// Park a sink whose source has not completed (or does not exist yet).
    pub fn add_sink_to_waiting_queue(&self, source_id: &str, sink: Arc<dyn Sink>) {
        self.waiting
            .lock()
            .entry(source_id.to_string())
            .or_default()
            .push(sink);
    }

    /// Atomically take every sink waiting on `source_id`.
    #[must_use]
    pub fn pop_waiting_sinks(&self, source_id: &str) -> Vec<Arc<dyn Sink>> {
        self.waiting.lock().remove(source_id).unwrap_or_default()
    }

    #[must_use]
    pub fn waiting_count(&self, source_id: &str) -> usize {
        self.waiting
            .lock()
            .get(source_id)
            .map_or(0, Vec::len)
    }

    pub fn register_hls_sink(&self, sink: Arc<dyn Sink>) {
        self.hls_sinks.lock().insert(sink.id(), sink);
    }

    pub fn remove_hls_sink(&self, id: SinkId) -> Option<Arc<dyn Sink>> {
        self.hls_sinks.lock().remove(&id)
    }

    #[must_use]
    pub fn find_hls_sink(&self, id: SinkId) -> Option<Arc<dyn Sink>> {
        self.hls_sinks.lock().get(&id).cloned()
    }
}
