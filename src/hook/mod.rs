//! Outbound HTTP notifications for lifecycle events.
//!
//! Every dispatch runs on a detached task with the configured timeout;
//! failures are logged and never reach the source loop.

use crate::config::HookConfig;
use chrono::Local;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Publish,
    PublishDone,
    Play,
    PlayDone,
    Record,
    IdleTimeout,
    ReceiveTimeout,
}

impl HookEvent {
    const fn name(self) -> &'static str {
        match self {
            Self::Publish => "on_publish",
            Self::PublishDone => "on_publish_done",
            Self::Play => "on_play",
            Self::PlayDone => "on_play_done",
            Self::Record => "on_record",
            Self::IdleTimeout => "on_idle_timeout",
            Self::ReceiveTimeout => "on_receive_timeout",
        }
    }
}

pub struct HookBus {
    client: reqwest::Client,
    config: HookConfig,
}

impl HookBus {
    #[must_use]
    pub fn new(config: HookConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()
            .unwrap_or_default();
        Arc::new(Self { client, config })
    }

    fn url_for(&self, event: HookEvent) -> Option<String> {
        if !self.config.enable {
            return None;
        }
        let url = match event {
            HookEvent::Publish => &self.config.on_publish,
            HookEvent::PublishDone => &self.config.on_publish_done,
            HookEvent::Play => &self.config.on_play,
            HookEvent::PlayDone => &self.config.on_play_done,
            HookEvent::Record => &self.config.on_record,
            HookEvent::IdleTimeout => &self.config.on_idle_timeout,
            HookEvent::ReceiveTimeout => &self.config.on_receive_timeout,
        };
        if url.is_empty() {
            None
        } else {
            Some(url.clone())
        }
    }

    /// Fire-and-forget. The payload gets a `time` field stamped on dispatch.
    pub fn fire(self: &Arc<Self>, event: HookEvent, mut payload: serde_json::Value) {
        let Some(url) = self.url_for(event) else {
            return;
        };
        if let Some(map) = payload.as_object_mut() {
            map.insert(
                "time".to_string(),
                json!(Local::now().to_rfc3339()),
            );
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        url,
                        status = %response.status(),
                        event = event.name(),
                        "hook rejected"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(url, event = event.name(), "hook failed: {err}");
                }
            }
        });
    }

    /// Fired by ingest sessions once a publisher authenticates; the engine
    /// itself fires the lifecycle events below.
    pub fn publish(self: &Arc<Self>, source_id: &str, remote_addr: &str) {
        self.fire(
            HookEvent::Publish,
            json!({ "source": source_id, "remote_addr": remote_addr }),
        );
    }

    pub fn publish_done(self: &Arc<Self>, source_id: &str) {
        self.fire(HookEvent::PublishDone, json!({ "source": source_id }));
    }

    pub fn play(self: &Arc<Self>, source_id: &str, sink_id: &str, protocol: &str) {
        self.fire(
            HookEvent::Play,
            json!({ "source": source_id, "sink": sink_id, "protocol": protocol }),
        );
    }

    pub fn play_done(self: &Arc<Self>, source_id: &str, sink_id: &str, protocol: &str) {
        self.fire(
            HookEvent::PlayDone,
            json!({ "source": source_id, "sink": sink_id, "protocol": protocol }),
        );
    }

    pub fn record(self: &Arc<Self>, source_id: &str, path: &str) {
        self.fire(
            HookEvent::Record,
            json!({ "source": source_id, "path": path }),
        );
    }

    pub fn idle_timeout(self: &Arc<Self>, source_id: &str) {
        self.fire(HookEvent::IdleTimeout, json!({ "source": source_id }));
    }

    pub fn receive_timeout(self: &Arc<Self>, source_id: &str) {
        self.fire(HookEvent::ReceiveTimeout, json!({ "source": source_id }));
    }
}
