//! Application configuration: JSON file, environment overlay, CLI overrides.
//!
//! GOP caching and merge-writing travel together: disabling the cache is a
//! latency decision, and a deployment that made it gains nothing from
//! coalesced sends.

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Merge-writing threshold applied when the config omits `mw_latency`.
pub const DEFAULT_MERGE_WRITE_LATENCY_MS: u64 = 350;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load: {0}")]
    Load(#[from] config::ConfigError),

    #[error("unknown protocol option: {0}")]
    UnknownOption(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cache one GOP per source and replay it to late subscribers.
    pub gop_cache: bool,
    /// Sizes each video track's packet pool when the GOP cache is on.
    pub gop_buffer_size: usize,
    /// Track-probe window in milliseconds before `write_header` is forced.
    pub probe_timeout: u64,
    /// Seconds without any subscriber before the idle watchdog fires. Zero
    /// disables it.
    pub idle_timeout: u64,
    /// Seconds without inbound data before the source is torn down. Zero
    /// disables it.
    pub receive_timeout: u64,
    /// Merge-writing threshold in milliseconds.
    pub mw_latency: u64,
    /// Advertised address for WebRTC candidates.
    pub public_ip: String,
    /// Inbound byte-queue depth per source; the stream pipe holds two fewer
    /// entries so an in-flight block is never overwritten.
    pub receive_queue_size: usize,

    pub rtmp: ProtocolConfig,
    pub rtsp: RtspConfig,
    pub hls: HlsConfig,
    pub webrtc: ProtocolConfig,
    pub gb28181: Gb28181Config,
    pub jt1078: ProtocolConfig,
    pub hooks: HookConfig,
    pub record: RecordConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gop_cache: true,
            gop_buffer_size: 4 * 1024 * 1024,
            probe_timeout: 2000,
            idle_timeout: 0,
            receive_timeout: 10,
            mw_latency: DEFAULT_MERGE_WRITE_LATENCY_MS,
            public_ip: String::new(),
            receive_queue_size: 512,
            rtmp: ProtocolConfig::enabled(1935),
            rtsp: RtspConfig::default(),
            hls: HlsConfig::default(),
            webrtc: ProtocolConfig::disabled(8000),
            gb28181: Gb28181Config::default(),
            jt1078: ProtocolConfig::disabled(1078),
            hooks: HookConfig::default(),
            record: RecordConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file with a `RILL_`-prefixed environment overlay.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let settings = ConfigBuilder::builder()
            .add_source(File::with_name(path).format(FileFormat::Json))
            .add_source(Environment::with_prefix("RILL").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Apply `--enable-<proto>[=port]` / `--disable-<proto>` pairs. Enable
    /// wins when both name the same protocol.
    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        for option in &overrides.disable {
            if overrides.enable.iter().any(|(name, _)| name == option) {
                continue;
            }
            self.set_enabled(option, false, None)?;
        }
        for (option, port) in &overrides.enable {
            self.set_enabled(option, true, *port)?;
        }
        Ok(())
    }

    fn set_enabled(
        &mut self,
        option: &str,
        enable: bool,
        port: Option<u16>,
    ) -> Result<(), ConfigError> {
        match option {
            "rtmp" => {
                self.rtmp.enable = enable;
                if let Some(p) = port {
                    self.rtmp.port = p;
                }
            }
            "rtsp" => {
                self.rtsp.enable = enable;
                if let Some(p) = port {
                    self.rtsp.port = p;
                }
            }
            "hls" => self.hls.enable = enable,
            "webrtc" => {
                self.webrtc.enable = enable;
                if let Some(p) = port {
                    self.webrtc.port = p;
                }
            }
            "gb28181" => {
                self.gb28181.enable = enable;
                if let Some(p) = port {
                    self.gb28181.port[0] = p;
                }
            }
            "jt1078" => {
                self.jt1078.enable = enable;
                if let Some(p) = port {
                    self.jt1078.port = p;
                }
            }
            "hooks" => self.hooks.enable = enable,
            "record" => self.record.enable = enable,
            other => return Err(ConfigError::UnknownOption(other.to_string())),
        }
        Ok(())
    }
}

/// Parsed CLI protocol switches; a `None` port keeps the configured one.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub enable: Vec<(String, Option<u16>)>,
    pub disable: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub enable: bool,
    pub port: u16,
}

impl ProtocolConfig {
    #[must_use]
    pub const fn enabled(port: u16) -> Self {
        Self { enable: true, port }
    }

    #[must_use]
    pub const fn disabled(port: u16) -> Self {
        Self {
            enable: false,
            port,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::disabled(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    pub enable: bool,
    pub port: u16,
    /// "UDP", "TCP" or "UDP|TCP".
    pub transport: String,
    pub password: String,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            enable: false,
            port: 554,
            transport: "UDP|TCP".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub enable: bool,
    pub dir: String,
    /// Target segment duration in seconds.
    pub duration: u32,
    /// Segments retained in the playlist FIFO.
    pub playlist_length: usize,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dir: "./hls".to_string(),
            duration: 2,
            playlist_length: 5,
        }
    }
}

impl HlsConfig {
    #[must_use]
    pub fn m3u8_name(&self, source_id: &str) -> String {
        format!("{}.m3u8", sanitize_source_id(source_id))
    }

    #[must_use]
    pub fn m3u8_path(&self, source_id: &str) -> PathBuf {
        PathBuf::from(&self.dir).join(self.m3u8_name(source_id))
    }

    #[must_use]
    pub fn ts_name(&self, source_id: &str, sequence: u64) -> String {
        format!("{}_{}.ts", sanitize_source_id(source_id), sequence)
    }

    #[must_use]
    pub fn ts_path(&self, source_id: &str, sequence: u64) -> PathBuf {
        PathBuf::from(&self.dir).join(self.ts_name(source_id, sequence))
    }
}

/// Source ids carry `app/stream` paths; flatten them for the filesystem.
#[must_use]
pub fn sanitize_source_id(source_id: &str) -> String {
    source_id.replace(['/', ':'], "_")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Gb28181Config {
    pub enable: bool,
    /// "UDP", "TCP" or "UDP|TCP".
    pub transport: String,
    /// Single-port mode uses `port[0]`; multi-port mode allocates from the
    /// `[port[0], port[1]]` range, one session per port.
    pub port: [u16; 2],
}

impl Default for Gb28181Config {
    fn default() -> Self {
        Self {
            enable: false,
            transport: "UDP|TCP".to_string(),
            port: [10_000, 0],
        }
    }
}

impl Gb28181Config {
    #[must_use]
    pub fn enable_tcp(&self) -> bool {
        self.transport.contains("TCP")
    }

    #[must_use]
    pub fn enable_udp(&self) -> bool {
        self.transport.contains("UDP")
    }

    #[must_use]
    pub fn is_multi_port(&self) -> bool {
        self.port[1] > self.port[0]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub enable: bool,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    pub on_publish: String,
    pub on_publish_done: String,
    pub on_play: String,
    pub on_play_done: String,
    pub on_record: String,
    pub on_idle_timeout: String,
    pub on_receive_timeout: String,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            enable: false,
            timeout: 5,
            on_publish: String::new(),
            on_publish_done: String::new(),
            on_play: String::new(),
            on_play_done: String::new(),
            on_record: String::new(),
            on_idle_timeout: String::new(),
            on_receive_timeout: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    pub enable: bool,
    /// Only "flv" is produced.
    pub format: String,
    pub dir: String,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enable: false,
            format: "flv".to_string(),
            dir: "./recordings".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert!(config.gop_cache);
        assert_eq!(config.mw_latency, 350);
        assert!(config.receive_queue_size > 2);
        assert_eq!(config.hls.playlist_length, 5);
    }

    #[test]
    fn enable_wins_over_disable() {
        let mut config = AppConfig::default();
        let overrides = CliOverrides {
            enable: vec![("rtmp".to_string(), Some(11_935))],
            disable: vec!["rtmp".to_string(), "record".to_string()],
        };
        config.apply_overrides(&overrides).unwrap();
        assert!(config.rtmp.enable);
        assert_eq!(config.rtmp.port, 11_935);
        assert!(!config.record.enable);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let mut config = AppConfig::default();
        let overrides = CliOverrides {
            enable: vec![("quic".to_string(), None)],
            disable: vec![],
        };
        assert!(matches!(
            config.apply_overrides(&overrides),
            Err(ConfigError::UnknownOption(_))
        ));
    }

    #[test]
    fn gb28181_transport_flags() {
        let config = Gb28181Config {
            enable: true,
            transport: "TCP".to_string(),
            port: [30_000, 30_010],
        };
        assert!(config.enable_tcp());
        assert!(!config.enable_udp());
        assert!(config.is_multi_port());
    }

    #[test]
    fn hls_paths_flatten_source_ids() {
        let hls = HlsConfig::default();
        assert_eq!(hls.m3u8_name("live/cam1"), "live_cam1.m3u8");
        assert_eq!(hls.ts_name("live/cam1", 7), "live_cam1_7.ts");
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"gop_cache": false, "rtmp": {"enable": true, "port": 2935}}"#,
        )
        .unwrap();
        let config = AppConfig::load(path.to_str().unwrap()).unwrap();
        assert!(!config.gop_cache);
        assert_eq!(config.rtmp.port, 2935);
        // Untouched sections keep their defaults.
        assert_eq!(config.mw_latency, 350);
    }
}
