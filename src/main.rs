use anyhow::Context;
use clap::Parser;
use rill::config::{AppConfig, CliOverrides};
use rill::gb28181::{SsrcFilter, TcpServer, UdpServer};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rill")]
#[command(about = "Multi-protocol live-media relay", long_about = None)]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, env = "RILL_CONFIG", default_value = "./config.json")]
    config: String,

    /// Enable a protocol, optionally overriding its port (0 keeps it).
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "0")]
    enable_rtmp: Option<u16>,
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "0")]
    enable_rtsp: Option<u16>,
    #[arg(long, num_args = 0..=1, default_missing_value = "0", value_name = "PORT")]
    enable_hls: Option<u16>,
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "0")]
    enable_webrtc: Option<u16>,
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "0")]
    enable_gb28181: Option<u16>,
    #[arg(long, value_name = "PORT", num_args = 0..=1, default_missing_value = "0")]
    enable_jt1078: Option<u16>,
    #[arg(long, num_args = 0..=1, default_missing_value = "0", value_name = "PORT")]
    enable_hooks: Option<u16>,
    #[arg(long, num_args = 0..=1, default_missing_value = "0", value_name = "PORT")]
    enable_record: Option<u16>,

    /// Disable a protocol (an enable for the same protocol wins).
    #[arg(long)]
    disable_rtmp: bool,
    #[arg(long)]
    disable_rtsp: bool,
    #[arg(long)]
    disable_hls: bool,
    #[arg(long)]
    disable_webrtc: bool,
    #[arg(long)]
    disable_gb28181: bool,
    #[arg(long)]
    disable_jt1078: bool,
    #[arg(long)]
    disable_hooks: bool,
    #[arg(long)]
    disable_record: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        let mut overrides = CliOverrides::default();
        let enables: [(&str, Option<u16>); 8] = [
            ("rtmp", self.enable_rtmp),
            ("rtsp", self.enable_rtsp),
            ("hls", self.enable_hls),
            ("webrtc", self.enable_webrtc),
            ("gb28181", self.enable_gb28181),
            ("jt1078", self.enable_jt1078),
            ("hooks", self.enable_hooks),
            ("record", self.enable_record),
        ];
        for (name, value) in enables {
            if let Some(port) = value {
                let port = (port > 0).then_some(port);
                overrides.enable.push((name.to_string(), port));
            }
        }
        let disables = [
            ("rtmp", self.disable_rtmp),
            ("rtsp", self.disable_rtsp),
            ("hls", self.disable_hls),
            ("webrtc", self.disable_webrtc),
            ("gb28181", self.disable_gb28181),
            ("jt1078", self.disable_jt1078),
            ("hooks", self.disable_hooks),
            ("record", self.disable_record),
        ];
        for (name, disabled) in disables {
            if disabled {
                overrides.disable.push(name.to_string());
            }
        }
        overrides
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;
    config
        .apply_overrides(&args.overrides())
        .context("applying protocol overrides")?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone())),
        )
        .compact()
        .init();

    info!(
        "server config:\n{}",
        serde_json::to_string_pretty(&config).unwrap_or_default()
    );

    // Single-port GB28181 receive comes up with the process; multi-port
    // listeners are created per expected source by the control plane.
    let mut shutdown_tokens = Vec::new();
    if config.gb28181.enable && !config.gb28181.is_multi_port() {
        let filter = SsrcFilter::new(128);
        let addr = format!("0.0.0.0:{}", config.gb28181.port[0]);

        if config.gb28181.enable_udp() {
            let server = UdpServer::bind(addr.parse()?, filter.clone())
                .await
                .context("binding gb28181 udp port")?;
            info!(addr = %server.local_addr(), "gb28181 udp receive ready");
            shutdown_tokens.push(server.cancel_token());
            server.spawn();
        }
        if config.gb28181.enable_tcp() {
            let server = TcpServer::bind(addr.parse()?, filter.clone(), false)
                .await
                .context("binding gb28181 tcp port")?;
            info!(addr = %server.local_addr(), "gb28181 tcp receive ready");
            shutdown_tokens.push(server.cancel_token());
            server.spawn();
        }
    }

    for (name, enabled, port) in [
        ("rtmp", config.rtmp.enable, config.rtmp.port),
        ("rtsp", config.rtsp.enable, config.rtsp.port),
        ("webrtc", config.webrtc.enable, config.webrtc.port),
        ("jt1078", config.jt1078.enable, config.jt1078.port),
    ] {
        if enabled {
            info!(protocol = name, port, "ingest/egress protocol enabled");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    for token in shutdown_tokens {
        token.cancel();
    }
    Ok(())
}
