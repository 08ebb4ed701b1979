use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use droidgate::session::{GatewaySettings, SessionManager};
use droidgate::webrtc::WebRtcBridge;

/// Log level for the gateway
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// droidgate command line arguments
#[derive(Parser, Debug)]
#[command(name = "droidgate")]
#[command(version, about = "A device-streaming gateway for Android automation", long_about = None)]
struct CliArgs {
    /// Data directory for persisted session configs (default: /etc/droidgate)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Path to the adb binary
    #[arg(long, value_name = "FILE", default_value = "adb")]
    adb: PathBuf,

    /// Path to the device-side agent binary
    #[arg(long, value_name = "FILE", default_value = "droidgate-server.jar")]
    server_binary: PathBuf,

    /// Preferred local forward port (ephemeral when omitted)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Per-socket connect timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    connect_timeout: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from("/etc/droidgate"));

    let settings = GatewaySettings {
        adb_path: args.adb,
        server_binary: args.server_binary,
        fixed_port: args.port,
        connect_timeout: Duration::from_secs(args.connect_timeout),
        ..Default::default()
    };

    tracing::info!(
        data_dir = %data_dir.display(),
        adb = %settings.adb_path.display(),
        "starting droidgate"
    );

    let manager = SessionManager::new(&data_dir, settings).await?;
    let bridge = WebRtcBridge::new(manager.clone());

    // Sessions are driven through the manager's API by an embedding
    // control surface; the binary itself only owns lifecycle and shutdown.
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping all sessions");

    bridge.shutdown().await;
    manager.stop_all().await;
    Ok(())
}

fn init_logging(level: LogLevel, verbose: u8) {
    let base = match (level, verbose) {
        (_, v) if v >= 2 => "trace",
        (_, 1) => "debug",
        (LogLevel::Error, _) => "error",
        (LogLevel::Warn, _) => "warn",
        (LogLevel::Info, _) => "info",
        (LogLevel::Debug, _) => "debug",
        (LogLevel::Trace, _) => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("droidgate={}", base)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
