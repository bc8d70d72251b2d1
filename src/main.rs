//! RelayMQ - MQTT v3.1.1 publish/subscribe broker
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   --max-connections <N>  Maximum connections (default: 100000)
//!   --max-packet-size <N>  Maximum packet size (default: 1MB)
//!   --max-qos <N>          Highest QoS granted to subscriptions
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::broker::Broker;
use relaymq::config::Config;
use relaymq::{Metrics, MetricsServer};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// RelayMQ - MQTT v3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version)]
#[command(about = "MQTT v3.1.1 publish/subscribe broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn apply_args(args: &Args, config: &mut Config) {
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(max_connections) = args.max_connections {
        config.limits.max_connections = max_connections;
    }
    if let Some(max_packet_size) = args.max_packet_size {
        config.limits.max_packet_size = max_packet_size;
    }
    if let Some(max_qos) = args.max_qos {
        config.mqtt.max_qos = max_qos;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut file_config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config and go through the same validation
    apply_args(&args, &mut file_config);
    if let Err(e) = file_config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }
    let broker_config = file_config.broker_config();

    info!("Starting RelayMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", broker_config.max_qos);
    info!("  Empty topic levels: {:?}", broker_config.segment_policy);

    let mut broker = Broker::new(broker_config);

    // Setup metrics if configured
    if file_config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        broker = broker.with_metrics(metrics.clone());
        info!("  Metrics: enabled (http://{})", file_config.metrics.bind);

        let metrics_server = MetricsServer::new(metrics, file_config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    tokio::select! {
        result = broker.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            broker.shutdown();
        }
    }

    Ok(())
}
