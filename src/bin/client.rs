//! veiltun client
//!
//! Originates the tunnel:
//! - Accepts plaintext connections on the ingress address
//! - Keeps one initiator session to the tunnel server, re-dialing when it drops
//! - Opens a stream per local connection and relays bytes

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use veiltun::{
    config::{self, Config, LoggingConfig, Mode},
    crypto::{self, Keyring},
    transport::Backoff,
    tunnel::{serve_ingress, Connector, SessionConfig, SessionRegistry},
};

/// veiltun client - masked multiplexed TCP tunnel
#[derive(Parser, Debug)]
#[command(name = "veiltun-client")]
#[command(about = "veiltun client - carries local connections to a veiltun server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Generate a new pre-shared key and exit
    #[arg(long)]
    generate_key: bool,

    /// Write an example client config with a fresh key to PATH and exit
    #[arg(long, value_name = "PATH")]
    init_config: Option<String>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    ingress: Option<String>,

    /// Tunnel server address (overrides config)
    #[arg(short, long)]
    egress: Option<String>,

    /// Pre-shared key (overrides config)
    #[arg(short, long)]
    key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        return generate_key();
    }
    if let Some(path) = &args.init_config {
        return init_config(path);
    }

    let config = load_config(&args)?;
    init_logging(&config.logging);

    let registry = SessionRegistry::new();
    let connector = Arc::new(Connector::new(
        config.egress.clone(),
        Keyring::new(config.key.as_bytes()),
        SessionConfig::from(&config.session),
        Backoff::from(&config.dial),
        config.dial.connect_timeout(),
        registry.clone(),
    ));

    let listener = TcpListener::bind(&config.ingress)
        .await
        .context("Failed to bind to address")?;

    info!("veiltun client v{}", veiltun::VERSION);
    info!("Listening on {}", config.ingress);
    info!("Tunnel server: {}", connector.server_addr());

    // Connect eagerly, without holding up the listener
    let eager = Arc::clone(&connector);
    tokio::spawn(async move {
        if let Err(e) = eager.session().await {
            warn!("Initial connection failed, will retry on demand: {}", e);
        }
    });

    serve_ingress(listener, connector, config.linger(), async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    info!("Shutting down...");
    registry.close_all();
    Ok(())
}

/// Merge the config file (if any) with command line overrides
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    if let Some(mode) = config.mode {
        if mode != Mode::Client {
            return Err(anyhow!("Configuration is for {:?} mode, not client", mode));
        }
    }
    if let Some(ingress) = &args.ingress {
        config.ingress = ingress.clone();
    }
    if let Some(egress) = &args.egress {
        config.egress = egress.clone();
    }
    if let Some(key) = &args.key {
        config.key = key.clone();
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(logging.level.as_str());
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

/// Generate and print a new pre-shared key
fn generate_key() -> Result<()> {
    let key = crypto::generate_key()?;

    println!("Add to both server and client config.toml:");
    println!("  key = \"{}\"", key);

    Ok(())
}

/// Write an example client configuration
fn init_config(path: &str) -> Result<()> {
    let config = config::write_example_config(Mode::Client, path)?;

    println!("Wrote {}", path);
    println!("Copy its key to the server config:");
    println!("  key = \"{}\"", config.key);

    Ok(())
}
