//! veiltun server
//!
//! Terminates the tunnel:
//! - Accepts tunnel connections on the ingress address
//! - Runs one responder session per connection
//! - Dials the egress service for every stream and relays bytes

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use veiltun::{
    config::{self, Config, LoggingConfig, Mode},
    crypto::{self, Keyring},
    relay::relay,
    transport::{dial, Backoff, TcpEndpoint},
    tunnel::{Role, Session, SessionConfig, SessionRegistry, Stream},
};

/// veiltun server - masked multiplexed TCP tunnel
#[derive(Parser, Debug)]
#[command(name = "veiltun-server")]
#[command(about = "veiltun server - forwards tunnelled streams to an egress service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Generate a new pre-shared key and exit
    #[arg(long)]
    generate_key: bool,

    /// Write an example server config with a fresh key to PATH and exit
    #[arg(long, value_name = "PATH")]
    init_config: Option<String>,

    /// Tunnel listen address (overrides config)
    #[arg(short, long)]
    ingress: Option<String>,

    /// Egress service address (overrides config)
    #[arg(short, long)]
    egress: Option<String>,

    /// Pre-shared key (overrides config)
    #[arg(short, long)]
    key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Settings shared by every session
struct ServerState {
    egress: String,
    keyring: Keyring,
    session_config: SessionConfig,
    backoff: Backoff,
    connect_timeout: Duration,
    linger: Duration,
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

    let state = Arc::new(ServerState {
        egress: config.egress.clone(),
        keyring: Keyring::new(config.key.as_bytes()),
        session_config: SessionConfig::from(&config.session),
        backoff: Backoff::from(&config.dial),
        connect_timeout: config.dial.connect_timeout(),
        linger: config.linger(),
    });
    let registry = SessionRegistry::new();

    let listener = TcpListener::bind(&config.ingress)
        .await
        .context("Failed to bind to address")?;

    info!("veiltun server v{}", veiltun::VERSION);
    info!("Listening on {}", config.ingress);
    info!("Forwarding to {}", config.egress);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        let state = Arc::clone(&state);
                        let registry = registry.clone();
                        tokio::spawn(serve_session(stream, peer_addr, state, registry));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

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
        if mode != Mode::Server {
            return Err(anyhow!("Configuration is for {:?} mode, not server", mode));
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

/// Write an example server configuration
fn init_config(path: &str) -> Result<()> {
    let config = config::write_example_config(Mode::Server, path)?;

    println!("Wrote {}", path);
    println!("Copy its key to the client config:");
    println!("  key = \"{}\"", config.key);

    Ok(())
}

/// Run one responder session until the connection goes away
async fn serve_session(
    conn: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    registry: SessionRegistry,
) {
    conn.set_nodelay(true).ok();

    let session = match Session::open(
        conn,
        state.keyring.clone(),
        Role::Responder,
        state.session_config.clone(),
    ) {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to start session for {}: {}", peer_addr, e);
            return;
        }
    };
    registry.register(&session);
    info!("Session from {} established ({} live)", peer_addr, registry.len());

    loop {
        let stream = match session.accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Accept stream from {} ended: {}", peer_addr, e);
                break;
            }
        };

        let state = Arc::clone(&state);
        tokio::spawn(forward_stream(stream, state));
    }

    info!("Session from {} closed", peer_addr);
}

/// Dial the egress service and relay one stream to it
async fn forward_stream(stream: Stream, state: Arc<ServerState>) {
    let stream_id = stream.id();

    match dial(&state.egress, state.connect_timeout, &state.backoff).await {
        Ok(upstream) => {
            let stats = relay(stream, TcpEndpoint::from_tcp(upstream), state.linger).await;
            debug!(
                stream_id,
                "Stream finished: {} bytes up, {} bytes down", stats.a_to_b, stats.b_to_a
            );
        }
        Err(e) => {
            warn!("Upstream service unreachable: {}", e);
            if let Err(e) = stream.close().await {
                debug!(stream_id, "Failed to close stream: {}", e);
            }
        }
    }
}
