//! Netplay room server
//!
//! Usage:
//!   netplay-rooms serve                          # Listen on [::]:37520
//!   netplay-rooms serve --port 5000              # Listen on a specific port
//!   netplay-rooms demo --server 127.0.0.1:37520  # Register and look up a room
//!   netplay-rooms serve --log-dir logs           # Also log to logs/np-room-manager.*.log

use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use netplay_rooms::server::DEFAULT_PORT;
use netplay_rooms::{RoomClient, RoomServer, ServerConfig, accept_room_push};
use netplay_rooms::logging;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "netplay-rooms", version, about = "Rendezvous server for netplay rooms")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write logs to daily rotated files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the room server
    Serve {
        /// Address to bind to
        #[arg(long, default_value = "::")]
        bind: IpAddr,

        /// Port to listen on
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Maximum concurrent client connections
        #[arg(long, default_value_t = 10000)]
        max_connections: usize,

        /// Upper bound on one poll wait, in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,

        /// Delay between registration push rounds, in milliseconds
        #[arg(long, default_value_t = 100)]
        push_interval_ms: u64,
    },

    /// Register a local game port with a running server and look the room up
    Demo {
        /// Room server address
        #[arg(long, default_value = "127.0.0.1:37520")]
        server: SocketAddr,

        /// Local game port to register, 0 picks a free one
        #[arg(long, default_value_t = 0)]
        game_port: u16,

        /// Timeout for each step, in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Held until exit so buffered file output is flushed
    let _log_guard = logging::init(&cli.log_level, cli.log_dir.as_deref())?;

    match cli.command {
        Command::Serve {
            bind,
            port,
            max_connections,
            poll_interval_ms,
            push_interval_ms,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                port,
                max_connections,
                poll_interval: Duration::from_millis(poll_interval_ms),
                push_interval: Duration::from_millis(push_interval_ms),
                ..Default::default()
            };
            run_server(config)
        }
        Command::Demo {
            server,
            game_port,
            timeout_ms,
        } => run_demo(server, game_port, Duration::from_millis(timeout_ms)),
    }
}

fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!("Starting room server...");
    info!("Configuration:");
    info!("  - Listen address: {}", config.listen_addr());
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Poll interval: {:?}", config.poll_interval);
    info!("  - Push interval: {:?}", config.push_interval);

    let server = RoomServer::bind(config).context("failed to start room server")?;

    // Runs until a listener-level failure
    server.run().context("room server stopped")?;
    Ok(())
}

fn run_demo(server: SocketAddr, game_port: u16, timeout: Duration) -> anyhow::Result<()> {
    let bind_ip: IpAddr = if server.is_ipv4() {
        "0.0.0.0".parse()?
    } else {
        "::".parse()?
    };
    let game_listener = TcpListener::bind(SocketAddr::new(bind_ip, game_port))
        .context("failed to bind game listener")?;
    let game_port = game_listener.local_addr()?.port();
    info!("Fake game server listening on port {}", game_port);

    let mut host = RoomClient::connect(server, timeout).context("host connect failed")?;
    if !host.init_session()? {
        bail!("server rejected protocol version");
    }
    host.register_server(game_port)?;

    let room_id = accept_room_push(&game_listener, timeout).context("no room id pushed")?;
    println!("Registered room {}", room_id);

    let mut joiner = RoomClient::connect(server, timeout).context("joiner connect failed")?;
    if !joiner.init_session()? {
        bail!("server rejected protocol version");
    }
    let response = joiner.request_registration(room_id)?;
    match response.host() {
        Some((address, port)) => println!("Room {} is hosted at {} port {}", room_id, address, port),
        None => bail!("room {} not found after registration", room_id),
    }

    host.game_started()?;
    info!("Reported game start, room {} released", room_id);
    Ok(())
}
