//! Fabric: messaging endpoint server
//!
//! Serves websocket clients that join rooms and publish into them, and can
//! relay a topic subscription into a room.
//!
//! Usage:
//!   fabric                                          # Default port 7070
//!   fabric --port 8080                              # Custom port
//!   fabric --config fabric.json                     # Load sectioned config
//!   fabric --subscribe tcp://localhost:5556 \
//!          --filter temp. --frame 2 --room sensors  # Relay topics into a room

use std::path::PathBuf;

use clap::Parser;
use fabric_protocol::Events;
use fabric_server::{
    ConfigStore, ConnectionEndpoint, Endpoint, FrameSelect, JsonDecode, Server, ServerConfig,
    TopicEndpoint, WeakServer,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fabric", about = "Fabric: messaging endpoint server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned) [default: 7070]
    #[arg(long)]
    port: Option<u16>,

    /// Hostname to bind to [default: 127.0.0.1]
    #[arg(long)]
    hostname: Option<String>,

    /// JSON config file with one object per section
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Topic address to subscribe to (tcp://, ipc:// or inproc://)
    #[arg(long)]
    subscribe: Option<String>,

    /// Topic filter for --subscribe (repeatable; empty string for everything)
    #[arg(long)]
    filter: Vec<String>,

    /// Bind the subscriber instead of connecting it
    #[arg(long)]
    bind: bool,

    /// Forward only this frame of each topic message
    #[arg(long)]
    frame: Option<usize>,

    /// Decode forwarded payloads as JSON
    #[arg(long)]
    json: bool,

    /// Room that receives relayed topic messages
    #[arg(long, default_value = "lobby")]
    room: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    if let Some(ref log_path) = cli.log_file {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
        {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {}: {e}", log_path.display());
                std::process::exit(1);
            }
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Configuration: file first, flags on top
    let store = match &cli.config {
        Some(path) => match ConfigStore::load(path) {
            Ok(store) => store,
            Err(e) => {
                error!("Failed to load config: {e}");
                return;
            }
        },
        None => ConfigStore::new(),
    };

    let mut settings = match ServerConfig::from_store(&store) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    let mut transport = settings.transport.take().unwrap_or_default();
    if let Some(port) = cli.port {
        transport.port = port;
    }
    if let Some(hostname) = cli.hostname.clone() {
        transport.hostname = hostname;
    }
    if let Some(max) = cli.max_connections {
        transport.max_connections = Some(max);
    }
    transport.verbose_logging |= cli.verbose;
    settings.transport = Some(transport);

    match serde_json::to_value(&settings) {
        Ok(section) => store.set_section(fabric_server::config::SERVER_SECTION, section),
        Err(e) => warn!("Failed to record effective settings: {e}"),
    }

    let server = match Server::from_store(store) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let weak = server.downgrade();
    server.onclient(move |client| wire_client(client, weak.clone()));

    if let Some(address) = cli.subscribe.clone() {
        let topic = build_subscriber(&cli, address);
        let weak = server.downgrade();
        let room = cli.room.clone();
        topic.onmessage(move |message: Value| {
            let Some(server) = weak.upgrade().filter(|server| server.has_room(&room)) else {
                return;
            };
            let delivered = server.room(&room).broadcast(Events::MESSAGE, vec![message]);
            debug!("Relayed topic message to {delivered} clients in {room}");
        });
        server.add_endpoint(topic);
    }

    if let Err(e) = server.start_main_server().await {
        error!("Failed to start server: {e}");
        return;
    }

    if let Some(addr) = server.local_addr() {
        info!("Fabric listening on ws://{addr}/ws");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down...");
    server.stop().await;
}

fn build_subscriber(cli: &Cli, address: String) -> TopicEndpoint {
    let mut builder = TopicEndpoint::subscriber(address);
    if cli.bind {
        builder = builder.bind();
    }
    if cli.filter.is_empty() {
        builder = builder.filter("");
    }
    for filter in &cli.filter {
        builder = builder.filter(filter.clone());
    }
    if let Some(index) = cli.frame {
        builder = builder.plugin(FrameSelect { index });
    }
    if cli.json {
        builder = builder.plugin(JsonDecode);
    }
    builder.build()
}

/// Client protocol: `join`/`leave` a room by name, `publish` a payload into
/// a room.
fn wire_client(client: &ConnectionEndpoint, server: WeakServer) {
    let id = client.connection_id().unwrap_or_default();
    info!("Client ready: {id} ({})", client.id());

    let join_server = server.clone();
    client.on(Events::JOIN, move |endpoint, args| {
        let (Some(server), Some(room)) = (join_server.upgrade(), room_arg(args)) else {
            return;
        };
        if let Err(e) = server.room(room).include(endpoint) {
            warn!("Join failed: {e}");
        }
    });

    let leave_server = server.clone();
    client.on(Events::LEAVE, move |endpoint, args| {
        let (Some(server), Some(room)) = (leave_server.upgrade(), room_arg(args)) else {
            return;
        };
        if server.has_room(room) {
            server.room(room).exclude(endpoint);
            server.reclaim_room(room);
        }
    });

    let publish_server = server.clone();
    client.on(Events::PUBLISH, move |_endpoint, args| {
        let (Some(server), Some(room)) = (publish_server.upgrade(), room_arg(args)) else {
            return;
        };
        // Publishing never creates a room.
        if !server.has_room(room) {
            debug!("Publish to unknown room {room} dropped");
            return;
        }
        let payload = args.get(1).cloned().unwrap_or(Value::Null);
        server.room(room).broadcast(Events::MESSAGE, vec![payload]);
    });

    // Runs before the server forgets the client, so its rooms are still known.
    client.ondisconnect(move |_endpoint| {
        let Some(server) = server.upgrade() else {
            return;
        };
        for room in server.rooms_of(&id) {
            server.reclaim_room(room.name());
        }
    });
}

fn room_arg(args: &[Value]) -> Option<&str> {
    args.first().and_then(Value::as_str).filter(|room| !room.is_empty())
}
