use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use fleetd::config::{NodeConfig, PeerConfig, RunnerConfig, StunConfig};
use fleetd::net::{DirectClient, PeerClient};
use fleetd::node::Node;
use fleetd::scheduler::{ProcessInfo, SpawnKind};
use fleetd::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version)]
#[command(about = "A fleet coordination daemon with NAT-traversing peer relays")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a fleetd daemon node
    Server(ServerArgs),

    /// Signal operations against a running daemon
    Signal {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: SignalCommands,
    },

    /// Scheduled-process operations against a running daemon
    Process {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ProcessCommands,
    },

    /// Peer and relay operations against a running daemon
    Net {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NetCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node name (defaults to the machine identity)
    #[arg(long, default_value = "")]
    name: String,

    /// Address to listen on for gRPC
    #[arg(long, default_value = "127.0.0.1:11451")]
    listen: SocketAddr,

    /// Whether this node is directly reachable by its peers
    #[arg(long)]
    public: bool,

    /// Public peers (comma-separated, format: "name:host:port")
    /// Example: "relay:198.51.100.7:11451"
    #[arg(long, default_value = "")]
    peers: String,

    /// Private peers reachable only through a relay (same format)
    #[arg(long, default_value = "")]
    private_peers: String,

    /// Run a rendezvous exchange server on this UDP address
    #[arg(long)]
    rendezvous_listen: Option<SocketAddr>,

    /// Probe this rendezvous server at startup
    #[arg(long)]
    rendezvous_server: Option<SocketAddr>,

    /// Shared token tagging rendezvous traffic
    #[arg(long, default_value = "fleetd")]
    token: String,

    /// Shell used to run scheduled commands
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Working directory for scheduled commands
    #[arg(long)]
    workdir: Option<String>,
}

// =============================================================================
// Client Arguments (shared by signal, process and net commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Daemon address
    #[arg(long, short = 'a', default_value = "127.0.0.1:11451")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum SignalCommands {
    /// Check a signal, registering it when unseen
    Wait { sig: String },
    /// Raise a signal
    Notify { sig: String },
    /// Show a signal's value and whether it exists
    Info { sig: String },
    /// List all known signals
    List,
    /// Remove the named signals
    Clear { sigs: Vec<String> },
}

#[derive(clap::Subcommand, Debug)]
enum ProcessCommands {
    /// List scheduled processes
    List,
    /// Stop a process by pid
    Kill { pid: i64 },
    /// Find processes by pid or command substring
    Find {
        #[arg(long, default_value_t = 0)]
        pid: i64,

        #[arg(long, default_value = "")]
        cmd: String,
    },
    /// Schedule a new process
    Spawn {
        /// Trigger kind
        kind: SpawnKindArg,

        /// Cron expression or comma-separated watch paths; ignored for script
        #[arg(long, default_value = "")]
        spec: String,

        /// The command to execute (e.g. "make build")
        cmd: String,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum SpawnKindArg {
    Cron,
    Fs,
    Script,
}

#[derive(clap::Subcommand, Debug)]
enum NetCommands {
    /// Liveness probe
    Ping,
    /// Show daemon metadata
    Info,
    /// Register a peer on the daemon
    Mark { name: String, addr: String },
    /// Invoke a method on a node registered with the daemon
    Call {
        node: String,
        method: String,
        args: Vec<String>,
    },
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_peers(peers_str: &str, public: bool) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                Some(PeerConfig {
                    name: parts[0].to_string(),
                    addr: format!("{}:{}", parts[1], parts[2]),
                    public,
                })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected name:host:port");
                None
            }
        })
        .collect()
}

fn print_processes(infos: &[ProcessInfo], output: &OutputFormat) {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(infos).unwrap_or_default());
        }
        OutputFormat::Table => {
            println!("{:<22} {:<10} {:<24} CMD", "PID", "STATE", "SPEC");
            for info in infos {
                println!(
                    "{:<22} {:<10} {:<24} {}",
                    info.pid, info.state, info.spec, info.cmd
                );
            }
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut peers = parse_peers(&args.peers, true);
    peers.extend(parse_peers(&args.private_peers, false));

    let config = NodeConfig {
        name: args.name,
        listen_addr: args.listen,
        public: args.public,
        peers,
        stun: StunConfig {
            token: args.token,
            listen_addr: args.rendezvous_listen,
            server_addr: args.rendezvous_server,
            ..StunConfig::default()
        },
        runner: RunnerConfig {
            shell: args.shell,
            workdir: args.workdir,
        },
    };

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, shutdown)?;
    node.run().await?;
    Ok(())
}

// =============================================================================
// Client Implementations
// =============================================================================

async fn run_signal(
    client: ClientArgs,
    command: SignalCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let daemon = DirectClient::connect("daemon", &client.addr)?;
    match command {
        SignalCommands::Wait { sig } => {
            println!("{}", daemon.signal_wait(&sig).await?);
        }
        SignalCommands::Notify { sig } => {
            daemon.signal_notify(&sig).await?;
        }
        SignalCommands::Info { sig } => {
            let (status, exist) = daemon.signal_info(&sig).await?;
            match client.output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string(&[status, exist])?);
                }
                OutputFormat::Table => {
                    println!("status={status} exist={exist}");
                }
            }
        }
        SignalCommands::List => {
            for sig in daemon.signal_list().await? {
                println!("{sig}");
            }
        }
        SignalCommands::Clear { sigs } => {
            daemon.signal_clear(&sigs).await?;
        }
    }
    Ok(())
}

async fn run_process(
    client: ClientArgs,
    command: ProcessCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let daemon = DirectClient::connect("daemon", &client.addr)?;
    match command {
        ProcessCommands::List => {
            print_processes(&daemon.process_list().await?, &client.output);
        }
        ProcessCommands::Kill { pid } => {
            daemon.process_kill(pid).await?;
            println!("killed {pid}");
        }
        ProcessCommands::Find { pid, cmd } => {
            print_processes(&daemon.process_find(pid, &cmd).await?, &client.output);
        }
        ProcessCommands::Spawn { kind, spec, cmd } => {
            let kind = match kind {
                SpawnKindArg::Cron => SpawnKind::Cron,
                SpawnKindArg::Fs => SpawnKind::Fs,
                SpawnKindArg::Script => SpawnKind::Script,
            };
            let pid = daemon.process_spawn(kind, &spec, &cmd).await?;
            println!("{pid}");
        }
    }
    Ok(())
}

async fn run_net(
    client: ClientArgs,
    command: NetCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let daemon = DirectClient::connect("daemon", &client.addr)?;
    match command {
        NetCommands::Ping => {
            daemon.ping().await?;
            println!("pong");
        }
        NetCommands::Info => {
            println!("{}", daemon.info().await?);
        }
        NetCommands::Mark { name, addr } => {
            daemon.mark(&name, &addr).await?;
        }
        NetCommands::Call { node, method, args } => {
            println!("{}", daemon.call(&node, &method, &args).await?);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Signal { client, command } => run_signal(client, command).await?,
        Commands::Process { client, command } => run_process(client, command).await?,
        Commands::Net { client, command } => run_net(client, command).await?,
    }

    Ok(())
}
