//! Binary entrypoint for the meshtrack CLI.
//!
//! Commands:
//! - `start [--port <path>] [--id <node id>]` - run the mesh node
//! - `init` - write a starter `config.toml`
//! - `status` - print the last persisted snapshot with neighbor ages
//!
//! See the library crate docs for module-level details: `meshtrack::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshtrack::config::Config;
use meshtrack::node::MeshNode;
use meshtrack::storage::SnapshotFile;

#[derive(Parser)]
#[command(name = "meshtrack")]
#[command(about = "Position gossip node for serial telemetry meshes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the mesh node
    Start {
        /// Serial device (e.g., /dev/ttyS5); overrides the config file
        #[arg(short, long)]
        port: Option<String>,

        /// Node id; overrides the config file
        #[arg(long)]
        id: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show the last persisted mesh snapshot
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port, id } => {
            let mut config = Config::load(&cli.config).await?;
            // CLI overrides config
            if let Some(port) = port {
                config.transport.port = port;
            }
            if let Some(id) = id {
                config.node.id = id;
            }
            config.validate()?;
            init_logging(Some(&config), cli.verbose);
            info!("Starting meshtrack v{}", env!("CARGO_PKG_VERSION"));
            info!(
                "Node {} at x={} y={} on {}",
                config.node.id, config.node.x, config.node.y, config.transport.port
            );

            let node = MeshNode::start(config).await?;
            node.run().await?;
        }
        Commands::Init => {
            init_logging(None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                anyhow::bail!("{} already exists; refusing to overwrite", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            let snapshot = SnapshotFile::new(&config.persist.path).load()?;
            let now = chrono::Utc::now();
            println!(
                "Self {}: x={}, y={}",
                snapshot.self_state.id, snapshot.self_state.x, snapshot.self_state.y
            );
            if snapshot.neighbors.is_empty() {
                println!("  No neighbors detected.");
            }
            for peer in &snapshot.neighbors {
                let dbm = peer
                    .signal_strength
                    .map(|d| format!(", dBm={}", d))
                    .unwrap_or_default();
                println!(
                    "  {}: x={}, y={}, last seen {}s ago{}",
                    peer.id,
                    peer.x,
                    peer.y,
                    peer.age(now).as_secs(),
                    dbm
                );
            }
        }
    }

    Ok(())
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.and_then(|c| c.logging.file.as_ref()).and_then(|file| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .ok()
    });
    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
