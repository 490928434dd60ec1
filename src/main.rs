use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanteam::discovery::Browser;
use lanteam::network::NetworkResolver;
use lanteam::{archive, Node, NodeConfig, NodeOptions, Services};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lanteam", version, about = "Share a team and its capabilities across a LAN")]
struct Cli {
    /// Overrides `data_dir` from lanteam.toml / LANTEAM_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    bind: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node until Ctrl-C.
    Serve,
    /// Create or rename the local identity.
    Identity { name: String },
    /// List usable network interfaces.
    Interfaces,
    /// Browse the LAN for advertised teams.
    Discover {
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Create a team led by this node, then keep serving.
    Create {
        name: String,
        #[arg(long, default_value = "")]
        interface: String,
        #[arg(long, default_value = "")]
        ip: String,
    },
    /// Join the team led at `endpoint` (host:port), then keep serving.
    Join { endpoint: String },
    Leave { team: String },
    Dissolve { team: String },
    Teams,
    Members { team: String },
    /// Pack a directory into a tar.gz and print its checksum.
    Pack { dir: PathBuf, out: PathBuf },
    Unpack { archive: PathBuf, dir: PathBuf },
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = NodeConfig::load()?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = &cli.bind {
        config.bind = bind.clone();
    }
    Ok(config)
}

/// Console output plus, for long-running commands, a daily log file.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanteam=info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lanteam.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve_until_ctrl_c(node: Node) -> Result<()> {
    tracing::info!(addr = %node.local_addr(), "Serving, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("listen for Ctrl-C")?;
    node.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let long_running = matches!(
        cli.command,
        Command::Serve | Command::Create { .. } | Command::Join { .. }
    );
    let log_dir = long_running.then(|| config.data_dir.join("logs"));
    let _guard = init_tracing(log_dir);

    match cli.command {
        Command::Serve => {
            let node = Node::start(config, NodeOptions::default()).await?;
            serve_until_ctrl_c(node).await?;
        }
        Command::Create { name, interface, ip } => {
            let node = Node::start(config, NodeOptions::default()).await?;
            let team = node.coordinator().create_team(&name, &interface, &ip).await?;
            print_json(&team)?;
            serve_until_ctrl_c(node).await?;
        }
        Command::Join { endpoint } => {
            let node = Node::start(config, NodeOptions::default()).await?;
            let team = node.coordinator().join_team(&endpoint).await?;
            print_json(&team)?;
            serve_until_ctrl_c(node).await?;
        }
        Command::Identity { name } => {
            let services = Services::build(&config, config.port, NodeOptions::default())?;
            print_json(&services.coordinator.set_identity(&name)?)?;
        }
        Command::Interfaces => {
            print_json(&NetworkResolver::default().list_interfaces()?)?;
        }
        Command::Discover { timeout } => {
            let timeout = timeout
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| config.discovery_timeout());
            let teams = Browser::new()?.discover_teams(timeout).await?;
            print_json(&teams)?;
        }
        Command::Leave { team } => {
            let services = Services::build(&config, config.port, NodeOptions::default())?;
            services.coordinator.leave_team(&team).await?;
            println!("left {team}");
        }
        Command::Dissolve { team } => {
            let services = Services::build(&config, config.port, NodeOptions::default())?;
            services.coordinator.dissolve_team(&team).await?;
            println!("dissolved {team}");
        }
        Command::Teams => {
            let services = Services::build(&config, config.port, NodeOptions::default())?;
            print_json(&services.directory.list())?;
        }
        Command::Members { team } => {
            let services = Services::build(&config, config.port, NodeOptions::default())?;
            print_json(&services.coordinator.get_team_members(&team).await?)?;
        }
        Command::Pack { dir, out } => {
            let (bytes, checksum) = archive::pack(&dir)?;
            std::fs::write(&out, bytes).with_context(|| format!("write {}", out.display()))?;
            println!("{checksum}");
        }
        Command::Unpack { archive: path, dir } => {
            let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            archive::unpack(&bytes, &dir)?;
            println!("unpacked into {}", dir.display());
        }
    }
    Ok(())
}
