//! otun: Tunnel Orchestrator Daemon
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! builds the orchestrator on a Linux TUN device and reads tunnel commands
//! from stdin, one per line.

mod iplink;
mod tun2socks;

use anyhow::{bail, Context, Result};
use clap::Parser;
use iplink::{IpLinkBuilder, DEFAULT_FWMARK, DEFAULT_ROUTE_TABLE};
use otun_runtime::TunnelService;
use otun_vpn::{
    AppInventory, FilePolicy, JsonAppInventory, PolicySource, StaticInventory, StaticPolicy,
    TunnelCommand, TunnelOrchestrator, VpnConfig,
};
use std::io::BufRead;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tun2socks::Tun2SocksProcess;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// otun - route all traffic through a local SOCKS proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Installed-application inventory (JSON array)
    #[arg(long)]
    apps: Option<PathBuf>,

    /// App selection policy (TOML), re-read before every command
    #[arg(long)]
    policy: Option<PathBuf>,

    /// TUN device name
    #[arg(long, default_value = "otun0")]
    device: String,

    /// Routing table for the tunnel routes
    #[arg(long, default_value_t = DEFAULT_ROUTE_TABLE)]
    route_table: u32,

    /// Firewall mark that exempts bypass proxy sockets from the tunnel
    #[arg(long, default_value_t = DEFAULT_FWMARK)]
    fwmark: u32,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,
}

/// One line of stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Tunnel(TunnelCommand),
    Status,
    Quit,
}

fn parse_input(line: &str) -> Result<Option<Input>> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };

    let input = match word {
        "start" => Input::Tunnel(TunnelCommand::Start),
        "stop" => Input::Tunnel(TunnelCommand::Stop),
        "ports" => {
            let socks = words.next().context("usage: ports <socks> <dns>")?;
            let dns = words.next().unwrap_or("-1");
            Input::Tunnel(TunnelCommand::PortsChanged {
                socks: socks.parse().with_context(|| format!("bad socks port {:?}", socks))?,
                dns: dns.parse().with_context(|| format!("bad dns port {:?}", dns))?,
            })
        }
        "status" => Input::Status,
        "quit" | "exit" => Input::Quit,
        other => bail!("unknown command {:?}", other),
    };
    Ok(Some(input))
}

fn load_config(args: &Args) -> Result<VpnConfig> {
    match &args.config {
        Some(path) => VpnConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(VpnConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = load_config(&args)?;

    if args.test_config {
        print!("{}", config.to_toml());
        println!("Configuration test passed!");
        return Ok(());
    }

    info!("otun starting...");

    let inventory: Box<dyn AppInventory> = match &args.apps {
        Some(path) => Box::new(JsonAppInventory::new(path)),
        None => Box::new(StaticInventory::default()),
    };
    let policy: Box<dyn PolicySource> = match &args.policy {
        Some(path) => Box::new(FilePolicy::new(path)),
        None => Box::new(StaticPolicy::default()),
    };

    let builder = IpLinkBuilder::new(&args.device, args.route_table, args.fwmark);
    info!("Tunnel routes in table {}, fwmark {}", builder.routing().table, builder.routing().fwmark);

    let forwarder = Tun2SocksProcess::new(&config.packet_forwarder_path);
    let orchestrator = TunnelOrchestrator::new(
        config,
        Box::new(builder),
        Box::new(forwarder),
        inventory,
    )?;
    let mut service = TunnelService::new(orchestrator, policy)?;

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        match parse_input(&line) {
            Ok(None) => {}
            Ok(Some(Input::Tunnel(command))) => {
                let ack = service.handle_command(command)?;
                info!("Accepted {}", ack.id);
            }
            Ok(Some(Input::Status)) => {
                for event in service.poll_events() {
                    info!("{:?}", event);
                }
                println!("{}", service.state());
            }
            Ok(Some(Input::Quit)) => break,
            Err(e) => warn!("{}", e),
        }
    }

    service.handle_command(TunnelCommand::Stop)?;
    service.flush()?;
    service.shutdown();

    info!("otun shutting down");
    Ok(())
}
