#![forbid(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vswitch_core::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about = "user-space Ethernet-over-UDP virtual switch")]
struct Cli {
    /// TAP device name
    #[arg(long, default_value = "tvs0")]
    name: String,

    /// explicit local MAC (colon-separated); derived from the host's first
    /// non-loopback interface when omitted
    #[arg(long)]
    mac: Option<String>,

    /// TAP MTU
    #[arg(long, default_value_t = 1400)]
    mtu: u16,

    /// IPv4 to assign to the TAP device
    #[arg(long)]
    addr: Option<Ipv4Addr>,

    /// prefix length for `addr`
    #[arg(long, default_value_t = 24)]
    mask: u8,

    /// bring the TAP device up automatically
    #[arg(long = "auto_up", default_value_t = true)]
    auto_up: bool,

    /// initial TTL for self-originated frames
    #[arg(long, default_value_t = 8)]
    ttl: u8,

    /// core peer address
    #[arg(long = "remote_addr", default_value = "0.0.0.0")]
    remote_addr: Ipv4Addr,

    /// core peer port
    #[arg(long = "remote_port", default_value_t = 0)]
    remote_port: u16,

    /// UDP bind port
    #[arg(long = "local_port", default_value_t = 9001)]
    local_port: u16,

    /// enable peer-exchange P2P
    #[arg(long, default_value_t = true)]
    p2p: bool,

    /// verbose logging
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        interface = %config.interface_name,
        local_udp_port = config.local_udp_port,
        core_endpoint = %config.core_endpoint,
        "starting vswitchd"
    );

    if let Err(err) = vswitch_core::run(config).await {
        error!(%err, "switch exited with a fatal error");
        std::process::exit(1);
    }
}

fn build_config(cli: &Cli) -> Result<Config, String> {
    let local_mac = match &cli.mac {
        Some(s) => vswitch_core::mac::parse(s).ok_or_else(|| format!("invalid --mac value: {s}"))?,
        None => vswitch_core::config::derive_local_mac().unwrap_or(vswitch_core::mac::ZERO),
    };

    Ok(Config {
        interface_name: cli.name.clone(),
        local_ip: cli.addr,
        mask: cli.mask,
        mtu: cli.mtu,
        local_mac,
        local_udp_port: cli.local_port,
        core_endpoint: SocketAddr::new(cli.remote_addr.into(), cli.remote_port),
        send_ttl: cli.ttl,
        enable_p2p: cli.p2p,
        auto_up: cli.auto_up,
        debug: cli.debug,
    })
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
